//! SETUP(session)/SETUP(stream)/SETPEERS plist bodies (spec §6 wire format).

use super::{DictBuilder, PlistValue};

/// Build the SETUP(session) request body.
#[must_use]
pub fn setup_session_request(session_uuid: &str) -> PlistValue {
    DictBuilder::new()
        .insert("sessionUUID", session_uuid)
        .insert("timingProtocol", "NTP")
        .build()
}

/// Extract `timingPort` from a SETUP(session) response.
#[must_use]
pub fn parse_setup_session_response(plist: &PlistValue) -> Option<u16> {
    let dict = plist.as_dict()?;
    let port = dict.get("timingPort")?.as_i64()?;
    u16::try_from(port).ok()
}

/// Build the SETUP(stream) request body: one audio stream entry carrying
/// the negotiated shared key and fixed CD-quality format parameters.
#[must_use]
pub fn setup_stream_request(shared_key: &[u8; 32]) -> PlistValue {
    let stream = DictBuilder::new()
        .insert("type", 96i64)
        .insert("audioFormat", 262_144i64)
        .insert("audioMode", "default")
        .insert("ct", 2i64)
        .insert("spf", 352i64)
        .insert("sr", 44_100i64)
        .insert("shk", shared_key.to_vec())
        .insert("latencyMin", 11_025i64)
        .insert("latencyMax", 88_200i64)
        .insert("isMedia", true)
        .insert("supportsDynamicStreamID", false)
        .build();

    DictBuilder::new()
        .insert("streams", PlistValue::Array(vec![stream]))
        .build()
}

/// Extract `(dataPort, controlPort)` from the first stream in a
/// SETUP(stream) response.
#[must_use]
pub fn parse_setup_stream_response(plist: &PlistValue) -> Option<(u16, u16)> {
    let dict = plist.as_dict()?;
    let streams = dict.get("streams")?.as_array()?;
    let stream = streams.first()?.as_dict()?;
    let data_port = u16::try_from(stream.get("dataPort")?.as_i64()?).ok()?;
    let control_port = u16::try_from(stream.get("controlPort")?.as_i64()?).ok()?;
    Some((data_port, control_port))
}

/// Build the SETPEERS request body: a plist array of peer IP strings.
#[must_use]
pub fn set_peers_request(addresses: &[String]) -> PlistValue {
    PlistValue::Array(addresses.iter().cloned().map(PlistValue::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn setup_session_request_carries_uuid_and_ntp() {
        let plist = setup_session_request("abc-123");
        let dict = plist.as_dict().unwrap();
        assert_eq!(dict.get("sessionUUID").and_then(PlistValue::as_str), Some("abc-123"));
        assert_eq!(dict.get("timingProtocol").and_then(PlistValue::as_str), Some("NTP"));
    }

    #[test]
    fn parse_setup_session_response_extracts_timing_port() {
        let mut dict = HashMap::new();
        dict.insert("timingPort".to_string(), PlistValue::Integer(319));
        let plist = PlistValue::Dictionary(dict);
        assert_eq!(parse_setup_session_response(&plist), Some(319));
    }

    #[test]
    fn setup_stream_request_embeds_shared_key() {
        let key = [7u8; 32];
        let plist = setup_stream_request(&key);
        let streams = plist.as_dict().unwrap().get("streams").unwrap().as_array().unwrap();
        let stream = streams[0].as_dict().unwrap();
        assert_eq!(stream.get("shk").and_then(PlistValue::as_bytes), Some(key.as_slice()));
        assert_eq!(stream.get("sr").and_then(PlistValue::as_i64), Some(44_100));
    }

    #[test]
    fn parse_setup_stream_response_extracts_ports() {
        let mut stream = HashMap::new();
        stream.insert("dataPort".to_string(), PlistValue::Integer(6000));
        stream.insert("controlPort".to_string(), PlistValue::Integer(6001));
        let mut dict = HashMap::new();
        dict.insert(
            "streams".to_string(),
            PlistValue::Array(vec![PlistValue::Dictionary(stream)]),
        );
        let plist = PlistValue::Dictionary(dict);
        assert_eq!(parse_setup_stream_response(&plist), Some((6000, 6001)));
    }

    #[test]
    fn set_peers_request_builds_string_array() {
        let plist = set_peers_request(&["192.168.1.5".to_string()]);
        let array = plist.as_array().unwrap();
        assert_eq!(array[0].as_str(), Some("192.168.1.5"));
    }
}
