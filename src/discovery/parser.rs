//! Parsing of `_airplay._tcp` mDNS TXT records into capability flags.

use crate::types::DeviceCapabilities;
use std::collections::HashMap;

/// Parse TXT records from a raw `key=value` mDNS response.
#[must_use]
pub fn parse_txt_records(records: &[String]) -> HashMap<String, String> {
    records
        .iter()
        .filter_map(|record| {
            let mut parts = record.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect()
}

/// Parse the `features` TXT value into [`DeviceCapabilities`].
///
/// The value is two comma-separated 32-bit hex words, low word first
/// (`"0x4A7FCA00,0x3C356BD0"`), or occasionally a single combined hex
/// value.
#[must_use]
pub fn parse_features(features_str: &str) -> Option<DeviceCapabilities> {
    let features = if features_str.contains(',') {
        let parts: Vec<&str> = features_str.split(',').collect();
        if parts.len() >= 2 {
            let lo = parse_hex(parts[0])?;
            let hi = parse_hex(parts[1])?;
            (hi << 32) | lo
        } else {
            parse_hex(parts[0])?
        }
    } else {
        parse_hex(features_str)?
    };

    Some(DeviceCapabilities::from_features(features))
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Map a `model` TXT value to a friendly device-type name, for logging
/// and UI display only.
#[must_use]
pub fn parse_model_name(model: &str) -> &str {
    match model {
        "AudioAccessory1,1" | "AudioAccessory1,2" => "HomePod",
        "AudioAccessory5,1" => "HomePod mini",
        "AppleTV3,1" | "AppleTV3,2" => "Apple TV (3rd generation)",
        "AppleTV5,3" => "Apple TV (4th generation)",
        "AppleTV6,2" => "Apple TV 4K",
        "AppleTV11,1" => "Apple TV 4K (2nd generation)",
        "AppleTV14,1" => "Apple TV 4K (3rd generation)",
        "AirPort10,1" => "AirPort Express",
        _ => model,
    }
}

/// Known `_airplay._tcp` TXT record keys.
pub mod txt_keys {
    /// Device ID (colon-separated MAC).
    pub const DEVICE_ID: &str = "deviceid";
    /// Features bitmask (two comma-separated hex words).
    pub const FEATURES: &str = "features";
    /// Model identifier.
    pub const MODEL: &str = "model";
    /// Protocol version.
    pub const PROTOCOL_VERSION: &str = "protovers";
    /// Source version.
    pub const SOURCE_VERSION: &str = "srcvers";
    /// Discovered volume (0.0-1.0 as text).
    pub const VOLUME: &str = "vv";
    /// Public key, present when a persistent key is already paired.
    pub const PUBLIC_KEY: &str = "pk";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_features_comma_separated() {
        let caps = parse_features("0x4A7FCA00,0x3C356BD0").unwrap();
        assert!(caps.supports_transient_pairing);
    }

    #[test]
    fn parse_features_rejects_garbage() {
        assert!(parse_features("not-hex").is_none());
    }

    #[test]
    fn parse_txt_records_splits_on_equals() {
        let records = vec!["deviceid=AA:BB:CC:DD:EE:FF".to_string(), "model=x".to_string()];
        let map = parse_txt_records(&records);
        assert_eq!(map.get("deviceid").unwrap(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(map.get("model").unwrap(), "x");
    }
}
