//! NTP-style wall-clock timestamps and the timing-service wire format (C1, C5).

use super::packet::RtpDecodeError;

/// NTP timestamp: seconds since 1900-01-01, plus a 32-bit binary fraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpTimestamp {
    /// Seconds since the NTP epoch.
    pub seconds: u32,
    /// Fractional seconds, in units of 1/2^32 second.
    pub fraction: u32,
}

impl NtpTimestamp {
    /// Offset between the NTP epoch (1900) and the Unix epoch (1970), in seconds.
    const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

    /// Capture the current wall-clock time as an NTP timestamp.
    #[must_use]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};

        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        let ntp_secs = duration.as_secs() + Self::NTP_UNIX_OFFSET;
        let fraction = (u64::from(duration.subsec_nanos()) << 32) / 1_000_000_000;

        Self {
            seconds: ntp_secs as u32,
            fraction: fraction as u32,
        }
    }

    /// Encode to 8 big-endian bytes (seconds, then fraction).
    #[must_use]
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.seconds.to_be_bytes());
        buf[4..8].copy_from_slice(&self.fraction.to_be_bytes());
        buf
    }

    /// Decode from 8 big-endian bytes.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            seconds: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            fraction: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Convert to microseconds since the NTP epoch.
    #[must_use]
    pub fn to_micros(self) -> u64 {
        let secs = u64::from(self.seconds);
        let frac_micros = (u64::from(self.fraction) * 1_000_000) >> 32;
        secs * 1_000_000 + frac_micros
    }
}

/// A received timing request: 32 bytes, header `0x80 0xd2`.
///
/// Only `echo_byte` (request byte 2, copied verbatim into the reply) and
/// `origin_time` (request bytes 24..32, the client's send timestamp) carry
/// information the reply needs; the rest of the request is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingRequest {
    /// Request byte 2, echoed into reply byte 2.
    pub echo_byte: u8,
    /// Client-side send timestamp (request bytes 24..32).
    pub origin_time: NtpTimestamp,
}

impl TimingRequest {
    /// Wire size in bytes.
    pub const SIZE: usize = 32;

    /// Build a request to send, stamping `origin_time` as now.
    #[must_use]
    pub fn new(echo_byte: u8) -> Self {
        Self {
            echo_byte,
            origin_time: NtpTimestamp::now(),
        }
    }

    /// Encode to the 32-byte wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(0x80);
        buf.push(0xD2);
        buf.push(self.echo_byte);
        buf.push(0);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&[0u8; 8]);
        buf.extend_from_slice(&self.origin_time.encode());
        buf
    }

    /// Decode from the 32-byte wire format.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the buffer is too small or the header
    /// doesn't match `0x80 0xd2`.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }
        if buf[0] != 0x80 || buf[1] != 0xD2 {
            return Err(RtpDecodeError::UnknownPayloadType(buf[1]));
        }

        Ok(Self {
            echo_byte: buf[2],
            origin_time: NtpTimestamp::decode(&buf[24..32]),
        })
    }
}

/// A timing reply: 32 bytes, header `0x80 0xd3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingResponse {
    /// Echoed from the request.
    pub echo_byte: u8,
    /// Client's original send timestamp, copied from the request.
    pub origin_time: NtpTimestamp,
    /// Time the server received the request.
    pub receive_time: NtpTimestamp,
    /// Time the server sent this reply.
    pub send_time: NtpTimestamp,
}

impl TimingResponse {
    /// Wire size in bytes.
    pub const SIZE: usize = 32;

    /// Build the reply to a given request, stamping `receive_time` and
    /// `send_time` from the server's clock.
    #[must_use]
    pub fn for_request(request: &TimingRequest, receive_time: NtpTimestamp, send_time: NtpTimestamp) -> Self {
        Self {
            echo_byte: request.echo_byte,
            origin_time: request.origin_time,
            receive_time,
            send_time,
        }
    }

    /// Encode to the 32-byte wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.push(0x80);
        buf.push(0xD3);
        buf.push(self.echo_byte);
        buf.push(0);
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&self.origin_time.encode());
        buf.extend_from_slice(&self.receive_time.encode());
        buf.extend_from_slice(&self.send_time.encode());
        buf
    }

    /// Decode from the 32-byte wire format.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the buffer is too small or the header
    /// doesn't match `0x80 0xd3`.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }
        if buf[0] != 0x80 || buf[1] != 0xD3 {
            return Err(RtpDecodeError::UnknownPayloadType(buf[1]));
        }

        Ok(Self {
            echo_byte: buf[2],
            origin_time: NtpTimestamp::decode(&buf[8..16]),
            receive_time: NtpTimestamp::decode(&buf[16..24]),
            send_time: NtpTimestamp::decode(&buf[24..32]),
        })
    }

    /// Clock offset (server time − client time), in microseconds.
    ///
    /// `((receive_time - origin_time) + (send_time - client_receive_time)) / 2`.
    #[must_use]
    pub fn calculate_offset(&self, client_receive_time: NtpTimestamp) -> i64 {
        let t1 = self.origin_time.to_micros() as i64;
        let t2 = self.receive_time.to_micros() as i64;
        let t3 = self.send_time.to_micros() as i64;
        let t4 = client_receive_time.to_micros() as i64;

        ((t2 - t1) + (t3 - t4)) / 2
    }

    /// Round-trip time, in microseconds: `(t4 - t1) - (t3 - t2)`.
    #[must_use]
    pub fn calculate_rtt(&self, client_receive_time: NtpTimestamp) -> u64 {
        let t1 = self.origin_time.to_micros();
        let t2 = self.receive_time.to_micros();
        let t3 = self.send_time.to_micros();
        let t4 = client_receive_time.to_micros();

        (t4 - t1).saturating_sub(t3 - t2)
    }
}

/// Either side of a timing exchange, for a single demux point on one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingPacket {
    /// A request received from a device.
    Request(TimingRequest),
    /// A reply received from a device (client-side use).
    Response(TimingResponse),
}

impl TimingPacket {
    /// Decode a 32-byte timing packet, dispatching on the header byte.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the buffer is too small or the header
    /// byte is neither `0xd2` nor `0xd3`.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < 2 {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: 2,
                have: buf.len(),
            });
        }
        match buf[1] {
            0xD2 => Ok(TimingPacket::Request(TimingRequest::decode(buf)?)),
            0xD3 => Ok(TimingPacket::Response(TimingResponse::decode(buf)?)),
            other => Err(RtpDecodeError::UnknownPayloadType(other & 0x7F)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_timestamp_round_trip() {
        let ts = NtpTimestamp {
            seconds: 1_234_567_890,
            fraction: 0x8000_0000,
        };
        let encoded = ts.encode();
        assert_eq!(NtpTimestamp::decode(&encoded), ts);
    }

    #[test]
    fn ntp_timestamp_now_is_after_2020() {
        let ts = NtpTimestamp::now();
        assert!(ts.seconds > 3_786_825_600);
    }

    #[test]
    fn timing_request_wire_layout() {
        let req = TimingRequest::new(0x07);
        let encoded = req.encode();
        assert_eq!(encoded.len(), 32);
        assert_eq!(encoded[0], 0x80);
        assert_eq!(encoded[1], 0xD2);
        assert_eq!(encoded[2], 0x07);
        assert_eq!(&encoded[24..32], &req.origin_time.encode());
    }

    #[test]
    fn timing_request_round_trip() {
        let req = TimingRequest::new(0x42);
        let decoded = TimingRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn timing_response_echoes_request_fields() {
        let req = TimingRequest::new(0x09);
        let receive = NtpTimestamp {
            seconds: 100,
            fraction: 0,
        };
        let send = NtpTimestamp {
            seconds: 100,
            fraction: 0x0A3D_70A3,
        };
        let resp = TimingResponse::for_request(&req, receive, send);
        let encoded = resp.encode();

        assert_eq!(encoded[0], 0x80);
        assert_eq!(encoded[1], 0xD3);
        assert_eq!(encoded[2], 0x09);
        assert_eq!(&encoded[8..16], &req.origin_time.encode());

        let decoded = TimingResponse::decode(&encoded).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn rtt_calculation() {
        let t1 = NtpTimestamp {
            seconds: 100,
            fraction: 0,
        };
        let t2 = NtpTimestamp {
            seconds: 100,
            fraction: 0x028F_5C28,
        };
        let t3 = NtpTimestamp {
            seconds: 100,
            fraction: 0x051E_B851,
        };
        let t4 = NtpTimestamp {
            seconds: 100,
            fraction: 0x0A3D_70A3,
        };

        let response = TimingResponse {
            echo_byte: 0,
            origin_time: t1,
            receive_time: t2,
            send_time: t3,
        };

        let rtt = response.calculate_rtt(t4);
        assert!(rtt > 25_000 && rtt < 35_000, "RTT was {rtt}");
    }

    #[test]
    fn offset_calculation() {
        let t1 = NtpTimestamp {
            seconds: 100,
            fraction: 0,
        };
        let t2 = NtpTimestamp {
            seconds: 105,
            fraction: 0x028F_5C28,
        };
        let t3 = NtpTimestamp {
            seconds: 105,
            fraction: 0x051E_B851,
        };
        let t4 = NtpTimestamp {
            seconds: 100,
            fraction: 0x0A3D_70A3,
        };

        let response = TimingResponse {
            echo_byte: 0,
            origin_time: t1,
            receive_time: t2,
            send_time: t3,
        };

        let offset = response.calculate_offset(t4);
        let expected = 4_995_000;
        let tolerance = 5_000;

        assert!(
            (offset - expected).abs() < tolerance,
            "Offset was {offset}"
        );
    }
}
