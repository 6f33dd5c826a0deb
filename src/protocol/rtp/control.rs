//! Control-port UDP packets: retransmit requests (C6) and sync packets (C3).

use super::packet::RtpDecodeError;
use super::timing::NtpTimestamp;

/// Request to retransmit `count` packets starting at `sequence_start`.
///
/// Wire format is 8 bytes: `0x80 0xd5 _ _ seq_start(BE16) seq_len(BE16)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// First sequence number to retransmit.
    pub sequence_start: u16,
    /// Number of packets to retransmit.
    pub count: u16,
}

impl RetransmitRequest {
    /// Create a new retransmit request.
    #[must_use]
    pub fn new(sequence_start: u16, count: u16) -> Self {
        Self {
            sequence_start,
            count,
        }
    }

    /// Encode to the 8-byte wire format.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.push(0x80);
        buf.push(0xD5);
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.sequence_start.to_be_bytes());
        buf.extend_from_slice(&self.count.to_be_bytes());
        buf
    }

    /// Decode from the 8-byte wire format (header already validated by the caller).
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the buffer is too small.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < 8 {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: 8,
                have: buf.len(),
            });
        }

        Ok(Self {
            sequence_start: u16::from_be_bytes([buf[4], buf[5]]),
            count: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

/// Control-port packet variants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlPacket {
    /// Request retransmission of lost packets.
    RetransmitRequest(RetransmitRequest),
    /// Sync packet carrying (wall-time, RTP position) for clock alignment.
    ///
    /// `initial` selects the flags byte: `0x90` for the first sync packet
    /// after a session joins CONNECTED, `0x80` for the steady-state cadence.
    Sync {
        /// Flags byte is `0x90` rather than `0x80`.
        initial: bool,
        /// Current play position in RTP timestamp units.
        rtp_timestamp: u32,
        /// Wall-clock time at `rtp_timestamp`.
        ntp_timestamp: NtpTimestamp,
        /// Near-future RTP position.
        next_timestamp: u32,
    },
}

impl ControlPacket {
    /// Encode packet to bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ControlPacket::RetransmitRequest(req) => req.encode(),
            ControlPacket::Sync {
                initial,
                rtp_timestamp,
                ntp_timestamp,
                next_timestamp,
            } => {
                let mut buf = Vec::with_capacity(20);
                buf.push(if *initial { 0x90 } else { 0x80 });
                buf.push(0xD4);
                buf.extend_from_slice(&[0u8; 2]);
                buf.extend_from_slice(&rtp_timestamp.to_be_bytes());
                buf.extend_from_slice(&ntp_timestamp.encode());
                buf.extend_from_slice(&next_timestamp.to_be_bytes());
                buf
            }
        }
    }

    /// Parse a control packet from bytes.
    ///
    /// # Errors
    ///
    /// Returns `RtpDecodeError` if the buffer is too small or the payload
    /// type is unrecognized.
    pub fn decode(buf: &[u8]) -> Result<Self, RtpDecodeError> {
        if buf.len() < 4 {
            return Err(RtpDecodeError::BufferTooSmall {
                needed: 4,
                have: buf.len(),
            });
        }

        let payload_type_masked = buf[1] & 0x7F;

        match payload_type_masked {
            0x55 => Ok(ControlPacket::RetransmitRequest(RetransmitRequest::decode(
                buf,
            )?)),
            0x54 => {
                if buf.len() < 20 {
                    return Err(RtpDecodeError::BufferTooSmall {
                        needed: 20,
                        have: buf.len(),
                    });
                }
                Ok(ControlPacket::Sync {
                    initial: buf[0] & 0x10 != 0,
                    rtp_timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
                    ntp_timestamp: NtpTimestamp::decode(&buf[8..16]),
                    next_timestamp: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
                })
            }
            _ => Err(RtpDecodeError::UnknownPayloadType(payload_type_masked)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_request_encode_matches_wire_format() {
        let req = RetransmitRequest::new(1002, 3);
        let encoded = req.encode();
        assert_eq!(
            encoded,
            vec![0x80, 0xD5, 0x00, 0x00, 0x03, 0xEA, 0x00, 0x03]
        );
    }

    #[test]
    fn retransmit_request_round_trip() {
        let req = RetransmitRequest::new(1002, 3);
        let encoded = req.encode();
        let decoded = RetransmitRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn control_packet_decodes_s3_scenario_bytes() {
        let bytes = [0x80u8, 0xd5, 0x00, 0x00, 0x03, 0xEA, 0x00, 0x03];
        let packet = ControlPacket::decode(&bytes).unwrap();
        assert_eq!(
            packet,
            ControlPacket::RetransmitRequest(RetransmitRequest::new(1002, 3))
        );
    }

    #[test]
    fn sync_packet_round_trip_initial() {
        let packet = ControlPacket::Sync {
            initial: true,
            rtp_timestamp: 44100,
            ntp_timestamp: NtpTimestamp {
                seconds: 1_234_567,
                fraction: 0x8000_0000,
            },
            next_timestamp: 44452,
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), 20);
        assert_eq!(encoded[0], 0x90);
        assert_eq!(encoded[1], 0xD4);

        let decoded = ControlPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn sync_packet_steady_state_flag() {
        let packet = ControlPacket::Sync {
            initial: false,
            rtp_timestamp: 0,
            ntp_timestamp: NtpTimestamp {
                seconds: 0,
                fraction: 0,
            },
            next_timestamp: 0,
        };
        let encoded = packet.encode();
        assert_eq!(encoded[0], 0x80);
        let decoded = ControlPacket::decode(&encoded).unwrap();
        assert!(matches!(decoded, ControlPacket::Sync { initial: false, .. }));
    }
}
