//! RTP audio streaming: packet framing, per-packet encryption, the
//! retransmit ring, control-port packets, and NTP-style timing (C1–C6).

mod codec;
mod control;
mod packet;
mod packet_buffer;
mod timing;

pub use codec::{PacketEncryptor, RtpCodecError};
pub use control::{ControlPacket, RetransmitRequest};
pub use packet::{PayloadType, RtpDecodeError, RtpHeader, RtpPacket};
pub use packet_buffer::PacketRing;
pub use timing::{NtpTimestamp, TimingPacket, TimingRequest, TimingResponse};

/// RTP protocol constants for `AirPlay`.
pub mod constants {
    /// Default RTP audio data port.
    pub const AUDIO_PORT: u16 = 6000;
    /// Default RTP control port.
    pub const CONTROL_PORT: u16 = 6001;
    /// Default RTP timing port.
    pub const TIMING_PORT: u16 = 6002;

    /// Audio frames per RTP packet (352 samples at 44.1kHz is about 8ms).
    pub const FRAMES_PER_PACKET: usize = 352;

    /// Audio sample rate.
    pub const SAMPLE_RATE: u32 = 44100;

    /// Audio channels (stereo).
    pub const CHANNELS: u8 = 2;

    /// Bits per sample.
    pub const BITS_PER_SAMPLE: u8 = 16;
}
