//! Shared per-quality audio aggregator (C10).
//!
//! One `MasterSession` is created per distinct `(quality, encrypted)` tuple
//! and shared by every [`crate::session::Session`] streaming that quality:
//! it owns the RTP sequence/timestamp cursor, the retransmit ring, and the
//! wall-clock anchor the sync and metadata pipelines read from.

use crate::protocol::alac;
use crate::protocol::rtp::{NtpTimestamp, PacketRing, RtpHeader, RtpPacket};
use tracing::{Span, debug};

/// `(sample_rate, channels, bits_per_sample)` together identify an audio
/// quality. The first implementation fixes this to CD-quality stereo
/// (spec §1 Non-goals), but the type carries the full tuple so a second
/// quality could be added without reshaping this struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioQuality {
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u8,
    /// Bits per sample.
    pub bits_per_sample: u8,
}

impl AudioQuality {
    /// The only quality this implementation streams.
    pub const CD_STEREO: Self = Self {
        sample_rate: 44_100,
        channels: 2,
        bits_per_sample: 16,
    };
}

/// Key identifying a `MasterSession`: quality plus whether its sessions
/// are HomeKit-encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MasterSessionKey {
    /// Audio quality.
    pub quality: AudioQuality,
    /// Whether attached sessions encrypt RTP payloads.
    pub encrypted: bool,
}

/// The session's current wall-clock anchor: "at wall time `ts_ms`, the RTP
/// sample being played is `pos`" (spec §3 `cur_stamp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WallClockAnchor {
    /// Monotonic wall-clock time, milliseconds.
    pub ts_ms: i64,
    /// RTP position, sample units.
    pub pos: i64,
}

/// Owns the sequence number, RTP timestamp cursor, and retransmit ring for
/// one quality (spec §3 `rtp_session`).
pub struct RtpSession {
    sequence: u16,
    /// Timestamp cursor in sample units; advances by `samples_per_packet`
    /// each emitted packet, never goes backwards.
    pos: i64,
    ring: PacketRing,
    packets_since_sync: u32,
}

/// Sync packets are sent every this many audio packets while STREAMING
/// (spec §4.3 "typically every N packets").
const SYNC_PACKET_INTERVAL: u32 = 126;

impl RtpSession {
    fn new() -> Self {
        Self {
            sequence: 0,
            pos: 0,
            ring: PacketRing::new(),
            packets_since_sync: 0,
        }
    }

    /// Current sequence number (next packet to be emitted will use this).
    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Current RTP timestamp cursor, sample units.
    #[must_use]
    pub fn pos(&self) -> i64 {
        self.pos
    }

    /// Whether a steady-state sync packet is due on this write.
    #[must_use]
    pub fn sync_due(&self) -> bool {
        self.packets_since_sync >= SYNC_PACKET_INTERVAL
    }

    fn note_sync_sent(&mut self) {
        self.packets_since_sync = 0;
    }

    fn retransmit_ring(&self) -> &PacketRing {
        &self.ring
    }

    fn retransmit_ring_mut(&mut self) -> &mut PacketRing {
        &mut self.ring
    }
}

/// A freshly packetized, ALAC-framed (but not yet encrypted) audio packet
/// ready for per-session encryption and UDP send.
pub struct PendingPacket {
    /// 12-byte RTP header (marker bit not yet applied — callers set it per
    /// destination session per spec §4.2 step 3).
    pub header: RtpHeader,
    /// ALAC-framed PCM payload.
    pub payload: Vec<u8>,
}

/// Per-quality audio aggregator (spec §3 `MasterSession`).
pub struct MasterSession {
    key: MasterSessionKey,
    rtp_session: RtpSession,
    /// Accumulation buffer of unsent PCM samples from the player.
    evbuf: Vec<u8>,
    /// Configured pipeline lead, in samples (spec §3 `output_buffer_samples`).
    output_buffer_samples: i64,
    cur_stamp: WallClockAnchor,
    samples_per_packet: usize,
    referencing_sessions: usize,
    span: Span,
}

impl MasterSession {
    /// Construct a new, empty aggregator for `key`.
    #[must_use]
    pub fn new(key: MasterSessionKey, output_buffer_samples: i64) -> Self {
        let span = tracing::info_span!(
            "master_session",
            sample_rate = key.quality.sample_rate,
            encrypted = key.encrypted
        );
        Self {
            key,
            rtp_session: RtpSession::new(),
            evbuf: Vec::new(),
            output_buffer_samples,
            cur_stamp: WallClockAnchor::default(),
            samples_per_packet: crate::protocol::rtp::constants::FRAMES_PER_PACKET,
            referencing_sessions: 0,
            span,
        }
    }

    /// The quality/encryption key this aggregator was created for.
    #[must_use]
    pub fn key(&self) -> MasterSessionKey {
        self.key
    }

    /// Structured-log span for this aggregator's lifetime.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The wall-clock anchor last recorded by [`Self::timestamp_set`].
    #[must_use]
    pub fn cur_stamp(&self) -> WallClockAnchor {
        self.cur_stamp
    }

    /// Current RTP sequence/position cursor, read-only.
    #[must_use]
    pub fn rtp_session(&self) -> &RtpSession {
        &self.rtp_session
    }

    /// Register a [`crate::session::Session`] as a consumer of this
    /// aggregator.
    pub fn attach(&mut self) {
        self.referencing_sessions += 1;
    }

    /// Unregister a consumer. Returns `true` once the last reference is
    /// gone, signalling the caller should drop this aggregator (spec §3
    /// "freed when its last referencing Session is cleaned up").
    pub fn detach(&mut self) -> bool {
        self.referencing_sessions = self.referencing_sessions.saturating_sub(1);
        self.referencing_sessions == 0
    }

    /// The sync packet position fields: `(position_behind_pos, rtp_pos)`
    /// (spec §6 "`cur_stamp.pos − output_buffer_samples`" and
    /// "`rtp_session.pos`").
    #[must_use]
    pub fn sync_positions(&self) -> (i64, i64) {
        (
            self.cur_stamp.pos - self.output_buffer_samples,
            self.rtp_session.pos,
        )
    }

    /// Record a new wall-clock anchor for a player write at time `ts_ms`
    /// (spec §4.2 "Per-write").
    pub fn timestamp_set(&mut self, ts_ms: i64) {
        let evbuf_samples = self.evbuf_samples();
        self.cur_stamp = WallClockAnchor {
            ts_ms,
            pos: self.rtp_session.pos + evbuf_samples - self.output_buffer_samples,
        };
    }

    fn bytes_per_sample_frame(&self) -> usize {
        usize::from(self.key.quality.channels) * usize::from(self.key.quality.bits_per_sample / 8)
    }

    fn evbuf_samples(&self) -> i64 {
        let frame = self.bytes_per_sample_frame();
        if frame == 0 {
            0
        } else {
            (self.evbuf.len() / frame) as i64
        }
    }

    /// Append freshly written little-endian PCM bytes to the accumulation
    /// buffer.
    pub fn push_samples(&mut self, pcm_bytes: &[u8]) {
        self.evbuf.extend_from_slice(pcm_bytes);
    }

    /// Drain whole packets' worth of PCM out of `evbuf`, ALAC-frame and
    /// RTP-stamp each, and advance the sequence/position cursor (spec
    /// §4.2 steps 1-2, §4.4). Returns one [`PendingPacket`] per drained
    /// packet, in emission order.
    pub fn drain_packets(&mut self, ssrc: u32) -> Vec<PendingPacket> {
        let frame = self.bytes_per_sample_frame();
        let packet_bytes = frame * self.samples_per_packet;
        if packet_bytes == 0 {
            return Vec::new();
        }

        let mut packets = Vec::new();
        while self.evbuf.len() >= packet_bytes {
            let raw_buf: Vec<u8> = self.evbuf.drain(..packet_bytes).collect();
            let payload = alac::frame_pcm_bytes(&raw_buf);

            let header = RtpHeader {
                version: 2,
                padding: false,
                extension: false,
                csrc_count: 0,
                marker: false,
                payload_type: crate::protocol::rtp::PayloadType::AudioRealtime,
                sequence: self.rtp_session.sequence,
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                timestamp: self.rtp_session.pos as u32,
                ssrc,
            };

            self.rtp_session.sequence = self.rtp_session.sequence.wrapping_add(1);
            self.rtp_session.pos += self.samples_per_packet as i64;
            self.rtp_session.packets_since_sync += 1;

            packets.push(PendingPacket { header, payload });
        }
        packets
    }

    /// Build the full RTP packet for a drained packet and commit it to
    /// the retransmit ring, applying `marker` to the header as the
    /// caller (who knows which sessions just joined) dictates.
    pub fn commit_to_ring(&mut self, pending: &PendingPacket, marker: bool) -> RtpPacket {
        let mut header = pending.header.clone();
        header.marker = marker;
        let packet = RtpPacket {
            header,
            payload: pending.payload.clone(),
        };
        self.rtp_session
            .retransmit_ring_mut()
            .insert(header.sequence, packet.encode());
        debug!(seq = header.sequence, pos = header.timestamp, "packet committed to ring");
        packet
    }

    /// Mark that a sync packet was just sent, resetting the steady-state
    /// cadence counter.
    pub fn note_sync_sent(&mut self) {
        self.rtp_session.note_sync_sent();
    }

    /// Look up a previously committed packet's wire bytes by sequence
    /// number for retransmission (spec §4.6).
    #[must_use]
    pub fn retransmit(&self, sequence: u16) -> Option<&[u8]> {
        self.rtp_session.retransmit_ring().get(sequence)
    }

    /// Look up a contiguous run of previously committed packets
    /// (spec §4.6, scenario S3).
    pub fn retransmit_range(&self, start: u16, count: u16) -> impl Iterator<Item = (u16, &[u8])> {
        self.rtp_session.retransmit_ring().get_range(start, count)
    }

    /// Build the `(initial, flags)` sync packet payload for the current
    /// anchor (spec §4.3).
    #[must_use]
    pub fn sync_packet(&self, initial: bool, next_timestamp: u32) -> crate::protocol::rtp::ControlPacket {
        let (behind, _) = self.sync_positions();
        crate::protocol::rtp::ControlPacket::Sync {
            initial,
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            rtp_timestamp: behind as u32,
            ntp_timestamp: NtpTimestamp::now(),
            next_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality_key() -> MasterSessionKey {
        MasterSessionKey {
            quality: AudioQuality::CD_STEREO,
            encrypted: true,
        }
    }

    #[test]
    fn drain_packets_advances_sequence_and_position_by_352() {
        let mut ms = MasterSession::new(quality_key(), 0);
        let frame_bytes = vec![0u8; 352 * 4 * 3]; // 3 full packets worth
        ms.push_samples(&frame_bytes);
        let packets = ms.drain_packets(0x1234_5678);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].header.sequence, 0);
        assert_eq!(packets[1].header.sequence, 1);
        assert_eq!(packets[1].header.timestamp, 352);
        assert_eq!(packets[2].header.timestamp, 704);
        assert_eq!(ms.rtp_session().pos(), 1056);
    }

    #[test]
    fn partial_packet_stays_buffered() {
        let mut ms = MasterSession::new(quality_key(), 0);
        ms.push_samples(&vec![0u8; 352 * 4 - 1]);
        assert!(ms.drain_packets(0).is_empty());
        assert_eq!(ms.rtp_session().pos(), 0);
    }

    #[test]
    fn attach_detach_tracks_last_reference() {
        let mut ms = MasterSession::new(quality_key(), 0);
        ms.attach();
        ms.attach();
        assert!(!ms.detach());
        assert!(ms.detach());
    }

    #[test]
    fn timestamp_set_accounts_for_buffered_and_lead_samples() {
        let mut ms = MasterSession::new(quality_key(), 1000);
        ms.push_samples(&vec![0u8; 352 * 4]); // one packet's worth buffered
        ms.timestamp_set(5000);
        // pos(0) + evbuf_samples(352) - output_buffer_samples(1000)
        assert_eq!(ms.cur_stamp().pos, 352 - 1000);
        assert_eq!(ms.cur_stamp().ts_ms, 5000);
    }

    #[test]
    fn retransmit_after_commit_returns_identical_bytes() {
        let mut ms = MasterSession::new(quality_key(), 0);
        ms.push_samples(&vec![0u8; 352 * 4]);
        let pending = ms.drain_packets(0xAABB_CCDD).remove(0);
        let packet = ms.commit_to_ring(&pending, true);
        let stored = ms.retransmit(0).unwrap().to_vec();
        assert_eq!(stored, packet.encode());
    }

    #[test]
    fn sync_due_after_interval_packets() {
        let mut ms = MasterSession::new(quality_key(), 0);
        for _ in 0..SYNC_PACKET_INTERVAL {
            ms.push_samples(&vec![0u8; 352 * 4]);
            ms.drain_packets(0);
        }
        assert!(ms.rtp_session().sync_due());
        ms.note_sync_sent();
        assert!(!ms.rtp_session().sync_due());
    }
}
