//! Per-device session state (C9).
//!
//! A [`Session`] tracks one `AirPlay` device's identity, transport, pairing
//! context, and protocol state. It is driven by the sequence engine
//! ([`crate::sequence`]) and shares audio plumbing through a handle into a
//! [`crate::master_session::MasterSession`].

use std::time::Duration;

use tracing::{Span, info, warn};

use crate::error::AirPlayError;
use crate::protocol::pairing::{PairSetup, PairVerify, PairingKeys, SessionKeys, TransientPairing};
use crate::protocol::rtsp::{Method, RtspSession};
use crate::sequence::SequenceType;
use crate::types::AirPlayDevice;

/// Protocol state (spec §3 `Session.state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No session established.
    Stopped,
    /// `device_start` has been called; pairing/sequence selection about to
    /// begin.
    Startup,
    /// OPTIONS exchanged successfully.
    Options,
    /// ANNOUNCE sent (legacy path; unused by START_AP2 but kept for the
    /// sequence table's completeness).
    Announce,
    /// SETUP completed, ports negotiated.
    Setup,
    /// RECORD sent, awaiting confirmation.
    Record,
    /// RECORD confirmed; streaming has not yet started (no sync/marker
    /// packet sent yet).
    Connected,
    /// Actively streaming audio.
    Streaming,
    /// TEARDOWN in flight.
    Teardown,
    /// Session failed; awaiting cleanup.
    Failed,
    /// Bad or missing password; waiting on `device_authorize`.
    Password,
}

/// Which `HomeKit` pairing flavor this session uses (spec §3 `pair_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairType {
    /// Pin-based pair-setup with a persistent device key, pair-verify on
    /// every session.
    HomekitNormal,
    /// SRP-based handshake with no persistent key.
    HomekitTransient,
}

/// In-progress pairing state machine, boxed because the three flavors have
/// very different sizes.
pub enum PairingMachine {
    /// No pairing in progress.
    None,
    /// HomeKit transient (SRP) handshake.
    Transient(Box<TransientPairing>),
    /// Pin-based pair-setup.
    Setup(Box<PairSetup>),
    /// Pair-verify against a stored key.
    Verify(Box<PairVerify>),
}

/// A digest-auth challenge seen on a prior 401, tracked across the retried
/// sequence so repeated challenges within one `START_RERUN` carry a
/// correct nonce-count (SPEC_FULL §4.15).
#[derive(Debug, Clone, Default)]
pub struct DigestChallenge {
    /// `WWW-Authenticate` realm.
    pub realm: String,
    /// `WWW-Authenticate` nonce.
    pub nonce: String,
    /// Nonce count, incremented on every request that reuses this
    /// challenge.
    pub nonce_count: u32,
    /// Client nonce, generated once per challenge and reused for every
    /// `nc` increment.
    pub cnonce: String,
}

impl DigestChallenge {
    /// Parse `realm=".."` and `nonce=".."` out of a `WWW-Authenticate:
    /// Digest ...` header value.
    #[must_use]
    pub fn parse(header_value: &str) -> Option<Self> {
        let realm = Self::quoted_param(header_value, "realm")?;
        let nonce = Self::quoted_param(header_value, "nonce")?;
        let cnonce = format!("{:016x}", rand::random::<u64>());
        Some(Self {
            realm,
            nonce,
            nonce_count: 0,
            cnonce,
        })
    }

    fn quoted_param(header_value: &str, key: &str) -> Option<String> {
        let needle = format!("{key}=\"");
        let start = header_value.find(&needle)? + needle.len();
        let end = header_value[start..].find('"')? + start;
        Some(header_value[start..end].to_string())
    }

    /// Bump the nonce-count for a new request reusing this challenge and
    /// return the `nc` value (8 hex digits) to embed in the header.
    pub fn next_nc(&mut self) -> String {
        self.nonce_count += 1;
        format!("{:08x}", self.nonce_count)
    }
}

/// Per-device session state (spec §3 `Session`).
pub struct Session {
    /// The device this session is driving.
    pub device: AirPlayDevice,
    /// Current protocol state.
    pub state: DeviceState,
    /// Sequence to run once the in-progress one's terminator fires.
    pub next_seq: Option<SequenceType>,
    /// Sans-IO RTSP request/response framing and `CSeq`/session-id
    /// bookkeeping.
    pub rtsp: RtspSession,
    /// Which pairing flavor this session negotiates.
    pub pair_type: PairType,
    /// In-progress pairing handshake, if any.
    pub pairing: PairingMachine,
    /// 32-byte key derived once pairing completes.
    pub shared_secret: Option<[u8; 32]>,
    /// Control-channel cipher material, installed after pairing.
    pub control_keys: Option<SessionKeys>,
    /// Events-channel cipher material, installed after pairing.
    pub events_keys: Option<SessionKeys>,
    /// Device-negotiated data port (RTP audio).
    pub data_port: u16,
    /// Device-negotiated control port (sync/retransmit).
    pub control_port: u16,
    /// Device-negotiated reverse "events" port.
    pub events_port: u16,
    /// Device-negotiated timing port.
    pub timing_port: u16,
    /// Set once a 403/470 response demands a PIN before pairing can
    /// proceed; persists across sessions until a successful pair-setup.
    pub requires_auth: bool,
    /// Stored normal-pairing key (`None` until PAIR_SETUP completes).
    pub auth_key: Option<PairingKeys>,
    /// Digest-auth challenge carried across a `START_RERUN`.
    pub digest: Option<DigestChallenge>,
    /// Per-device volume ceiling (spec §4.11).
    pub max_volume: u8,
    /// `true` once a hard IPv6 failure has forced a fallback to IPv4
    /// (spec §4.1 "Startup IPv6 fallback"); prevents retrying IPv6.
    pub v6_disabled: bool,
    /// Callback id the player registered to be notified of state changes.
    pub callback_id: u64,
    /// Structured-log span correlating every RTSP exchange for this
    /// device (SPEC_FULL §4.12).
    pub span: Span,
}

impl Session {
    /// Create a new session for `device`, about to run `device_start`.
    #[must_use]
    pub fn new(device: AirPlayDevice, callback_id: u64) -> Self {
        let address = device.address();
        let port = device.port;
        let span = tracing::info_span!("session", device_id = %device.id, device_name = %device.name);
        let requires_auth = device.requires_auth;
        let pair_type = if requires_auth {
            PairType::HomekitNormal
        } else if device.capabilities.supports_transient_pairing {
            PairType::HomekitTransient
        } else {
            PairType::HomekitNormal
        };

        Self {
            rtsp: RtspSession::new(&address.to_string(), port),
            device,
            state: DeviceState::Stopped,
            next_seq: None,
            pair_type,
            pairing: PairingMachine::None,
            shared_secret: None,
            control_keys: None,
            events_keys: None,
            data_port: 0,
            control_port: 0,
            events_port: 0,
            timing_port: 0,
            requires_auth,
            auth_key: None,
            digest: None,
            max_volume: 11,
            v6_disabled: false,
            callback_id,
            span,
        }
    }

    /// Transition to a new state, logging the change (SPEC_FULL §4.12).
    pub fn set_state(&mut self, state: DeviceState) {
        let _enter = self.span.enter();
        info!(from = ?self.state, to = ?state, "session state transition");
        self.state = state;
    }

    /// Whether this session is eligible for the spec §4.1 "Startup IPv6
    /// fallback": dual-stack, currently on IPv6, and not yet disabled.
    #[must_use]
    pub fn wants_ipv6_fallback(&self) -> bool {
        !self.v6_disabled && self.device.address().is_ipv6() && self.device.has_dual_stack()
    }

    /// Invariant check (spec §8, universal invariant 3): `STREAMING`
    /// implies a master session, shared secret, and data port are all
    /// present.
    #[must_use]
    pub fn streaming_invariant_holds(&self, has_master_session: bool) -> bool {
        if self.state != DeviceState::Streaming {
            return true;
        }
        has_master_session && self.shared_secret.is_some() && self.data_port != 0 && self.control_port != 0
    }

    /// Determine which pairing sequence `device_start` should run (spec
    /// §4.1 "device_start orchestration").
    #[must_use]
    pub fn startup_pairing_sequence(&self) -> SequenceType {
        if self.auth_key.is_some() {
            SequenceType::PairVerify
        } else if self.device.supports_transient_pairing() {
            SequenceType::PairTransient
        } else {
            SequenceType::PinStart
        }
    }

    /// Derive and install `shared_secret`/channel keys once a pairing
    /// handshake completes (spec §4.1 "Encryption transition").
    ///
    /// `raw` is the pairing collaborator's output: 64 bytes for transient
    /// (first 32 used), 32 bytes for a completed pair-verify.
    ///
    /// # Errors
    /// Returns [`AirPlayError::EncryptionFailure`] if `raw` is too short.
    pub fn install_shared_secret(&mut self, raw: &[u8]) -> Result<(), AirPlayError> {
        if raw.len() < 32 {
            return Err(AirPlayError::EncryptionFailure {
                channel: "control".to_string(),
                message: format!("shared secret too short: {} bytes", raw.len()),
            });
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&raw[..32]);
        self.shared_secret = Some(secret);
        info!(parent: &self.span, "shared secret derived, installing control/events ciphers");
        Ok(())
    }

    /// Record a 401 challenge's realm/nonce, or bump the digest
    /// nonce-count if one was already in flight this sequence
    /// (SPEC_FULL §4.15).
    pub fn note_digest_challenge(&mut self, www_authenticate: &str) {
        if self.digest.is_none() {
            self.digest = DigestChallenge::parse(www_authenticate);
        }
    }

    /// Build an RTSP `Authorization: Digest ...` header value for
    /// `method`/`uri` using the in-flight challenge, if any.
    #[must_use]
    pub fn digest_authorization(&mut self, method: Method, uri: &str, username: &str, password: &str) -> Option<String> {
        let digest = self.digest.as_mut()?;
        let nc = digest.next_nc();
        let ha1 = md5_hex(&format!("{username}:{}:{password}", digest.realm));
        let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));
        let response = md5_hex(&format!(
            "{ha1}:{}:{nc}:{}:auth:{ha2}",
            digest.nonce, digest.cnonce
        ));
        Some(format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", qop=auth, nc={nc}, cnonce=\"{}\", response=\"{response}\"",
            digest.realm, digest.nonce, digest.cnonce
        ))
    }

    /// Mark a device as requiring a PIN before pairing can proceed (spec
    /// §7 `AUTH_REQUIRED`): a 403 on OPTIONS, or a 470 on a transient
    /// pair-setup step 1.
    pub fn require_auth(&mut self) {
        warn!(parent: &self.span, "device requires PIN authorization");
        self.requires_auth = true;
        self.device.requires_auth = true;
        self.pair_type = PairType::HomekitNormal;
    }

    /// Clear the persistent auth requirement after a successful
    /// PAIR_SETUP normal-pairing handshake (spec §7).
    pub fn clear_requires_auth(&mut self) {
        self.requires_auth = false;
        self.device.requires_auth = false;
    }

    /// Reject stored auth on a bad password (spec §7 `AUTH_BAD`).
    pub fn reject_auth(&mut self) {
        warn!(parent: &self.span, "authentication rejected, clearing stored key");
        self.auth_key = None;
        self.set_state(DeviceState::Password);
    }

    /// Interval between keep-alive `FEEDBACK` sequences (spec §4.10).
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

    /// Whether this session should receive the periodic keep-alive
    /// (spec §4.10: "all CONNECTED/STREAMING sessions").
    #[must_use]
    pub fn wants_keepalive(&self) -> bool {
        matches!(self.state, DeviceState::Connected | DeviceState::Streaming)
    }
}

/// Minimal MD5 used only for RTSP digest authentication (not a
/// general-purpose hash; digest auth is the one place this protocol still
/// mandates MD5).
fn md5_hex(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    format!("{digest:x}")
}

mod md5 {
    //! RFC 1321 MD5, sized for digest-auth inputs only.

    const S: [u32; 64] = [
        7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 7, 12, 17, 22, 5, 9, 14, 20, 5, 9, 14, 20, 5,
        9, 14, 20, 5, 9, 14, 20, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 4, 11, 16, 23, 6,
        10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21, 6, 10, 15, 21,
    ];

    const K: [u32; 64] = [
        0xd76a_a478,
        0xe8c7_b756,
        0x2420_70db,
        0xc1bd_ceee,
        0xf57c_0faf,
        0x4787_c62a,
        0xa830_4613,
        0xfd46_9501,
        0x6980_98d8,
        0x8b44_f7af,
        0xffff_5bb1,
        0x895c_d7be,
        0x6b90_1122,
        0xfd98_7193,
        0xa679_438e,
        0x49b4_0821,
        0xf61e_2562,
        0xc040_b340,
        0x265e_5a51,
        0xe9b6_c7aa,
        0xd62f_105d,
        0x0244_1453,
        0xd8a1_e681,
        0xe7d3_fbc8,
        0x21e1_cde6,
        0xc337_07d6,
        0xf4d5_0d87,
        0x455a_14ed,
        0xa9e3_e905,
        0xfcef_a3f8,
        0x676f_02d9,
        0x8d2a_4c8a,
        0xfffa_3942,
        0x8771_f681,
        0x6d9d_6122,
        0xfde5_380c,
        0xa4be_ea44,
        0x4bde_cfa9,
        0xf6bb_4b60,
        0xbebf_bc70,
        0x289b_7ec6,
        0xeaa1_27fa,
        0xd4ef_3085,
        0x0488_1d05,
        0xd9d4_d039,
        0xe6db_99e5,
        0x1fa2_7cf8,
        0xc4ac_5665,
        0xf429_2244,
        0x432a_ff97,
        0xab94_23a7,
        0xfc93_a039,
        0x655b_59c3,
        0x8f0c_cc92,
        0xffef_f47d,
        0x8584_5dd1,
        0x6fa8_7e4f,
        0xfe2c_e6e0,
        0xa301_0441,
        0x4e08_11a1,
        0xf753_7e82,
        0xbd3a_f235,
        0x2ad7_d2bb,
        0xeb86_d391,
    ];

    pub struct Digest(pub [u8; 16]);

    impl std::fmt::LowerHex for Digest {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            for byte in self.0 {
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
    }

    #[must_use]
    pub fn compute(input: &[u8]) -> Digest {
        let mut a0: u32 = 0x6745_2301;
        let mut b0: u32 = 0xefcd_ab89;
        let mut c0: u32 = 0x98ba_dcfe;
        let mut d0: u32 = 0x1032_5476;

        let mut msg = input.to_vec();
        let original_len_bits = (input.len() as u64).wrapping_mul(8);
        msg.push(0x80);
        while msg.len() % 64 != 56 {
            msg.push(0);
        }
        msg.extend_from_slice(&original_len_bits.to_le_bytes());

        for chunk in msg.chunks_exact(64) {
            let mut m = [0u32; 16];
            for (i, word) in m.iter_mut().enumerate() {
                *word = u32::from_le_bytes([
                    chunk[i * 4],
                    chunk[i * 4 + 1],
                    chunk[i * 4 + 2],
                    chunk[i * 4 + 3],
                ]);
            }

            let (mut a, mut b, mut c, mut d) = (a0, b0, c0, d0);
            for i in 0..64 {
                let (f, g) = match i {
                    0..=15 => ((b & c) | (!b & d), i),
                    16..=31 => ((d & b) | (!d & c), (5 * i + 1) % 16),
                    32..=47 => (b ^ c ^ d, (3 * i + 5) % 16),
                    _ => (c ^ (b | !d), (7 * i) % 16),
                };
                let f = f
                    .wrapping_add(a)
                    .wrapping_add(K[i])
                    .wrapping_add(m[g]);
                a = d;
                d = c;
                c = b;
                b = b.wrapping_add(f.rotate_left(S[i]));
            }

            a0 = a0.wrapping_add(a);
            b0 = b0.wrapping_add(b);
            c0 = c0.wrapping_add(c);
            d0 = d0.wrapping_add(d);
        }

        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&a0.to_le_bytes());
        out[4..8].copy_from_slice(&b0.to_le_bytes());
        out[8..12].copy_from_slice(&c0.to_le_bytes());
        out[12..16].copy_from_slice(&d0.to_le_bytes());
        Digest(out)
    }
}
