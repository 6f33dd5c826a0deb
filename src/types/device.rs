use std::collections::HashMap;
use std::net::IpAddr;

/// A discovered `AirPlay` 2 device, built from an mDNS `_airplay._tcp`
/// service record by the discovery module (C13).
#[derive(Debug, Clone, PartialEq)]
pub struct AirPlayDevice {
    /// Device identifier from the `deviceid` TXT key (colon-separated MAC).
    pub id: String,

    /// Human-readable device name (the mDNS instance name).
    pub name: String,

    /// Device model identifier from the `model` TXT key, e.g.
    /// `"AudioAccessory5,1"`.
    pub model: Option<String>,

    /// Resolved IP addresses.
    pub addresses: Vec<IpAddr>,

    /// `AirPlay` RTSP control port.
    pub port: u16,

    /// Capability flags parsed from the `features` TXT key.
    pub capabilities: DeviceCapabilities,

    /// Raw TXT record key/value pairs, kept for protocol use
    /// (e.g. re-deriving a field a future code path needs).
    pub txt_records: HashMap<String, String>,

    /// Set once a prior session saw a 403/470 demand a PIN before
    /// pairing could proceed; persists across `Session` instances
    /// (reconnects, IPv6-fallback restarts) until a successful
    /// pair-setup clears it (spec §7).
    pub requires_auth: bool,
}

/// Capability flags parsed from a device's `features` bitmask.
///
/// Bit numbers match the mapping forked-daapd's AirPlay backend uses;
/// see `examples/original_source/src/outputs/airplay.c`'s `features_map`.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct DeviceCapabilities {
    /// Bit 9 — supports audio streaming. Devices without this are
    /// discarded by the registry hook (C13).
    pub supports_audio: bool,

    /// Bit 14 — MFi (legacy) authentication hardware present.
    pub supports_mfi_auth: bool,

    /// Bit 15 — wants artwork pushed via `SEND_ARTWORK`.
    pub wants_artwork: bool,

    /// Bit 16 — wants progress pushed via `SEND_PROGRESS`.
    pub wants_progress: bool,

    /// Bit 17 — wants DAAP "now playing" text via `SEND_TEXT`.
    pub wants_text: bool,

    /// Bit 27 — supports legacy (AirPlay 1 RSA) pairing.
    pub supports_legacy_pairing: bool,

    /// Bit 38 — supports buffered (gapless) audio.
    pub supports_buffered_audio: bool,

    /// Bit 40 — supports PTP timing (non-goal; recorded for
    /// completeness, never acted on).
    pub supports_ptp: bool,

    /// Bit 43 — supports HomeKit "system pairing" (normal pair-setup).
    pub supports_system_pairing: bool,

    /// Bit 46 — HomeKit pairing and access control.
    pub supports_hk_access_control: bool,

    /// Bit 48 — `AirPlay` 2 / CoreUtils pairing and encryption. This is
    /// the canonical "is this an `AirPlay` 2 device" bit.
    pub airplay2: bool,

    /// Bit 52 — supports HomeKit transient pairing.
    pub supports_transient_pairing: bool,

    /// Raw features bitmask, kept for diagnostics.
    pub raw_features: u64,
}

impl AirPlayDevice {
    /// Whether this device advertises `AirPlay` 2 support.
    #[must_use]
    pub fn supports_airplay2(&self) -> bool {
        self.capabilities.airplay2
    }

    /// Whether this device supports transient (SRP-less) pairing.
    #[must_use]
    pub fn supports_transient_pairing(&self) -> bool {
        self.capabilities.supports_transient_pairing
    }

    /// Whether this device supports PTP timing (never used; present
    /// only so callers can log/skip such devices deliberately).
    #[must_use]
    pub fn supports_ptp(&self) -> bool {
        self.capabilities.supports_ptp
    }

    /// Current volume reported by discovery (`vv` TXT key), if present.
    #[must_use]
    pub fn discovered_volume(&self) -> Option<f32> {
        self.txt_records.get("vv").and_then(|v| v.parse().ok())
    }

    /// Primary address to dial: prefers IPv4, then non-link-local IPv6.
    #[must_use]
    pub fn address(&self) -> IpAddr {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| {
                self.addresses
                    .iter()
                    .find(|addr| matches!(addr, IpAddr::V6(v6) if v6.segments()[0] != 0xfe80))
            })
            .or_else(|| self.addresses.first())
            .copied()
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
    }

    /// Whether this device has both an IPv4 and IPv6 address, making it
    /// eligible for the v6-then-v4 startup fallback (spec §4.1).
    #[must_use]
    pub fn has_dual_stack(&self) -> bool {
        self.addresses.iter().any(IpAddr::is_ipv4) && self.addresses.iter().any(IpAddr::is_ipv6)
    }
}

/// Feature-bit constants, named after what they gate rather than their
/// mDNS TXT label.
pub mod feature_bits {
    /// Audio streaming support; required for admission.
    pub const AUDIO: u64 = 1 << 9;
    /// MFi legacy auth hardware.
    pub const MFI_AUTH: u64 = 1 << 14;
    /// Wants artwork.
    pub const WANTS_ARTWORK: u64 = 1 << 15;
    /// Wants progress.
    pub const WANTS_PROGRESS: u64 = 1 << 16;
    /// Wants DAAP text metadata.
    pub const WANTS_TEXT: u64 = 1 << 17;
    /// Legacy (AirPlay 1) pairing.
    pub const LEGACY_PAIRING: u64 = 1 << 27;
    /// Buffered/gapless audio.
    pub const BUFFERED_AUDIO: u64 = 1 << 38;
    /// PTP timing (non-goal).
    pub const PTP_CLOCK: u64 = 1 << 40;
    /// HomeKit "system pairing" (normal pair-setup).
    pub const SYSTEM_PAIRING: u64 = 1 << 43;
    /// HomeKit pairing and access control.
    pub const HK_ACCESS_CONTROL: u64 = 1 << 46;
    /// `AirPlay` 2 / CoreUtils pairing and encryption.
    pub const AIRPLAY_2: u64 = 1 << 48;
    /// HomeKit transient pairing.
    pub const TRANSIENT_PAIRING: u64 = 1 << 52;
}

impl DeviceCapabilities {
    /// Parse capabilities from an `AirPlay` features bitmask (the two
    /// comma-separated 32-bit hex words from the TXT record, already
    /// combined into one `u64` by the caller).
    #[must_use]
    pub fn from_features(features: u64) -> Self {
        use feature_bits as f;
        let has = |bit: u64| features & bit != 0;
        Self {
            supports_audio: has(f::AUDIO),
            supports_mfi_auth: has(f::MFI_AUTH),
            wants_artwork: has(f::WANTS_ARTWORK),
            wants_progress: has(f::WANTS_PROGRESS),
            wants_text: has(f::WANTS_TEXT),
            supports_legacy_pairing: has(f::LEGACY_PAIRING),
            supports_buffered_audio: has(f::BUFFERED_AUDIO),
            supports_ptp: has(f::PTP_CLOCK),
            supports_system_pairing: has(f::SYSTEM_PAIRING),
            supports_hk_access_control: has(f::HK_ACCESS_CONTROL),
            airplay2: has(f::AIRPLAY_2),
            supports_transient_pairing: has(f::TRANSIENT_PAIRING),
            raw_features: features,
        }
    }
}
