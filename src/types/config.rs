//! Typed configuration surface for the output backend (spec §6, §4.13).

use serde::Deserialize;
use std::collections::HashMap;

/// Top-level configuration, matching the `general.*` / `airplay_shared.*`
/// / `airplay.<name>.*` sections a host config file would load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AirPlayConfig {
    /// `general.*` section.
    pub general: GeneralConfig,
    /// `airplay_shared.*` section.
    pub airplay_shared: SharedConfig,
    /// Per-device overrides, keyed by device name (`airplay.<name>.*`).
    pub airplay: HashMap<String, DeviceConfig>,
}

impl Default for AirPlayConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            airplay_shared: SharedConfig::default(),
            airplay: HashMap::new(),
        }
    }
}

/// `general.*` settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Whether to attempt IPv6 connections at all.
    pub ipv6: bool,
    /// User-Agent sent on every RTSP request.
    pub user_agent: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            ipv6: true,
            user_agent: "airplay2-rs/1.0".to_string(),
        }
    }
}

/// `airplay_shared.*` settings: ports shared by the timing and control
/// services across all sessions.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    /// Timing service UDP port; 0 picks an ephemeral port.
    pub timing_port: u16,
    /// Control service UDP port; 0 picks an ephemeral port.
    pub control_port: u16,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            timing_port: 0,
            control_port: 0,
        }
    }
}

/// Per-device `airplay.<name>.*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Never attempt to start this device.
    pub exclude: bool,
    /// Keep attempting to (re)connect rather than treating it as
    /// transient.
    pub permanent: bool,
    /// Maximum volume scale, 1..=11 (spec §4.11); out-of-range values
    /// are clamped to 11 by the volume scaler, not here.
    pub max_volume: u8,
    /// Automatically retry `device_start` after a transport failure.
    pub reconnect: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            exclude: false,
            permanent: false,
            max_volume: 11,
            reconnect: false,
        }
    }
}

impl AirPlayConfig {
    /// Look up the effective per-device config, falling back to
    /// defaults if the device has no `airplay.<name>` section.
    #[must_use]
    pub fn device_config(&self, device_name: &str) -> DeviceConfig {
        self.airplay.get(device_name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = AirPlayConfig::default();
        assert!(config.general.ipv6);
        assert_eq!(config.airplay_shared.timing_port, 0);
        assert_eq!(config.airplay_shared.control_port, 0);
    }

    #[test]
    fn device_config_falls_back_to_default() {
        let config = AirPlayConfig::default();
        let dc = config.device_config("Unknown Speaker");
        assert!(!dc.exclude);
        assert_eq!(dc.max_volume, 11);
    }

    #[test]
    fn device_config_honors_override() {
        let mut config = AirPlayConfig::default();
        config.airplay.insert(
            "Kitchen".to_string(),
            DeviceConfig {
                max_volume: 8,
                ..Default::default()
            },
        );
        assert_eq!(config.device_config("Kitchen").max_volume, 8);
        assert_eq!(config.device_config("Other").max_volume, 11);
    }
}
