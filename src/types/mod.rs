//! Core types for the airplay2 library

mod config;
mod device;

pub use config::{AirPlayConfig, DeviceConfig, GeneralConfig, SharedConfig};
pub use device::{AirPlayDevice, DeviceCapabilities};
