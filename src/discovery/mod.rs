//! mDNS discovery of `_airplay._tcp` service records (C13).
//!
//! Resolution and TXT parsing live in [`browser`]/[`parser`]; this
//! module's free functions are the collaborator interface spec'd in
//! spec.md §6 (`browse(_airplay._tcp, ...)`), reduced to the common
//! case of "give me what's out there right now".

mod browser;
mod parser;

pub use browser::{DeviceBrowser, DiscoveryEvent};
pub use parser::{parse_features, parse_model_name, parse_txt_records, txt_keys};

use crate::types::{AirPlayConfig, AirPlayDevice};
use crate::AirPlayError;
use futures::StreamExt;
use std::time::Duration;

/// mDNS service type this crate browses.
pub const AIRPLAY_SERVICE_TYPE: &str = "_airplay._tcp.local.";

/// Discover `AirPlay` devices on the network using default settings.
///
/// # Errors
///
/// Returns an error if the mDNS daemon cannot be initialized.
pub async fn discover() -> Result<Vec<AirPlayDevice>, AirPlayError> {
    scan(Duration::from_secs(5)).await
}

/// Scan for `AirPlay` devices, collecting whatever resolves within
/// `timeout`.
///
/// # Errors
///
/// Returns an error if the mDNS daemon cannot be initialized.
pub async fn scan(timeout: Duration) -> Result<Vec<AirPlayDevice>, AirPlayError> {
    let browser = DeviceBrowser::new(AirPlayConfig::default());
    let mut stream = Box::pin(browser.browse()?);
    let mut devices = std::collections::HashMap::new();

    let _ = tokio::time::timeout(timeout, async {
        while let Some(event) = stream.next().await {
            match event {
                DiscoveryEvent::Added(d) | DiscoveryEvent::Updated(d) => {
                    devices.insert(d.id.clone(), d);
                }
                DiscoveryEvent::Removed(id) => {
                    devices.remove(&id);
                }
            }
        }
    })
    .await;

    Ok(devices.into_values().collect())
}
