//! # airplay2
//!
//! An `AirPlay` 2 audio output backend: discovers speakers over mDNS,
//! negotiates a `HomeKit`-encrypted RTSP control session with each, and
//! streams synchronized ALAC-framed PCM over RTP/UDP with metadata and
//! volume delivery.
//!
//! This crate is a backend a media player drives through the
//! [`backend`] module's output-device operations; it does not itself
//! decide what to play.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Output-device operations consumed by the player (C14).
pub mod backend;
/// Error types
pub mod error;
/// Device discovery and the mDNS-to-descriptor registry hook (C13).
pub mod discovery;
/// Per-quality audio aggregator (C10).
pub mod master_session;
/// Network transport traits and HAP-encrypted TCP sessions
pub mod net;
/// Wire protocol building blocks: RTSP, RTP, pairing, plist, DAAP, crypto.
pub mod protocol;
/// Table-driven RTSP request/response sequencer (C8).
pub mod sequence;
/// Per-device session state machine (C9).
pub mod session;
/// State and event plumbing shared across the reactor.
pub mod state;
/// Core types
pub mod types;
/// Percent/dB volume scaling (C12).
pub mod volume;

pub use backend::AirPlayOutput;
pub use error::AirPlayError;
pub use types::{AirPlayConfig, AirPlayDevice};

// Discovery functions
pub use discovery::{discover, scan};
