//! Wire protocol building blocks: crypto primitives, pairing, RTSP, RTP,
//! plist encoding, and DAAP metadata/artwork.

#![allow(missing_docs)]

pub mod alac;
pub mod crypto;
pub mod daap;
pub mod pairing;
pub mod plist;
pub mod rtp;
pub mod rtsp;
