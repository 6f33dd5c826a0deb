//! Error taxonomy for the `AirPlay` 2 output backend.
//!
//! Every variant maps onto one of the seven conceptual error kinds a
//! session can fail with: transport, protocol, auth-required, auth-bad,
//! encryption, timeout, and fatal-bug. The mapping is carried in
//! [`AirPlayError::kind`], which the sequence engine and session state
//! machine use to decide how to react.

use std::fmt;

/// A coarse classification of an [`AirPlayError`], used to drive state
/// transitions without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused/closed, or a `send`/`recv` failure.
    Transport,
    /// Unparseable plist, missing required response field, unsupported
    /// auth scheme.
    Protocol,
    /// The device requires a PIN before it will pair.
    AuthRequired,
    /// A previously stored key or password was rejected.
    AuthBad,
    /// AEAD encrypt/decrypt failure on a framed channel.
    Encryption,
    /// An operation did not complete before its deadline.
    Timeout,
    /// Programming error: sequence table misalignment or an unreachable
    /// state was reached.
    FatalBug,
}

/// Errors produced by the `airplay2` crate.
#[derive(Debug, thiserror::Error)]
pub enum AirPlayError {
    /// The RTSP control connection to a device could not be established
    /// or was closed unexpectedly.
    #[error("connection to {device_name} failed: {message}")]
    ConnectionFailed {
        /// Name of the device being connected to.
        device_name: String,
        /// Human-readable detail.
        message: String,
        /// Underlying I/O error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// A previously established connection dropped.
    #[error("disconnected from {device_name}")]
    Disconnected {
        /// Name of the device that disconnected.
        device_name: String,
    },

    /// An RTSP response could not be parsed, or its status line was
    /// not a success the caller could proceed on.
    #[error("RTSP error: {message}")]
    RtspError {
        /// Human-readable detail.
        message: String,
        /// Status code, if the response parsed far enough to have one.
        status_code: Option<u16>,
    },

    /// Pairing or digest authentication failed.
    #[error("authentication failed: {message}")]
    AuthenticationFailed {
        /// Human-readable detail.
        message: String,
        /// Whether the caller can retry (e.g. a fresh PIN), as opposed
        /// to a hard protocol violation.
        recoverable: bool,
    },

    /// mDNS browsing could not be started or produced an unusable
    /// record.
    #[error("discovery failed: {message}")]
    DiscoveryFailed {
        /// Human-readable detail.
        message: String,
        /// Underlying error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// A binary plist or TLV8 payload did not contain a field the
    /// caller required.
    #[error("protocol error: missing field `{field}` in {context}")]
    MissingField {
        /// Name of the missing field.
        field: String,
        /// What was being parsed, for logs (e.g. "SETUP(stream) response").
        context: String,
    },

    /// AEAD encrypt/decrypt failed on a framed channel.
    #[error("encryption failure on {channel}: {message}")]
    EncryptionFailure {
        /// Which channel failed (`"control"`, `"events"`, `"audio"`).
        channel: String,
        /// Human-readable detail.
        message: String,
    },

    /// A request or handshake step did not complete in time.
    #[error("timeout waiting for {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
    },

    /// Internal invariant violated: a sequence table was misaligned,
    /// or the state machine reached a state it never should.
    #[error("internal error: {message}")]
    FatalBug {
        /// Human-readable detail.
        message: String,
    },
}

impl AirPlayError {
    /// Classify this error into one of the seven conceptual kinds.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionFailed { .. } | Self::Disconnected { .. } => ErrorKind::Transport,
            Self::RtspError { .. } | Self::MissingField { .. } => ErrorKind::Protocol,
            Self::AuthenticationFailed { recoverable, .. } => {
                if *recoverable {
                    ErrorKind::AuthRequired
                } else {
                    ErrorKind::AuthBad
                }
            }
            Self::DiscoveryFailed { .. } => ErrorKind::Transport,
            Self::EncryptionFailure { .. } => ErrorKind::Encryption,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::FatalBug { .. } => ErrorKind::FatalBug,
        }
    }

    /// Build a [`Self::FatalBug`] from a static description.
    ///
    /// Used in place of `panic!`/`unreachable!` at sequence-table
    /// misalignments and other states that should be unreachable but
    /// must not crash the reactor.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalBug {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::AuthRequired => "auth_required",
            Self::AuthBad => "auth_bad",
            Self::Encryption => "encryption",
            Self::Timeout => "timeout",
            Self::FatalBug => "fatal_bug",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failed_is_transport() {
        let err = AirPlayError::ConnectionFailed {
            device_name: "Kitchen".into(),
            message: "refused".into(),
            source: None,
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn recoverable_auth_is_auth_required() {
        let err = AirPlayError::AuthenticationFailed {
            message: "pin needed".into(),
            recoverable: true,
        };
        assert_eq!(err.kind(), ErrorKind::AuthRequired);
    }

    #[test]
    fn non_recoverable_auth_is_auth_bad() {
        let err = AirPlayError::AuthenticationFailed {
            message: "bad mac".into(),
            recoverable: false,
        };
        assert_eq!(err.kind(), ErrorKind::AuthBad);
    }

    #[test]
    fn fatal_helper_sets_kind() {
        let err = AirPlayError::fatal("sequence table misaligned");
        assert_eq!(err.kind(), ErrorKind::FatalBug);
    }
}
