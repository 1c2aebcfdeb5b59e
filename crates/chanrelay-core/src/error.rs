//! Shared error type across chanrelay crates.

use thiserror::Error;

/// Stable error classes (used in logs, metrics labels, and test vectors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed header, bad sub-code, or a request in the wrong state.
    ProtocolViolation,
    /// Frame exceeds the configured maximum size.
    PayloadTooLarge,
    /// Peer speaks a different protocol revision.
    UnsupportedVersion,
    /// Unknown channel or peer.
    NotFound,
    /// Rejected by an authorization hook.
    Denied,
    /// ID space exhausted.
    ResourceExhausted,
    /// Invalid configuration.
    BadConfig,
    /// Socket level failure.
    Io,
    /// Internal invariant broken.
    Internal,
}

impl ErrorClass {
    /// String representation used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorClass::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorClass::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorClass::NotFound => "NOT_FOUND",
            ErrorClass::Denied => "DENIED",
            ErrorClass::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorClass::BadConfig => "BAD_CONFIG",
            ErrorClass::Io => "IO",
            ErrorClass::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Unified error type used by core, server and client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("denied: {0}")]
    Denied(String),
    #[error("{0} ids exhausted")]
    IdsExhausted(&'static str),
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal: {0}")]
    Internal(String),
}

impl RelayError {
    /// Shorthand for a protocol violation.
    pub fn protocol(msg: impl Into<String>) -> Self {
        RelayError::Protocol(msg.into())
    }

    /// Map to the stable error class.
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Protocol(_) => ErrorClass::ProtocolViolation,
            RelayError::PayloadTooLarge { .. } => ErrorClass::PayloadTooLarge,
            RelayError::UnsupportedVersion(_) => ErrorClass::UnsupportedVersion,
            RelayError::NotFound(_) => ErrorClass::NotFound,
            RelayError::Denied(_) => ErrorClass::Denied,
            RelayError::IdsExhausted(_) => ErrorClass::ResourceExhausted,
            RelayError::BadConfig(_) => ErrorClass::BadConfig,
            RelayError::Io(_) => ErrorClass::Io,
            RelayError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Fatal errors must stop the engine's driver instead of being logged and
    /// skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::IdsExhausted(_) | RelayError::Internal(_))
    }
}
