//! Error taxonomy for the networking core.
//!
//! Per-session failures (decode errors, auth failures, oversize frames)
//! terminate only that session; the coordinator keeps running. Callers see
//! failures through `Result` returns and through the event stream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("operation timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Error used to fail pending requests when their session goes away.
    pub(crate) fn disconnected() -> Self {
        VaultError::Network(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "session closed",
        ))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::ProtocolDecode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
