//! Error types for the keel core.

use std::io;
use thiserror::Error;

/// The error type for session, snapshot and diagnostics operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A request arrived before `initialize`.
    #[error("server not initialized")]
    NotInitialized,

    /// `initialize` was received twice.
    #[error("server already initialized")]
    AlreadyInitialized,

    /// The session has been shut down.
    #[error("session is shut down")]
    ShutDown,

    /// No view matches the request.
    #[error("unknown view: {0}")]
    UnknownView(String),

    /// The file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The URI cannot be handled.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// An edit range does not fit the document.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// A request or notification payload could not be interpreted.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// A best-effort operation failed and may succeed later.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Options could not be decoded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error is a cooperative cancellation rather than a failure.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the client sent something it should not have.
    #[must_use]
    pub fn is_invalid_params(&self) -> bool {
        matches!(
            self,
            Self::InvalidRange(_) | Self::MalformedPayload(_) | Self::InvalidUri(_)
        )
    }
}

impl From<keel_files::Error> for Error {
    fn from(err: keel_files::Error) -> Self {
        match err {
            keel_files::Error::InvalidRange(msg) => Self::InvalidRange(msg),
            keel_files::Error::MalformedPayload(msg) => Self::MalformedPayload(msg),
            keel_files::Error::InvalidUri(uri) => Self::InvalidUri(uri),
            keel_files::Error::FileNotFound(uri) => Self::FileNotFound(uri),
            keel_files::Error::UnopenedOverlay(uri) => {
                Self::MalformedPayload(format!("{uri} is not open"))
            }
            keel_files::Error::Io(e) => Self::Transient(e.to_string()),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A specialized Result type for keel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_errors_keep_their_kind() {
        let err: Error = keel_files::Error::InvalidRange("0:9".into()).into();
        assert!(matches!(err, Error::InvalidRange(_)));
        assert!(err.is_invalid_params());

        let err: Error = keel_files::Error::Io(io::Error::other("disk")).into();
        assert!(matches!(err, Error::Transient(_)));
        assert!(!err.is_invalid_params());
    }

    #[test]
    fn only_cancelled_is_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::Internal("x".into()).is_cancellation());
    }
}
