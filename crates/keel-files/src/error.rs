//! Error types for keel-files operations.

use std::io;
use thiserror::Error;

/// The error type for file store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An edit range was inverted or pointed outside the document.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// A modification payload could not be interpreted.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The URI does not name a local file.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The file does not exist on disk and has no overlay.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A save or close arrived for a file that was never opened.
    #[error("no overlay for {0}")]
    UnopenedOverlay(String),

    /// IO error occurred while reading from disk.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A specialized Result type for keel-files operations.
pub type Result<T> = std::result::Result<T, Error>;
