//! Immutable file handles.

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::kind::FileKind;
use lsp_types::Url;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;

/// Version carried by handles that do not come from an editor overlay.
pub const DISK_VERSION: i32 = -1;

/// The content of a file URI at one point in time.
///
/// Handles are cheap to clone and never change once built. A newer state of
/// the same URI is always a new handle. Two handles with equal
/// [`hash`](Self::hash) can be used interchangeably for reads.
#[derive(Clone)]
pub struct FileHandle(Arc<Inner>);

struct Inner {
    uri: Url,
    version: i32,
    content: Content,
    hash: ContentHash,
    kind: FileKind,
    overlay: bool,
    saved: bool,
    mtime: Option<SystemTime>,
}

enum Content {
    Bytes(Arc<[u8]>),
    Unreadable { kind: io::ErrorKind, message: String },
}

impl FileHandle {
    /// Build an overlay handle for content edited in the client.
    #[must_use]
    pub fn overlay(uri: Url, version: i32, text: impl Into<Arc<[u8]>>, kind: FileKind, saved: bool) -> Self {
        let bytes: Arc<[u8]> = text.into();
        Self(Arc::new(Inner {
            uri,
            version,
            hash: ContentHash::of(&bytes),
            content: Content::Bytes(bytes),
            kind,
            overlay: true,
            saved,
            mtime: None,
        }))
    }

    /// Build a handle for content read from disk.
    #[must_use]
    pub fn disk(uri: Url, bytes: impl Into<Arc<[u8]>>, kind: FileKind, mtime: Option<SystemTime>) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        Self(Arc::new(Inner {
            uri,
            version: DISK_VERSION,
            hash: ContentHash::of(&bytes),
            content: Content::Bytes(bytes),
            kind,
            overlay: false,
            saved: true,
            mtime,
        }))
    }

    /// Build a handle for a file that could not be read.
    ///
    /// The handle is still a valid snapshot input: its hash is
    /// [`ContentHash::missing`] and reading its content reports the error.
    #[must_use]
    pub fn unreadable(uri: Url, kind: FileKind, err: &io::Error) -> Self {
        Self(Arc::new(Inner {
            uri,
            version: DISK_VERSION,
            hash: ContentHash::missing(),
            content: Content::Unreadable {
                kind: err.kind(),
                message: err.to_string(),
            },
            kind,
            overlay: false,
            saved: true,
            mtime: None,
        }))
    }

    /// The file URI.
    #[must_use]
    pub fn uri(&self) -> &Url {
        &self.0.uri
    }

    /// Editor version, or [`DISK_VERSION`] for on-disk content.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.0.version
    }

    /// Content digest.
    #[must_use]
    pub fn hash(&self) -> ContentHash {
        self.0.hash
    }

    /// File kind.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.0.kind
    }

    /// True iff the content comes from the editor.
    #[must_use]
    pub fn is_overlay(&self) -> bool {
        self.0.overlay
    }

    /// True if the content is known to match disk: always for disk handles,
    /// and for overlays last saved without further edits.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.0.saved
    }

    /// Modification time observed when the file was read from disk.
    #[must_use]
    pub fn mtime(&self) -> Option<SystemTime> {
        self.0.mtime
    }

    /// Whether reading the file failed.
    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self.0.content, Content::Unreadable { .. })
    }

    /// The raw content.
    ///
    /// # Errors
    ///
    /// Returns `Error::FileNotFound` if the file does not exist and
    /// `Error::Io` for other read failures.
    pub fn content(&self) -> Result<&[u8]> {
        match &self.0.content {
            Content::Bytes(bytes) => Ok(bytes),
            Content::Unreadable {
                kind: io::ErrorKind::NotFound,
                ..
            } => Err(Error::FileNotFound(self.0.uri.to_string())),
            Content::Unreadable { kind, message } => Err(Error::Io(io::Error::new(*kind, message.clone()))),
        }
    }

    /// The content as text.
    ///
    /// # Errors
    ///
    /// Fails like [`content`](Self::content), and with
    /// `Error::MalformedPayload` if the bytes are not UTF-8.
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(self.content()?)
            .map_err(|e| Error::MalformedPayload(format!("{} is not valid UTF-8: {e}", self.0.uri)))
    }

    /// Whether both handles denote the same state of the same file.
    #[must_use]
    pub fn same_state(&self, other: &FileHandle) -> bool {
        self.0.uri == other.0.uri
            && self.0.hash == other.0.hash
            && self.0.version == other.0.version
            && self.0.overlay == other.0.overlay
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("uri", &self.0.uri.as_str())
            .field("version", &self.0.version)
            .field("hash", &self.0.hash)
            .field("kind", &self.0.kind)
            .field("overlay", &self.0.overlay)
            .finish_non_exhaustive()
    }
}
