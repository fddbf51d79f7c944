//! Hash-addressed file store for the keel language server.
//!
//! This crate owns the lowest layer of the server's workspace model: what a
//! file *is* at a given instant. It provides:
//!
//! - [`FileHandle`]: an immutable, cheaply cloned reference to a file's
//!   content at a point in time, identified by a [`ContentHash`]
//! - [`FileKind`]: the closed set of file categories the server cares about
//! - [`Modification`]: a single editor or filesystem event
//! - [`FileStore`]: the overlay set plus a memoized view of the disk
//!
//! Incremental edits from the editor are applied by [`edit::apply_changes`]
//! using LSP (UTF-16) position semantics.

#![forbid(unsafe_code)]

pub mod edit;
pub mod error;
pub mod hash;
pub mod kind;
pub mod uri;

mod handle;
mod modification;
mod store;

pub use error::{Error, Result};
pub use handle::{DISK_VERSION, FileHandle};
pub use hash::ContentHash;
pub use kind::{FileKind, KindRules, KindTable};
pub use modification::{Modification, ModificationAction, Payload};
pub use store::FileStore;
