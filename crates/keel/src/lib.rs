//! Keel - the session, snapshot and diagnostics core of a language server.
//!
//! The crate models an editor workspace as a set of [`View`]s, one per folder
//! and build configuration, each exposing an immutable [`Snapshot`] of the
//! workspace that is replaced as files change. Diagnostics are computed per
//! snapshot in the background, merged across Views, and pushed to the editor
//! only when they change.
//!
//! [`Server`] is the entry point for a protocol front end; [`Session`] can be
//! driven directly when no protocol is involved.

#![forbid(unsafe_code)]

// Workspace model
pub mod best_view;
pub mod metadata;
pub mod session;
pub mod snapshot;
pub mod view;

// Diagnostics
pub mod diagnostics;

// Collaborators the core talks to
pub mod checker;
pub mod client;
pub mod env;

// Protocol surface
pub mod bug;
pub mod progress;
pub mod server;
pub mod watch;

pub mod error;
pub mod options;

pub use diagnostics::{Cause, Diagnostic, DiagnosticMap, DiagnosticStore};
pub use error::{Error, Result};
pub use options::{ClientOptions, DiagnosticsTrigger, Options, SessionConfig};
pub use server::Server;
pub use session::Session;
pub use snapshot::{Snapshot, SnapshotRef};
pub use view::{View, ViewId};
