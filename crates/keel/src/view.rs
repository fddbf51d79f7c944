//! Views: one workspace folder under one build configuration.
//!
//! A [`View`] owns the chain of snapshots for its folder. Exactly one snapshot
//! is current at a time; installing a successor swaps the pointer first and
//! only then cancels the predecessor, so nobody reading the current snapshot
//! ever sees a cancelled one.
//!
//! # Lock ordering
//!
//! `View::current` is a leaf lock: it is held only for the pointer swap or
//! clone and never across an await point or another lock.

use crate::checker::TypeChecker;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::options::{DirectoryFilters, Options};
use crate::snapshot::{RefTracker, Snapshot, SnapshotRef, SnapshotSeed};
use keel_files::{uri, ContentHash, FileHandle, FileKind, FileStore, KindRules};
use lsp_types::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Stable identifier of a View.
///
/// Identifiers order lexicographically, which is the final tie-break when
/// ranking Views for a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(Arc<str>);

impl ViewId {
    /// Create a View identifier.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The immutable configuration a View was created with.
#[derive(Debug)]
pub struct ViewDefinition {
    /// Root directory, with a trailing slash.
    pub folder: Url,
    /// Display name of the workspace folder.
    pub name: String,
    /// Options in effect, including folder overrides.
    pub options: Arc<Options>,
    /// Resolved build environment.
    pub env: Env,
    /// File classification rules.
    pub kind_rules: KindRules,
    /// Parsed directory filters.
    pub filters: DirectoryFilters,
    /// Digest of `options`.
    pub options_hash: ContentHash,
    /// Digest of `env`.
    pub env_hash: ContentHash,
}

impl ViewDefinition {
    /// Build a definition.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the directory filters do not parse.
    pub fn new(folder: Url, name: impl Into<String>, options: Options, env: Env) -> Result<Self> {
        let filters = options.directory_filters()?;
        Ok(Self {
            kind_rules: options.kind_rules(),
            options_hash: options.hash(),
            env_hash: env.hash(),
            folder,
            name: name.into(),
            options: Arc::new(options),
            env,
            filters,
        })
    }
}

/// A workspace folder with its build configuration and snapshot chain.
pub struct View {
    id: ViewId,
    def: Arc<ViewDefinition>,
    current: RwLock<Arc<Snapshot>>,
    cancel: CancellationToken,
    refs: Arc<RefTracker>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("folder", &self.def.folder.as_str())
            .finish_non_exhaustive()
    }
}

impl View {
    pub(crate) fn new(
        id: ViewId,
        def: ViewDefinition,
        store: Arc<FileStore>,
        checker: Arc<dyn TypeChecker>,
        refs: Arc<RefTracker>,
        global_id: u64,
        overlays: Vec<FileHandle>,
    ) -> Self {
        let def = Arc::new(def);
        let cancel = CancellationToken::new();
        let first = Snapshot::initial(SnapshotSeed {
            view_id: id.clone(),
            def: def.clone(),
            store,
            checker,
            cancel: cancel.child_token(),
            global_id,
            overlays,
        });
        Self {
            id,
            def,
            current: RwLock::new(Arc::new(first)),
            cancel,
            refs,
        }
    }

    /// Acquire a reference to the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutDown` once the View has been removed.
    pub fn snapshot(&self) -> Result<SnapshotRef> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShutDown);
        }
        Ok(SnapshotRef::acquire(self.current(), self.refs.clone()))
    }

    pub(crate) fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Derive and install the successor of the current snapshot.
    ///
    /// Callers serialize installs (the session's modification lock), so the
    /// snapshot read here is still current at the swap.
    pub(crate) fn advance(
        &self,
        global_id: u64,
        overlays: &[FileHandle],
        changes: &HashMap<Url, FileHandle>,
        reload: bool,
    ) -> Arc<Snapshot> {
        let prev = self.current();
        let next = Arc::new(prev.derive(global_id, self.cancel.child_token(), overlays, changes, reload));
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *current = next.clone();
        }
        prev.background_context().cancel();
        prev.retire();
        debug!(
            view = %self.id,
            snapshot = next.sequence_id(),
            global = global_id,
            reload,
            "Installed snapshot"
        );
        next
    }

    /// Whether a change to `uri` can affect this View: a file of a known kind
    /// under the root or under a module root the packages come from, any file
    /// the package graph lists, or a file the current snapshot has read.
    #[must_use]
    pub fn is_interested(&self, uri: &Url) -> bool {
        let snapshot = self.current();
        let known_kind = self.def.kind_rules.classify(uri) != FileKind::Unknown;
        if known_kind && uri::is_within(&self.def.folder, uri) {
            return true;
        }
        if snapshot.find_file(uri).is_some() {
            return true;
        }
        snapshot.loaded_graph().is_some_and(|graph| {
            graph.references(uri)
                || (known_kind && graph.module_roots().iter().any(|root| uri::is_within(root, uri)))
        })
    }

    /// Directories whose files the client should watch for this View: the
    /// root, then every module root outside it.
    #[must_use]
    pub fn watched_directories(&self) -> Vec<Url> {
        let mut dirs = vec![self.def.folder.clone()];
        if let Some(graph) = self.current().loaded_graph() {
            for root in graph.module_roots() {
                if !uri::is_within(&self.def.folder, &root) && !dirs.contains(&root) {
                    dirs.push(root);
                }
            }
        }
        dirs
    }

    /// Cancel the View and its current snapshot.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.current().retire();
    }

    /// Identifier.
    #[must_use]
    pub fn id(&self) -> &ViewId {
        &self.id
    }

    /// Definition the View was created with.
    #[must_use]
    pub fn definition(&self) -> &Arc<ViewDefinition> {
        &self.def
    }

    /// Root directory.
    #[must_use]
    pub fn folder(&self) -> &Url {
        &self.def.folder
    }

    /// Options in effect.
    #[must_use]
    pub fn options(&self) -> &Arc<Options> {
        &self.def.options
    }

    /// Build environment.
    #[must_use]
    pub fn env(&self) -> &Env {
        &self.def.env
    }

    /// Tool chain version of the environment.
    #[must_use]
    pub fn toolchain_version(&self) -> &str {
        &self.def.env.toolchain
    }

    /// Valid for the View's lifetime; cancelled when it is removed.
    #[must_use]
    pub fn background_context(&self) -> &CancellationToken {
        &self.cancel
    }
}
