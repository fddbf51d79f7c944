//! Immutable workspace snapshots.
//!
//! A [`Snapshot`] is one consistent state of a View: the files it has seen,
//! the options and environment of the View, the package metadata graph, and
//! the type-check and analysis results derived from them. Successive
//! snapshots of a View share file handles and carry over every cached result
//! whose inputs did not change.
//!
//! Readers hold a [`SnapshotRef`]. The reference keeps the snapshot alive,
//! counts toward the session's shutdown drain, and releases the snapshot's
//! caches once the snapshot has been superseded and the last reference is
//! gone.

use crate::checker::{PackageDiagnostics, TypeChecker};
use crate::diagnostics::DiagnosticMap;
use crate::env::Env;
use crate::error::{Error, Result};
use crate::metadata::{MetadataGraph, PackageId, PackageMetadata};
use crate::options::Options;
use crate::progress::WorkHandle;
use crate::view::{ViewDefinition, ViewId};
use keel_files::{uri, ContentHash, FileHandle, FileKind, FileStore};
use lsp_types::Url;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why loading a View's packages failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializationError {
    /// The loader's message.
    pub message: String,
    /// The manifest the failure is attributed to, if any.
    pub uri: Option<Url>,
}

/// Result of loading metadata for one snapshot.
#[derive(Debug)]
pub struct LoadOutcome {
    /// The package graph: freshly loaded, or the predecessor's if loading
    /// failed.
    pub graph: Arc<MetadataGraph>,
    /// Set when loading failed.
    pub error: Option<InitializationError>,
}

/// A cached per-package result with the inputs it was computed from.
#[derive(Debug, Clone)]
struct CacheEntry {
    inputs: BTreeMap<Url, ContentHash>,
    options: ContentHash,
    env: ContentHash,
    value: PackageDiagnostics,
}

impl CacheEntry {
    fn still_valid(&self, changed: &BTreeSet<Url>, options: ContentHash, env: ContentHash) -> bool {
        self.options == options && self.env == env && !self.inputs.keys().any(|u| changed.contains(u))
    }
}

type Cache = Mutex<HashMap<PackageId, CacheEntry>>;

/// Tracing labels of a snapshot.
#[derive(Debug, Clone)]
pub struct Labels {
    view: ViewId,
    sequence_id: u64,
    global_id: u64,
    folder: Url,
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "view={} snapshot={} global={} folder={}",
            self.view, self.sequence_id, self.global_id, self.folder
        )
    }
}

/// Everything needed to build a View's first snapshot.
pub(crate) struct SnapshotSeed {
    pub view_id: ViewId,
    pub def: Arc<ViewDefinition>,
    pub store: Arc<FileStore>,
    pub checker: Arc<dyn TypeChecker>,
    pub cancel: CancellationToken,
    pub global_id: u64,
    pub overlays: Vec<FileHandle>,
}

/// One consistent state of a View.
pub struct Snapshot {
    sequence_id: u64,
    global_id: u64,
    parent: Option<u64>,
    view_id: ViewId,
    def: Arc<ViewDefinition>,
    cancel: CancellationToken,
    store: Arc<FileStore>,
    checker: Arc<dyn TypeChecker>,
    files: Mutex<HashMap<Url, FileHandle>>,
    changed: BTreeSet<Url>,
    metadata: OnceCell<Arc<LoadOutcome>>,
    fallback_graph: Option<Arc<MetadataGraph>>,
    type_checked: Cache,
    analyzed: Cache,
    refs: AtomicUsize,
    retired: AtomicBool,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("view", &self.view_id)
            .field("sequence_id", &self.sequence_id)
            .field("global_id", &self.global_id)
            .finish_non_exhaustive()
    }
}

impl Snapshot {
    pub(crate) fn initial(seed: SnapshotSeed) -> Self {
        let files = seed
            .overlays
            .into_iter()
            .map(|h| (h.uri().clone(), h))
            .collect();
        Self {
            sequence_id: 1,
            global_id: seed.global_id,
            parent: None,
            view_id: seed.view_id,
            def: seed.def,
            cancel: seed.cancel,
            store: seed.store,
            checker: seed.checker,
            files: Mutex::new(files),
            changed: BTreeSet::new(),
            metadata: OnceCell::new(),
            fallback_graph: None,
            type_checked: Mutex::new(HashMap::new()),
            analyzed: Mutex::new(HashMap::new()),
            refs: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }

    /// Derive the successor of this snapshot.
    ///
    /// `overlays` is the complete current overlay set and `changes` the
    /// post-state of every URI touched by the batch. Cached results are
    /// carried over unless one of their input files changed; everything is
    /// dropped when `reload` forces a fresh metadata load.
    pub(crate) fn derive(
        &self,
        global_id: u64,
        cancel: CancellationToken,
        overlays: &[FileHandle],
        changes: &HashMap<Url, FileHandle>,
        reload: bool,
    ) -> Self {
        let old = self.lock_files().clone();

        let mut files: HashMap<Url, FileHandle> = old
            .iter()
            .filter(|(_, h)| !h.is_overlay())
            .map(|(u, h)| (u.clone(), h.clone()))
            .collect();
        for handle in overlays {
            files.insert(handle.uri().clone(), handle.clone());
        }
        for (uri, handle) in changes {
            if !(handle.is_overlay() || files.get(uri).is_some_and(FileHandle::is_overlay)) {
                files.insert(uri.clone(), handle.clone());
            }
        }

        let mut changed: BTreeSet<Url> = changes.keys().cloned().collect();
        for uri in old.keys().chain(files.keys()) {
            let same = match (old.get(uri), files.get(uri)) {
                (Some(a), Some(b)) => a.same_state(b),
                (None, None) => true,
                _ => false,
            };
            if !same {
                changed.insert(uri.clone());
            }
        }
        // Disk handles for changed files are re-read on demand.
        for uri in &changed {
            if files.get(uri).is_some_and(|h| !h.is_overlay()) && !changes.contains_key(uri) {
                files.remove(uri);
            }
        }

        let options = self.def.options_hash;
        let env = self.def.env_hash;
        let carry = |cache: &Cache| -> HashMap<PackageId, CacheEntry> {
            if reload {
                return HashMap::new();
            }
            lock(cache)
                .iter()
                .filter(|(_, e)| e.still_valid(&changed, options, env))
                .map(|(id, e)| (id.clone(), e.clone()))
                .collect()
        };
        let type_checked = carry(&self.type_checked);
        let analyzed = carry(&self.analyzed);

        let metadata = match self.metadata.get() {
            Some(outcome) if !reload && outcome.error.is_none() => OnceCell::new_with(Some(outcome.clone())),
            _ => OnceCell::new(),
        };

        trace!(
            view = %self.view_id,
            from = self.sequence_id,
            changed = changed.len(),
            carried = type_checked.len() + analyzed.len(),
            reload,
            "Derived snapshot"
        );

        Self {
            sequence_id: self.sequence_id + 1,
            global_id,
            parent: Some(self.sequence_id),
            view_id: self.view_id.clone(),
            def: self.def.clone(),
            cancel,
            store: self.store.clone(),
            checker: self.checker.clone(),
            files: Mutex::new(files),
            changed,
            metadata,
            fallback_graph: self.loaded_graph(),
            type_checked: Mutex::new(type_checked),
            analyzed: Mutex::new(analyzed),
            refs: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
        }
    }

    fn lock_files(&self) -> std::sync::MutexGuard<'_, HashMap<Url, FileHandle>> {
        lock(&self.files)
    }

    // ========== Files ==========

    /// Read a file as of this snapshot.
    ///
    /// Overlays are fixed when the snapshot is created; disk files are read
    /// on first access and the first result is kept, so every reader of the
    /// snapshot sees the same content.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUri` for URIs that are neither open nor local
    /// files.
    pub async fn read_file(&self, uri: &Url) -> Result<FileHandle> {
        if let Some(handle) = self.lock_files().get(uri) {
            return Ok(handle.clone());
        }
        let handle = self.store.read_disk(uri).await?;
        Ok(self
            .lock_files()
            .entry(uri.clone())
            .or_insert(handle)
            .clone())
    }

    /// The handle for `uri` if the snapshot has already seen the file.
    #[must_use]
    pub fn find_file(&self, uri: &Url) -> Option<FileHandle> {
        self.lock_files().get(uri).cloned()
    }

    /// Whether `uri` is open in the editor.
    #[must_use]
    pub fn is_open(&self, uri: &Url) -> bool {
        self.lock_files().get(uri).is_some_and(FileHandle::is_overlay)
    }

    /// Open files, ordered by URI.
    #[must_use]
    pub fn overlays(&self) -> Vec<FileHandle> {
        let mut overlays: Vec<_> = self
            .lock_files()
            .values()
            .filter(|h| h.is_overlay())
            .cloned()
            .collect();
        overlays.sort_by(|a, b| a.uri().as_str().cmp(b.uri().as_str()));
        overlays
    }

    /// Every file this snapshot knows of: files it has read or that are
    /// open, plus every file its package graph lists.
    #[must_use]
    pub fn known_files(&self) -> BTreeSet<Url> {
        let mut known: BTreeSet<Url> = self.lock_files().keys().cloned().collect();
        if let Some(graph) = self.loaded_graph() {
            known.extend(graph.files().cloned());
        }
        known
    }

    /// URIs whose content differs from the parent snapshot.
    #[must_use]
    pub fn changed_files(&self) -> &BTreeSet<Url> {
        &self.changed
    }

    /// Kind of a file under this View's rules.
    ///
    /// Overlays keep the kind chosen when they were opened.
    #[must_use]
    pub fn file_kind(&self, handle: &FileHandle) -> FileKind {
        if handle.is_overlay() {
            handle.kind()
        } else {
            self.def.kind_rules.classify(handle.uri())
        }
    }

    /// Whether `uri` is the tool chain's predeclared-identifier file.
    #[must_use]
    pub fn is_builtin(&self, uri: &Url) -> bool {
        self.def.env.builtin_file.as_ref() == Some(uri)
    }

    /// Whether `uri` is ignored by the build: a path component below the
    /// View root starts with `.` or `_` or is `testdata`, or a directory
    /// filter excludes its directory.
    #[must_use]
    pub fn ignored_file(&self, uri: &Url) -> bool {
        let Some(segments) = uri::relative_segments(&self.def.folder, uri) else {
            return false;
        };
        if segments
            .iter()
            .any(|s| s.starts_with('.') || s.starts_with('_') || *s == "testdata")
        {
            return true;
        }
        match segments.split_last() {
            Some((_, dirs)) if !dirs.is_empty() => self.def.filters.excludes(&dirs.join("/")),
            _ => false,
        }
    }

    // ========== Metadata ==========

    /// Load (once) and return the package graph of this snapshot.
    ///
    /// A load failure is not an error here: it is recorded in the outcome,
    /// whose graph then falls back to the predecessor's.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading. A cancelled load is retried by the next caller.
    pub async fn load(&self) -> Result<Arc<LoadOutcome>> {
        self.metadata
            .get_or_try_init(|| async {
                match self.checker.load_metadata(self, &self.cancel).await {
                    Ok(packages) => {
                        debug!(labels = %self.labels(), packages = packages.len(), "Loaded metadata");
                        Ok(Arc::new(LoadOutcome {
                            graph: Arc::new(MetadataGraph::build(&self.def.folder, packages)),
                            error: None,
                        }))
                    }
                    Err(e) if e.is_cancellation() => Err(e),
                    Err(e) => {
                        warn!(labels = %self.labels(), error = %e, "Failed to load workspace");
                        Ok(Arc::new(LoadOutcome {
                            graph: self.fallback_graph.clone().unwrap_or_default(),
                            error: Some(InitializationError {
                                message: e.to_string(),
                                uri: self.primary_manifest(),
                            }),
                        }))
                    }
                }
            })
            .await
            .cloned()
    }

    /// The package graph, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading.
    pub async fn metadata_graph(&self) -> Result<Arc<MetadataGraph>> {
        Ok(self.load().await?.graph.clone())
    }

    /// The package graph if it is already known, without loading.
    ///
    /// Falls back to the predecessor's graph while this snapshot's own load
    /// has not completed.
    #[must_use]
    pub fn loaded_graph(&self) -> Option<Arc<MetadataGraph>> {
        self.metadata
            .get()
            .map(|o| o.graph.clone())
            .or_else(|| self.fallback_graph.clone())
    }

    /// Whether metadata loading has completed for this snapshot.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.metadata.initialized()
    }

    /// The load failure, if loading completed and failed.
    #[must_use]
    pub fn known_initialization_error(&self) -> Option<InitializationError> {
        self.metadata.get().and_then(|o| o.error.clone())
    }

    /// The load failure of this snapshot, loading first if needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading.
    pub async fn initialization_error(&self) -> Result<Option<InitializationError>> {
        Ok(self.load().await?.error.clone())
    }

    /// Metadata for one package.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading.
    pub async fn metadata(&self, id: &PackageId) -> Result<Option<Arc<PackageMetadata>>> {
        Ok(self.metadata_graph().await?.metadata(id).cloned())
    }

    /// Every package.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading.
    pub async fn all_metadata(&self) -> Result<Vec<Arc<PackageMetadata>>> {
        Ok(self.metadata_graph().await?.all())
    }

    /// Packages that belong to the workspace.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading.
    pub async fn workspace_metadata(&self) -> Result<Vec<Arc<PackageMetadata>>> {
        Ok(self.metadata_graph().await?.workspace_packages())
    }

    /// The narrowest workspace package compiling `uri`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the snapshot was superseded while
    /// loading.
    pub async fn narrowest_workspace_package(&self, uri: &Url) -> Result<Option<Arc<PackageMetadata>>> {
        let graph = self.metadata_graph().await?;
        Ok(graph
            .packages_for_file(uri)
            .into_iter()
            .find(|p| graph.is_workspace_package(&p.id)))
    }

    fn primary_manifest(&self) -> Option<Url> {
        let rules = &self.def.kind_rules;
        [&rules.workspace_manifest, &rules.module_manifest]
            .into_iter()
            .find_map(|name| {
                let uri = self.def.folder.join(name).ok()?;
                let path = uri::to_path(&uri).ok()?;
                path.exists().then_some(uri)
            })
    }

    // ========== Type checking ==========

    /// Type-check packages, reusing results carried over from earlier
    /// snapshots.
    ///
    /// # Errors
    ///
    /// Propagates the type checker's error, including `Error::Cancelled`.
    pub async fn type_check(&self, ids: &[PackageId], cancel: &CancellationToken) -> Result<Vec<PackageDiagnostics>> {
        let misses = self.cache_misses(&self.type_checked, ids);
        if !misses.is_empty() {
            let results = self.checker.type_check(self, &misses, cancel).await?;
            self.remember(&self.type_checked, results).await?;
        }
        Ok(self.cached(&self.type_checked, ids))
    }

    /// Analyze packages, reusing results carried over from earlier snapshots.
    ///
    /// # Errors
    ///
    /// Propagates the analyzer's error, including `Error::Cancelled`.
    pub async fn analyze(
        &self,
        ids: &[PackageId],
        progress: Option<&WorkHandle>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageDiagnostics>> {
        let misses = self.cache_misses(&self.analyzed, ids);
        if !misses.is_empty() {
            let results = self.checker.analyze(self, &misses, progress, cancel).await?;
            self.remember(&self.analyzed, results).await?;
        }
        Ok(self.cached(&self.analyzed, ids))
    }

    /// Type-check diagnostics of packages, grouped by file.
    ///
    /// # Errors
    ///
    /// Propagates the type checker's error, including `Error::Cancelled`.
    pub async fn package_diagnostics(&self, ids: &[PackageId], cancel: &CancellationToken) -> Result<DiagnosticMap> {
        let mut map = DiagnosticMap::new();
        for package in self.type_check(ids, cancel).await? {
            for diagnostic in package.diagnostics {
                map.entry(diagnostic.uri.clone()).or_default().push(diagnostic);
            }
        }
        Ok(map)
    }

    fn cache_misses(&self, cache: &Cache, ids: &[PackageId]) -> Vec<PackageId> {
        let cache = lock(cache);
        let mut misses: Vec<PackageId> = ids.iter().filter(|id| !cache.contains_key(id)).cloned().collect();
        misses.sort();
        misses.dedup();
        misses
    }

    fn cached(&self, cache: &Cache, ids: &[PackageId]) -> Vec<PackageDiagnostics> {
        let cache = lock(cache);
        ids.iter()
            .filter_map(|id| cache.get(id).map(|e| e.value.clone()))
            .collect()
    }

    async fn remember(&self, cache: &Cache, results: Vec<PackageDiagnostics>) -> Result<()> {
        let graph = self.metadata_graph().await?;
        for value in results {
            let mut inputs = BTreeMap::new();
            for id in graph.transitive_deps(std::slice::from_ref(&value.id)) {
                let Some(package) = graph.metadata(&id) else {
                    continue;
                };
                for file in &package.compiled_files {
                    let handle = self.read_file(file).await?;
                    inputs.insert(file.clone(), handle.hash());
                }
            }
            lock(cache).insert(
                value.id.clone(),
                CacheEntry {
                    inputs,
                    options: self.def.options_hash,
                    env: self.def.env_hash,
                    value,
                },
            );
        }
        Ok(())
    }

    /// Input file hashes recorded for a cached type-check result.
    #[must_use]
    pub fn type_check_inputs(&self, id: &PackageId) -> Option<BTreeMap<Url, ContentHash>> {
        lock(&self.type_checked).get(id).map(|e| e.inputs.clone())
    }

    fn release_caches(&self) {
        lock(&self.type_checked).clear();
        lock(&self.analyzed).clear();
        trace!(view = %self.view_id, snapshot = self.sequence_id, "Released snapshot caches");
    }

    /// Mark the snapshot as superseded; caches go once no reader remains.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        if self.refs.load(Ordering::SeqCst) == 0 {
            self.release_caches();
        }
    }

    // ========== Identity ==========

    /// Sequence number, increasing within the View.
    #[must_use]
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Identifier unique across all Views of the session.
    #[must_use]
    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    /// Sequence number of the snapshot this one was derived from.
    #[must_use]
    pub fn parent_id(&self) -> Option<u64> {
        self.parent
    }

    /// Cancelled once the snapshot is superseded or its View goes away.
    #[must_use]
    pub fn background_context(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The owning View's identifier.
    #[must_use]
    pub fn view_id(&self) -> &ViewId {
        &self.view_id
    }

    /// The owning View's definition.
    #[must_use]
    pub fn definition(&self) -> &Arc<ViewDefinition> {
        &self.def
    }

    /// Root of the View.
    #[must_use]
    pub fn folder(&self) -> &Url {
        &self.def.folder
    }

    /// Options of the View.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.def.options
    }

    /// Build environment of the View.
    #[must_use]
    pub fn env(&self) -> &Env {
        &self.def.env
    }

    /// The back end this snapshot delegates to.
    #[must_use]
    pub fn checker(&self) -> &Arc<dyn TypeChecker> {
        &self.checker
    }

    /// Labels for tracing.
    #[must_use]
    pub fn labels(&self) -> Labels {
        Labels {
            view: self.view_id.clone(),
            sequence_id: self.sequence_id,
            global_id: self.global_id,
            folder: self.def.folder.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session-wide count of outstanding snapshot references.
#[derive(Debug, Default)]
pub(crate) struct RefTracker {
    outstanding: AtomicUsize,
    drained: Notify,
}

impl RefTracker {
    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every reference is released. Returns `false` on timeout.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.outstanding() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

/// A counted read reference to a [`Snapshot`].
///
/// Dropping the reference (or calling [`release`](Self::release)) releases
/// it exactly once. Cloning acquires a new reference.
pub struct SnapshotRef {
    snapshot: Arc<Snapshot>,
    tracker: Arc<RefTracker>,
}

impl SnapshotRef {
    pub(crate) fn acquire(snapshot: Arc<Snapshot>, tracker: Arc<RefTracker>) -> Self {
        snapshot.refs.fetch_add(1, Ordering::SeqCst);
        tracker.outstanding.fetch_add(1, Ordering::SeqCst);
        Self { snapshot, tracker }
    }

    /// Release the reference.
    pub fn release(self) {
        drop(self);
    }

    /// The shared snapshot.
    #[must_use]
    pub fn arc(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }
}

impl Clone for SnapshotRef {
    fn clone(&self) -> Self {
        Self::acquire(self.snapshot.clone(), self.tracker.clone())
    }
}

impl Deref for SnapshotRef {
    type Target = Snapshot;

    fn deref(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl fmt::Debug for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot.fmt(f)
    }
}

impl Drop for SnapshotRef {
    fn drop(&mut self) {
        let previous = self.snapshot.refs.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && self.snapshot.retired.load(Ordering::SeqCst) {
            self.snapshot.release_caches();
        }
        if self.tracker.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}

/// Reject work on a snapshot whose background context is gone.
///
/// # Errors
///
/// Returns `Error::Cancelled` if `cancel` is tripped.
pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
