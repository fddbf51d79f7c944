//! The session: owner of the file store and the set of Views.
//!
//! # Lock ordering
//!
//! Locks are acquired only in this order, skipping any not needed:
//!
//! 1. `state`: lifecycle transitions
//! 2. `view_mu`: changes to the View set
//! 3. `modification`: recording modifications and installing snapshots
//! 4. `View::current` (leaf, see [`crate::view`])
//! 5. the diagnostic store's lock
//! 6. snapshot-internal caches
//!
//! The View list itself is a copy-on-write `Arc<Vec<_>>` behind a leaf
//! `RwLock`, so readers never wait on a View being added.

use crate::best_view;
use crate::checker::TypeChecker;
use crate::env::{Env, EnvResolver};
use crate::error::{Error, Result};
use crate::options::{Options, SessionConfig};
use crate::snapshot::{RefTracker, Snapshot, SnapshotRef};
use crate::view::{View, ViewDefinition, ViewId};
use keel_files::{uri, FileHandle, FileKind, FileStore, Modification};
use lsp_types::Url;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tempfile::TempDir;
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    ShutDown,
}

/// What a modification batch did.
#[derive(Debug, Default)]
pub struct AppliedModifications {
    /// For every View that received a new snapshot, the changed URIs it is
    /// interested in.
    pub views: BTreeMap<ViewId, Vec<Url>>,
    /// Modifications the file store refused, with the reason.
    pub rejected: Vec<(Url, Error)>,
}

/// Process-wide owner of the file store and the Views.
pub struct Session {
    state: tokio::sync::RwLock<State>,
    view_mu: tokio::sync::Mutex<()>,
    modification: tokio::sync::Mutex<()>,
    views: RwLock<Arc<Vec<Arc<View>>>>,
    store: Arc<FileStore>,
    checker: Arc<dyn TypeChecker>,
    env_resolver: Arc<dyn EnvResolver>,
    refs: Arc<RefTracker>,
    temp_dir: Mutex<Option<TempDir>>,
    next_view: AtomicU64,
    next_global: AtomicU64,
    default_env: Env,
    config: SessionConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("views", &self.views().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session with no Views.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transient` if the session's temporary directory cannot
    /// be created.
    pub fn new(
        store: Arc<FileStore>,
        checker: Arc<dyn TypeChecker>,
        env_resolver: Arc<dyn EnvResolver>,
        config: SessionConfig,
    ) -> Result<Self> {
        let temp_dir = tempfile::Builder::new().prefix("keel-").tempdir()?;
        debug!(path = %temp_dir.path().display(), "Created session directory");
        Ok(Self {
            state: tokio::sync::RwLock::new(State::Active),
            view_mu: tokio::sync::Mutex::new(()),
            modification: tokio::sync::Mutex::new(()),
            views: RwLock::new(Arc::new(Vec::new())),
            store,
            checker,
            env_resolver,
            refs: Arc::new(RefTracker::default()),
            temp_dir: Mutex::new(Some(temp_dir)),
            next_view: AtomicU64::new(1),
            next_global: AtomicU64::new(1),
            default_env: Env::host(),
            config,
        })
    }

    async fn ensure_active(&self) -> Result<tokio::sync::RwLockReadGuard<'_, State>> {
        let state = self.state.read().await;
        if *state == State::ShutDown {
            return Err(Error::ShutDown);
        }
        Ok(state)
    }

    fn set_views(&self, views: Vec<Arc<View>>) {
        *self.views.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(views);
    }

    fn next_global_id(&self) -> u64 {
        self.next_global.fetch_add(1, Ordering::SeqCst)
    }

    // ========== Views ==========

    /// Add a View for the folder at `root`.
    ///
    /// A folder may have several Views, e.g. one per target platform.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutDown` after shutdown, `Error::Config` for invalid
    /// options, and whatever the environment resolver reports.
    pub async fn add_folder(&self, root: Url, name: &str, options: Options) -> Result<Arc<View>> {
        let _state = self.ensure_active().await?;
        let _views = self.view_mu.lock().await;

        let root = uri::as_dir(root);
        let env = self.env_resolver.fetch_env(&root, &options).await?;
        let def = ViewDefinition::new(root, name, options, env)?;
        let id = ViewId::new(format!("v{}", self.next_view.fetch_add(1, Ordering::SeqCst)));

        let _modification = self.modification.lock().await;
        let view = Arc::new(View::new(
            id,
            def,
            self.store.clone(),
            self.checker.clone(),
            self.refs.clone(),
            self.next_global_id(),
            self.store.overlays().await,
        ));
        let mut views = self.views().as_ref().clone();
        views.push(view.clone());
        self.set_views(views);

        info!(
            view = %view.id(),
            folder = %view.folder(),
            os = %view.env().target_os,
            arch = %view.env().target_arch,
            "Added view"
        );
        Ok(view)
    }

    /// Remove every View of the folder at `root`. Returns whether any existed.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutDown` after shutdown.
    pub async fn remove_folder(&self, root: &Url) -> Result<bool> {
        let _state = self.ensure_active().await?;
        let _views = self.view_mu.lock().await;

        let root = uri::as_dir(root.clone());
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .views()
            .iter()
            .cloned()
            .partition(|v| v.folder() == &root);
        self.set_views(kept);
        for view in &removed {
            view.shutdown();
            info!(view = %view.id(), folder = %root, "Removed view");
        }
        Ok(!removed.is_empty())
    }

    /// Replace a View by one for the same folder with new options.
    ///
    /// The replacement gets a new identifier and a fresh snapshot chain.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownView` if `id` does not exist, and the errors of
    /// [`add_folder`](Self::add_folder).
    pub async fn reconfigure(&self, id: &ViewId, options: Options) -> Result<Arc<View>> {
        let old = self.view(id)?;
        let name = old.definition().name.clone();
        let view = self.add_folder(old.folder().clone(), &name, options).await?;

        let _state = self.ensure_active().await?;
        let _views = self.view_mu.lock().await;
        let kept: Vec<_> = self
            .views()
            .iter()
            .filter(|v| v.id() != id)
            .cloned()
            .collect();
        self.set_views(kept);
        old.shutdown();
        info!(old = %id, new = %view.id(), "Reconfigured view");
        Ok(view)
    }

    /// Views in creation order.
    #[must_use]
    pub fn views(&self) -> Arc<Vec<Arc<View>>> {
        self.views
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Look up a View.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownView` if no View has identifier `id`.
    pub fn view(&self, id: &ViewId) -> Result<Arc<View>> {
        self.views()
            .iter()
            .find(|v| v.id() == id)
            .cloned()
            .ok_or_else(|| Error::UnknownView(id.to_string()))
    }

    // ========== Modifications ==========

    /// Replace on-disk modifications of directories with one modification
    /// per known file inside them.
    ///
    /// Editor events and modifications of anything other than a directory
    /// some snapshot or overlay knows files under are passed through.
    pub async fn expand_modifications(&self, batch: Vec<Modification>) -> Vec<Modification> {
        if !batch.iter().any(|m| m.on_disk) {
            return batch;
        }
        let mut known: BTreeSet<Url> = self
            .store
            .overlays()
            .await
            .into_iter()
            .map(|h| h.uri().clone())
            .collect();
        for view in self.views().iter() {
            known.extend(view.current().known_files());
        }

        let mut expanded = Vec::with_capacity(batch.len());
        for m in batch {
            if !m.on_disk || known.contains(&m.uri) {
                expanded.push(m);
                continue;
            }
            let dir = uri::as_dir(m.uri.clone());
            let inside: Vec<&Url> = known.iter().filter(|f| uri::is_within(&dir, f)).collect();
            if inside.is_empty() {
                expanded.push(m);
                continue;
            }
            debug!(dir = %dir, files = inside.len(), "Expanded directory modification");
            expanded.extend(inside.into_iter().map(|f| Modification::on_disk(f.clone(), m.action)));
        }
        expanded
    }

    /// Apply a batch of modifications and install new snapshots for every
    /// View the batch affects.
    ///
    /// A View is affected when one of the changed files is interesting to it
    /// (see [`View::is_interested`]); other Views keep their snapshot.
    /// Modifications the store rejects are reported in the result and do not
    /// stop the rest of the batch.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutDown` after shutdown.
    pub async fn did_modify_files(&self, batch: &[Modification]) -> Result<AppliedModifications> {
        let _state = self.ensure_active().await?;
        let span = info_span!("did_modify_files", count = batch.len());
        let applied = async {
            let _modification = self.modification.lock().await;

            let mut applied = AppliedModifications::default();
            let mut changes: HashMap<Url, FileHandle> = HashMap::new();
            let mut recorded: Vec<&Modification> = Vec::with_capacity(batch.len());
            for m in batch {
                match self.store.record_modification(m).await {
                    Ok(handle) => {
                        changes.insert(m.uri.clone(), handle);
                        recorded.push(m);
                    }
                    Err(e) => {
                        warn!(uri = %m.uri, action = ?m.action, error = %e, "Rejected modification");
                        applied.rejected.push((m.uri.clone(), e.into()));
                    }
                }
            }
            if changes.is_empty() {
                return applied;
            }

            let overlays = self.store.overlays().await;
            for view in self.views().iter() {
                let mut touched: Vec<Url> = changes.keys().filter(|u| view.is_interested(u)).cloned().collect();
                if touched.is_empty() {
                    continue;
                }
                touched.sort();
                let prev = view.current();
                let reload = self.needs_reload(view, &prev, &recorded, &changes);
                view.advance(self.next_global_id(), &overlays, &changes, reload);
                applied.views.insert(view.id().clone(), touched);
            }
            applied
        }
        .instrument(span)
        .await;
        Ok(applied)
    }

    /// Whether the next snapshot of `view` must load metadata afresh.
    fn needs_reload(
        &self,
        view: &View,
        prev: &Snapshot,
        batch: &[&Modification],
        changes: &HashMap<Url, FileHandle>,
    ) -> bool {
        if prev.known_initialization_error().is_some() {
            return true;
        }
        batch.iter().any(|m| {
            let Some(after) = changes.get(&m.uri) else {
                return false;
            };
            let before = prev.find_file(&m.uri);
            match prev.file_kind(after) {
                kind if kind.is_manifest() => before.is_none_or(|b| b.hash() != after.hash()),
                FileKind::Source if m.action.changes_file_set() => uri::is_within(view.folder(), &m.uri),
                FileKind::Source => self.checker.affects_metadata(before.as_ref(), after),
                _ => false,
            }
        })
    }

    /// A snapshot of the View that best owns `file`.
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutDown` after shutdown and `Error::UnknownView` if no
    /// View can see the file.
    pub async fn snapshot_of(&self, file: &Url) -> Result<SnapshotRef> {
        let _state = self.ensure_active().await?;
        let views = self.views();
        best_view::best_view_loading(&views, file)
            .await
            .ok_or_else(|| Error::UnknownView(format!("no view contains {file}")))?
            .snapshot()
    }

    // ========== Teardown ==========

    /// Shut the session down.
    ///
    /// Cancels every View, waits up to the configured drain timeout for
    /// outstanding snapshot references, clears the file store and removes the
    /// temporary directory. Returns the number of references still
    /// outstanding when the wait ended; non-zero indicates a leak.
    pub async fn shutdown(&self) -> usize {
        {
            let mut state = self.state.write().await;
            if *state == State::ShutDown {
                return 0;
            }
            *state = State::ShutDown;
        }

        let views = {
            let _views = self.view_mu.lock().await;
            let views = self.views();
            self.set_views(Vec::new());
            views
        };
        for view in views.iter() {
            view.shutdown();
        }
        drop(views);

        let leaked = if self.refs.drain(self.config.drain_timeout).await {
            0
        } else {
            self.refs.outstanding()
        };
        self.store.clear().await;

        let dir = self.temp_dir.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(dir) = dir {
            if let Err(e) = dir.close() {
                warn!(error = %e, "Failed to remove session directory");
            }
        }
        info!(leaked, "Session shut down");
        leaked
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub async fn is_shut_down(&self) -> bool {
        *self.state.read().await == State::ShutDown
    }

    // ========== Accessors ==========

    /// The file store.
    #[must_use]
    pub fn store(&self) -> &Arc<FileStore> {
        &self.store
    }

    /// The session's temporary directory, until shutdown.
    #[must_use]
    pub fn temp_dir(&self) -> Option<PathBuf> {
        self.temp_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|d| d.path().to_path_buf())
    }

    /// The default build environment; diagnostics from other environments
    /// are suffixed.
    #[must_use]
    pub fn default_env(&self) -> &Env {
        &self.default_env
    }

    /// Process-level tuning.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot references currently held.
    #[must_use]
    pub fn outstanding_snapshots(&self) -> usize {
        self.refs.outstanding()
    }
}
