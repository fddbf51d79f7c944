//! Diagnosis passes over the Views a modification batch affected.
//!
//! Every batch opens a new epoch: the previous epoch's token is cancelled and
//! each affected View is marked pending at the new epoch. A pass then
//! diagnoses every pending View concurrently. A View leaves the pending map
//! only when a full pass over it completed in an epoch that is still current,
//! so a View whose pass was cancelled is picked up again by the next epoch.
//!
//! With a non-zero delay, a pass has two phases: a fast type-check of the
//! packages holding the changed files, published as non-final, and the full
//! diagnosis once the delay has elapsed. Full passes hold a permit of a
//! process-wide semaphore.

use super::{diagnose_changed_files, diagnose_snapshot_full, orphaned_file_diagnostics, DiagnosticStore};
use crate::error::{Error, Result};
use crate::options::DiagnosticsTrigger;
use crate::progress::{ProgressTracker, WorkHandle};
use crate::session::Session;
use crate::snapshot::{check_cancelled, SnapshotRef};
use crate::view::{View, ViewId};
use lsp_types::Url;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// What triggered a diagnosis pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cause {
    /// A document was opened.
    DidOpen,
    /// A document was edited.
    DidChange,
    /// A document was saved.
    DidSave,
    /// A document was closed.
    DidClose,
    /// The client reported file system changes.
    DidChangeWatchedFiles,
    /// The server finished initializing.
    Initialization,
    /// Settings changed.
    Configuration,
    /// Workspace folders were added.
    Folders,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::DidOpen => "didOpen",
            Self::DidChange => "didChange",
            Self::DidSave => "didSave",
            Self::DidClose => "didClose",
            Self::DidChangeWatchedFiles => "didChangeWatchedFiles",
            Self::Initialization => "initialization",
            Self::Configuration => "configuration change",
            Self::Folders => "workspace folder change",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Default)]
struct Epoch {
    mod_id: u64,
    cancel: CancellationToken,
    pending: HashMap<ViewId, u64>,
}

/// Runs diagnosis passes and feeds their results to the store.
pub struct DiagnosticScheduler {
    session: Arc<Session>,
    store: Arc<DiagnosticStore>,
    progress: Arc<ProgressTracker>,
    semaphore: Semaphore,
    critical: tokio::sync::Mutex<Option<WorkHandle>>,
    epoch: Mutex<Epoch>,
}

impl fmt::Debug for DiagnosticScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticScheduler")
            .field("mod_id", &self.mod_id())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

/// A token tripped by either parent. Cancelling it stops the watcher task.
fn linked(mod_cancel: &CancellationToken, snapshot: &CancellationToken) -> CancellationToken {
    let linked = mod_cancel.child_token();
    let watcher = linked.clone();
    let snapshot = snapshot.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = snapshot.cancelled() => watcher.cancel(),
            () = watcher.cancelled() => {}
        }
    });
    linked
}

async fn sleep_until(deadline: Instant, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        () = tokio::time::sleep_until(deadline) => Ok(()),
        () = cancel.cancelled() => Err(Error::Cancelled),
    }
}

impl DiagnosticScheduler {
    /// Create a scheduler for `session` publishing into `store`.
    #[must_use]
    pub fn new(session: Arc<Session>, store: Arc<DiagnosticStore>, progress: Arc<ProgressTracker>) -> Self {
        let permits = session.config().diagnostics_concurrency.max(1);
        Self {
            session,
            store,
            progress,
            semaphore: Semaphore::new(permits),
            critical: tokio::sync::Mutex::new(None),
            epoch: Mutex::new(Epoch::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Epoch> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new epoch with `views` pending.
    ///
    /// Cancels the passes of the previous epoch and returns the new epoch
    /// number with its token.
    pub fn begin_epoch<'a>(&self, views: impl IntoIterator<Item = &'a ViewId>) -> (u64, CancellationToken) {
        let mut epoch = self.lock();
        epoch.cancel.cancel();
        epoch.mod_id += 1;
        epoch.cancel = CancellationToken::new();
        let mod_id = epoch.mod_id;
        for view in views {
            epoch.pending.insert(view.clone(), mod_id);
        }
        debug!(mod_id, pending = epoch.pending.len(), "Began modification epoch");
        (mod_id, epoch.cancel.clone())
    }

    /// Diagnose every pending View, then the orphaned open files.
    ///
    /// `changed` lists, per View, the files of the batch that opened the
    /// epoch; they drive the fast phase. `progress`, if any, is ended when
    /// the pass completes.
    pub async fn diagnose_changed_views(
        self: Arc<Self>,
        mod_id: u64,
        mod_cancel: CancellationToken,
        changed: BTreeMap<ViewId, Vec<Url>>,
        cause: Cause,
        progress: Option<WorkHandle>,
    ) {
        let views = self.session.views();
        let pending: Vec<Arc<View>> = {
            let mut epoch = self.lock();
            epoch.pending.retain(|id, _| views.iter().any(|v| v.id() == id));
            views
                .iter()
                .filter(|v| epoch.pending.contains_key(v.id()))
                .cloned()
                .collect()
        };

        let passes = pending.into_iter().map(|view| {
            let changed = changed.get(view.id()).cloned().unwrap_or_default();
            self.diagnose_view(view, mod_id, &mod_cancel, changed, cause, progress.as_ref())
        });
        futures::future::join_all(passes).await;

        if !mod_cancel.is_cancelled() {
            match orphaned_file_diagnostics(&self.session).await {
                Ok((diagnostics, versions)) => {
                    if !mod_cancel.is_cancelled() {
                        self.store.update_orphaned(mod_id, diagnostics, &versions).await;
                    }
                }
                Err(e) if e.is_cancellation() => {}
                Err(e) => warn!(mod_id, error = %e, "Computing orphaned file diagnostics failed"),
            }
        }
        if let Some(progress) = progress {
            progress.end("Done.").await;
        }
    }

    async fn diagnose_view(
        &self,
        view: Arc<View>,
        mod_id: u64,
        mod_cancel: &CancellationToken,
        changed: Vec<Url>,
        cause: Cause,
        progress: Option<&WorkHandle>,
    ) {
        let Ok(snapshot) = view.snapshot() else {
            return;
        };
        if cause == Cause::DidChange && snapshot.options().diagnostics_trigger == DiagnosticsTrigger::Save {
            debug!(view = %view.id(), mod_id, "Deferring diagnosis until save");
            return;
        }

        let cancel = linked(mod_cancel, snapshot.background_context());
        let _stop = cancel.clone().drop_guard();
        match self.diagnose_snapshot(&snapshot, &changed, progress, &cancel).await {
            Ok(()) => {
                let mut epoch = self.lock();
                let current = epoch.pending.get(view.id()).is_some_and(|pending| *pending <= mod_id);
                if current && !mod_cancel.is_cancelled() {
                    epoch.pending.remove(view.id());
                }
            }
            Err(e) if e.is_cancellation() => {
                debug!(labels = %snapshot.labels(), mod_id, "Diagnosis cancelled");
            }
            Err(e) => warn!(labels = %snapshot.labels(), mod_id, error = %e, "Diagnosis failed"),
        }
    }

    async fn diagnose_snapshot(
        &self,
        snapshot: &SnapshotRef,
        changed: &[Url],
        progress: Option<&WorkHandle>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let span = info_span!("diagnose_snapshot", labels = %snapshot.labels());
        async {
            let start = Instant::now();
            let options = snapshot.options();
            let delay = options.diagnostics_delay;
            let two_phase = delay > Duration::ZERO
                && options.diagnostics_trigger == DiagnosticsTrigger::Edit
                && !changed.is_empty();

            if two_phase {
                let min_delay = self.session.config().min_diagnostics_delay.min(delay);
                sleep_until(start + min_delay, cancel).await?;
                let fast = diagnose_changed_files(snapshot, changed, cancel).await?;
                if !fast.is_empty() {
                    self.store.update(snapshot, fast, false, cancel).await?;
                }
                sleep_until(start + delay, cancel).await?;
            }

            let _permit = tokio::select! {
                permit = self.semaphore.acquire() => permit.map_err(|_| Error::ShutDown)?,
                () = cancel.cancelled() => return Err(Error::Cancelled),
            };
            check_cancelled(cancel)?;
            let diagnostics = diagnose_snapshot_full(snapshot, progress, cancel).await?;
            self.update_critical_error().await;
            self.store.update(snapshot, diagnostics, true, cancel).await
        }
        .instrument(span)
        .await
    }

    /// Show, refresh or end the "Error loading workspace" report.
    ///
    /// The report is shown only while a file is open, and ends once no View's
    /// current snapshot has a load error.
    async fn update_critical_error(&self) {
        let error = self
            .session
            .views()
            .iter()
            .find_map(|v| v.current().known_initialization_error());
        let any_open = !self.session.store().overlays().await.is_empty();

        let mut critical = self.critical.lock().await;
        match (error, critical.take()) {
            (Some(error), Some(handle)) if any_open => {
                handle.report(error.message, None).await;
                *critical = Some(handle);
            }
            (Some(error), None) if any_open => {
                let handle = self.progress.start("Error loading workspace", error.message, false).await;
                *critical = Some(handle);
            }
            (_, Some(handle)) => handle.end("Done.").await,
            (_, None) => {}
        }
    }

    /// Views awaiting a completed pass, with the epoch that marked them.
    #[must_use]
    pub fn pending(&self) -> HashMap<ViewId, u64> {
        self.lock().pending.clone()
    }

    /// The current epoch.
    #[must_use]
    pub fn mod_id(&self) -> u64 {
        self.lock().mod_id
    }

    /// Cancel the passes of the current epoch.
    pub fn cancel_all(&self) {
        self.lock().cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::MockTypeChecker;
    use crate::client::RecordingClient;
    use crate::env::StaticEnvResolver;
    use crate::options::SessionConfig;
    use keel_files::{FileStore, KindRules};

    fn scheduler() -> Arc<DiagnosticScheduler> {
        let client = Arc::new(RecordingClient::new());
        let session = Arc::new(
            Session::new(
                Arc::new(FileStore::new(KindRules::default())),
                Arc::new(MockTypeChecker::new()),
                Arc::new(StaticEnvResolver::default()),
                SessionConfig::default(),
            )
            .unwrap(),
        );
        let store = Arc::new(DiagnosticStore::new(client.clone(), session.clone()));
        let progress = Arc::new(ProgressTracker::new(client));
        Arc::new(DiagnosticScheduler::new(session, store, progress))
    }

    #[tokio::test]
    async fn new_epoch_cancels_the_previous_one() {
        let scheduler = scheduler();
        let a = ViewId::new("v1");
        let b = ViewId::new("v2");

        let (first, first_cancel) = scheduler.begin_epoch([&a]);
        let (second, second_cancel) = scheduler.begin_epoch([&b]);
        assert_eq!((first, second), (1, 2));
        assert!(first_cancel.is_cancelled());
        assert!(!second_cancel.is_cancelled());

        let pending = scheduler.pending();
        assert_eq!(pending[&a], 1);
        assert_eq!(pending[&b], 2);
    }

    #[tokio::test]
    async fn remarking_a_view_moves_it_to_the_new_epoch() {
        let scheduler = scheduler();
        let a = ViewId::new("v1");
        scheduler.begin_epoch([&a]);
        scheduler.begin_epoch([&a]);
        assert_eq!(scheduler.pending(), HashMap::from([(a, 2)]));
        assert_eq!(scheduler.mod_id(), 2);
    }

    #[tokio::test]
    async fn removed_views_leave_the_pending_map() {
        let scheduler = scheduler();
        let (mod_id, cancel) = scheduler.begin_epoch([&ViewId::new("gone")]);
        scheduler
            .clone()
            .diagnose_changed_views(mod_id, cancel, BTreeMap::new(), Cause::DidOpen, None)
            .await;
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn causes_read_as_protocol_events() {
        assert_eq!(Cause::DidChange.to_string(), "didChange");
        assert_eq!(Cause::Configuration.to_string(), "configuration change");
    }
}
