//! Protocol-level entry points.
//!
//! [`Server`] turns LSP lifecycle, text synchronization and workspace
//! notifications into session operations, and starts a diagnosis pass for
//! every modification batch. It is transport-agnostic: replies go through the
//! [`Client`] it was created with.
//!
//! The lifecycle is `initialize` → `initialized` → `shutdown`. Notifications
//! before `initialize` fail with `Error::NotInitialized`, and everything after
//! `shutdown` fails with `Error::ShutDown`.

use crate::bug::BugReporter;
use crate::checker::TypeChecker;
use crate::client::Client;
use crate::diagnostics::{Cause, DiagnosticScheduler, DiagnosticStore};
use crate::env::EnvResolver;
use crate::error::{Error, Result};
use crate::options::{load_folder_overrides, ClientOptions, Options, SessionConfig};
use crate::progress::ProgressTracker;
use crate::session::Session;
use crate::view::{View, ViewId};
use crate::watch::WatchRegistrar;
use keel_files::{uri, FileStore, Modification, ModificationAction, Payload};
use lsp_types::{
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidChangeWatchedFilesParams,
    DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, FileChangeType, InitializeParams, InitializeResult, MessageType,
    OneOf, SaveOptions, ServerCapabilities, ServerInfo, TextDocumentSyncCapability,
    TextDocumentSyncKind, TextDocumentSyncOptions, TextDocumentSyncSaveOptions, Url,
    WorkDoneProgressCancelParams, WorkspaceFolder, WorkspaceFoldersServerCapabilities,
    WorkspaceServerCapabilities,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Initializing,
    Initialized,
    ShutDown,
}

/// The language server core behind a protocol front end.
pub struct Server {
    client: Arc<dyn Client>,
    lifecycle: RwLock<Lifecycle>,
    client_options: RwLock<ClientOptions>,
    settings: RwLock<Options>,
    folders: Mutex<Vec<WorkspaceFolder>>,
    session: Arc<Session>,
    store: Arc<DiagnosticStore>,
    scheduler: Arc<DiagnosticScheduler>,
    progress: Arc<ProgressTracker>,
    watches: WatchRegistrar,
    bugs: BugReporter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Held from applying a batch until its epoch is scheduled, so batches
    /// get epochs in the order they were applied.
    pipeline: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("lifecycle", &self.lifecycle())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

fn read<T: Copy>(lock: &RwLock<T>) -> T {
    *lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

/// The display name of a folder: its last path segment.
fn folder_name(folder: &Url) -> String {
    folder
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or("workspace")
        .to_string()
}

impl Server {
    /// Create a server that has not been initialized yet.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transient` if the session cannot be created.
    pub fn new(
        client: Arc<dyn Client>,
        checker: Arc<dyn TypeChecker>,
        env_resolver: Arc<dyn EnvResolver>,
        config: SessionConfig,
    ) -> Result<Arc<Self>> {
        let settings = Options::default();
        let files = Arc::new(FileStore::new(settings.kind_rules()));
        let session = Arc::new(Session::new(files, checker, env_resolver, config)?);
        let store = Arc::new(DiagnosticStore::new(client.clone(), session.clone()));
        let progress = Arc::new(ProgressTracker::new(client.clone()));
        let scheduler = Arc::new(DiagnosticScheduler::new(
            session.clone(),
            store.clone(),
            progress.clone(),
        ));
        Ok(Arc::new(Self {
            watches: WatchRegistrar::new(client.clone()),
            bugs: BugReporter::new(client.clone()),
            client,
            lifecycle: RwLock::new(Lifecycle::Uninitialized),
            client_options: RwLock::new(ClientOptions::default()),
            settings: RwLock::new(settings),
            folders: Mutex::new(Vec::new()),
            session,
            store,
            scheduler,
            progress,
            tasks: Mutex::new(Vec::new()),
            pipeline: tokio::sync::Mutex::new(()),
        }))
    }

    fn lifecycle(&self) -> Lifecycle {
        read(&self.lifecycle)
    }

    fn require_active(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Uninitialized => Err(Error::NotInitialized),
            Lifecycle::ShutDown => Err(Error::ShutDown),
            Lifecycle::Initializing | Lifecycle::Initialized => Ok(()),
        }
    }

    async fn show(&self, typ: MessageType, message: String) {
        if !self.client_options().show_message {
            return;
        }
        if let Err(e) = self.client.show_message(typ, message).await {
            warn!(error = %e, "Showing message failed");
        }
    }

    /// Decode settings, reporting invalid ones to the user.
    async fn decode_settings(&self, settings: &Value) -> Option<Options> {
        match Options::from_settings(settings) {
            Ok(options) => Some(options),
            Err(e) => {
                warn!(error = %e, "Invalid settings");
                self.show(MessageType::WARNING, format!("Invalid keel settings: {e}")).await;
                None
            }
        }
    }

    async fn apply_settings(&self, options: Options) {
        self.bugs.set_enabled(options.report_internal_bugs);
        self.session.store().set_kind_rules(options.kind_rules()).await;
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = options;
    }

    /// The client settings with the folder's `.keel.yaml` applied on top.
    async fn folder_options(&self, folder: &Url) -> Options {
        let base = self.settings();
        let Ok(path) = uri::to_path(folder) else {
            return base;
        };
        let overrides = match load_folder_overrides(&path).await {
            Ok(Some(overrides)) => overrides,
            Ok(None) => return base,
            Err(e) => {
                self.show(MessageType::ERROR, format!("Ignoring folder configuration: {e}")).await;
                return base;
            }
        };
        match base.with_overrides(&overrides) {
            Ok(options) => options,
            Err(e) => {
                self.show(MessageType::ERROR, format!("Ignoring folder configuration: {e}")).await;
                base
            }
        }
    }

    async fn add_folder(&self, folder: Url, name: &str) -> Option<Arc<View>> {
        let options = self.folder_options(&folder).await;
        match self.session.add_folder(folder.clone(), name, options).await {
            Ok(view) => Some(view),
            Err(e) => {
                warn!(folder = %folder, error = %e, "Adding folder failed");
                self.show(MessageType::ERROR, format!("Failed to add folder {name}: {e}")).await;
                None
            }
        }
    }

    async fn update_watches(&self) {
        let views = self.session.views();
        if let Err(e) = self.watches.update(&views, self.client_options()).await {
            warn!(error = %e, "Updating file watchers failed");
        }
    }

    /// Open a new epoch for `changed` and diagnose it in the background.
    async fn schedule(&self, changed: BTreeMap<ViewId, Vec<Url>>, cause: Cause) {
        let (mod_id, cancel) = self.scheduler.begin_epoch(changed.keys());
        let progress = if self.settings().verbose_work_done_progress {
            Some(self.progress.start(format!("diagnosing {cause}"), "", false).await)
        } else {
            None
        };
        debug!(mod_id, views = changed.len(), %cause, "Scheduling diagnosis");
        let task = tokio::spawn(self.scheduler.clone().diagnose_changed_views(
            mod_id, cancel, changed, cause, progress,
        ));
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    // ========== Lifecycle ==========

    /// Handle `initialize`.
    ///
    /// Invalid `initializationOptions` are reported to the user and replaced
    /// by the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyInitialized` on a second call and
    /// `Error::ShutDown` after shutdown.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        {
            let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Uninitialized => *lifecycle = Lifecycle::Initializing,
                Lifecycle::ShutDown => return Err(Error::ShutDown),
                Lifecycle::Initializing | Lifecycle::Initialized => return Err(Error::AlreadyInitialized),
            }
        }

        let capabilities = serde_json::to_value(&params.capabilities).unwrap_or_default();
        let client_options = ClientOptions::from_capabilities(&capabilities);
        write(&self.client_options, client_options);
        self.progress.set_supports_work_done(client_options.work_done_progress);

        let settings = params.initialization_options.unwrap_or(Value::Null);
        let options = self.decode_settings(&settings).await.unwrap_or_default();
        self.apply_settings(options).await;

        #[allow(deprecated)]
        let folders = match (params.workspace_folders, params.root_uri) {
            (Some(folders), _) if !folders.is_empty() => folders,
            (_, Some(root)) => vec![WorkspaceFolder {
                name: folder_name(&root),
                uri: root,
            }],
            _ => Vec::new(),
        };
        info!(folders = folders.len(), client = ?params.client_info.map(|c| c.name), "Initializing");
        *self.folders.lock().unwrap_or_else(PoisonError::into_inner) = folders;

        Ok(InitializeResult {
            capabilities: Self::capabilities(),
            server_info: Some(ServerInfo {
                name: "keel".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
        })
    }

    /// What the server advertises: incremental text synchronization with
    /// save notifications, and workspace folder changes.
    #[must_use]
    pub fn capabilities() -> ServerCapabilities {
        ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                will_save: None,
                will_save_wait_until: None,
                save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                    include_text: Some(true),
                })),
            })),
            workspace: Some(WorkspaceServerCapabilities {
                workspace_folders: Some(WorkspaceFoldersServerCapabilities {
                    supported: Some(true),
                    change_notifications: Some(OneOf::Left(true)),
                }),
                file_operations: None,
            }),
            ..ServerCapabilities::default()
        }
    }

    /// Handle `initialized`: add a View per workspace folder, register file
    /// watchers and diagnose everything.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` unless `initialize` came first, and
    /// `Error::AlreadyInitialized` on a second call.
    pub async fn initialized(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Initializing => *lifecycle = Lifecycle::Initialized,
                Lifecycle::Uninitialized => return Err(Error::NotInitialized),
                Lifecycle::Initialized => return Err(Error::AlreadyInitialized),
                Lifecycle::ShutDown => return Err(Error::ShutDown),
            }
        }

        let _pipeline = self.pipeline.lock().await;
        let folders = std::mem::take(&mut *self.folders.lock().unwrap_or_else(PoisonError::into_inner));
        for folder in folders {
            self.add_folder(folder.uri, &folder.name).await;
        }
        self.update_watches().await;

        let all = self
            .session
            .views()
            .iter()
            .map(|v| (v.id().clone(), Vec::new()))
            .collect();
        self.schedule(all, Cause::Initialization).await;
        Ok(())
    }

    /// Handle `shutdown`: cancel diagnosis, wait for it to stop and shut the
    /// session down. Snapshot references still held afterwards are reported
    /// as a bug.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` before `initialize` and
    /// `Error::ShutDown` on a second call.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.write().unwrap_or_else(PoisonError::into_inner);
            match *lifecycle {
                Lifecycle::Uninitialized => return Err(Error::NotInitialized),
                Lifecycle::ShutDown => return Err(Error::ShutDown),
                Lifecycle::Initializing | Lifecycle::Initialized => *lifecycle = Lifecycle::ShutDown,
            }
        }
        self.scheduler.cancel_all();
        self.settle().await;

        let leaked = self.session.shutdown().await;
        if leaked > 0 {
            self.bugs
                .report(format!("{leaked} snapshot references outstanding at shutdown"))
                .await;
        }
        self.client.close().await;
        Ok(())
    }

    // ========== Text synchronization ==========

    /// Handle `textDocument/didOpen`.
    ///
    /// # Errors
    ///
    /// See [`did_modify_files`](Self::did_modify_files).
    pub async fn did_open(&self, params: DidOpenTextDocumentParams) -> Result<()> {
        let doc = params.text_document;
        let m = Modification::open(doc.uri, doc.version, doc.language_id, doc.text);
        self.did_modify_files(vec![m], Cause::DidOpen).await
    }

    /// Handle `textDocument/didChange`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRange` or `Error::MalformedPayload` for edits
    /// that do not fit the document, and see
    /// [`did_modify_files`](Self::did_modify_files).
    pub async fn did_change(&self, params: DidChangeTextDocumentParams) -> Result<()> {
        let payload = Payload::from_changes(params.content_changes);
        let m = Modification::change(params.text_document.uri, params.text_document.version, payload);
        self.did_modify_files(vec![m], Cause::DidChange).await
    }

    /// Handle `textDocument/didSave`.
    ///
    /// # Errors
    ///
    /// See [`did_modify_files`](Self::did_modify_files).
    pub async fn did_save(&self, params: DidSaveTextDocumentParams) -> Result<()> {
        let m = Modification::save(params.text_document.uri, params.text);
        self.did_modify_files(vec![m], Cause::DidSave).await
    }

    /// Handle `textDocument/didClose`.
    ///
    /// # Errors
    ///
    /// See [`did_modify_files`](Self::did_modify_files).
    pub async fn did_close(&self, params: DidCloseTextDocumentParams) -> Result<()> {
        let m = Modification::close(params.text_document.uri);
        self.did_modify_files(vec![m], Cause::DidClose).await
    }

    /// Handle `workspace/didChangeWatchedFiles`.
    ///
    /// # Errors
    ///
    /// See [`did_modify_files`](Self::did_modify_files).
    pub async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) -> Result<()> {
        let batch = params
            .changes
            .into_iter()
            .filter_map(|event| {
                let action = match event.typ {
                    FileChangeType::CREATED => ModificationAction::Create,
                    FileChangeType::CHANGED => ModificationAction::Change,
                    FileChangeType::DELETED => ModificationAction::Delete,
                    other => {
                        debug!(uri = %event.uri, typ = ?other, "Ignoring unknown file change type");
                        return None;
                    }
                };
                Some(Modification::on_disk(event.uri, action))
            })
            .collect();
        self.did_modify_files(batch, Cause::DidChangeWatchedFiles).await
    }

    /// Apply a modification batch and diagnose what it affected.
    ///
    /// Every URI in the batch is published at least once more, even if its
    /// diagnostics are unchanged. A new epoch is opened, and the previous
    /// epoch's diagnosis cancelled, even when no View is affected.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` or `Error::ShutDown` outside the
    /// active lifecycle, and otherwise the first error of a modification the
    /// file store rejected. The rest of the batch is applied regardless.
    pub async fn did_modify_files(&self, batch: Vec<Modification>, cause: Cause) -> Result<()> {
        self.require_active()?;
        let pipeline = self.pipeline.lock().await;
        let batch = self.session.expand_modifications(batch).await;
        self.store.mark_must_publish(batch.iter().map(|m| &m.uri)).await;

        let applied = self.session.did_modify_files(&batch).await?;
        self.schedule(applied.views, cause).await;
        drop(pipeline);
        self.update_watches().await;

        match applied.rejected.into_iter().next() {
            Some((uri, e)) => {
                if matches!(e, Error::Internal(_)) {
                    self.bugs.report(format!("{uri}: {e}")).await;
                }
                Err(e)
            }
            None => Ok(()),
        }
    }

    // ========== Workspace ==========

    /// Handle `workspace/didChangeConfiguration`.
    ///
    /// Views whose effective options change are replaced and diagnosed.
    /// Invalid settings are reported to the user and leave everything as is.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` or `Error::ShutDown` outside the
    /// active lifecycle.
    pub async fn did_change_configuration(&self, params: DidChangeConfigurationParams) -> Result<()> {
        self.require_active()?;
        let Some(options) = self.decode_settings(&params.settings).await else {
            return Ok(());
        };
        self.apply_settings(options).await;

        let _pipeline = self.pipeline.lock().await;
        let mut changed = BTreeMap::new();
        for view in self.session.views().iter() {
            let options = self.folder_options(view.folder()).await;
            if options == **view.options() {
                continue;
            }
            match self.session.reconfigure(view.id(), options).await {
                Ok(replacement) => {
                    changed.insert(replacement.id().clone(), Vec::new());
                }
                Err(e) => {
                    warn!(view = %view.id(), error = %e, "Reconfiguring view failed");
                    self.show(MessageType::ERROR, format!("Failed to apply settings to {}: {e}", view.folder()))
                        .await;
                }
            }
        }
        if !changed.is_empty() {
            self.store.forget_removed_views().await;
            self.update_watches().await;
            self.schedule(changed, Cause::Configuration).await;
        }
        Ok(())
    }

    /// Handle `workspace/didChangeWorkspaceFolders`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotInitialized` or `Error::ShutDown` outside the
    /// active lifecycle.
    pub async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) -> Result<()> {
        self.require_active()?;
        let _pipeline = self.pipeline.lock().await;
        for folder in &params.event.removed {
            self.session.remove_folder(&folder.uri).await?;
        }
        if !params.event.removed.is_empty() {
            self.store.forget_removed_views().await;
        }
        let mut added = BTreeMap::new();
        for folder in params.event.added {
            if let Some(view) = self.add_folder(folder.uri, &folder.name).await {
                added.insert(view.id().clone(), Vec::new());
            }
        }
        self.update_watches().await;
        if !added.is_empty() || !params.event.removed.is_empty() {
            self.schedule(added, Cause::Folders).await;
        }
        Ok(())
    }

    /// Handle `window/workDoneProgress/cancel`.
    pub fn work_done_progress_cancel(&self, params: &WorkDoneProgressCancelParams) {
        if !self.progress.cancel(&params.token) {
            debug!(token = ?params.token, "Cancel for unknown progress token");
        }
    }

    // ========== Accessors ==========

    /// Wait until every diagnosis pass started so far has finished.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
            if tasks.is_empty() {
                return;
            }
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        self.bugs.report(format!("diagnosis task panicked: {e}")).await;
                    }
                }
            }
        }
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The diagnostic store.
    #[must_use]
    pub fn diagnostics(&self) -> &Arc<DiagnosticStore> {
        &self.store
    }

    /// Views awaiting a completed diagnosis pass, with their epoch.
    #[must_use]
    pub fn pending(&self) -> HashMap<ViewId, u64> {
        self.scheduler.pending()
    }

    /// The current modification epoch.
    #[must_use]
    pub fn mod_id(&self) -> u64 {
        self.scheduler.mod_id()
    }

    /// Client capabilities captured at `initialize`.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        read(&self.client_options)
    }

    /// Client settings in effect, before folder overrides.
    #[must_use]
    pub fn settings(&self) -> Options {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Internal bug reports.
    #[must_use]
    pub fn bugs(&self) -> &BugReporter {
        &self.bugs
    }
}
