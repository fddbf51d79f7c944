//! Language server front end for keel.
//!
//! This crate puts the keel core behind a JSON-RPC connection using
//! `tower-lsp`.
//!
//! # Architecture
//!
//! - [`Backend`] implements tower-lsp's `LanguageServer` and forwards every
//!   handled message to [`keel::Server`].
//! - [`LspClient`] is the core's outgoing transport, sending typed
//!   notifications and requests over the tower-lsp client.
//! - [`SourceChecker`] is the structural checker the binary runs.
//!
//! # Handled messages
//!
//! ## Lifecycle
//! - `initialize`, `initialized`, `shutdown`
//!
//! ## Text synchronization
//! - `textDocument/didOpen`, `didChange`, `didSave`, `didClose`
//!
//! ## Workspace
//! - `workspace/didChangeConfiguration`
//! - `workspace/didChangeWorkspaceFolders`
//! - `workspace/didChangeWatchedFiles`
//! - `window/workDoneProgress/cancel`

pub mod checker;
pub mod client;
pub mod error;

pub use checker::SourceChecker;
pub use client::LspClient;
pub use error::{Error, Result};

use keel::checker::TypeChecker;
use keel::env::{EnvResolver, HostEnvResolver};
use keel::{Server, SessionConfig};
use lsp_types::{
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidChangeWatchedFilesParams,
    DidChangeWorkspaceFoldersParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, InitializeParams, InitializeResult, InitializedParams,
    WorkDoneProgressCancelParams,
};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tower_lsp::{jsonrpc, ClientSocket, LanguageServer, LspService};
use tracing::{debug, info, warn};

/// tower-lsp handler delegating to the keel core.
#[derive(Debug)]
pub struct Backend {
    server: Arc<Server>,
}

impl Backend {
    /// Wrap a core server.
    #[must_use]
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// The core server.
    #[must_use]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Handle `window/workDoneProgress/cancel`, which tower-lsp's
    /// `LanguageServer` trait does not expose.
    pub async fn work_done_progress_cancel(&self, params: WorkDoneProgressCancelParams) {
        self.server.work_done_progress_cancel(&params);
    }
}

/// Log the outcome of a notification, which has no reply to carry it.
fn report(method: &str, result: keel::Result<()>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_cancellation() => debug!(method, "Notification cancelled"),
        Err(e) => warn!(method, error = %e, "Notification failed"),
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> jsonrpc::Result<InitializeResult> {
        self.server
            .initialize(params)
            .await
            .map_err(|e| error::to_jsonrpc(&e))
    }

    async fn initialized(&self, _: InitializedParams) {
        report("initialized", self.server.initialized().await);
    }

    async fn shutdown(&self) -> jsonrpc::Result<()> {
        self.server.shutdown().await.map_err(|e| error::to_jsonrpc(&e))
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        report("textDocument/didOpen", self.server.did_open(params).await);
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        report("textDocument/didChange", self.server.did_change(params).await);
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        report("textDocument/didSave", self.server.did_save(params).await);
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        report("textDocument/didClose", self.server.did_close(params).await);
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        report(
            "workspace/didChangeConfiguration",
            self.server.did_change_configuration(params).await,
        );
    }

    async fn did_change_workspace_folders(&self, params: DidChangeWorkspaceFoldersParams) {
        report(
            "workspace/didChangeWorkspaceFolders",
            self.server.did_change_workspace_folders(params).await,
        );
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        report(
            "workspace/didChangeWatchedFiles",
            self.server.did_change_watched_files(params).await,
        );
    }
}

/// Build the tower-lsp service around a new core server.
///
/// # Errors
///
/// Returns `Error::Core` if the session cannot be created.
pub fn build_service(
    checker: Arc<dyn TypeChecker>,
    env_resolver: Arc<dyn EnvResolver>,
    config: SessionConfig,
) -> Result<(LspService<Backend>, ClientSocket)> {
    let transport = Arc::new(LspClient::new());
    let server = Server::new(transport.clone(), checker, env_resolver, config)?;
    Ok(LspService::build(move |client| {
        transport.bind(client);
        Backend::new(server)
    })
    .custom_method(
        "window/workDoneProgress/cancel",
        Backend::work_done_progress_cancel,
    )
    .finish())
}

/// Serve the language server over `input` and `output` until the client
/// disconnects, using [`SourceChecker`] and the host environment.
///
/// # Errors
///
/// Returns `Error::Core` if the session cannot be created.
pub async fn serve<I, O>(input: I, output: O, config: SessionConfig) -> Result<()>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (service, socket) = build_service(
        Arc::new(SourceChecker::new()),
        Arc::new(HostEnvResolver),
        config,
    )?;
    tower_lsp::Server::new(input, output, socket).serve(service).await;
    info!("Connection closed");
    Ok(())
}
