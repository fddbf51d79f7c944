//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use keel::checker::MockTypeChecker;
use keel::client::RecordingClient;
use keel::env::StaticEnvResolver;
use keel::{Server, SessionConfig};
use keel_files::uri;
use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, InitializeParams, Position, PublishDiagnosticsParams, Range,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, Url,
    VersionedTextDocumentIdentifier, WorkspaceFolder,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::time::Instant;

const PUBLISH: &str = "textDocument/publishDiagnostics";
const SHOW_MESSAGE: &str = "window/showMessage";

/// A running server over a temporary workspace folder.
pub struct Harness {
    pub dir: TempDir,
    pub root: Url,
    pub client: Arc<RecordingClient>,
    pub checker: Arc<MockTypeChecker>,
    pub server: Arc<Server>,
}

impl Harness {
    /// Start a server with `settings` as initialization options.
    pub async fn start(settings: Value) -> Self {
        Self::start_with_files(settings, &[]).await
    }

    /// Like [`start`](Self::start), with files written to disk first.
    pub async fn start_with_files(settings: Value, files: &[(&str, &str)]) -> Self {
        let checker = Arc::new(MockTypeChecker::new());
        Self::start_with(settings, files, checker).await
    }

    /// Start with a checker the test has already scripted.
    pub async fn start_with(settings: Value, files: &[(&str, &str)], checker: Arc<MockTypeChecker>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        for (rel, text) in files {
            let path = dir.path().join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, text).unwrap();
        }
        let root = uri::from_dir(dir.path()).unwrap();

        let client = Arc::new(RecordingClient::new());
        let server = Server::new(
            client.clone(),
            checker.clone(),
            Arc::new(StaticEnvResolver::default()),
            SessionConfig::default(),
        )
        .unwrap();

        let params = InitializeParams {
            initialization_options: Some(settings),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root.clone(),
                name: "workspace".to_string(),
            }]),
            ..InitializeParams::default()
        };
        server.initialize(params).await.unwrap();
        server.initialized().await.unwrap();
        server.settle().await;

        Self {
            dir,
            root,
            client,
            checker,
            server,
        }
    }

    /// URI of a path relative to the workspace folder.
    pub fn uri(&self, rel: &str) -> Url {
        self.root.join(rel).unwrap()
    }

    pub async fn open(&self, rel: &str, text: &str) -> Url {
        let uri = self.uri(rel);
        self.open_uri(&uri, text).await;
        uri
    }

    pub async fn open_uri(&self, uri: &Url, text: &str) {
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: "keel".to_string(),
                version: 1,
                text: text.to_string(),
            },
        };
        self.server.did_open(params).await.unwrap();
    }

    /// Replace the whole content of an open file.
    pub async fn change(&self, rel: &str, version: i32, text: &str) {
        self.change_events(
            rel,
            version,
            vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.to_string(),
            }],
        )
        .await;
    }

    /// Replace `range` of an open file.
    pub async fn edit(&self, rel: &str, version: i32, range: Range, text: &str) {
        self.change_events(
            rel,
            version,
            vec![TextDocumentContentChangeEvent {
                range: Some(range),
                range_length: None,
                text: text.to_string(),
            }],
        )
        .await;
    }

    async fn change_events(&self, rel: &str, version: i32, content_changes: Vec<TextDocumentContentChangeEvent>) {
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: self.uri(rel),
                version,
            },
            content_changes,
        };
        self.server.did_change(params).await.unwrap();
    }

    pub async fn save(&self, rel: &str) {
        let params = DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: self.uri(rel) },
            text: None,
        };
        self.server.did_save(params).await.unwrap();
    }

    pub async fn close(&self, rel: &str) {
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: self.uri(rel) },
        };
        self.server.did_close(params).await.unwrap();
    }

    /// `publishDiagnostics` for `uri` with the time each was sent.
    pub fn publications(&self, uri: &Url) -> Vec<(Instant, PublishDiagnosticsParams)> {
        self.client
            .messages_for(PUBLISH)
            .into_iter()
            .filter_map(|m| {
                let params: PublishDiagnosticsParams = serde_json::from_value(m.params).ok()?;
                (&params.uri == uri).then_some((m.at, params))
            })
            .collect()
    }

    /// Texts of every `showMessage` so far.
    pub fn shown(&self) -> Vec<String> {
        self.client
            .messages_for(SHOW_MESSAGE)
            .into_iter()
            .filter_map(|m| m.params["message"].as_str().map(str::to_string))
            .collect()
    }
}

/// Messages of a publication, in publication order.
pub fn messages(params: &PublishDiagnosticsParams) -> Vec<&str> {
    params.diagnostics.iter().map(|d| d.message.as_str()).collect()
}

pub fn range(start: (u32, u32), end: (u32, u32)) -> Range {
    Range::new(Position::new(start.0, start.1), Position::new(end.0, end.1))
}
