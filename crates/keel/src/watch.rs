//! File-watch registrations.
//!
//! The client watches files on the server's behalf. Every View asks for its
//! root and for the roots of modules outside it, restricted to the extensions
//! the View classifies. Whenever that set changes, the new registration is
//! made before the old one is withdrawn, so there is no window in which
//! nothing is watched.

use crate::client::Client;
use crate::error::Result;
use crate::options::ClientOptions;
use crate::view::View;
use keel_files::uri;
use lsp_types::notification::{DidChangeWatchedFiles, Notification};
use lsp_types::{
    DidChangeWatchedFilesRegistrationOptions, FileSystemWatcher, GlobPattern, OneOf, Registration,
    RelativePattern, Unregistration, Url,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Registered {
    id: Option<String>,
    keys: BTreeSet<String>,
}

/// Keeps the client's watch registration in line with the Views.
pub struct WatchRegistrar {
    client: Arc<dyn Client>,
    registered: Mutex<Registered>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for WatchRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistrar").finish_non_exhaustive()
    }
}

/// Glob watchers for `dirs`, keyed by a string that identifies the pattern.
fn watchers(dirs: &[(Url, Vec<String>)], relative: bool) -> BTreeMap<String, FileSystemWatcher> {
    let mut out = BTreeMap::new();
    for (dir, extensions) in dirs {
        if extensions.is_empty() {
            continue;
        }
        let glob = format!("**/*.{{{}}}", extensions.join(","));
        let pattern = if relative {
            GlobPattern::Relative(RelativePattern {
                base_uri: OneOf::Right(dir.clone()),
                pattern: glob.clone(),
            })
        } else {
            let Ok(path) = uri::to_path(dir) else {
                continue;
            };
            let base = path.display().to_string();
            GlobPattern::String(format!("{}/{glob}", base.trim_end_matches('/')))
        };
        out.insert(
            format!("{dir}{glob}"),
            FileSystemWatcher {
                glob_pattern: pattern,
                kind: None,
            },
        );
    }
    out
}

impl WatchRegistrar {
    /// Create a registrar for `client`.
    #[must_use]
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self {
            client,
            registered: Mutex::new(Registered::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Bring the registration in line with `views`.
    ///
    /// Returns whether a new registration was made. Clients without dynamic
    /// watch registration are skipped.
    ///
    /// # Errors
    ///
    /// Fails if the client rejects the registration; the previous
    /// registration then stays in place.
    pub async fn update(&self, views: &[Arc<View>], client: ClientOptions) -> Result<bool> {
        let dirs: Vec<(Url, Vec<String>)> = views
            .iter()
            .flat_map(|view| {
                let extensions = view.definition().kind_rules.watched_extensions();
                view.watched_directories()
                    .into_iter()
                    .map(move |dir| (dir, extensions.clone()))
            })
            .collect();
        self.sync(&dirs, client).await
    }

    async fn sync(&self, dirs: &[(Url, Vec<String>)], client: ClientOptions) -> Result<bool> {
        if !client.dynamic_watched_files {
            return Ok(false);
        }
        let watchers = watchers(dirs, client.relative_patterns);
        let keys: BTreeSet<String> = watchers.keys().cloned().collect();

        let mut registered = self.registered.lock().await;
        if registered.id.is_some() && registered.keys == keys {
            return Ok(false);
        }

        let id = format!(
            "{}-{}",
            DidChangeWatchedFiles::METHOD,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let options = DidChangeWatchedFilesRegistrationOptions {
            watchers: watchers.into_values().collect(),
        };
        self.client
            .register_capability(vec![Registration {
                id: id.clone(),
                method: DidChangeWatchedFiles::METHOD.to_string(),
                register_options: Some(serde_json::to_value(options)?),
            }])
            .await?;
        debug!(id = %id, patterns = keys.len(), "Registered file watchers");

        if let Some(previous) = registered.id.replace(id) {
            let result = self
                .client
                .unregister_capability(vec![Unregistration {
                    id: previous.clone(),
                    method: DidChangeWatchedFiles::METHOD.to_string(),
                }])
                .await;
            if let Err(e) = result {
                warn!(id = %previous, error = %e, "Unregistering file watchers failed");
            }
        }
        registered.keys = keys;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MessageKind, RecordingClient};

    fn dir(path: &str) -> (Url, Vec<String>) {
        (
            Url::parse(&format!("file://{path}")).unwrap(),
            vec!["src".to_string(), "tmpl".to_string(), "toml".to_string()],
        )
    }

    fn dynamic(relative: bool) -> ClientOptions {
        ClientOptions {
            dynamic_watched_files: true,
            relative_patterns: relative,
            ..ClientOptions::default()
        }
    }

    fn setup() -> (Arc<RecordingClient>, WatchRegistrar) {
        let recorder = Arc::new(RecordingClient::new());
        let registrar = WatchRegistrar::new(recorder.clone());
        (recorder, registrar)
    }

    #[tokio::test]
    async fn registers_relative_patterns_once() {
        let (recorder, registrar) = setup();
        let dirs = [dir("/w/")];
        assert!(registrar.sync(&dirs, dynamic(true)).await.unwrap());
        assert!(!registrar.sync(&dirs, dynamic(true)).await.unwrap());

        let messages = recorder.messages();
        assert_eq!(messages.len(), 1);
        let registration = &messages[0].params["registrations"][0];
        assert_eq!(registration["id"], "workspace/didChangeWatchedFiles-1");
        let watcher = &registration["registerOptions"]["watchers"][0];
        assert_eq!(watcher["globPattern"]["baseUri"], "file:///w/");
        assert_eq!(watcher["globPattern"]["pattern"], "**/*.{src,tmpl,toml}");
    }

    #[tokio::test]
    async fn absolute_patterns_without_relative_support() {
        let (recorder, registrar) = setup();
        registrar.sync(&[dir("/w/")], dynamic(false)).await.unwrap();
        let params = &recorder.messages()[0].params;
        assert_eq!(
            params["registrations"][0]["registerOptions"]["watchers"][0]["globPattern"],
            "/w/**/*.{src,tmpl,toml}"
        );
    }

    #[tokio::test]
    async fn registers_new_before_unregistering_old() {
        let (recorder, registrar) = setup();
        registrar.sync(&[dir("/w/")], dynamic(true)).await.unwrap();
        registrar
            .sync(&[dir("/w/"), dir("/mods/dep/")], dynamic(true))
            .await
            .unwrap();

        let methods: Vec<_> = recorder.messages().into_iter().map(|m| m.method).collect();
        assert_eq!(
            methods,
            vec![
                "client/registerCapability",
                "client/registerCapability",
                "client/unregisterCapability"
            ]
        );
        let unregister = &recorder.messages_for("client/unregisterCapability")[0];
        assert_eq!(unregister.kind, MessageKind::Request);
        assert_eq!(
            unregister.params["unregisterations"][0]["id"],
            "workspace/didChangeWatchedFiles-1"
        );
    }

    #[tokio::test]
    async fn failed_registration_keeps_the_old_one() {
        let (recorder, registrar) = setup();
        registrar.sync(&[dir("/w/")], dynamic(true)).await.unwrap();
        recorder.fail_method("client/registerCapability");
        assert!(registrar.sync(&[dir("/other/")], dynamic(true)).await.is_err());
        assert!(recorder.messages_for("client/unregisterCapability").is_empty());

        // The failed set was not remembered, so it is retried.
        let before = recorder.messages().len();
        assert!(registrar.sync(&[dir("/other/")], dynamic(true)).await.is_err());
        assert_eq!(recorder.messages().len(), before + 1);
    }

    #[tokio::test]
    async fn static_clients_are_skipped() {
        let (recorder, registrar) = setup();
        let changed = registrar
            .sync(&[dir("/w/")], ClientOptions::default())
            .await
            .unwrap();
        assert!(!changed);
        assert!(recorder.messages().is_empty());
    }
}
