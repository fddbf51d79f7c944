//! Per-file diagnostic state and publication.
//!
//! Every file has one entry per View that reported on it, plus an orphaned
//! bucket for diagnostics no View owns. Publication merges the entries of the
//! file's best Views, removes duplicates, tags findings that only a
//! non-default build reports, and sends the result only if it differs from
//! what the client last received.

use super::{Diagnostic, DiagnosticMap};
use crate::best_view;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::snapshot::Snapshot;
use crate::view::{View, ViewId};
use keel_files::{ContentHash, DISK_VERSION};
use lsp_types::{PublishDiagnosticsParams, Url};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
struct ViewDiagnostics {
    snapshot: u64,
    version: i32,
    diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
struct OrphanedDiagnostics {
    mod_id: u64,
    diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
struct FileDiagnostics {
    by_view: HashMap<ViewId, ViewDiagnostics>,
    orphaned: Option<OrphanedDiagnostics>,
    published_hash: ContentHash,
    must_publish: bool,
}

type Files = HashMap<Url, FileDiagnostics>;

/// Diagnostics of every file, across Views.
pub struct DiagnosticStore {
    files: Mutex<Files>,
    client: Arc<dyn Client>,
    session: Arc<Session>,
}

impl std::fmt::Debug for DiagnosticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticStore").finish_non_exhaustive()
    }
}

fn version_in(snapshot: &Snapshot, uri: &Url) -> i32 {
    snapshot.find_file(uri).map_or(DISK_VERSION, |h| h.version())
}

/// Remove entries of Views not in `views`. Returns whether any went.
fn prune_gone_views(fd: &mut FileDiagnostics, views: &[Arc<View>]) -> bool {
    let before = fd.by_view.len();
    fd.by_view.retain(|id, _| views.iter().any(|v| v.id() == id));
    fd.by_view.len() != before
}

/// Newest file version any remaining View reported for.
fn latest_version(fd: &FileDiagnostics) -> Option<i32> {
    fd.by_view.values().map(|e| e.version).max()
}

impl DiagnosticStore {
    /// Create an empty store publishing to `client`.
    #[must_use]
    pub fn new(client: Arc<dyn Client>, session: Arc<Session>) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            client,
            session,
        }
    }

    /// Force the next publication of each URI to be sent even if unchanged.
    pub async fn mark_must_publish(&self, uris: impl IntoIterator<Item = &Url>) {
        let mut files = self.files.lock().await;
        for uri in uris {
            files.entry(uri.clone()).or_default().must_publish = true;
        }
    }

    /// Store a snapshot's diagnostics and publish every file they touch.
    ///
    /// An entry is replaced only by a report from a newer snapshot of the
    /// same View, or by a final report from the same snapshot, so a fast
    /// partial pass can never clobber a completed full pass. A final report
    /// also clears this View's entries for files it no longer mentions, and
    /// republishes files whose only reports came from removed Views.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled`, leaving the store untouched, if `cancel`
    /// is tripped before the store is locked.
    pub async fn update(
        &self,
        snapshot: &Snapshot,
        diagnostics: DiagnosticMap,
        is_final: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut files = self.files.lock().await;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // Read the View set under the store lock so a View removed meanwhile
        // is pruned rather than resurrected.
        let views = self.session.views();
        let view = snapshot.view_id();
        let sequence = snapshot.sequence_id();

        let mut touched: BTreeMap<Url, i32> = BTreeMap::new();
        for (uri, diagnostics) in diagnostics {
            let fd = files.entry(uri.clone()).or_default();
            let replace = match fd.by_view.get(view) {
                None => true,
                Some(current) => current.snapshot < sequence || (current.snapshot == sequence && is_final),
            };
            if !replace {
                trace!(uri = %uri, view = %view, snapshot = sequence, "Dropped stale diagnostics");
                continue;
            }
            let version = version_in(snapshot, &uri);
            fd.by_view.insert(
                view.clone(),
                ViewDiagnostics {
                    snapshot: sequence,
                    version,
                    diagnostics,
                },
            );
            touched.insert(uri, version);
        }

        if is_final {
            for (uri, fd) in files.iter_mut() {
                if touched.contains_key(uri) {
                    continue;
                }
                let pruned = prune_gone_views(fd, &views);
                let stale = fd
                    .by_view
                    .get(view)
                    .is_some_and(|current| current.snapshot <= sequence && !current.diagnostics.is_empty());
                if stale {
                    let version = version_in(snapshot, uri);
                    fd.by_view.insert(
                        view.clone(),
                        ViewDiagnostics {
                            snapshot: sequence,
                            version,
                            diagnostics: Vec::new(),
                        },
                    );
                    touched.insert(uri.clone(), version);
                } else if pruned {
                    let version = latest_version(fd).unwrap_or_else(|| version_in(snapshot, uri));
                    touched.insert(uri.clone(), version);
                }
            }
        }

        debug!(
            labels = %snapshot.labels(),
            files = touched.len(),
            is_final,
            "Updating diagnostics"
        );
        for (uri, version) in touched {
            self.publish_locked(&mut files, &views, &uri, version).await;
        }
        Ok(())
    }

    /// Drop the entries of Views that no longer exist and republish the
    /// files only they reported on.
    pub async fn forget_removed_views(&self) {
        let mut files = self.files.lock().await;
        let views = self.session.views();

        let mut pruned: Vec<(Url, i32)> = files
            .iter_mut()
            .filter_map(|(uri, fd)| {
                prune_gone_views(fd, &views).then(|| (uri.clone(), latest_version(fd).unwrap_or(DISK_VERSION)))
            })
            .collect();
        pruned.sort();
        debug!(files = pruned.len(), "Forgetting diagnostics of removed views");
        for (uri, version) in pruned {
            self.publish_locked(&mut files, &views, &uri, version).await;
        }
    }

    /// Replace the orphaned bucket for epoch `mod_id`.
    ///
    /// Files with orphaned diagnostics from an earlier epoch that are not in
    /// `diagnostics` are cleared. `versions` gives the open version of each
    /// file; missing files publish without a version.
    pub async fn update_orphaned(&self, mod_id: u64, diagnostics: DiagnosticMap, versions: &HashMap<Url, i32>) {
        let mut files = self.files.lock().await;
        let views = self.session.views();

        let mut touched: HashSet<Url> = HashSet::new();
        for (uri, fd) in files.iter_mut() {
            if !diagnostics.contains_key(uri) && fd.orphaned.as_ref().is_some_and(|o| o.mod_id < mod_id) {
                fd.orphaned = None;
                touched.insert(uri.clone());
            }
        }
        for (uri, diagnostics) in diagnostics {
            let fd = files.entry(uri.clone()).or_default();
            if fd.orphaned.as_ref().is_some_and(|o| o.mod_id > mod_id) {
                continue;
            }
            fd.orphaned = Some(OrphanedDiagnostics { mod_id, diagnostics });
            touched.insert(uri);
        }

        let mut touched: Vec<Url> = touched.into_iter().collect();
        touched.sort();
        for uri in touched {
            let version = versions.get(&uri).copied().unwrap_or(DISK_VERSION);
            self.publish_locked(&mut files, &views, &uri, version).await;
        }
    }

    /// Compute and, if changed, send the diagnostics of one file.
    async fn publish_locked(&self, files: &mut Files, views: &[Arc<View>], uri: &Url, version: i32) {
        let Some(fd) = files.get_mut(uri) else {
            return;
        };
        prune_gone_views(fd, views);

        let default_env = self.session.default_env();
        let mut sources: Vec<(&[Diagnostic], String)> = Vec::new();
        if let Some(orphaned) = &fd.orphaned {
            sources.push((orphaned.diagnostics.as_slice(), String::new()));
        }
        let mut reporting: Vec<Arc<View>> = best_view::best_views(views, uri);
        if reporting.is_empty() {
            reporting = views
                .iter()
                .filter(|v| fd.by_view.contains_key(v.id()))
                .cloned()
                .collect();
        }
        for view in &reporting {
            let Some(entry) = fd.by_view.get(view.id()) else {
                continue;
            };
            if entry.version != version {
                continue;
            }
            sources.push((entry.diagnostics.as_slice(), view.env().suffix(default_env)));
        }

        let diagnostics = merge(&sources);
        let mut hash = ContentHash::default();
        for d in &diagnostics {
            hash.xor_with(&d.stable_hash());
        }
        if hash == fd.published_hash && !fd.must_publish {
            return;
        }

        let params = PublishDiagnosticsParams {
            uri: uri.clone(),
            diagnostics: diagnostics.iter().map(Diagnostic::to_lsp).collect(),
            version: (version >= 0).then_some(version),
        };
        match self.client.publish_diagnostics(params).await {
            Ok(()) => {
                debug!(uri = %uri, count = diagnostics.len(), hash = %hash.short(), "Published diagnostics");
                fd.published_hash = hash;
                fd.must_publish = false;
            }
            Err(e) => warn!(uri = %uri, error = %e, "Publishing diagnostics failed"),
        }
    }

    /// Sequence number of the snapshot whose diagnostics are stored for
    /// `uri` under `view`.
    pub async fn stored_snapshot(&self, uri: &Url, view: &ViewId) -> Option<u64> {
        self.files
            .lock()
            .await
            .get(uri)
            .and_then(|fd| fd.by_view.get(view))
            .map(|entry| entry.snapshot)
    }

    /// Hash of what was last published for `uri`.
    pub async fn published_hash(&self, uri: &Url) -> Option<ContentHash> {
        self.files.lock().await.get(uri).map(|fd| fd.published_hash)
    }
}

/// Deduplicate diagnostics by identity across sources, suffixing those no
/// default-build source reported, then sort for publication.
fn merge(sources: &[(&[Diagnostic], String)]) -> Vec<Diagnostic> {
    let mut by_hash: HashMap<ContentHash, (Diagnostic, Vec<&str>)> = HashMap::new();
    for (diagnostics, suffix) in sources {
        for d in *diagnostics {
            by_hash
                .entry(d.stable_hash())
                .or_insert_with(|| (d.clone(), Vec::new()))
                .1
                .push(suffix.as_str());
        }
    }

    let mut merged: Vec<Diagnostic> = by_hash
        .into_values()
        .map(|(mut d, suffixes)| {
            if !suffixes.contains(&"") {
                if let Some(first) = suffixes.iter().min() {
                    d.message.push_str(first);
                }
            }
            d
        })
        .collect();
    merged.sort_by(Diagnostic::publication_order);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::MockTypeChecker;
    use crate::client::RecordingClient;
    use crate::env::StaticEnvResolver;
    use crate::options::{Options, SessionConfig};
    use keel_files::{FileStore, KindRules, Modification};
    use lsp_types::{DiagnosticSeverity, Position, Range};

    struct Fixture {
        client: Arc<RecordingClient>,
        session: Arc<Session>,
        store: DiagnosticStore,
    }

    fn fixture() -> Fixture {
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
        let store = DiagnosticStore::new(client.clone(), session.clone());
        Fixture { client, session, store }
    }

    async fn add_view(session: &Session, folder: &str) -> Arc<View> {
        session
            .add_folder(Url::parse(folder).unwrap(), "w", Options::default())
            .await
            .unwrap()
    }

    fn file() -> Url {
        Url::parse("file:///w/x.src").unwrap()
    }

    fn report(message: &str) -> DiagnosticMap {
        DiagnosticMap::from([(file(), vec![diag(0, message)])])
    }

    fn last_messages(client: &RecordingClient) -> Vec<String> {
        client
            .published(&file())
            .last()
            .map(|p| p.diagnostics.iter().map(|d| d.message.clone()).collect())
            .unwrap_or_default()
    }

    fn diag(line: u32, message: &str) -> Diagnostic {
        Diagnostic::new(
            Url::parse("file:///w/x.src").unwrap(),
            Range::new(Position::new(line, 0), Position::new(line, 1)),
            DiagnosticSeverity::ERROR,
            "compiler",
            message,
        )
    }

    #[test]
    fn shared_findings_are_not_suffixed() {
        let default = vec![diag(0, "both")];
        let other = vec![diag(0, "both"), diag(1, "only plan9")];
        let merged = merge(&[
            (default.as_slice(), String::new()),
            (other.as_slice(), " [plan9,amd64]".to_string()),
        ]);

        let messages: Vec<_> = merged.iter().map(|d| d.message.as_str()).collect();
        assert_eq!(messages, vec!["both", "only plan9 [plan9,amd64]"]);
    }

    #[test]
    fn alphabetically_first_suffix_wins() {
        let a = vec![diag(0, "m")];
        let merged = merge(&[
            (a.as_slice(), " [windows,arm]".to_string()),
            (a.as_slice(), " [plan9,arm]".to_string()),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].message, "m [plan9,arm]");
    }

    #[test]
    fn merged_output_is_sorted() {
        let a = vec![diag(3, "late"), diag(1, "early")];
        let merged = merge(&[(a.as_slice(), String::new())]);
        assert_eq!(merged[0].message, "early");
    }

    #[tokio::test]
    async fn partial_report_does_not_replace_final_report_of_same_snapshot() {
        let f = fixture();
        let view = add_view(&f.session, "file:///w/").await;
        let snapshot = view.snapshot().unwrap();
        let cancel = CancellationToken::new();

        f.store.update(&snapshot, report("full"), true, &cancel).await.unwrap();
        f.store.update(&snapshot, report("fast"), false, &cancel).await.unwrap();

        assert_eq!(f.client.published(&file()).len(), 1);
        assert_eq!(last_messages(&f.client), vec!["full"]);
    }

    #[tokio::test]
    async fn final_report_replaces_partial_report_of_same_snapshot() {
        let f = fixture();
        let view = add_view(&f.session, "file:///w/").await;
        let snapshot = view.snapshot().unwrap();
        let cancel = CancellationToken::new();

        f.store.update(&snapshot, report("fast"), false, &cancel).await.unwrap();
        f.store.update(&snapshot, report("full"), true, &cancel).await.unwrap();

        assert_eq!(last_messages(&f.client), vec!["full"]);
    }

    #[tokio::test]
    async fn report_from_older_snapshot_is_dropped() {
        let f = fixture();
        let view = add_view(&f.session, "file:///w/").await;
        let old = view.snapshot().unwrap();
        f.session
            .did_modify_files(&[Modification::open(file(), 1, "keel", "x")])
            .await
            .unwrap();
        let new = view.snapshot().unwrap();
        assert!(new.sequence_id() > old.sequence_id());
        let cancel = CancellationToken::new();

        f.store.update(&new, report("current"), true, &cancel).await.unwrap();
        f.store.update(&old, report("outdated"), true, &cancel).await.unwrap();

        assert_eq!(f.store.stored_snapshot(&file(), view.id()).await, Some(new.sequence_id()));
        assert_eq!(last_messages(&f.client), vec!["current"]);
    }

    #[tokio::test]
    async fn final_pass_clears_reports_of_removed_views() {
        let f = fixture();
        let gone = add_view(&f.session, "file:///w/").await;
        let kept = add_view(&f.session, "file:///elsewhere/").await;
        let cancel = CancellationToken::new();

        let snapshot = gone.snapshot().unwrap();
        f.store.update(&snapshot, report("undefined x"), true, &cancel).await.unwrap();
        snapshot.release();
        assert_eq!(last_messages(&f.client), vec!["undefined x"]);

        f.session.remove_folder(gone.folder()).await.unwrap();
        let snapshot = kept.snapshot().unwrap();
        f.store.update(&snapshot, DiagnosticMap::new(), true, &cancel).await.unwrap();

        assert_eq!(f.client.published(&file()).len(), 2);
        assert!(last_messages(&f.client).is_empty());
        assert_eq!(f.store.stored_snapshot(&file(), gone.id()).await, None);
    }

    #[tokio::test]
    async fn forgetting_removed_views_republishes_their_files() {
        let f = fixture();
        let view = add_view(&f.session, "file:///w/").await;
        let snapshot = view.snapshot().unwrap();
        f.store
            .update(&snapshot, report("undefined x"), true, &CancellationToken::new())
            .await
            .unwrap();
        snapshot.release();

        f.session.remove_folder(view.folder()).await.unwrap();
        f.store.forget_removed_views().await;
        f.store.forget_removed_views().await;

        assert_eq!(f.client.published(&file()).len(), 2);
        assert!(last_messages(&f.client).is_empty());
    }
}
