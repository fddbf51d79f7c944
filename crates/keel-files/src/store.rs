//! The file store: editor overlays over memoized disk reads.

use crate::edit::apply_changes;
use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::kind::{FileKind, KindRules};
use crate::modification::{Modification, ModificationAction, Payload};
use crate::uri;
use lsp_types::Url;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

/// Hash-addressed content store for on-disk files and editor overlays.
///
/// Reads prefer the overlay of an open file. Disk reads are memoized until
/// the file's observed modification time changes or the file is explicitly
/// invalidated by a file system event.
///
/// # Lock Ordering
///
/// `overlays` and `disk` are never held at the same time, and neither is
/// held across a disk read.
#[derive(Debug, Default)]
pub struct FileStore {
    rules: RwLock<KindRules>,
    overlays: Mutex<HashMap<Url, FileHandle>>,
    disk: Mutex<HashMap<Url, FileHandle>>,
}

impl FileStore {
    /// Create an empty store classifying files with `rules`.
    #[must_use]
    pub fn new(rules: KindRules) -> Self {
        Self {
            rules: RwLock::new(rules),
            overlays: Mutex::new(HashMap::new()),
            disk: Mutex::new(HashMap::new()),
        }
    }

    /// Current kind rules.
    #[must_use]
    pub fn kind_rules(&self) -> KindRules {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the kind rules, e.g. after the template extensions changed.
    ///
    /// Memoized disk handles are dropped so they are classified again.
    pub async fn set_kind_rules(&self, rules: KindRules) {
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = rules;
        self.disk.lock().await.clear();
    }

    fn classify(&self, uri: &Url) -> FileKind {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .classify(uri)
    }

    /// Read a file, preferring its overlay.
    ///
    /// A file that cannot be read still yields a handle; its content accessor
    /// reports the failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUri` if `uri` is not a `file://` URI and has no
    /// overlay.
    pub async fn read_file(&self, uri: &Url) -> Result<FileHandle> {
        if let Some(overlay) = self.overlay(uri).await {
            return Ok(overlay);
        }
        self.read_disk(uri).await
    }

    /// Read a file from disk, ignoring overlays.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUri` if `uri` is not a `file://` URI.
    pub async fn read_disk(&self, uri: &Url) -> Result<FileHandle> {
        let path = uri::to_path(uri)?;
        let kind = self.classify(uri);

        let mtime = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) => {
                trace!(uri = %uri, error = %e, "File not readable");
                self.disk.lock().await.remove(uri);
                return Ok(FileHandle::unreadable(uri.clone(), kind, &e));
            }
        };

        if let Some(memo) = self.disk.lock().await.get(uri) {
            if mtime.is_some() && memo.mtime() == mtime {
                return Ok(memo.clone());
            }
        }

        let handle = match tokio::fs::read(&path).await {
            Ok(bytes) => FileHandle::disk(uri.clone(), bytes, kind, mtime),
            Err(e) => {
                debug!(uri = %uri, error = %e, "Failed to read file");
                return Ok(FileHandle::unreadable(uri.clone(), kind, &e));
            }
        };
        trace!(uri = %uri, hash = %handle.hash().short(), "Read file from disk");
        self.disk.lock().await.insert(uri.clone(), handle.clone());
        Ok(handle)
    }

    /// The overlay for `uri`, if the file is open.
    pub async fn overlay(&self, uri: &Url) -> Option<FileHandle> {
        self.overlays.lock().await.get(uri).cloned()
    }

    /// All current overlays, ordered by URI.
    pub async fn overlays(&self) -> Vec<FileHandle> {
        let mut handles: Vec<FileHandle> = self.overlays.lock().await.values().cloned().collect();
        handles.sort_by(|a, b| a.uri().as_str().cmp(b.uri().as_str()));
        handles
    }

    /// Forget the memoized disk handle for `uri`.
    pub async fn invalidate_disk(&self, uri: &Url) {
        self.disk.lock().await.remove(uri);
    }

    /// Drop every overlay and memoized read.
    pub async fn clear(&self) {
        self.overlays.lock().await.clear();
        self.disk.lock().await.clear();
    }

    /// Apply a modification and return the resulting handle for its URI.
    ///
    /// # Errors
    ///
    /// - `Error::MalformedPayload` if an open carries no text or a change
    ///   carries no payload
    /// - `Error::InvalidRange` if an edit does not fit the current text
    /// - `Error::UnopenedOverlay` if a file that is not open is saved
    /// - `Error::InvalidUri` if a disk read is needed for a non-file URI
    pub async fn record_modification(&self, m: &Modification) -> Result<FileHandle> {
        debug!(uri = %m.uri, action = %m.action, version = ?m.version, "Recording modification");
        match m.action {
            ModificationAction::Open => self.open(m).await,
            ModificationAction::Change if !m.on_disk => self.change(m).await,
            ModificationAction::Save => self.save(m).await,
            ModificationAction::Close => self.close(m).await,
            ModificationAction::Change | ModificationAction::Create | ModificationAction::Delete => {
                self.invalidate_disk(&m.uri).await;
                self.read_file(&m.uri).await
            }
        }
    }

    async fn open(&self, m: &Modification) -> Result<FileHandle> {
        let Some(Payload::Full(text)) = &m.payload else {
            return Err(Error::MalformedPayload(format!("open of {} carries no text", m.uri)));
        };
        let kind = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .classify_open(&m.uri, m.language_id.as_deref());

        let saved = match self.read_disk(&m.uri).await {
            Ok(disk) => disk.content().is_ok_and(|c| c == text.as_bytes()),
            Err(_) => false,
        };
        let handle = FileHandle::overlay(m.uri.clone(), m.version.unwrap_or(0), text.as_bytes(), kind, saved);
        self.overlays.lock().await.insert(m.uri.clone(), handle.clone());
        Ok(handle)
    }

    async fn change(&self, m: &Modification) -> Result<FileHandle> {
        let Some(payload) = &m.payload else {
            return Err(Error::MalformedPayload(format!("change of {} carries no content", m.uri)));
        };

        let previous = match self.overlay(&m.uri).await {
            Some(overlay) => overlay,
            None => {
                warn!(uri = %m.uri, "Change for a file that is not open; synthesizing an overlay");
                let disk = self.read_disk(&m.uri).await;
                match disk {
                    Ok(handle) if !handle.is_missing() => handle,
                    _ => FileHandle::overlay(m.uri.clone(), 0, Vec::new(), self.classify(&m.uri), false),
                }
            }
        };

        let text = match payload {
            Payload::Full(text) => text.clone().into_bytes(),
            Payload::Edits(edits) => apply_changes(previous.content()?, edits)?,
        };

        let version = m.version.unwrap_or_else(|| previous.version().max(0) + 1);
        if previous.is_overlay() && version <= previous.version() {
            debug!(uri = %m.uri, previous = previous.version(), version, "Non-increasing overlay version");
        }

        let saved = self.matches_disk(&m.uri, &text).await;
        let handle = FileHandle::overlay(m.uri.clone(), version, text, previous.kind(), saved);
        self.overlays.lock().await.insert(m.uri.clone(), handle.clone());
        Ok(handle)
    }

    async fn save(&self, m: &Modification) -> Result<FileHandle> {
        let Some(overlay) = self.overlay(&m.uri).await else {
            return Err(Error::UnopenedOverlay(m.uri.to_string()));
        };
        self.invalidate_disk(&m.uri).await;

        let text: Vec<u8> = match &m.payload {
            Some(Payload::Full(text)) => {
                if overlay.content()? != text.as_bytes() {
                    warn!(uri = %m.uri, "Saved text differs from overlay; accepting it");
                }
                text.clone().into_bytes()
            }
            Some(Payload::Edits(_)) => {
                return Err(Error::MalformedPayload(format!("save of {} carries edits", m.uri)));
            }
            None => overlay.content()?.to_vec(),
        };

        let handle = FileHandle::overlay(m.uri.clone(), overlay.version(), text, overlay.kind(), true);
        self.overlays.lock().await.insert(m.uri.clone(), handle.clone());
        Ok(handle)
    }

    async fn close(&self, m: &Modification) -> Result<FileHandle> {
        if self.overlays.lock().await.remove(&m.uri).is_none() {
            warn!(uri = %m.uri, "Close for a file that is not open");
        }
        self.invalidate_disk(&m.uri).await;
        match self.read_disk(&m.uri).await {
            // Untitled buffers have nothing to revert to.
            Err(Error::InvalidUri(_)) => {
                let gone = std::io::Error::new(std::io::ErrorKind::NotFound, "closed buffer");
                Ok(FileHandle::unreadable(m.uri.clone(), self.classify(&m.uri), &gone))
            }
            other => other,
        }
    }

    /// Whether `text` equals the memoized disk content of `uri`.
    ///
    /// Only a memoized read is consulted, so this never touches the disk.
    async fn matches_disk(&self, uri: &Url, text: &[u8]) -> bool {
        self.disk
            .lock()
            .await
            .get(uri)
            .is_some_and(|disk| disk.content().is_ok_and(|c| c == text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Position, Range, TextDocumentContentChangeEvent};

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    #[tokio::test]
    async fn incremental_change_updates_text_and_version() {
        let store = FileStore::default();
        let file = uri("/nonexistent/a.src");
        let opened = store
            .record_modification(&Modification::open(file.clone(), 1, "keel", "abcdef"))
            .await
            .unwrap();

        let edit = TextDocumentContentChangeEvent {
            range: Some(Range::new(Position::new(0, 1), Position::new(0, 3))),
            range_length: None,
            text: "ZZ".to_string(),
        };
        let changed = store
            .record_modification(&Modification::change(file.clone(), 2, Payload::Edits(vec![edit])))
            .await
            .unwrap();

        assert_eq!(changed.text().unwrap(), "aZZdef");
        assert_eq!(changed.version(), 2);
        assert_ne!(changed.hash(), opened.hash());
        assert!(!changed.is_saved());
    }

    #[tokio::test]
    async fn change_without_open_synthesizes_overlay() {
        let store = FileStore::default();
        let file = uri("/nonexistent/b.src");
        let handle = store
            .record_modification(&Modification::change(file.clone(), 4, Payload::Full("new".into())))
            .await
            .unwrap();

        assert!(handle.is_overlay());
        assert_eq!(handle.kind(), FileKind::Source);
        assert_eq!(store.overlays().await.len(), 1);
    }

    #[tokio::test]
    async fn save_of_unopened_file_fails() {
        let store = FileStore::default();
        let err = store
            .record_modification(&Modification::save(uri("/nonexistent/c.src"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnopenedOverlay(_)));
    }

    #[tokio::test]
    async fn save_with_different_text_is_a_correction() {
        let store = FileStore::default();
        let file = uri("/nonexistent/d.src");
        store
            .record_modification(&Modification::open(file.clone(), 1, "keel", "one"))
            .await
            .unwrap();
        let saved = store
            .record_modification(&Modification::save(file.clone(), Some("two".into())))
            .await
            .unwrap();

        assert_eq!(saved.text().unwrap(), "two");
        assert_eq!(saved.version(), 1);
        assert!(saved.is_saved());
    }

    #[tokio::test]
    async fn open_without_text_is_malformed() {
        let store = FileStore::default();
        let mut open = Modification::open(uri("/nonexistent/e.src"), 1, "keel", "");
        open.payload = None;
        assert!(matches!(
            store.record_modification(&open).await,
            Err(Error::MalformedPayload(_))
        ));
    }
}
