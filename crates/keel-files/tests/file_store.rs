//! Integration tests for the file store against a real directory.
//!
//! These tests verify that overlays shadow disk content, that closing a file
//! reverts to what is on disk, and that file system events refresh memoized
//! reads.

use keel_files::{
    uri, ContentHash, Error, FileKind, FileStore, Modification, ModificationAction, Payload,
};
use lsp_types::{Position, Range, TextDocumentContentChangeEvent};
use rstest::rstest;
use std::fs;
use tempfile::TempDir;

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("main.src"), "disk text").unwrap();
    fs::write(dir.path().join("module.toml"), "name = \"app\"").unwrap();
    dir
}

#[tokio::test]
async fn open_then_close_round_trips_through_disk() {
    let dir = workspace();
    let store = FileStore::default();
    let file = uri::from_path(&dir.path().join("main.src")).unwrap();

    store
        .record_modification(&Modification::open(file.clone(), 1, "keel", "x"))
        .await
        .unwrap();
    assert_eq!(store.read_file(&file).await.unwrap().text().unwrap(), "x");

    let closed = store
        .record_modification(&Modification::close(file.clone()))
        .await
        .unwrap();
    assert!(!closed.is_overlay());
    assert_eq!(closed.version(), keel_files::DISK_VERSION);
    assert_eq!(closed.text().unwrap(), "disk text");
    assert!(store.overlays().await.is_empty());
}

#[tokio::test]
async fn closing_a_file_absent_from_disk_yields_not_found() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::default();
    let file = uri::from_path(&dir.path().join("scratch.src")).unwrap();

    store
        .record_modification(&Modification::open(file.clone(), 1, "keel", "x"))
        .await
        .unwrap();
    let closed = store
        .record_modification(&Modification::close(file.clone()))
        .await
        .unwrap();

    assert!(closed.is_missing());
    assert_eq!(closed.hash(), ContentHash::missing());
    assert!(matches!(closed.text(), Err(Error::FileNotFound(_))));
}

#[tokio::test]
async fn open_with_disk_content_is_saved() {
    let dir = workspace();
    let store = FileStore::default();
    let file = uri::from_path(&dir.path().join("main.src")).unwrap();

    let same = store
        .record_modification(&Modification::open(file.clone(), 1, "keel", "disk text"))
        .await
        .unwrap();
    assert!(same.is_saved());

    let edit = TextDocumentContentChangeEvent {
        range: Some(Range::new(Position::new(0, 0), Position::new(0, 4))),
        range_length: None,
        text: "memory".to_string(),
    };
    let edited = store
        .record_modification(&Modification::change(file, 2, Payload::Edits(vec![edit])))
        .await
        .unwrap();
    assert_eq!(edited.text().unwrap(), "memory text");
    assert!(!edited.is_saved());
}

#[tokio::test]
async fn disk_events_refresh_memoized_reads() {
    let dir = workspace();
    let store = FileStore::default();
    let path = dir.path().join("main.src");
    let file = uri::from_path(&path).unwrap();

    let before = store.read_file(&file).await.unwrap();
    assert_eq!(before.text().unwrap(), "disk text");

    fs::write(&path, "rewritten").unwrap();
    let after = store
        .record_modification(&Modification::on_disk(file.clone(), ModificationAction::Change))
        .await
        .unwrap();
    assert_eq!(after.text().unwrap(), "rewritten");

    fs::remove_file(&path).unwrap();
    let deleted = store
        .record_modification(&Modification::on_disk(file, ModificationAction::Delete))
        .await
        .unwrap();
    assert!(deleted.is_missing());
}

#[tokio::test]
async fn overlay_shadows_disk_events() {
    let dir = workspace();
    let store = FileStore::default();
    let path = dir.path().join("main.src");
    let file = uri::from_path(&path).unwrap();

    store
        .record_modification(&Modification::open(file.clone(), 1, "keel", "editor"))
        .await
        .unwrap();
    fs::write(&path, "changed underneath").unwrap();
    let handle = store
        .record_modification(&Modification::on_disk(file, ModificationAction::Change))
        .await
        .unwrap();

    assert!(handle.is_overlay());
    assert_eq!(handle.text().unwrap(), "editor");
}

#[rstest]
#[case::source("main.src", FileKind::Source)]
#[case::module("module.toml", FileKind::ModuleManifest)]
#[tokio::test]
async fn disk_reads_are_classified(#[case] name: &str, #[case] kind: FileKind) {
    let dir = workspace();
    let store = FileStore::default();
    let file = uri::from_path(&dir.path().join(name)).unwrap();
    assert_eq!(store.read_file(&file).await.unwrap().kind(), kind);
}

#[tokio::test]
async fn non_file_uri_without_overlay_is_invalid() {
    let store = FileStore::default();
    let file = lsp_types::Url::parse("untitled:Untitled-1").unwrap();
    assert!(matches!(
        store.read_file(&file).await,
        Err(Error::InvalidUri(_))
    ));
}
