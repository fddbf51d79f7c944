//! Integration tests for text synchronization through the server.
//!
//! These tests drive `didOpen`, `didChange` and `didClose` and check what the
//! file store and snapshots see afterwards.

mod common;
use common::{range, Harness};

use keel::metadata::PackageId;
use keel::options::Options;
use keel_files::uri;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn test_open_then_close_reverts_to_disk() {
    let h = Harness::start_with_files(json!({ "diagnosticsDelay": "0" }), &[("a.src", "disk text")]).await;
    let store = h.server.session().store().clone();

    let uri = h.open("a.src", "x").await;
    let open = store.read_file(&uri).await.unwrap();
    assert!(open.is_overlay());
    assert_eq!(open.text().unwrap(), "x");

    h.close("a.src").await;
    let closed = store.read_file(&uri).await.unwrap();
    assert!(!closed.is_overlay());
    assert_eq!(closed.text().unwrap(), "disk text");
}

#[tokio::test]
async fn test_closing_an_unsaved_new_file_leaves_it_missing() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    let store = h.server.session().store().clone();

    let uri = h.open("new.src", "draft").await;
    h.close("new.src").await;

    assert!(store.read_file(&uri).await.unwrap().is_missing());
}

#[tokio::test]
async fn test_incremental_edit_replaces_range() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    let store = h.server.session().store().clone();

    let uri = h.open("a.src", "abcdef").await;
    let before = store.read_file(&uri).await.unwrap();

    h.edit("a.src", 2, range((0, 1), (0, 3)), "ZZ").await;
    let after = store.read_file(&uri).await.unwrap();

    assert_eq!(after.text().unwrap(), "aZZdef");
    assert_eq!(after.version(), 2);
    assert_ne!(after.hash(), before.hash());
}

#[tokio::test]
async fn test_edit_outside_the_document_is_rejected() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    h.open("a.src", "abc").await;

    let params = lsp_types::DidChangeTextDocumentParams {
        text_document: lsp_types::VersionedTextDocumentIdentifier {
            uri: h.uri("a.src"),
            version: 2,
        },
        content_changes: vec![lsp_types::TextDocumentContentChangeEvent {
            range: Some(range((5, 0), (5, 1))),
            range_length: None,
            text: "x".to_string(),
        }],
    };
    assert!(h.server.did_change(params).await.is_err());

    let current = h.server.session().store().read_file(&h.uri("a.src")).await.unwrap();
    assert_eq!(current.text().unwrap(), "abc");
    assert_eq!(current.version(), 1);
}

#[tokio::test]
async fn test_old_snapshot_keeps_old_content() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    let uri = h.open("a.src", "one").await;
    let old = h.server.session().snapshot_of(&uri).await.unwrap();

    h.change("a.src", 2, "two").await;
    let new = h.server.session().snapshot_of(&uri).await.unwrap();

    assert_eq!(old.read_file(&uri).await.unwrap().text().unwrap(), "one");
    assert_eq!(new.read_file(&uri).await.unwrap().text().unwrap(), "two");
    assert!(new.sequence_id() > old.sequence_id());

    old.release();
    new.release();
}

#[tokio::test]
async fn test_shutdown_reports_no_leaks_after_release() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    let uri = h.open("a.src", "one").await;
    h.server.session().snapshot_of(&uri).await.unwrap().release();
    h.server.settle().await;

    h.server.shutdown().await.unwrap();
    assert_eq!(h.server.session().outstanding_snapshots(), 0);
    assert!(h.shown().iter().all(|m| !m.contains("outstanding")));
}

#[tokio::test]
async fn test_carried_results_keep_their_inputs() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    let a = h.open("a/x.src", "package a\nfn x\n").await;
    let b = h.open("b/y.src", "package b\nfn y\n").await;
    h.server.settle().await;
    let old = h.server.session().snapshot_of(&a).await.unwrap();

    h.change("a/x.src", 2, "package a\nfn x2\n").await;
    h.server.settle().await;
    let new = h.server.session().snapshot_of(&a).await.unwrap();
    assert_eq!(new.sequence_id(), old.sequence_id() + 1);

    let b_before = old.type_check_inputs(&PackageId::new("b")).expect("b checked before the edit");
    let b_after = new.type_check_inputs(&PackageId::new("b")).expect("b carried over");
    assert_eq!(b_after, b_before);
    let b_now = h.server.session().store().read_file(&b).await.unwrap();
    assert_eq!(b_after[&b], b_now.hash());

    let a_before = old.type_check_inputs(&PackageId::new("a")).unwrap();
    let a_after = new.type_check_inputs(&PackageId::new("a")).unwrap();
    assert_ne!(a_after[&a], a_before[&a]);

    old.release();
    new.release();
}

#[tokio::test]
async fn test_unrelated_view_keeps_its_snapshot() {
    let h = Harness::start(json!({ "diagnosticsDelay": "0" })).await;
    let other_dir = TempDir::new().unwrap();
    let other = h
        .server
        .session()
        .add_folder(uri::from_dir(other_dir.path()).unwrap(), "other", Options::default())
        .await
        .unwrap();
    let untouched = other.snapshot().unwrap().global_id();

    let a = h.open("a.src", "package a\n").await;
    h.server.settle().await;

    assert_eq!(other.snapshot().unwrap().global_id(), untouched);
    let changed = h.server.session().snapshot_of(&a).await.unwrap();
    assert_eq!(changed.folder(), &h.root);
    assert!(changed.global_id() > untouched);
    changed.release();
}
