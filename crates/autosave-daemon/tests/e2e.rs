//! End-to-end tests for autosave-daemon.
//!
//! Drives the session manager against a real file store in a temp
//! directory, plus the draft watcher on a real filesystem.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use autosave_core::{Content, ContentStore, DocumentId, SyncConfig, SyncEvent, SyncState};
use autosave_daemon::{
    DraftEvent, DraftEventKind, DraftWatcher, FileStore, ManagerConfig, SessionManager,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const DEBOUNCE: Duration = Duration::from_millis(200);

struct Harness {
    _temp_dir: TempDir,
    drafts: PathBuf,
    store: Arc<FileStore>,
    manager: SessionManager,
    events: UnboundedReceiver<SyncEvent>,
}

impl Harness {
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let drafts = temp_dir.path().join("drafts");
        std::fs::create_dir_all(&drafts).expect("Failed to create drafts dir");

        let store = Arc::new(
            FileStore::open(temp_dir.path().join("store"))
                .await
                .expect("Failed to open store"),
        );
        let config = ManagerConfig {
            owner_id: "tester".to_string(),
            sync: SyncConfig::builder()
                .debounce(DEBOUNCE)
                .saved_display(Duration::from_secs(60))
                .build(),
        };
        let (manager, events) = SessionManager::new(Arc::clone(&store), config);

        Self {
            _temp_dir: temp_dir,
            drafts,
            store,
            manager,
            events,
        }
    }

    /// Write a draft file and hand the matching watcher event to the manager.
    async fn write_draft(&mut self, id: &str, body: &str) {
        let path = self.drafts.join(format!("{}.json", id));
        std::fs::write(&path, body).expect("Failed to write draft");
        self.manager
            .on_draft_event(DraftEvent {
                id: id.into(),
                path,
                kind: DraftEventKind::Modified,
            })
            .await
            .expect("Draft event failed");
    }

    async fn delete_draft(&mut self, id: &str) {
        let path = self.drafts.join(format!("{}.json", id));
        std::fs::remove_file(&path).expect("Failed to remove draft");
        self.manager
            .on_draft_event(DraftEvent {
                id: id.into(),
                path,
                kind: DraftEventKind::Deleted,
            })
            .await
            .expect("Draft event failed");
    }

    /// Pump session events into the manager until one matches.
    async fn wait_for_event(&mut self, mut matches: impl FnMut(&SyncEvent) -> bool) -> SyncEvent {
        timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("Event channel closed");
                self.manager.on_sync_event(&event);
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("Timeout waiting for session event")
    }
}

fn paragraph_json(text: &str) -> String {
    Content::paragraph(text).to_value().to_string()
}

#[tokio::test]
async fn test_first_draft_creates_document() {
    let mut h = Harness::new().await;

    h.write_draft("doc-1", &paragraph_json("hello")).await;

    let doc = h.store.get(&"doc-1".into()).await.unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.title, "doc-1");
    assert_eq!(doc.owner_id, "tester");
    assert_eq!(doc.content, Content::paragraph("hello"));
    assert_eq!(h.manager.session_count(), 1);
}

#[tokio::test]
async fn test_modified_draft_is_saved_after_debounce() {
    let mut h = Harness::new().await;
    let id = DocumentId::from("doc-1");

    h.write_draft("doc-1", &paragraph_json("v1")).await;
    h.write_draft("doc-1", &paragraph_json("v2")).await;
    h.write_draft("doc-1", &paragraph_json("v3")).await;

    let event = h
        .wait_for_event(|e| matches!(e, SyncEvent::Saved { .. }))
        .await;

    // Burst of edits coalesces into one write of the latest draft.
    assert!(matches!(event, SyncEvent::Saved { version: 2, .. }));
    let doc = h.store.get(&id).await.unwrap();
    assert_eq!(doc.content, Content::paragraph("v3"));
    let status = h.manager.session(&id).unwrap().status();
    assert_eq!(status.state, SyncState::Saved);
    assert_eq!(status.version, Some(2));
}

#[tokio::test]
async fn test_unchanged_draft_skips_write() {
    let mut h = Harness::new().await;

    h.write_draft("doc-1", &paragraph_json("same")).await;
    h.write_draft("doc-1", &paragraph_json("same")).await;

    h.wait_for_event(|e| matches!(e, SyncEvent::FlushSkipped { .. }))
        .await;

    assert_eq!(h.store.get(&"doc-1".into()).await.unwrap().version, 1);
}

#[tokio::test]
async fn test_invalid_draft_is_ignored() {
    let mut h = Harness::new().await;
    let id = DocumentId::from("doc-1");

    h.write_draft("doc-1", &paragraph_json("good")).await;
    h.write_draft("doc-1", "{ not json").await;
    h.write_draft("doc-1", r#"[{"text": "leaf at top level"}]"#).await;

    let session = h.manager.session(&id).expect("Session should stay open");
    assert_eq!(session.working_copy(), Content::paragraph("good"));
    assert!(!session.has_unsaved_changes());
}

#[tokio::test]
async fn test_invalid_first_draft_opens_nothing() {
    let mut h = Harness::new().await;

    h.write_draft("doc-1", "[]").await;

    assert_eq!(h.manager.session_count(), 0);
    assert!(h.store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deleted_draft_flushes_and_closes() {
    let mut h = Harness::new().await;

    h.write_draft("doc-1", &paragraph_json("v1")).await;
    h.write_draft("doc-1", &paragraph_json("last words")).await;
    h.delete_draft("doc-1").await;

    assert_eq!(h.manager.session_count(), 0);
    let doc = h.store.get(&"doc-1".into()).await.unwrap();
    assert_eq!(doc.content, Content::paragraph("last words"));
    assert_eq!(doc.version, 2);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_edits() {
    let mut h = Harness::new().await;

    h.write_draft("a", &paragraph_json("a1")).await;
    h.write_draft("b", &paragraph_json("b1")).await;
    h.write_draft("a", &paragraph_json("a2")).await;
    h.write_draft("b", &paragraph_json("b2")).await;

    h.manager.shutdown().await;

    assert_eq!(h.manager.session_count(), 0);
    for (id, text) in [("a", "a2"), ("b", "b2")] {
        let doc = h.store.get(&id.into()).await.unwrap();
        assert_eq!(doc.content, Content::paragraph(text), "document {}", id);
        assert_eq!(doc.version, 2, "document {}", id);
    }
}

#[tokio::test]
async fn test_reopen_uses_stored_document() {
    let mut h = Harness::new().await;
    let id = DocumentId::from("doc-1");

    h.write_draft("doc-1", &paragraph_json("v1")).await;
    h.write_draft("doc-1", &paragraph_json("v2")).await;
    h.delete_draft("doc-1").await;

    // Draft comes back with the stored content; nothing new to write.
    h.write_draft("doc-1", &paragraph_json("v2")).await;

    let session = h.manager.session(&id).unwrap();
    assert_eq!(session.status().version, Some(2));
    assert!(!session.has_unsaved_changes());
}

#[tokio::test]
async fn test_document_removed_from_store_closes_session() {
    let mut h = Harness::new().await;
    let id = DocumentId::from("doc-1");

    h.write_draft("doc-1", &paragraph_json("v1")).await;
    std::fs::remove_file(h.store.root().join("doc-1.json")).expect("Failed to remove record");
    h.write_draft("doc-1", &paragraph_json("v2")).await;

    let failed = h
        .wait_for_event(|e| matches!(e, SyncEvent::SaveFailed { .. }))
        .await;
    assert!(matches!(failed, SyncEvent::SaveFailed { ref kind, .. } if kind == "not_found"));

    h.wait_for_event(|e| matches!(e, SyncEvent::DocumentMissing { .. }))
        .await;
    assert!(h.manager.session(&id).is_none());
}

// ============================================================================
// Draft Watcher Tests
// ============================================================================

async fn next_draft_event(watcher: &mut DraftWatcher) -> DraftEvent {
    // FSEvents + debounce can take several seconds
    timeout(Duration::from_secs(10), watcher.event_rx().recv())
        .await
        .expect("Timeout waiting for draft event")
        .expect("No event received")
}

fn write_twice(path: &Path, first: &str, second: &str) {
    std::fs::write(path, first).expect("Failed to write file");
    std::thread::sleep(Duration::from_millis(100));
    std::fs::write(path, second).expect("Failed to modify file");
}

/// Test draft watcher detects changes.
#[tokio::test]
async fn test_draft_watcher_detects_changes() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let drafts_path = temp_dir.path().to_path_buf();

    let mut watcher = DraftWatcher::new(drafts_path.clone()).expect("Failed to create watcher");

    // Give watcher time to fully initialize - FSEvents on macOS needs time
    tokio::time::sleep(Duration::from_millis(500)).await;

    write_twice(
        &drafts_path.join("doc-1.json"),
        &paragraph_json("hello"),
        &paragraph_json("hello world"),
    );

    let event = next_draft_event(&mut watcher).await;
    assert_eq!(event.id, DocumentId::from("doc-1"));
    assert_eq!(event.kind, DraftEventKind::Modified);
}

/// Test draft watcher only reports visible .json files.
#[tokio::test]
async fn test_draft_watcher_only_json_files() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let drafts_path = temp_dir.path().to_path_buf();

    let mut watcher = DraftWatcher::new(drafts_path.clone()).expect("Failed to create watcher");
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Ignored: wrong extension, hidden file
    std::fs::write(drafts_path.join("notes.txt"), "text").expect("Failed to write txt file");
    std::fs::write(drafts_path.join(".swap.json"), "[]").expect("Failed to write hidden file");

    tokio::time::sleep(Duration::from_millis(200)).await;
    write_twice(
        &drafts_path.join("doc-2.json"),
        &paragraph_json("a"),
        &paragraph_json("b"),
    );

    let event = next_draft_event(&mut watcher).await;
    assert_eq!(event.id, DocumentId::from("doc-2"));
}

/// Test draft watcher reports deletions.
#[tokio::test]
async fn test_draft_watcher_detects_deletion() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let drafts_path = temp_dir.path().to_path_buf();
    let draft = drafts_path.join("doc-3.json");
    std::fs::write(&draft, paragraph_json("bye")).expect("Failed to write draft");

    let mut watcher = DraftWatcher::new(drafts_path.clone()).expect("Failed to create watcher");
    tokio::time::sleep(Duration::from_millis(500)).await;

    std::fs::remove_file(&draft).expect("Failed to remove draft");

    let event = next_draft_event(&mut watcher).await;
    assert_eq!(event.id, DocumentId::from("doc-3"));
    assert_eq!(event.kind, DraftEventKind::Deleted);
}
