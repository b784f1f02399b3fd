//! Draft directory watcher.
//!
//! Every `<document-id>.json` file in the drafts directory is the live
//! working copy of one document. Uses notify-debouncer-mini so an editor
//! writing a file in several chunks produces a single event.

use anyhow::Result;
use autosave_core::DocumentId;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Quiet period before the watcher reports a change.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Change to a draft file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftEvent {
    /// Document the draft belongs to (file stem)
    pub id: DocumentId,
    /// Absolute path of the draft file
    pub path: PathBuf,
    pub kind: DraftEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftEventKind {
    /// Draft created or modified
    Modified,
    /// Draft removed; the editing session ends
    Deleted,
}

/// Last seen mtime per draft, to drop events that changed nothing
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

/// Watches the drafts directory (non-recursively).
pub struct DraftWatcher {
    drafts_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<DraftEvent>,
}

impl DraftWatcher {
    pub fn new(drafts_path: PathBuf) -> Result<Self> {
        // Canonicalize so event paths share the same prefix (macOS /private/var).
        let drafts_path = drafts_path.canonicalize().unwrap_or(drafts_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));

        let mut debouncer = new_debouncer(
            WATCH_DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(draft_event) = Self::process_event(&event.path, &mtime_cache) {
                            if event_tx.send(draft_event).is_err() {
                                // Receiver dropped
                                return;
                            }
                        }
                    }
                }
                Err(e) => error!("Draft watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&drafts_path, RecursiveMode::NonRecursive)?;

        Ok(Self {
            drafts_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Turn a raw path into a draft event, or `None` if it isn't a draft or
    /// nothing actually changed.
    fn process_event(path: &Path, mtime_cache: &MtimeCache) -> Option<DraftEvent> {
        let id = draft_id(path)?;

        let kind = if path.exists() {
            DraftEventKind::Modified
        } else {
            DraftEventKind::Deleted
        };

        let mut cache = mtime_cache.lock().unwrap_or_else(|e| e.into_inner());
        match kind {
            DraftEventKind::Modified => {
                let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
                if cache.get(path) == Some(&mtime) {
                    return None;
                }
                cache.insert(path.to_path_buf(), mtime);
            }
            DraftEventKind::Deleted => {
                cache.remove(path);
            }
        }

        debug!("Draft event: {:?} - {}", kind, id);
        Some(DraftEvent {
            id,
            path: path.to_path_buf(),
            kind,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<DraftEvent> {
        &mut self.event_rx
    }

    pub fn drafts_path(&self) -> &Path {
        &self.drafts_path
    }
}

/// Document id for a draft path: visible `*.json` files only.
pub fn draft_id(path: &Path) -> Option<DocumentId> {
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(DocumentId::new(stem))
}
