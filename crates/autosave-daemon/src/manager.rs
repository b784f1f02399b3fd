//! Session manager: one autosave session per open draft.
//!
//! Draft changes become edits on the matching `SyncController`, opening a
//! session (and creating the stored document) on first sight. Deleting a
//! draft flushes and closes its session. Session events are forwarded to
//! the daemon loop through a channel.

use crate::file_store::FileStore;
use crate::watcher::{DraftEvent, DraftEventKind};
use anyhow::{Context, Result};
use autosave_core::{
    Content, ContentStore, DocumentId, FlushOutcome, NewDocument, StoreError, Subscription,
    SyncConfig, SyncController, SyncEvent,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Settings shared by every session the manager opens.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Owner recorded on documents the manager creates.
    pub owner_id: String,
    pub sync: SyncConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            owner_id: "local".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

struct OpenSession {
    controller: SyncController<FileStore>,
    /// Keeps event forwarding alive for as long as the session is open
    _subscription: Subscription,
}

/// Owns all live sessions.
pub struct SessionManager {
    store: Arc<FileStore>,
    config: ManagerConfig,
    sessions: HashMap<DocumentId, OpenSession>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

impl SessionManager {
    /// Create a manager. The receiver yields events from every session.
    pub fn new(
        store: Arc<FileStore>,
        config: ManagerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                config,
                sessions: HashMap::new(),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn session(&self, id: &DocumentId) -> Option<&SyncController<FileStore>> {
        self.sessions.get(id).map(|s| &s.controller)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a session for `id`, creating the document from `initial` if the
    /// store doesn't have it yet.
    pub async fn open(
        &mut self,
        id: &DocumentId,
        initial: &Content,
    ) -> Result<&SyncController<FileStore>> {
        if !self.sessions.contains_key(id) {
            let doc = match self.store.get(id).await {
                Ok(doc) => doc,
                Err(StoreError::NotFound(_)) => {
                    info!("Creating document {}", id);
                    self.store
                        .create(
                            NewDocument::new(id.as_str(), &self.config.owner_id, initial.clone())
                                .with_id(id.clone()),
                        )
                        .await?
                }
                Err(e) => return Err(e).with_context(|| format!("Failed to load {}", id)),
            };

            let controller =
                SyncController::new(&doc, Arc::clone(&self.store), self.config.sync.clone());
            let tx = self.event_tx.clone();
            let subscription = controller.events().subscribe(move |event| {
                // Daemon loop gone means we're shutting down.
                let _ = tx.send(event);
            });
            info!("Opened session for {} (version {})", id, doc.version);

            self.sessions.insert(
                id.clone(),
                OpenSession {
                    controller,
                    _subscription: subscription,
                },
            );
        }

        self.sessions
            .get(id)
            .map(|s| &s.controller)
            .with_context(|| format!("Session for {} vanished", id))
    }

    /// Feed new draft content into its session.
    pub async fn apply_draft(&mut self, id: &DocumentId, content: Content) -> Result<()> {
        let controller = self.open(id, &content).await?;
        controller.on_change(content);
        Ok(())
    }

    /// Handle a watcher event. Unreadable or invalid drafts are logged and
    /// skipped; the session keeps its last good working copy.
    pub async fn on_draft_event(&mut self, event: DraftEvent) -> Result<()> {
        match event.kind {
            DraftEventKind::Modified => match read_draft(&event.path).await {
                Ok(content) => self.apply_draft(&event.id, content).await,
                Err(e) => {
                    warn!("Ignoring draft {}: {:#}", event.path.display(), e);
                    Ok(())
                }
            },
            DraftEventKind::Deleted => {
                self.close(&event.id).await;
                Ok(())
            }
        }
    }

    /// React to a session event from the channel.
    pub fn on_sync_event(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::DocumentMissing { document_id } => {
                warn!("{} was deleted from the store; closing its session", document_id);
                // Dropping the controller closes it.
                self.sessions.remove(document_id);
            }
            SyncEvent::SaveFailed {
                document_id,
                kind,
                message,
                ..
            } => {
                error!("Save failed for {} ({}): {}", document_id, kind, message);
            }
            other => debug!("Session event: {:?}", other),
        }
    }

    /// Flush pending edits (as on focus loss) and end the session.
    pub async fn close(&mut self, id: &DocumentId) {
        let Some(session) = self.sessions.remove(id) else {
            return;
        };
        let outcome = session.controller.on_blur().await;
        session.controller.settled().await;
        session.controller.close();
        info!("Closed session for {} ({:?})", id, outcome);
    }

    /// Save every session and wait for the writes to land.
    pub async fn shutdown(&mut self) {
        let ids: Vec<DocumentId> = self.sessions.keys().cloned().collect();
        for id in ids {
            let Some(session) = self.sessions.remove(&id) else {
                continue;
            };
            match session.controller.save().await {
                FlushOutcome::Completed(Err(e)) => {
                    error!("Final save failed for {}: {}", id, e);
                }
                outcome => debug!("Final save for {}: {:?}", id, outcome),
            }
            session.controller.settled().await;
            session.controller.close();
        }
        info!("All sessions closed");
    }
}

async fn read_draft(path: &Path) -> Result<Content> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Content::from_json(&raw)?)
}
