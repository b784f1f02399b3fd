//! Event infrastructure for autosave sessions.
//!
//! Provides `SyncEvent` for monitoring and `EventBus` for subscriptions.
//! A session publishes to its bus after releasing its own lock, so callbacks
//! may call back into the controller.

use crate::store::DocumentId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// What caused a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FlushTrigger {
    /// Debounce window elapsed after the last edit.
    Timer,
    /// Editor lost focus.
    Blur,
    /// Explicit save request.
    Manual,
}

/// Events emitted by a sync session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// Session state changed.
    StateChanged {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        /// Previous state.
        from: crate::controller::SyncState,
        /// New state.
        to: crate::controller::SyncState,
    },
    /// A flush found nothing new to write.
    FlushSkipped {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        trigger: FlushTrigger,
    },
    /// A write was handed to the session's queue.
    FlushRequested {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        trigger: FlushTrigger,
    },
    /// Content written to the store.
    Saved {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        /// Version assigned by the store.
        version: u64,
        timestamp: DateTime<Utc>,
    },
    /// Write failed.
    SaveFailed {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
        /// Error tag from `StoreError::kind`.
        kind: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The store no longer has the document; the host should stop editing it.
    DocumentMissing {
        #[serde(rename = "documentId")]
        document_id: DocumentId,
    },
}

type Listener = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// Keeps a listener registered on an [`EventBus`]. Dropping it removes the
/// listener; events already being delivered may still reach it once.
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct Subscription {
    bus: Weak<EventBus>,
    key: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key);
        }
    }
}

/// Fan-out of one session's events to its listeners, in subscription order.
///
/// Listeners are called outside the lock, so a listener may subscribe,
/// drop its own subscription, or call back into the session.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_key: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(SyncEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::new(listener));
        Subscription {
            bus: Arc::downgrade(self),
            key,
        }
    }

    fn remove(&self, key: u64) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn emit(&self, event: SyncEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        for listener in listeners {
            listener(event.clone());
        }
    }
}
