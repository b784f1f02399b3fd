//! Debounced sync controller: the glue between live editing and the store.
//!
//! Each open editor gets one `SyncController`. It owns the working copy,
//! restarts a debounce timer on every edit, and flushes to the store when
//! the timer fires, when the editor loses focus, or on an explicit save.
//! Writes go through the session's [`SerialQueue`], so a session never has
//! two writes in flight, and a burst of flush requests collapses into the
//! running write plus the latest pending one.
//!
//! State machine:
//!
//! ```text
//!  idle | saved | error --edit--> dirty
//!  dirty --timer / blur / save--> saving
//!  saving --ok--> saved --(saved_display)--> idle
//!  saving --err--> error
//! ```
//!
//! A flush whose working copy equals the last saved copy never reaches the
//! store; the session drops back to `idle` instead.
//!
//! There is no version check against other sessions unless
//! `optimistic_concurrency` is enabled: the last write to land wins.

use crate::content::Content;
use crate::events::{EventBus, FlushTrigger, SyncEvent};
use crate::queue::{Enqueued, SerialQueue};
use crate::store::{ContentStore, Document, DocumentId, SaveReceipt, StoreError};
use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default idle window before an edit is flushed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Default time the `saved` state is shown before falling back to `idle`.
pub const DEFAULT_SAVED_DISPLAY: Duration = Duration::from_millis(2000);

/// Session state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Nothing pending, nothing saving.
    Idle,
    /// Local edits not yet flushed.
    Dirty,
    /// A write is in flight.
    Saving,
    /// The last write just succeeded.
    Saved,
    /// The last write failed.
    Error,
}

/// Snapshot of a session's sync state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_saved_at: Option<DateTime<Utc>>,
    /// Set exactly while `state` is `Error`.
    pub error_message: Option<String>,
    /// Store version after the last successful write.
    pub version: Option<u64>,
}

impl SyncStatus {
    fn new(version: u64) -> Self {
        Self {
            state: SyncState::Idle,
            last_saved_at: None,
            error_message: None,
            version: Some(version),
        }
    }

    /// Short status line for the editor chrome.
    pub fn label(&self) -> String {
        match self.state {
            SyncState::Saving => "Saving…".to_string(),
            SyncState::Dirty => "Unsaved changes".to_string(),
            SyncState::Error => format!(
                "Error: {}",
                self.error_message.as_deref().unwrap_or("save failed")
            ),
            SyncState::Saved | SyncState::Idle => match self.last_saved_at {
                Some(at) => format!(
                    "Last saved at {}",
                    at.with_timezone(&Local).format("%H:%M:%S")
                ),
                None if self.state == SyncState::Saved => "Saved".to_string(),
                None => String::new(),
            },
        }
    }
}

pub type FlushResult = std::result::Result<SaveReceipt, StoreError>;

/// What a flush request turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Working copy already matches the store; nothing written.
    Skipped,
    /// Another write is in flight; this one was parked behind it and its
    /// result will only show up in the session status.
    Queued,
    /// The write ran to completion.
    Completed(FlushResult),
    /// The session was closed.
    Closed,
}

/// Passed to the completion callback after every finished write.
#[derive(Debug, Clone)]
pub struct FlushReport {
    pub document_id: DocumentId,
    pub trigger: FlushTrigger,
    pub result: FlushResult,
}

pub type CompletionCallback = Arc<dyn Fn(&FlushReport) + Send + Sync>;

/// Per-session configuration. Build with [`SyncConfig::builder`].
#[derive(Clone)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub saved_display: Duration,
    /// Use `save_if_version` so a write fails instead of clobbering a newer
    /// version written by another session.
    pub optimistic_concurrency: bool,
    on_complete: Option<CompletionCallback>,
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder {
            config: Self::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            saved_display: DEFAULT_SAVED_DISPLAY,
            optimistic_concurrency: false,
            on_complete: None,
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("debounce", &self.debounce)
            .field("saved_display", &self.saved_display)
            .field("optimistic_concurrency", &self.optimistic_concurrency)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn debounce(mut self, delay: Duration) -> Self {
        self.config.debounce = delay;
        self
    }

    pub fn saved_display(mut self, duration: Duration) -> Self {
        self.config.saved_display = duration;
        self
    }

    pub fn optimistic_concurrency(mut self, enabled: bool) -> Self {
        self.config.optimistic_concurrency = enabled;
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&FlushReport) + Send + Sync + 'static) -> Self {
        self.config.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

/// Mutable session state. Never held across an `.await`.
struct SessionState {
    working: Content,
    last_saved: Content,
    status: SyncStatus,
    debounce: Option<JoinHandle<()>>,
    saved_timer: Option<JoinHandle<()>>,
    closed: bool,
}

struct Session<S> {
    document_id: DocumentId,
    store: Arc<S>,
    config: SyncConfig,
    queue: SerialQueue<FlushOutcome>,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<SyncStatus>,
    events: Arc<EventBus>,
}

/// Events collected under the lock and emitted after it is released.
type Pending = Vec<SyncEvent>;

impl<S: ContentStore + 'static> Session<S> {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, st: &mut SessionState, to: SyncState, events: &mut Pending) {
        let from = st.status.state;
        st.status.state = to;
        if to != SyncState::Error {
            st.status.error_message = None;
        }
        self.status_tx.send_replace(st.status.clone());
        if from != to {
            debug!("{}: {:?} -> {:?}", self.document_id, from, to);
            events.push(SyncEvent::StateChanged {
                document_id: self.document_id.clone(),
                from,
                to,
            });
        }
    }

    fn emit(&self, events: Pending) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn on_change(self: &Arc<Self>, content: Content) {
        let mut events = Pending::new();
        {
            let mut st = self.lock();
            if st.closed {
                debug!("{}: ignoring edit after close", self.document_id);
                return;
            }
            st.working = content;
            if let Some(timer) = st.saved_timer.take() {
                timer.abort();
            }
            // An in-flight write settles into `dirty` on its own if the
            // working copy moved on.
            if st.status.state != SyncState::Saving {
                self.set_state(&mut st, SyncState::Dirty, &mut events);
            }
            self.schedule_debounce(&mut st);
        }
        self.emit(events);
    }

    fn schedule_debounce(self: &Arc<Self>, st: &mut SessionState) {
        if let Some(timer) = st.debounce.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        // Deadline counts from the edit, not from when the task first runs.
        let timer = tokio::time::sleep(self.config.debounce);
        st.debounce = Some(tokio::spawn(async move {
            timer.await;
            if let Some(session) = weak.upgrade() {
                session.flush(FlushTrigger::Timer).await;
            }
        }));
    }

    fn schedule_saved_timer(self: &Arc<Self>, st: &mut SessionState) {
        if let Some(timer) = st.saved_timer.take() {
            timer.abort();
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::time::sleep(self.config.saved_display);
        st.saved_timer = Some(tokio::spawn(async move {
            timer.await;
            if let Some(session) = weak.upgrade() {
                let mut events = Pending::new();
                {
                    let mut st = session.lock();
                    st.saved_timer = None;
                    if st.status.state == SyncState::Saved {
                        session.set_state(&mut st, SyncState::Idle, &mut events);
                    }
                }
                session.emit(events);
            }
        }));
    }

    async fn flush(self: &Arc<Self>, trigger: FlushTrigger) -> FlushOutcome {
        let mut events = Pending::new();
        let snapshot = {
            let mut st = self.lock();
            if st.closed {
                return FlushOutcome::Closed;
            }
            if let Some(timer) = st.debounce.take() {
                // The timer task is the one running this flush; let it finish.
                if trigger != FlushTrigger::Timer {
                    timer.abort();
                }
            }

            // A write in flight is about to move `last_saved`, so equality
            // with it proves nothing yet. Queue behind it; `write` re-checks.
            if st.working == st.last_saved && !self.queue.is_busy() {
                if let Some(timer) = st.saved_timer.take() {
                    timer.abort();
                }
                if matches!(
                    st.status.state,
                    SyncState::Dirty | SyncState::Error | SyncState::Saved
                ) {
                    self.set_state(&mut st, SyncState::Idle, &mut events);
                }
                events.push(SyncEvent::FlushSkipped {
                    document_id: self.document_id.clone(),
                    trigger,
                });
                None
            } else {
                self.set_state(&mut st, SyncState::Saving, &mut events);
                events.push(SyncEvent::FlushRequested {
                    document_id: self.document_id.clone(),
                    trigger,
                });
                Some(st.working.clone())
            }
        };
        self.emit(events);

        let Some(snapshot) = snapshot else {
            debug!("{}: nothing to save ({:?})", self.document_id, trigger);
            return FlushOutcome::Skipped;
        };

        let session = Arc::clone(self);
        match self
            .queue
            .enqueue(move || session.write(snapshot, trigger))
        {
            Enqueued::Started(done) => done.wait().await.unwrap_or_else(|e| {
                FlushOutcome::Completed(Err(StoreError::Unknown(e.to_string())))
            }),
            Enqueued::Queued => {
                debug!("{}: write queued behind in-flight save", self.document_id);
                FlushOutcome::Queued
            }
        }
    }

    /// Body of a queued write. Runs on the queue's task.
    async fn write(self: Arc<Self>, snapshot: Content, trigger: FlushTrigger) -> FlushOutcome {
        let mut events = Pending::new();
        let expected_version = {
            let mut st = self.lock();
            if st.last_saved == snapshot {
                // An earlier write in this burst already stored it.
                if st.status.state == SyncState::Saving {
                    let next = if st.working == st.last_saved {
                        SyncState::Saved
                    } else {
                        SyncState::Dirty
                    };
                    self.set_state(&mut st, next, &mut events);
                    if next == SyncState::Saved && !st.closed {
                        self.schedule_saved_timer(&mut st);
                    }
                }
                drop(st);
                self.emit(events);
                return FlushOutcome::Skipped;
            }
            self.set_state(&mut st, SyncState::Saving, &mut events);
            st.status.version
        };
        self.emit(events);

        let result = AssertUnwindSafe(self.persist(&snapshot, expected_version))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(StoreError::Unknown("content store panicked".to_string())));

        self.finish(snapshot, trigger, &result);
        FlushOutcome::Completed(result)
    }

    async fn persist(&self, content: &Content, expected_version: Option<u64>) -> FlushResult {
        match expected_version {
            Some(expected) if self.config.optimistic_concurrency => {
                self.store
                    .save_if_version(&self.document_id, content, expected)
                    .await
            }
            _ => self.store.save(&self.document_id, content).await,
        }
    }

    fn finish(self: &Arc<Self>, snapshot: Content, trigger: FlushTrigger, result: &FlushResult) {
        let mut events = Pending::new();
        {
            let mut st = self.lock();
            match result {
                Ok(receipt) => {
                    let now = Utc::now();
                    st.last_saved = snapshot;
                    st.status.last_saved_at = Some(now);
                    st.status.version = Some(receipt.version);
                    if st.working == st.last_saved {
                        self.set_state(&mut st, SyncState::Saved, &mut events);
                        if !st.closed {
                            self.schedule_saved_timer(&mut st);
                        }
                    } else {
                        self.set_state(&mut st, SyncState::Dirty, &mut events);
                    }
                    info!("Saved {} (version {})", self.document_id, receipt.version);
                    events.push(SyncEvent::Saved {
                        document_id: self.document_id.clone(),
                        version: receipt.version,
                        timestamp: now,
                    });
                }
                Err(err) => {
                    st.status.error_message = Some(err.to_string());
                    self.set_state(&mut st, SyncState::Error, &mut events);
                    warn!("Failed to save {}: {}", self.document_id, err);
                    events.push(SyncEvent::SaveFailed {
                        document_id: self.document_id.clone(),
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                        timestamp: Utc::now(),
                    });
                    if matches!(err, StoreError::NotFound(_)) {
                        events.push(SyncEvent::DocumentMissing {
                            document_id: self.document_id.clone(),
                        });
                    }
                }
            }
        }
        self.emit(events);

        if let Some(callback) = &self.config.on_complete {
            callback(&FlushReport {
                document_id: self.document_id.clone(),
                trigger,
                result: result.clone(),
            });
        }
    }

    fn close(&self) {
        let mut st = self.lock();
        if st.closed {
            return;
        }
        st.closed = true;
        for timer in [st.debounce.take(), st.saved_timer.take()].into_iter().flatten() {
            timer.abort();
        }
        debug!("{}: session closed", self.document_id);
    }
}

/// Autosave session for one open document.
///
/// Must be created inside a tokio runtime. Dropping the controller closes
/// the session.
pub struct SyncController<S: ContentStore + 'static> {
    session: Arc<Session<S>>,
}

impl<S: ContentStore + 'static> SyncController<S> {
    /// Start a session whose working copy is `document`'s stored content.
    pub fn new(document: &Document, store: Arc<S>, config: SyncConfig) -> Self {
        let status = SyncStatus::new(document.version);
        let (status_tx, _) = watch::channel(status.clone());

        Self {
            session: Arc::new(Session {
                document_id: document.id.clone(),
                store,
                config,
                queue: SerialQueue::new(),
                state: Mutex::new(SessionState {
                    working: document.content.clone(),
                    last_saved: document.content.clone(),
                    status,
                    debounce: None,
                    saved_timer: None,
                    closed: false,
                }),
                status_tx,
                events: Arc::new(EventBus::new()),
            }),
        }
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.session.document_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.session.config
    }

    /// Replace the working copy and restart the debounce window.
    pub fn on_change(&self, content: Content) {
        self.session.on_change(content);
    }

    /// Flush right away if there are edits waiting on the debounce timer.
    pub async fn on_blur(&self) -> FlushOutcome {
        let pending = {
            let st = self.session.lock();
            st.status.state == SyncState::Dirty || st.debounce.is_some()
        };
        if !pending {
            return FlushOutcome::Skipped;
        }
        self.session.flush(FlushTrigger::Blur).await
    }

    /// Flush right away, skipping the debounce window.
    pub async fn save(&self) -> FlushOutcome {
        self.session.flush(FlushTrigger::Manual).await
    }

    pub fn status(&self) -> SyncStatus {
        self.session.lock().status.clone()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.session.status_tx.subscribe()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.session.events
    }

    pub fn working_copy(&self) -> Content {
        self.session.lock().working.clone()
    }

    /// Whether the working copy differs from what was last stored.
    pub fn has_unsaved_changes(&self) -> bool {
        let st = self.session.lock();
        st.working != st.last_saved
    }

    /// Wait until no write is running or queued.
    pub async fn settled(&self) {
        self.session.queue.idle().await;
    }

    /// End the session. Pending timers are cancelled and later edits are
    /// ignored; a write already handed to the queue still completes.
    pub fn close(&self) {
        self.session.close();
    }
}

impl<S: ContentStore + 'static> Drop for SyncController<S> {
    fn drop(&mut self) {
        self.session.close();
    }
}
