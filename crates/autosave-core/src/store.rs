//! Content store abstraction for document persistence.
//!
//! Implementations:
//! - `InMemoryStore` - For testing and embedding
//! - `FileStore` (in autosave-daemon) - One JSON record per document on disk
//!
//! Authorization is the caller's job: by the time a store method runs, the
//! acting user is assumed to be allowed to touch the document.

use crate::content::{Content, ValidationError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Stable document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),

    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: DocumentId,
        expected: u64,
        actual: u64,
    },

    #[error("{0}")]
    Persistence(String),

    #[error("{0}")]
    Unknown(String),
}

impl StoreError {
    /// Whether trying the same write again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Persistence(_) | StoreError::Unknown(_))
    }

    /// Stable tag for log lines and events.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Validation(_) => "validation",
            StoreError::NotFound(_) => "not_found",
            StoreError::AlreadyExists(_) => "already_exists",
            StoreError::Conflict { .. } => "conflict",
            StoreError::Persistence(_) => "persistence",
            StoreError::Unknown(_) => "unknown",
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub description: Option<String>,
    pub content: Content,
    /// Bumped by exactly one on every successful write.
    pub version: u64,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`ContentStore::create`].
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Caller-chosen id; a random one is generated when `None`.
    pub id: Option<DocumentId>,
    pub title: String,
    pub description: Option<String>,
    pub content: Content,
    pub owner_id: String,
}

impl NewDocument {
    pub fn new(title: impl Into<String>, owner_id: impl Into<String>, content: Content) -> Self {
        Self {
            id: None,
            title: title.into(),
            description: None,
            content,
            owner_id: owner_id.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<DocumentId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Build the initial record (version 1) once the id is settled.
    pub fn into_document(self, id: DocumentId, now: DateTime<Utc>) -> Document {
        Document {
            id,
            title: self.title,
            description: self.description,
            content: self.content,
            version: 1,
            owner_id: self.owner_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Title/description changes. `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub description: Option<String>,
}

impl MetadataPatch {
    /// Apply to `doc`, bumping version and timestamp.
    pub fn apply(self, doc: &mut Document, now: DateTime<Utc>) {
        if let Some(title) = self.title {
            doc.title = title;
        }
        if let Some(description) = self.description {
            doc.description = Some(description);
        }
        doc.version += 1;
        doc.updated_at = now;
    }
}

/// Result of a successful content write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveReceipt {
    pub id: DocumentId,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl SaveReceipt {
    pub fn for_document(doc: &Document) -> Self {
        Self {
            id: doc.id.clone(),
            version: doc.version,
            updated_at: doc.updated_at,
        }
    }
}

/// Persistence backend for documents.
///
/// Stores never retry internally; retry policy belongs to the caller.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Create a document at version 1.
    async fn create(&self, new: NewDocument) -> Result<Document>;

    /// Read a document.
    async fn get(&self, id: &DocumentId) -> Result<Document>;

    /// Overwrite the document's content, bumping its version by one.
    ///
    /// Identical content still counts as a write and still bumps the version.
    async fn save(&self, id: &DocumentId, content: &Content) -> Result<SaveReceipt>;

    /// Like [`ContentStore::save`], but only if the stored version is
    /// `expected_version`.
    ///
    /// The default goes through `get` then `save` and is therefore not
    /// atomic; stores with a conditional-update primitive should override it.
    async fn save_if_version(
        &self,
        id: &DocumentId,
        content: &Content,
        expected_version: u64,
    ) -> Result<SaveReceipt> {
        let current = self.get(id).await?;
        if current.version != expected_version {
            return Err(StoreError::Conflict {
                id: id.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }
        self.save(id, content).await
    }

    /// Update title and/or description.
    async fn update_metadata(&self, id: &DocumentId, patch: MetadataPatch) -> Result<Document>;
}

// Lets a single store be shared between sessions and the test that owns it.
#[async_trait]
impl<T: ContentStore + ?Sized> ContentStore for Arc<T> {
    async fn create(&self, new: NewDocument) -> Result<Document> {
        (**self).create(new).await
    }

    async fn get(&self, id: &DocumentId) -> Result<Document> {
        (**self).get(id).await
    }

    async fn save(&self, id: &DocumentId, content: &Content) -> Result<SaveReceipt> {
        (**self).save(id, content).await
    }

    async fn save_if_version(
        &self,
        id: &DocumentId,
        content: &Content,
        expected_version: u64,
    ) -> Result<SaveReceipt> {
        (**self).save_if_version(id, content, expected_version).await
    }

    async fn update_metadata(&self, id: &DocumentId, patch: MetadataPatch) -> Result<Document> {
        (**self).update_metadata(id, patch).await
    }
}

/// In-memory store with hooks for exercising failure paths.
pub struct InMemoryStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
    /// Errors returned by upcoming `save` calls, oldest first
    faults: Mutex<VecDeque<StoreError>>,
    /// Simulated round-trip time for `save`
    latency: Mutex<Option<Duration>>,
    save_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Every successfully written (id, content), in order
    history: Mutex<Vec<(DocumentId, Content)>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            latency: Mutex::new(None),
            save_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Insert a document as-is, replacing any existing one with the same id.
    pub fn insert(&self, doc: Document) {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc.id.clone(), doc);
    }

    /// Remove a document, simulating deletion by another workflow.
    pub fn remove(&self, id: &DocumentId) -> Option<Document> {
        self.documents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// Make the next `save` fail with `err`. Calls queue up.
    pub fn fail_next(&self, err: StoreError) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// Delay every `save` by `latency` (tokio time, so paused clocks apply).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Number of `save` invocations, including failed ones.
    pub fn save_count(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Highest number of `save` calls that were running at the same time.
    pub fn max_concurrent_saves(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Contents written for `id`, oldest first.
    pub fn saved_contents(&self, id: &DocumentId) -> Vec<Content> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(doc_id, _)| doc_id == id)
            .map(|(_, content)| content.clone())
            .collect()
    }

    fn take_fault(&self) -> Option<StoreError> {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn latency(&self) -> Option<Duration> {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn write(
        &self,
        id: &DocumentId,
        content: &Content,
        expected_version: Option<u64>,
    ) -> Result<SaveReceipt> {
        let _flight = InFlight::enter(&self.in_flight, &self.max_in_flight);
        self.save_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = self.take_fault() {
            return Err(err);
        }
        content.validate()?;

        let receipt = {
            let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
            let doc = documents
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if let Some(expected) = expected_version {
                if doc.version != expected {
                    return Err(StoreError::Conflict {
                        id: id.clone(),
                        expected,
                        actual: doc.version,
                    });
                }
            }
            doc.content = content.clone();
            doc.version += 1;
            doc.updated_at = Utc::now();
            SaveReceipt::for_document(doc)
        };

        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id.clone(), content.clone()));
        debug!("Saved {} at version {}", id, receipt.version);
        Ok(receipt)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks concurrent `save` calls; decrements on drop so early returns count.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn create(&self, new: NewDocument) -> Result<Document> {
        new.content.validate()?;
        let id = new.id.clone().unwrap_or_else(DocumentId::generate);

        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        if documents.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let doc = new.into_document(id.clone(), Utc::now());
        documents.insert(id, doc.clone());
        Ok(doc)
    }

    async fn get(&self, id: &DocumentId) -> Result<Document> {
        self.documents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn save(&self, id: &DocumentId, content: &Content) -> Result<SaveReceipt> {
        self.write(id, content, None).await
    }

    async fn save_if_version(
        &self,
        id: &DocumentId,
        content: &Content,
        expected_version: u64,
    ) -> Result<SaveReceipt> {
        self.write(id, content, Some(expected_version)).await
    }

    async fn update_metadata(&self, id: &DocumentId, patch: MetadataPatch) -> Result<Document> {
        let mut documents = self.documents.write().unwrap_or_else(|e| e.into_inner());
        let doc = documents
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        patch.apply(doc, Utc::now());
        Ok(doc.clone())
    }
}
