//! autosave-core: Document autosave and synchronization for the Codac editor.
//!
//! This crate provides:
//! - The rich-text content tree and its structural validation
//! - The `ContentStore` persistence abstraction with an in-memory store
//! - A serial, coalescing task queue (one write in flight per session)
//! - The debounced sync controller that drives a single editing session
//! - An event bus for observing sessions

pub mod content;
pub mod controller;
pub mod events;
pub mod queue;
pub mod store;

pub use content::{Content, Node, ValidationError};
pub use controller::{
    FlushOutcome, FlushReport, SyncConfig, SyncConfigBuilder, SyncController, SyncState,
    SyncStatus,
};
pub use events::{EventBus, FlushTrigger, Subscription, SyncEvent};
pub use queue::{Enqueued, SerialQueue};
pub use store::{
    ContentStore, Document, DocumentId, InMemoryStore, MetadataPatch, NewDocument, SaveReceipt,
    StoreError,
};
