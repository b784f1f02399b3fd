//! autosave-daemon library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod file_store;
pub mod manager;
pub mod watcher;

// Re-export key types for convenience
pub use file_store::FileStore;
pub use manager::{ManagerConfig, SessionManager};
pub use watcher::{DraftEvent, DraftEventKind, DraftWatcher};
