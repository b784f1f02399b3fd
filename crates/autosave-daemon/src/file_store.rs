//! File-backed content store using tokio::fs.
//!
//! Each document is one pretty-printed JSON record, `<store>/<id>.json`.
//! Writes go to a temp file first and are renamed into place, so a crash
//! mid-write leaves the previous version intact.

use async_trait::async_trait;
use autosave_core::content::{Content, ValidationError};
use autosave_core::store::{
    ContentStore, Document, DocumentId, MetadataPatch, NewDocument, Result, SaveReceipt,
    StoreError,
};
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const RECORD_EXT: &str = "json";

/// Content store keeping one JSON file per document.
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write cycles so version bumps never interleave
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn open(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root).await.map_err(io_error)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids of all stored documents, sorted.
    pub async fn list(&self) -> Result<Vec<DocumentId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(&self.root).await.map_err(io_error)?;

        while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(DocumentId::new(stem));
            }
        }

        ids.sort();
        Ok(ids)
    }

    fn record_path(&self, id: &DocumentId) -> Result<PathBuf> {
        check_id(id)?;
        Ok(self.root.join(format!("{}.{}", id, RECORD_EXT)))
    }

    async fn read_record(&self, id: &DocumentId) -> Result<Document> {
        let path = self.record_path(id)?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::Unknown(format!("Corrupt record for {}: {}", id, e)))
    }

    async fn write_record(&self, doc: &Document) -> Result<()> {
        let path = self.record_path(&doc.id)?;
        let tmp = path.with_extension(format!("{}.tmp", RECORD_EXT));
        let contents = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Unknown(e.to_string()))?;

        fs::write(&tmp, contents).await.map_err(io_error)?;
        fs::rename(&tmp, &path).await.map_err(io_error)?;
        debug!("Wrote {} (version {})", path.display(), doc.version);
        Ok(())
    }

    async fn write_content(
        &self,
        id: &DocumentId,
        content: &Content,
        expected_version: Option<u64>,
    ) -> Result<SaveReceipt> {
        content.validate()?;

        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_record(id).await?;
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
        self.write_record(&doc).await?;
        Ok(SaveReceipt::for_document(&doc))
    }
}

/// Ids become file names, so anything that could escape the root is refused.
fn check_id(id: &DocumentId) -> Result<()> {
    let s = id.as_str();
    let bad = s.is_empty()
        || s.starts_with('.')
        || s.contains(['/', '\\'])
        || s.chars().any(char::is_control);
    if bad {
        return Err(StoreError::Validation(ValidationError {
            path: "/id".to_string(),
            reason: format!("`{}` is not a valid document id", s),
        }));
    }
    Ok(())
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Persistence(e.to_string())
}

#[async_trait]
impl ContentStore for FileStore {
    async fn create(&self, new: NewDocument) -> Result<Document> {
        new.content.validate()?;
        let id = new.id.clone().unwrap_or_else(DocumentId::generate);

        let _guard = self.write_lock.lock().await;
        let path = self.record_path(&id)?;
        if fs::try_exists(&path).await.map_err(io_error)? {
            return Err(StoreError::AlreadyExists(id));
        }
        let doc = new.into_document(id, Utc::now());
        self.write_record(&doc).await?;
        Ok(doc)
    }

    async fn get(&self, id: &DocumentId) -> Result<Document> {
        self.read_record(id).await
    }

    async fn save(&self, id: &DocumentId, content: &Content) -> Result<SaveReceipt> {
        self.write_content(id, content, None).await
    }

    async fn save_if_version(
        &self,
        id: &DocumentId,
        content: &Content,
        expected_version: u64,
    ) -> Result<SaveReceipt> {
        self.write_content(id, content, Some(expected_version)).await
    }

    async fn update_metadata(&self, id: &DocumentId, patch: MetadataPatch) -> Result<Document> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.read_record(id).await?;
        patch.apply(&mut doc, Utc::now());
        self.write_record(&doc).await?;
        Ok(doc)
    }
}
