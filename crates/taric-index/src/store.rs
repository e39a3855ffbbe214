use std::sync::Arc;

use bytes::Bytes;
use taric_store::{StorageBackend, StoreError};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::entry::{IndexDocument, IndexEntry};
use crate::error::IndexResult;

/// Key the index document is stored under when none is configured.
pub const DEFAULT_INDEX_KEY: &str = "taricdeltas.json";

/// Durable index document stored as one object in the backend.
///
/// Every write replaces the whole document. Read-modify-write cycles made
/// through one `IndexStore` are serialized, so concurrent upserts within a
/// process never lose each other. Separate processes sharing a backend
/// still race, and the last writer wins.
pub struct IndexStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    write_lock: Mutex<()>,
}

impl IndexStore {
    pub fn new(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn exists(&self) -> IndexResult<bool> {
        Ok(self.backend.exists(&self.key).await?)
    }

    /// Load the current document. A missing index object is an empty index.
    pub async fn load(&self) -> IndexResult<IndexDocument> {
        match self.backend.read_all(&self.key).await {
            Ok(bytes) => IndexDocument::from_slice(&self.key, &bytes),
            Err(StoreError::NotFound(_)) => {
                debug!(key = %self.key, "index missing, treating as empty");
                Ok(IndexDocument::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or replace the entry for `entry.id`.
    pub async fn upsert(&self, entry: IndexEntry) -> IndexResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await?;
        let id = entry.id;
        let replaced = doc.upsert(entry);
        self.save(&doc).await?;
        if replaced {
            info!(%id, entries = doc.len(), "index entry replaced");
        } else {
            info!(%id, entries = doc.len(), "index entry added");
        }
        Ok(())
    }

    /// Install a freshly computed document, discarding the current one.
    pub async fn replace_all(&self, entries: Vec<IndexEntry>) -> IndexResult<IndexDocument> {
        let _guard = self.write_lock.lock().await;
        let doc = IndexDocument::from_entries(entries);
        self.save(&doc).await?;
        info!(key = %self.key, entries = doc.len(), "index replaced");
        Ok(doc)
    }

    async fn save(&self, doc: &IndexDocument) -> IndexResult<()> {
        let bytes = Bytes::from(doc.to_vec()?);
        self.backend.write(&self.key, bytes, None).await?;
        Ok(())
    }
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("backend", &self.backend.name())
            .field("key", &self.key)
            .finish()
    }
}
