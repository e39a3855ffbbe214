use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};

use crate::error::{Operation, StoreError, StoreResult};
use crate::traits::{
    Metadata, ObjectInfo, ObjectReader, ObjectStat, PartReceipt, StorageBackend, UploadId,
};

/// Chunk size used when streaming objects out of memory.
pub const DEFAULT_MEMORY_CHUNK: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct MemoryObject {
    data: Bytes,
    metadata: Metadata,
    last_modified: SystemTime,
}

#[derive(Debug)]
struct MemoryUpload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

/// In-memory, map-based backend.
///
/// Intended for tests and embedding. Objects live in a `BTreeMap` behind a
/// `RwLock`, so listings come out in key order. Rename is atomic here, which
/// makes it behave like the filesystem backend rather than S3 for readers.
///
/// Failures can be injected per [`Operation`] with [`fail_next`](Self::fail_next)
/// or [`fail_after`](Self::fail_after) to exercise error paths of callers,
/// and slowed down with [`set_latency`](Self::set_latency).
pub struct InMemoryBackend {
    objects: RwLock<BTreeMap<String, MemoryObject>>,
    uploads: RwLock<HashMap<String, MemoryUpload>>,
    /// Operation -> number of calls still allowed to succeed before one fails.
    faults: RwLock<HashMap<Operation, usize>>,
    latency: RwLock<HashMap<Operation, Duration>>,
    calls: RwLock<HashMap<Operation, usize>>,
    chunk_size: usize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_MEMORY_CHUNK)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            uploads: RwLock::new(HashMap::new()),
            faults: RwLock::new(HashMap::new()),
            latency: RwLock::new(HashMap::new()),
            calls: RwLock::new(HashMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Number of multipart uploads begun but not yet completed or aborted.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.read().expect("lock poisoned").len()
    }

    /// Make the next call of `op` fail with a backend error.
    pub fn fail_next(&self, op: Operation) {
        self.fail_after(op, 0);
    }

    /// Let `successes` calls of `op` through, then fail the one after.
    pub fn fail_after(&self, op: Operation, successes: usize) {
        self.faults.write().expect("lock poisoned").insert(op, successes);
    }

    /// Delay every call of `op` by `delay`.
    pub fn set_latency(&self, op: Operation, delay: Duration) {
        self.latency.write().expect("lock poisoned").insert(op, delay);
    }

    /// Number of calls of `op` made so far, including failed ones.
    pub fn calls(&self, op: Operation) -> usize {
        self.calls
            .read()
            .expect("lock poisoned")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    async fn enter(&self, op: Operation, key: &str) -> StoreResult<()> {
        *self.calls.write().expect("lock poisoned").entry(op).or_insert(0) += 1;
        let delay = self.latency.read().expect("lock poisoned").get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_fault(op, key)
    }

    fn check_fault(&self, op: Operation, key: &str) -> StoreResult<()> {
        let mut faults = self.faults.write().expect("lock poisoned");
        let Some(remaining) = faults.get_mut(&op) else {
            return Ok(());
        };
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(());
        }
        faults.remove(&op);
        Err(StoreError::backend(op, key, "injected fault"))
    }

    fn get(&self, key: &str) -> StoreResult<MemoryObject> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn put(&self, key: &str, data: Bytes, metadata: Option<Metadata>) {
        let object = MemoryObject {
            data,
            metadata: metadata.unwrap_or_default(),
            last_modified: SystemTime::now(),
        };
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), object);
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.enter(Operation::Exists, key).await?;
        Ok(self.objects.read().expect("lock poisoned").contains_key(key))
    }

    async fn open_reader(&self, key: &str) -> StoreResult<ObjectReader> {
        self.enter(Operation::Read, key).await?;
        let data = self.get(key)?.data;
        let chunk_size = self.chunk_size;
        let chunks: Vec<StoreResult<Bytes>> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| Ok(data.slice(start..(start + chunk_size).min(data.len()))))
            .collect();
        Ok(ObjectReader {
            size: data.len() as u64,
            stream: stream::iter(chunks).boxed(),
        })
    }

    async fn write(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> StoreResult<()> {
        self.enter(Operation::Write, key).await?;
        self.put(key, data, metadata);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.enter(Operation::Delete, key).await?;
        self.objects
            .write()
            .expect("lock poisoned")
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
        self.enter(Operation::List, prefix).await?;
        let map = self.objects.read().expect("lock poisoned");
        Ok(map
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            })
            .collect())
    }

    async fn stat(&self, key: &str) -> StoreResult<ObjectStat> {
        self.enter(Operation::Stat, key).await?;
        let object = self.get(key)?;
        Ok(ObjectStat {
            info: ObjectInfo {
                key: key.to_string(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
            },
            metadata: object.metadata,
        })
    }

    async fn rename(&self, from: &str, to: &str, metadata: Option<Metadata>) -> StoreResult<()> {
        self.enter(Operation::Rename, from).await?;
        let mut map = self.objects.write().expect("lock poisoned");
        let object = map
            .remove(from)
            .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
        map.insert(
            to.to_string(),
            MemoryObject {
                data: object.data,
                metadata: metadata.unwrap_or_default(),
                last_modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> StoreResult<UploadId> {
        self.enter(Operation::Upload, key).await?;
        let id = uuid::Uuid::new_v4().to_string();
        self.uploads.write().expect("lock poisoned").insert(
            id.clone(),
            MemoryUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(UploadId {
            key: key.to_string(),
            id,
        })
    }

    async fn upload_part(
        &self,
        upload: &UploadId,
        number: u32,
        data: Bytes,
    ) -> StoreResult<PartReceipt> {
        self.enter(Operation::Upload, &upload.key).await?;
        let mut uploads = self.uploads.write().expect("lock poisoned");
        let pending = uploads
            .get_mut(&upload.id)
            .ok_or_else(|| StoreError::UnknownUpload(upload.id.clone()))?;
        let etag = format!("{number}-{}", data.len());
        pending.parts.insert(number, data);
        Ok(PartReceipt { number, etag })
    }

    async fn complete_upload(&self, upload: &UploadId, parts: Vec<PartReceipt>) -> StoreResult<()> {
        self.enter(Operation::Upload, &upload.key).await?;
        let pending = self
            .uploads
            .write()
            .expect("lock poisoned")
            .remove(&upload.id)
            .ok_or_else(|| StoreError::UnknownUpload(upload.id.clone()))?;

        let mut assembled = BytesMut::new();
        for part in &parts {
            let data = pending.parts.get(&part.number).ok_or_else(|| {
                StoreError::backend(
                    Operation::Upload,
                    &pending.key,
                    format!("part {} was never uploaded", part.number),
                )
            })?;
            assembled.extend_from_slice(data);
        }
        self.put(&pending.key, assembled.freeze(), None);
        Ok(())
    }

    async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()> {
        self.uploads
            .write()
            .expect("lock poisoned")
            .remove(&upload.id);
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("object_count", &self.len())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
