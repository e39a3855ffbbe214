use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::error::StoreResult;

/// Free-form per-object metadata.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key carrying a client-supplied modification timestamp.
pub const MODIFIED_KEY: &str = "modified";

/// A finite, non-restartable sequence of byte chunks read from a backend.
///
/// The underlying file handle or connection is owned by the stream and is
/// released when the stream is dropped, whether or not it was drained.
pub type ByteStream = BoxStream<'static, StoreResult<Bytes>>;

/// An object opened for reading.
///
/// `size` is the length of the object the stream reads, taken from the same
/// handle or response, so it cannot disagree with the bytes produced even if
/// the key is replaced while the stream is open.
pub struct ObjectReader {
    pub size: u64,
    pub stream: ByteStream,
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader").field("size", &self.size).finish_non_exhaustive()
    }
}

/// One listed object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: SystemTime,
}

/// Size, timestamps and metadata of a single object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectStat {
    pub info: ObjectInfo,
    pub metadata: Metadata,
}

impl ObjectStat {
    /// The client-supplied modification timestamp, if one was recorded.
    pub fn modified(&self) -> Option<&str> {
        self.metadata.get(MODIFIED_KEY).map(String::as_str)
    }
}

/// Handle for an in-progress multipart upload.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UploadId {
    /// Destination key the upload completes into.
    pub key: String,
    /// Backend-assigned upload identifier.
    pub id: String,
}

/// Proof that one part was stored, needed to complete the upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartReceipt {
    /// 1-based part number.
    pub number: u32,
    pub etag: String,
}

/// Uniform byte storage over local disk or an S3-compatible object store.
///
/// Keys are `/`-separated strings relative to the backend root. All
/// implementations must satisfy:
/// - `write` fully replaces any existing object at the key.
/// - `delete` and `open_reader` report a missing key as
///   [`StoreError::NotFound`](crate::StoreError::NotFound), distinct from
///   backend failures.
/// - `list` returns objects in ascending key order.
/// - `abort_upload` is idempotent.
///
/// `rename` is where backends differ. The filesystem backend renames
/// atomically. The object-store backend has no rename primitive and emulates
/// it as copy-then-delete: between the two calls a reader may observe the
/// source only, both objects, or (if the delete fails) both indefinitely.
/// Callers that stage under temporary keys must expect leftovers and clean
/// them up later.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Open the object for streaming in bounded chunks.
    async fn open_reader(&self, key: &str) -> StoreResult<ObjectReader>;

    /// Store `data` at `key`, replacing any existing object.
    async fn write(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// List objects whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>>;

    async fn stat(&self, key: &str) -> StoreResult<ObjectStat>;

    /// Move `from` to `to`, replacing `to`.
    ///
    /// The destination's metadata is replaced by `metadata`; `None` leaves it
    /// empty so the backend's own last-modified time is authoritative.
    async fn rename(&self, from: &str, to: &str, metadata: Option<Metadata>) -> StoreResult<()>;

    async fn begin_upload(&self, key: &str) -> StoreResult<UploadId>;

    async fn upload_part(
        &self,
        upload: &UploadId,
        number: u32,
        data: Bytes,
    ) -> StoreResult<PartReceipt>;

    /// Assemble the parts, in the order given, into the upload's key.
    async fn complete_upload(&self, upload: &UploadId, parts: Vec<PartReceipt>) -> StoreResult<()>;

    /// Discard an upload and its parts. Aborting an unknown or already
    /// aborted upload succeeds.
    async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()>;

    /// Remove backend-private staging leftovers older than `older_than`.
    ///
    /// These are objects the backend creates on its own behalf while writing
    /// (partial files, unfinished multipart uploads) and that a crash can
    /// strand. They never appear in [`list`](Self::list). Returns how many
    /// were removed.
    async fn sweep_staging(&self, older_than: Duration) -> StoreResult<usize> {
        let _ = older_than;
        Ok(0)
    }

    /// Stream the object without its size.
    async fn read_stream(&self, key: &str) -> StoreResult<ByteStream> {
        Ok(self.open_reader(key).await?.stream)
    }

    /// Per-object metadata map.
    async fn metadata(&self, key: &str) -> StoreResult<Metadata> {
        Ok(self.stat(key).await?.metadata)
    }

    /// Read a whole object into memory. Only meant for small objects.
    async fn read_all(&self, key: &str) -> StoreResult<Bytes> {
        let stream = self.read_stream(key).await?;
        let buf = stream
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await?;
        Ok(buf.freeze())
    }
}
