use std::io;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use taric_store::{PartReceipt, StorageBackend, UploadId};
use tracing::{debug, warn};

use crate::error::{CommitError, CommitResult};

/// Content above this size is staged with a multipart upload.
pub const DEFAULT_MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;

/// Size of each multipart part. S3 requires at least 5 MiB for every part
/// but the last.
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Upload content as it arrives from the client.
pub type UploadBody<'a> = BoxStream<'a, io::Result<Bytes>>;

/// How content is written to its staging key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagingPolicy {
    pub multipart_threshold: usize,
    pub part_size: usize,
}

impl Default for StagingPolicy {
    fn default() -> Self {
        Self {
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

/// Writes upload content to a key, in one request or in parts.
///
/// At most `multipart_threshold` bytes (plus one incoming chunk) are held
/// before the stager commits to a single write; past that, content goes out
/// in `part_size` parts as it arrives. Memory use is bounded by the policy,
/// not by the size of the upload.
#[derive(Clone)]
pub struct Stager {
    backend: Arc<dyn StorageBackend>,
    policy: StagingPolicy,
}

impl Stager {
    pub fn new(backend: Arc<dyn StorageBackend>, mut policy: StagingPolicy) -> Self {
        policy.part_size = policy.part_size.max(1);
        Self { backend, policy }
    }

    pub fn policy(&self) -> StagingPolicy {
        self.policy
    }

    /// Drain `body` into `key` and return the number of bytes written.
    ///
    /// A failed multipart upload, whether the body or the backend failed,
    /// is aborted before the error is returned.
    pub async fn stage(&self, key: &str, mut body: UploadBody<'_>) -> CommitResult<u64> {
        let mut buf = BytesMut::new();
        while buf.len() <= self.policy.multipart_threshold {
            match body.try_next().await.map_err(CommitError::Upload)? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => {
                    let size = buf.len() as u64;
                    self.backend
                        .write(key, buf.freeze(), None)
                        .await
                        .map_err(CommitError::Staging)?;
                    return Ok(size);
                }
            }
        }

        let upload = self.backend.begin_upload(key).await.map_err(CommitError::Staging)?;
        debug!(key, part_size = self.policy.part_size, "staging in parts");

        let result = self.stage_parts(&upload, buf, body).await;
        if let Err(e) = &result {
            warn!(key, error = %e, "multipart staging failed, aborting upload");
            if let Err(abort) = self.backend.abort_upload(&upload).await {
                warn!(key, error = %abort, "failed to abort multipart upload");
            }
        }
        result
    }

    async fn stage_parts(
        &self,
        upload: &UploadId,
        mut buf: BytesMut,
        mut body: UploadBody<'_>,
    ) -> CommitResult<u64> {
        let part_size = self.policy.part_size;
        let mut receipts: Vec<PartReceipt> = Vec::new();
        let mut size = 0u64;
        let mut finished = false;

        while !finished {
            match body.try_next().await.map_err(CommitError::Upload)? {
                Some(chunk) => buf.extend_from_slice(&chunk),
                None => finished = true,
            }
            while buf.len() >= part_size || (finished && !buf.is_empty()) {
                let part = buf.split_to(part_size.min(buf.len())).freeze();
                size += part.len() as u64;
                let number = receipts.len() as u32 + 1;
                let receipt = self
                    .backend
                    .upload_part(upload, number, part)
                    .await
                    .map_err(CommitError::Staging)?;
                receipts.push(receipt);
            }
        }

        self.backend
            .complete_upload(upload, receipts)
            .await
            .map_err(CommitError::Staging)?;
        Ok(size)
    }
}

impl std::fmt::Debug for Stager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stager")
            .field("backend", &self.backend.name())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream::{self, StreamExt};
    use taric_store::{InMemoryBackend, Operation};

    fn stager(backend: &Arc<InMemoryBackend>, threshold: usize, part_size: usize) -> Stager {
        Stager::new(
            backend.clone(),
            StagingPolicy {
                multipart_threshold: threshold,
                part_size,
            },
        )
    }

    /// `content` delivered in `chunk`-sized pieces.
    fn chunked(content: &[u8], chunk: usize) -> UploadBody<'static> {
        let pieces: Vec<io::Result<Bytes>> = content
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(pieces).boxed()
    }

    #[tokio::test]
    async fn small_content_single_write() {
        let backend = Arc::new(InMemoryBackend::new());
        let size = stager(&backend, 16, 4)
            .stage("f/TEMP_000001.xml", chunked(b"small", 2))
            .await
            .unwrap();
        assert_eq!(size, 5);
        assert_eq!(
            backend.read_all("f/TEMP_000001.xml").await.unwrap(),
            Bytes::from_static(b"small")
        );
        assert_eq!(backend.calls(Operation::Write), 1);
        assert_eq!(backend.calls(Operation::Upload), 0);
    }

    #[tokio::test]
    async fn empty_body_stages_empty_object() {
        let backend = Arc::new(InMemoryBackend::new());
        let size = stager(&backend, 16, 4)
            .stage("f/TEMP_000001.xml", stream::empty().boxed())
            .await
            .unwrap();
        assert_eq!(size, 0);
        assert!(backend.read_all("f/TEMP_000001.xml").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn large_content_streams_in_parts() {
        let backend = Arc::new(InMemoryBackend::new());
        let content: Vec<u8> = (0u8..=250).collect();
        let size = stager(&backend, 100, 64)
            .stage("f/big.xml", chunked(&content, 10))
            .await
            .unwrap();
        assert_eq!(size, content.len() as u64);
        assert_eq!(backend.read_all("f/big.xml").await.unwrap(), content);
        assert_eq!(backend.pending_uploads(), 0);
        assert_eq!(backend.calls(Operation::Write), 0);
        // begin + 4 parts (64, 64, 64, 59) + complete
        assert_eq!(backend.calls(Operation::Upload), 6);
    }

    #[tokio::test]
    async fn failed_part_aborts_upload() {
        let backend = Arc::new(InMemoryBackend::new());
        // begin + first part succeed, second part fails.
        backend.fail_after(Operation::Upload, 2);
        let err = stager(&backend, 10, 8)
            .stage("f/big.xml", chunked(b"0123456789abcdef0123", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Staging(_)));
        assert_eq!(backend.pending_uploads(), 0);
        assert!(!backend.exists("f/big.xml").await.unwrap());
    }

    #[tokio::test]
    async fn broken_body_aborts_upload() {
        let backend = Arc::new(InMemoryBackend::new());
        let pieces: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"0123456789abcdef")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let err = stager(&backend, 10, 8)
            .stage("f/big.xml", stream::iter(pieces).boxed())
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Upload(_)));
        assert_eq!(backend.pending_uploads(), 0);
        assert!(backend.is_empty());
    }
}
