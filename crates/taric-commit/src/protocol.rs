use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use taric_crypto::ContentDigest;
use taric_gate::ContentGate;
use taric_index::{IndexEntry, Reconciler, Scheduled};
use taric_store::{ByteStream, Metadata, NamingScheme, StorageBackend, StoreError, MODIFIED_KEY};
use taric_types::{ModTime, Seq};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::error::{CommitError, CommitResult};
use crate::stager::{Stager, StagingPolicy, UploadBody};
use crate::state::CommitState;

/// Publishes of seqs sharing a stripe run one at a time.
const LOCK_STRIPES: usize = 64;

/// One upload handed to [`CommitProtocol::publish`].
pub struct PublishRequest<'a> {
    pub seq: Seq,
    pub body: UploadBody<'a>,
    /// Client-supplied modification time, recorded as the issue date.
    pub modtime: Option<ModTime>,
}

impl<'a> PublishRequest<'a> {
    /// Request for content already held in memory.
    pub fn new(seq: Seq, content: impl Into<Bytes>) -> Self {
        let content: Bytes = content.into();
        Self::streaming(seq, stream::once(async move { Ok::<_, std::io::Error>(content) }).boxed())
    }

    /// Request whose content is read from `body` while it is staged.
    pub fn streaming(seq: Seq, body: UploadBody<'a>) -> Self {
        Self {
            seq,
            body,
            modtime: None,
        }
    }

    pub fn with_modtime(mut self, modtime: ModTime) -> Self {
        self.modtime = Some(modtime);
        self
    }
}

impl std::fmt::Debug for PublishRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishRequest")
            .field("seq", &self.seq)
            .field("modtime", &self.modtime)
            .finish_non_exhaustive()
    }
}

/// Result of a successful publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub key: String,
    /// The index entry written for the file.
    pub entry: IndexEntry,
    /// `true` if an earlier file with the same seq was overwritten.
    ///
    /// Best effort: if the backend could not be asked whether the key
    /// existed, the publish still goes ahead and this reports `false`.
    pub replaced: bool,
}

/// A published file opened for streaming.
pub struct OpenedFile {
    /// Length of the object `stream` reads.
    pub size: u64,
    pub stream: ByteStream,
}

impl std::fmt::Debug for OpenedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedFile").field("size", &self.size).finish_non_exhaustive()
    }
}

/// Stage, validate and publish uploads; read and remove published files.
///
/// Publishing never writes the canonical key directly. Content is staged
/// under the seq's `TEMP_` key, read back and checked by the
/// [`ContentGate`], and only then renamed into place. A rejected upload
/// leaves the canonical file untouched. A failed rename may leave the
/// staging object behind for the [`Reconciler`] to purge.
///
/// Publishes and removals of the same seq are serialized within one
/// protocol instance, so two uploads never share the staging key. Writers
/// outside it (another process on the same store) are caught after the
/// rename by comparing digests.
#[derive(Clone)]
pub struct CommitProtocol {
    backend: Arc<dyn StorageBackend>,
    naming: NamingScheme,
    gate: Arc<ContentGate>,
    stager: Stager,
    reconciler: Reconciler,
    locks: Arc<Vec<Mutex<()>>>,
}

impl CommitProtocol {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        gate: Arc<ContentGate>,
        reconciler: Reconciler,
        policy: StagingPolicy,
    ) -> Self {
        Self {
            naming: reconciler.naming().clone(),
            stager: Stager::new(backend.clone(), policy),
            backend,
            gate,
            reconciler,
            locks: Arc::new((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect()),
        }
    }

    pub fn naming(&self) -> &NamingScheme {
        &self.naming
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Run the full commit for one upload.
    pub async fn publish(&self, request: PublishRequest<'_>) -> CommitResult<PublishReceipt> {
        let PublishRequest { seq, body, modtime } = request;
        let temp_key = self.naming.temp_key(seq);
        let key = self.naming.canonical_key(seq);
        let _guard = self.lock(seq).await;
        debug!(%seq, state = %CommitState::Received, "upload received");

        let size = self.stager.stage(&temp_key, body).await?;
        debug!(%seq, key = %temp_key, size, state = %CommitState::Staged, "upload staged");

        let staged = self
            .backend
            .read_all(&temp_key)
            .await
            .map_err(CommitError::Staging)?;
        if let Err(rejection) = self.gate.evaluate(&staged).await {
            self.discard(&temp_key).await;
            info!(%seq, reason = %rejection, state = %CommitState::Rejected, "upload rejected");
            return Err(rejection.into());
        }
        let validated = ContentDigest::of_bytes(&staged);
        drop(staged);
        debug!(%seq, state = %CommitState::Validated, "upload validated");

        let replaced = match self.backend.exists(&key).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(%seq, error = %e, "could not check for an existing file");
                false
            }
        };

        let metadata = modtime.map(|m| Metadata::from([(MODIFIED_KEY.to_string(), m.as_str().to_string())]));
        if let Err(e) = self.backend.rename(&temp_key, &key, metadata).await {
            error!(%seq, error = %e, state = %CommitState::PublishFailed, "publish failed, staging object left for reconciliation");
            return Err(CommitError::Publish(e));
        }

        let entry = self.reconciler.entry_for(seq).await?;
        if entry.digest != validated.digest {
            error!(
                %seq,
                expected = %validated.digest,
                found = %entry.digest,
                state = %CommitState::PublishFailed,
                "published content differs from what was validated"
            );
            self.withdraw(&key).await;
            return Err(CommitError::Superseded(seq));
        }

        self.reconciler.index().upsert(entry.clone()).await?;
        info!(%seq, key = %key, size = entry.size, replaced, state = %CommitState::Published, "delta file published");

        Ok(PublishReceipt {
            key,
            entry,
            replaced,
        })
    }

    /// Delete the published file for `seq`.
    ///
    /// Returns `false` if there was nothing to delete. The index is not
    /// touched; callers schedule a reconciliation to drop the entry.
    pub async fn remove(&self, seq: Seq) -> CommitResult<bool> {
        let key = self.naming.canonical_key(seq);
        let _guard = self.lock(seq).await;
        match self.backend.delete(&key).await {
            Ok(()) => {
                info!(%seq, key = %key, "delta file removed");
                Ok(true)
            }
            Err(StoreError::NotFound(_)) => {
                debug!(%seq, key = %key, "nothing to remove");
                Ok(false)
            }
            Err(e) => Err(CommitError::Store(e)),
        }
    }

    /// Open the published file for `seq` for streaming.
    pub async fn open(&self, seq: Seq) -> CommitResult<OpenedFile> {
        let key = self.naming.canonical_key(seq);
        let not_found = |e: StoreError| match e {
            StoreError::NotFound(_) => CommitError::NotFound(seq),
            other => CommitError::Store(other),
        };
        let reader = self.backend.open_reader(&key).await.map_err(not_found)?;
        Ok(OpenedFile {
            size: reader.size,
            stream: reader.stream,
        })
    }

    async fn lock(&self, seq: Seq) -> MutexGuard<'_, ()> {
        self.locks[seq.value() as usize % self.locks.len()].lock().await
    }

    /// Take down unvalidated content that reached the canonical key and let
    /// a rebuild bring the index back in line with storage.
    async fn withdraw(&self, key: &str) {
        match self.backend.delete(key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => error!(key, error = %e, "failed to withdraw unvalidated delta file"),
        }
        if let Scheduled::Coalesced = self.reconciler.schedule() {
            debug!("withdrawal folded into running rebuild");
        }
    }

    async fn discard(&self, temp_key: &str) {
        match self.backend.delete(temp_key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = temp_key, error = %e, "failed to remove rejected staging object"),
        }
    }
}

impl std::fmt::Debug for CommitProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitProtocol")
            .field("backend", &self.backend.name())
            .field("naming", &self.naming)
            .field("gate", &self.gate)
            .field("stager", &self.stager)
            .finish()
    }
}
