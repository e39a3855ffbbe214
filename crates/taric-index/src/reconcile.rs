//! Full index rebuild from a backend scan.
//!
//! The reconciler is the only component that removes orphaned staging
//! objects. A `TEMP_` key that survives to a scan belongs to an upload that
//! never published (crash, rejected request cut short, failed rename), so it
//! is deleted. Canonical keys are re-digested into fresh entries. Keys the
//! naming scheme does not recognize are never touched.
//!
//! Backend-private leftovers (partial files, abandoned multipart uploads)
//! are swept too, but only once they are older than
//! [`STALE_STAGING_AGE`], so writes in flight during the scan survive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use taric_crypto::{ContentDigest, Fingerprint};
use taric_store::{KeyClass, NamingScheme, StorageBackend, StoreError, StoreResult};
use taric_types::{format_issue_date, Seq};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entry::IndexEntry;
use crate::error::{IndexError, IndexResult};
use crate::store::IndexStore;

/// Backend staging leftovers younger than this are left alone.
pub const STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

/// When a rebuild should actually scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RebuildMode {
    /// Always scan and replace the index.
    Forced,
    /// Only scan when no index document exists yet.
    IfMissing,
}

/// Summary of one rebuild run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// `true` when [`RebuildMode::IfMissing`] found an index and did nothing.
    pub skipped: bool,
    /// Canonical files written to the new index.
    pub indexed: usize,
    /// Orphaned staging objects deleted.
    pub purged: usize,
    /// Keys left alone because the naming scheme does not recognize them.
    pub ignored: usize,
    /// Canonical files that vanished between listing and reading.
    pub vanished: usize,
    /// Stale backend staging leftovers removed.
    pub swept: usize,
}

/// Outcome of [`Reconciler::schedule`].
#[derive(Debug)]
pub enum Scheduled {
    /// A new background rebuild was spawned.
    Started(JoinHandle<()>),
    /// A rebuild is already running; it will run once more when done.
    Coalesced,
}

/// Stream a stored object through the content digest.
pub async fn digest_object(backend: &dyn StorageBackend, key: &str) -> StoreResult<Fingerprint> {
    let stream = backend.read_stream(key).await?;
    ContentDigest::of_stream(stream).await
}

struct Inner {
    backend: Arc<dyn StorageBackend>,
    naming: NamingScheme,
    index: Arc<IndexStore>,
    api_root: String,
    running: AtomicBool,
    pending: AtomicBool,
}

/// Rebuilds the index from the backend and computes single entries.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        naming: NamingScheme,
        index: Arc<IndexStore>,
        api_root: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                naming,
                index,
                api_root: api_root.into(),
                running: AtomicBool::new(false),
                pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        &self.inner.index
    }

    pub fn naming(&self) -> &NamingScheme {
        &self.inner.naming
    }

    /// Whether a scheduled rebuild is in flight.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Compute the index entry for the canonical object of `id`.
    ///
    /// The issue date is the object's `modified` metadata when present,
    /// otherwise the backend's last-modified time.
    pub async fn entry_for(&self, id: Seq) -> IndexResult<IndexEntry> {
        let key = self.inner.naming.canonical_key(id);
        let stat = self.inner.backend.stat(&key).await?;
        let issue_date = match stat.modified() {
            Some(modified) => modified.to_string(),
            None => format_issue_date(stat.info.last_modified),
        };
        let fingerprint = digest_object(self.inner.backend.as_ref(), &key).await?;
        Ok(IndexEntry::new(id, issue_date, &self.inner.api_root, fingerprint))
    }

    /// Scan the folder, purge orphans, and replace the index.
    pub async fn rebuild(&self, mode: RebuildMode) -> IndexResult<RebuildReport> {
        if mode == RebuildMode::IfMissing && self.inner.index.exists().await? {
            debug!(key = %self.inner.index.key(), "index present, rebuild skipped");
            return Ok(RebuildReport {
                skipped: true,
                ..RebuildReport::default()
            });
        }

        let started = Instant::now();
        let prefix = self.inner.naming.list_prefix();
        info!(backend = self.inner.backend.name(), prefix = %prefix, "rebuilding index");

        let mut report = RebuildReport::default();
        let mut entries = Vec::new();
        for object in self.inner.backend.list(&prefix).await? {
            match self.inner.naming.classify(&object.key) {
                KeyClass::Temp(id) => {
                    info!(key = %object.key, %id, "removing orphaned staging object");
                    match self.inner.backend.delete(&object.key).await {
                        Ok(()) => report.purged += 1,
                        Err(e) if e.is_not_found() => {}
                        Err(e) => warn!(key = %object.key, error = %e, "failed to remove staging object"),
                    }
                }
                KeyClass::Canonical(id) => match self.entry_for(id).await {
                    Ok(entry) => {
                        debug!(key = %object.key, %id, "indexed");
                        entries.push(entry);
                    }
                    Err(IndexError::Store(StoreError::NotFound(_))) => {
                        debug!(key = %object.key, "delta file removed during scan");
                        report.vanished += 1;
                    }
                    Err(e) => return Err(e),
                },
                KeyClass::Unrecognized => {
                    debug!(key = %object.key, "ignoring unrecognized key");
                    report.ignored += 1;
                }
            }
        }

        match self.inner.backend.sweep_staging(STALE_STAGING_AGE).await {
            Ok(swept) => report.swept = swept,
            Err(e) => warn!(error = %e, "failed to sweep backend staging leftovers"),
        }

        entries.sort_by_key(|e| e.id);
        report.indexed = entries.len();
        self.inner.index.replace_all(entries).await?;

        info!(
            indexed = report.indexed,
            purged = report.purged,
            swept = report.swept,
            ignored = report.ignored,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "index rebuilt"
        );
        Ok(report)
    }

    /// Run a forced rebuild in the background.
    ///
    /// At most one rebuild runs at a time. Requests arriving while one is in
    /// flight are folded into a single follow-up run, so the index always
    /// reflects a scan that started after the latest request.
    pub fn schedule(&self) -> Scheduled {
        let inner = &self.inner;
        inner.pending.store(true, Ordering::SeqCst);
        if inner.running.swap(true, Ordering::SeqCst) {
            debug!("rebuild already running, request coalesced");
            return Scheduled::Coalesced;
        }

        let this = self.clone();
        Scheduled::Started(tokio::spawn(async move { this.drain().await }))
    }

    async fn drain(&self) {
        let inner = &self.inner;
        loop {
            inner.pending.store(false, Ordering::SeqCst);
            if let Err(e) = self.rebuild(RebuildMode::Forced).await {
                error!(error = %e, "background index rebuild failed");
            }
            if inner.pending.load(Ordering::SeqCst) {
                continue;
            }
            inner.running.store(false, Ordering::SeqCst);
            // A request may have landed after the pending check while we
            // still looked busy; pick it up unless someone else already has.
            if inner.pending.load(Ordering::SeqCst) && !inner.running.swap(true, Ordering::SeqCst) {
                continue;
            }
            break;
        }
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("backend", &self.inner.backend.name())
            .field("folder", &self.inner.naming.folder())
            .field("index", &self.inner.index.key())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use taric_store::{InMemoryBackend, Metadata, Operation, MODIFIED_KEY};

    use crate::store::DEFAULT_INDEX_KEY;

    const API_ROOT: &str = "http://localhost:8080/api/v1/";

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::with_chunk_size(4));
        let index = Arc::new(IndexStore::new(backend.clone(), DEFAULT_INDEX_KEY));
        let reconciler = Reconciler::new(backend.clone(), NamingScheme::default(), index, API_ROOT);
        Fixture { backend, reconciler }
    }

    fn seq(s: &str) -> Seq {
        Seq::parse(s).unwrap()
    }

    async fn put(backend: &InMemoryBackend, key: &str, content: &'static [u8]) {
        backend.write(key, Bytes::from_static(content), None).await.unwrap();
    }

    #[tokio::test]
    async fn rebuild_classifies_every_key() {
        let f = fixture();
        put(&f.backend, "taricfiles/000002.xml", b"two").await;
        put(&f.backend, "taricfiles/000001.xml", b"one").await;
        put(&f.backend, "taricfiles/TEMP_000003.xml", b"orphan").await;
        put(&f.backend, "taricfiles/notes.txt", b"keep me").await;
        put(&f.backend, "taricfiles/archive/000004.xml", b"nested").await;

        let report = f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        assert_eq!(
            report,
            RebuildReport {
                skipped: false,
                indexed: 2,
                purged: 1,
                ignored: 2,
                vanished: 0,
                swept: 0,
            }
        );

        let keys = f.backend.keys();
        assert!(!keys.contains(&"taricfiles/TEMP_000003.xml".to_string()));
        assert!(keys.contains(&"taricfiles/notes.txt".to_string()));
        assert!(keys.contains(&"taricfiles/archive/000004.xml".to_string()));

        let doc = f.reconciler.index().load().await.unwrap();
        let ids: Vec<Seq> = doc.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![seq("000001"), seq("000002")]);
        let one = doc.get(seq("000001")).unwrap();
        assert_eq!(one.digest, ContentDigest::of_bytes(b"one").digest);
        assert_eq!(one.size, 3);
        assert_eq!(one.url, "http://localhost:8080/api/v1/taricfiles/000001");
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let f = fixture();
        put(&f.backend, "taricfiles/000010.xml", b"ten").await;
        put(&f.backend, "taricfiles/000005.xml", b"five").await;

        f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        let first = f.backend.read_all(DEFAULT_INDEX_KEY).await.unwrap();
        f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        let second = f.backend.read_all(DEFAULT_INDEX_KEY).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn if_missing_only_builds_once() {
        let f = fixture();
        put(&f.backend, "taricfiles/000001.xml", b"one").await;

        let first = f.reconciler.rebuild(RebuildMode::IfMissing).await.unwrap();
        assert!(!first.skipped);
        assert_eq!(first.indexed, 1);

        put(&f.backend, "taricfiles/000002.xml", b"two").await;
        let second = f.reconciler.rebuild(RebuildMode::IfMissing).await.unwrap();
        assert!(second.skipped);
        assert_eq!(f.reconciler.index().load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_store_gives_empty_index() {
        let f = fixture();
        let report = f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        assert_eq!(report.indexed, 0);
        assert!(f.reconciler.index().exists().await.unwrap());
        assert!(f.reconciler.index().load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_prefers_modified_metadata() {
        let f = fixture();
        let metadata = Metadata::from([(MODIFIED_KEY.to_string(), "2019-03-04".to_string())]);
        f.backend
            .write("taricfiles/000001.xml", Bytes::from_static(b"x"), Some(metadata))
            .await
            .unwrap();
        put(&f.backend, "taricfiles/000002.xml", b"y").await;

        let with_meta = f.reconciler.entry_for(seq("000001")).await.unwrap();
        assert_eq!(with_meta.issue_date, "2019-03-04");

        let without = f.reconciler.entry_for(seq("000002")).await.unwrap();
        assert_eq!(without.issue_date.len(), "2024-01-01T00:00:00".len());
        assert_eq!(&without.issue_date[10..11], "T");
    }

    #[tokio::test]
    async fn list_failure_leaves_index_untouched() {
        let f = fixture();
        put(&f.backend, "taricfiles/000001.xml", b"one").await;
        f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        let before = f.backend.read_all(DEFAULT_INDEX_KEY).await.unwrap();

        f.backend.fail_next(Operation::List);
        assert!(f.reconciler.rebuild(RebuildMode::Forced).await.is_err());
        assert_eq!(f.backend.read_all(DEFAULT_INDEX_KEY).await.unwrap(), before);
    }

    #[tokio::test]
    async fn purge_failure_is_not_fatal() {
        let f = fixture();
        put(&f.backend, "taricfiles/TEMP_000001.xml", b"orphan").await;
        put(&f.backend, "taricfiles/000002.xml", b"two").await;
        f.backend.fail_next(Operation::Delete);

        let report = f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        assert_eq!(report.purged, 0);
        assert_eq!(report.indexed, 1);
        assert!(f.backend.exists("taricfiles/TEMP_000001.xml").await.unwrap());

        // The next pass finishes the cleanup.
        let report = f.reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        assert_eq!(report.purged, 1);
    }

    #[tokio::test]
    async fn scheduled_rebuild_runs_in_background() {
        let f = fixture();
        put(&f.backend, "taricfiles/000001.xml", b"one").await;
        put(&f.backend, "taricfiles/TEMP_000002.xml", b"orphan").await;

        let Scheduled::Started(handle) = f.reconciler.schedule() else {
            panic!("first schedule should start a task");
        };
        handle.await.unwrap();

        assert!(!f.reconciler.is_running());
        assert_eq!(f.reconciler.index().load().await.unwrap().len(), 1);
        assert!(!f.backend.exists("taricfiles/TEMP_000002.xml").await.unwrap());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn overlapping_schedules_coalesce() {
        let f = fixture();
        put(&f.backend, "taricfiles/000001.xml", b"one").await;

        // On a single-threaded runtime the spawned task cannot start until
        // this test yields, so the second request must coalesce.
        let first = f.reconciler.schedule();
        let second = f.reconciler.schedule();
        assert!(matches!(second, Scheduled::Coalesced));

        // Both requests are served by the one task.
        put(&f.backend, "taricfiles/000002.xml", b"two").await;
        let Scheduled::Started(handle) = first else {
            panic!("first schedule should start a task");
        };
        handle.await.unwrap();

        assert!(!f.reconciler.is_running());
        assert_eq!(f.reconciler.index().load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rebuild_sweeps_stale_backend_staging() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(taric_store::FsBackend::open(dir.path()).await.unwrap());
        let index = Arc::new(IndexStore::new(backend.clone(), DEFAULT_INDEX_KEY));
        let reconciler = Reconciler::new(backend.clone(), NamingScheme::default(), index, API_ROOT);
        put_fs(&backend, "taricfiles/000001.xml", b"one").await;

        let folder = dir.path().join("taricfiles");
        let stale = folder.join(".000002.xml.67e55044-10b1-426f-9247-bb680e5fe0c8");
        let fresh = folder.join(".000003.xml.0f8fad5b-d9cb-469f-a165-70867728950e");
        std::fs::write(&stale, b"partial").unwrap();
        std::fs::write(&fresh, b"in flight").unwrap();
        let old = std::time::SystemTime::now() - STALE_STAGING_AGE - Duration::from_secs(60);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let report = reconciler.rebuild(RebuildMode::Forced).await.unwrap();
        assert_eq!(report.swept, 1);
        assert_eq!(report.indexed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    async fn put_fs(backend: &taric_store::FsBackend, key: &str, content: &'static [u8]) {
        backend.write(key, Bytes::from_static(content), None).await.unwrap();
    }
}
