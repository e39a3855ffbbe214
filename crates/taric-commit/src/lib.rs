//! Two-phase upload commit for the tariff delta service.
//!
//! An upload moves through [`CommitState`]s: it is staged under a `TEMP_`
//! key, checked by the content gate, renamed to its canonical key, and
//! finally recorded in the index. Readers and the index only ever see
//! canonical keys, so a bad or partial upload never becomes visible.
//!
//! # Key Types
//!
//! - [`CommitProtocol`] -- publish, open and remove delta files
//! - [`Stager`] -- single write or multipart upload of staged content
//! - [`PublishRequest`] / [`PublishReceipt`] -- input and output of a publish
//! - [`CommitError`] -- failures, each tied to the state it left behind

pub mod error;
pub mod protocol;
pub mod stager;
pub mod state;

pub use error::{CommitError, CommitResult};
pub use protocol::{CommitProtocol, OpenedFile, PublishReceipt, PublishRequest};
pub use stager::{
    Stager, StagingPolicy, UploadBody, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE,
};
pub use state::CommitState;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use proptest::prelude::*;
    use taric_crypto::ContentDigest;
    use taric_gate::{ContentCheck, ContentGate, FnCheck, GateError, SCHEMA_CHECK, VIRUS_CHECK};
    use taric_index::{IndexStore, RebuildMode, Reconciler, DEFAULT_INDEX_KEY};
    use taric_store::{
        InMemoryBackend, Metadata, NamingScheme, ObjectInfo, ObjectReader, ObjectStat, Operation,
        PartReceipt, StorageBackend, StoreResult, UploadId,
    };
    use taric_types::{ModTime, Seq};
    use tokio::sync::Notify;

    const API_ROOT: &str = "http://localhost:8080/api/v1/";

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        protocol: CommitProtocol,
    }

    fn fixture_with(gate: ContentGate, policy: StagingPolicy) -> Fixture {
        let backend = Arc::new(InMemoryBackend::with_chunk_size(5));
        let protocol = protocol_over(backend.clone(), gate, policy);
        Fixture { backend, protocol }
    }

    fn protocol_over(
        backend: Arc<dyn StorageBackend>,
        gate: ContentGate,
        policy: StagingPolicy,
    ) -> CommitProtocol {
        let index = Arc::new(IndexStore::new(backend.clone(), DEFAULT_INDEX_KEY));
        let reconciler = Reconciler::new(backend.clone(), NamingScheme::default(), index, API_ROOT);
        CommitProtocol::new(backend, Arc::new(gate), reconciler, policy)
    }

    fn fixture() -> Fixture {
        fixture_with(ContentGate::default(), StagingPolicy::default())
    }

    /// Gate whose schema check only accepts content starting with `<`.
    fn xml_only_gate() -> ContentGate {
        ContentGate::new()
            .with_check(FnCheck::new(VIRUS_CHECK, |_: &[u8]| true))
            .with_check(FnCheck::new(SCHEMA_CHECK, |b: &[u8]| b.first() == Some(&b'<')))
    }

    fn seq(s: &str) -> Seq {
        Seq::parse(s).unwrap()
    }

    async fn read(protocol: &CommitProtocol, id: Seq) -> Vec<u8> {
        let opened = protocol.open(id).await.unwrap();
        let chunks: Vec<Bytes> = opened.stream.try_collect().await.unwrap();
        let content = chunks.concat();
        assert_eq!(opened.size, content.len() as u64);
        content
    }

    // -----------------------------------------------------------------------
    // Success path
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn publish_then_read_returns_same_bytes() {
        let f = fixture();
        let content = Bytes::from_static(b"<TARIC.DELTA seq=\"200000\"/>");
        let receipt = f
            .protocol
            .publish(PublishRequest::new(seq("200000"), content.clone()))
            .await
            .unwrap();

        assert_eq!(receipt.key, "taricfiles/200000.xml");
        assert!(!receipt.replaced);
        assert_eq!(receipt.entry.digest, ContentDigest::of_bytes(&content).digest);
        assert_eq!(receipt.entry.size, content.len() as u64);
        assert_eq!(read(&f.protocol, seq("200000")).await, content.to_vec());
        assert!(!f.backend.exists("taricfiles/TEMP_200000.xml").await.unwrap());

        let doc = f.protocol.reconciler().index().load().await.unwrap();
        assert_eq!(doc.entries(), &[receipt.entry]);
    }

    #[tokio::test]
    async fn republish_replaces_single_entry() {
        let f = fixture();
        f.protocol
            .publish(PublishRequest::new(seq("000001"), &b"<first/>"[..]))
            .await
            .unwrap();
        let second = f
            .protocol
            .publish(PublishRequest::new(seq("000001"), &b"<second-payload/>"[..]))
            .await
            .unwrap();
        assert!(second.replaced);

        let doc = f.protocol.reconciler().index().load().await.unwrap();
        assert_eq!(doc.len(), 1);
        let entry = doc.get(seq("000001")).unwrap();
        assert_eq!(entry.size, b"<second-payload/>".len() as u64);
        assert_eq!(entry.digest, ContentDigest::of_bytes(b"<second-payload/>").digest);
    }

    #[tokio::test]
    async fn modtime_becomes_issue_date() {
        let f = fixture();
        let modtime = ModTime::parse("2020-06-30T12:00:00.250").unwrap();
        let receipt = f
            .protocol
            .publish(PublishRequest::new(seq("000002"), &b"<x/>"[..]).with_modtime(modtime))
            .await
            .unwrap();
        assert_eq!(receipt.entry.issue_date, "2020-06-30T12:00:00.250");
        let stat = f.backend.stat("taricfiles/000002.xml").await.unwrap();
        assert_eq!(stat.modified(), Some("2020-06-30T12:00:00.250"));
    }

    #[tokio::test]
    async fn large_upload_goes_through_multipart() {
        let f = fixture_with(
            ContentGate::default(),
            StagingPolicy {
                multipart_threshold: 16,
                part_size: 7,
            },
        );
        let content = Bytes::from(vec![b'<'; 50]);
        let pieces: Vec<std::io::Result<Bytes>> =
            content.chunks(6).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
        let body = futures::stream::iter(pieces);
        f.protocol
            .publish(PublishRequest::streaming(seq("000003"), Box::pin(body)))
            .await
            .unwrap();
        assert_eq!(read(&f.protocol, seq("000003")).await, content.to_vec());
        assert_eq!(f.backend.pending_uploads(), 0);
        assert!(f.backend.calls(Operation::Upload) > 3);
    }

    // -----------------------------------------------------------------------
    // Failure paths
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn rejected_upload_leaves_nothing_behind() {
        let f = fixture_with(xml_only_gate(), StagingPolicy::default());
        let err = f
            .protocol
            .publish(PublishRequest::new(seq("200000"), &b"not xml"[..]))
            .await
            .unwrap_err();

        assert!(matches!(&err, CommitError::Rejected(GateError::Rejected { check }) if check == SCHEMA_CHECK));
        assert_eq!(err.state(), Some(CommitState::Rejected));
        assert!(!f.backend.exists("taricfiles/TEMP_200000.xml").await.unwrap());
        assert!(matches!(
            f.protocol.open(seq("200000")).await,
            Err(CommitError::NotFound(_))
        ));
        assert!(f.protocol.reconciler().index().load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_upload_keeps_previous_version() {
        let f = fixture_with(xml_only_gate(), StagingPolicy::default());
        f.protocol
            .publish(PublishRequest::new(seq("000001"), &b"<good/>"[..]))
            .await
            .unwrap();
        f.protocol
            .publish(PublishRequest::new(seq("000001"), &b"bad"[..]))
            .await
            .unwrap_err();
        assert_eq!(read(&f.protocol, seq("000001")).await, b"<good/>".to_vec());
    }

    #[tokio::test]
    async fn staging_failure_publishes_nothing() {
        let f = fixture();
        f.backend.fail_next(Operation::Write);
        let err = f
            .protocol
            .publish(PublishRequest::new(seq("000004"), &b"<x/>"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Staging(_)));
        assert_eq!(err.state(), Some(CommitState::Received));
        assert!(f.backend.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_healed_by_reconciliation() {
        let f = fixture();
        f.backend.fail_next(Operation::Rename);
        let err = f
            .protocol
            .publish(PublishRequest::new(seq("000005"), &b"<x/>"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Publish(_)));
        assert_eq!(err.state(), Some(CommitState::PublishFailed));
        assert!(f.backend.exists("taricfiles/TEMP_000005.xml").await.unwrap());

        let report = f
            .protocol
            .reconciler()
            .rebuild(RebuildMode::Forced)
            .await
            .unwrap();
        assert_eq!(report.purged, 1);
        assert!(!f.backend.exists("taricfiles/TEMP_000005.xml").await.unwrap());
        assert!(f.protocol.reconciler().index().load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_failure_after_publish() {
        let f = fixture();
        // Staging is the first write; the index save is the second.
        f.backend.fail_after(Operation::Write, 1);
        let err = f
            .protocol
            .publish(PublishRequest::new(seq("000006"), &b"<x/>"[..]))
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::Index(_)));
        assert!(f.backend.exists("taricfiles/000006.xml").await.unwrap());
    }

    // -----------------------------------------------------------------------
    // Remove and open
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn remove_then_open_is_not_found() {
        let f = fixture();
        f.protocol
            .publish(PublishRequest::new(seq("200000"), &b"<x/>"[..]))
            .await
            .unwrap();
        assert!(f.protocol.remove(seq("200000")).await.unwrap());
        assert!(!f.protocol.remove(seq("200000")).await.unwrap());
        assert!(matches!(
            f.protocol.open(seq("200000")).await,
            Err(CommitError::NotFound(id)) if id == seq("200000")
        ));
    }

    #[tokio::test]
    async fn remove_backend_failure_is_reported() {
        let f = fixture();
        f.backend.fail_next(Operation::Delete);
        assert!(matches!(
            f.protocol.remove(seq("000001")).await,
            Err(CommitError::Store(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Concurrent writers
    // -----------------------------------------------------------------------

    /// Virus check that parks inside evaluation until released.
    struct HeldCheck {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl ContentCheck for HeldCheck {
        fn name(&self) -> &str {
            VIRUS_CHECK
        }

        async fn check(&self, content: &Bytes) -> bool {
            self.entered.notify_one();
            self.release.notified().await;
            !content.starts_with(b"VIRUS")
        }
    }

    #[tokio::test]
    async fn concurrent_uploads_of_one_seq_do_not_share_staging() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let gate = ContentGate::new().with_check(HeldCheck {
            entered: entered.clone(),
            release: release.clone(),
        });
        let f = fixture_with(gate, StagingPolicy::default());

        let good = tokio::spawn({
            let protocol = f.protocol.clone();
            async move {
                protocol
                    .publish(PublishRequest::new(seq("000001"), &b"<good/>"[..]))
                    .await
            }
        });
        entered.notified().await;

        let bad = tokio::spawn({
            let protocol = f.protocol.clone();
            async move {
                protocol
                    .publish(PublishRequest::new(seq("000001"), &b"VIRUS"[..]))
                    .await
            }
        });
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        // The second upload waits its turn instead of overwriting the
        // staging object under the first one's checks.
        assert_eq!(
            f.backend.read_all("taricfiles/TEMP_000001.xml").await.unwrap(),
            Bytes::from_static(b"<good/>")
        );

        release.notify_one();
        let good = good.await.unwrap().unwrap();
        entered.notified().await;
        release.notify_one();
        let bad = bad.await.unwrap().unwrap_err();

        assert!(matches!(bad, CommitError::Rejected(GateError::Rejected { check }) if check == VIRUS_CHECK));
        assert_eq!(read(&f.protocol, seq("000001")).await, b"<good/>".to_vec());
        let doc = f.protocol.reconciler().index().load().await.unwrap();
        assert_eq!(doc.entries(), &[good.entry]);
    }

    /// Check that lets everything through but has another writer replace
    /// the staging object while it runs.
    struct OverwrittenDuringCheck {
        backend: Arc<InMemoryBackend>,
    }

    #[async_trait]
    impl ContentCheck for OverwrittenDuringCheck {
        fn name(&self) -> &str {
            SCHEMA_CHECK
        }

        async fn check(&self, _content: &Bytes) -> bool {
            self.backend
                .write("taricfiles/TEMP_000007.xml", Bytes::from_static(b"unchecked"), None)
                .await
                .unwrap();
            true
        }
    }

    #[tokio::test]
    async fn content_changed_after_validation_is_withdrawn() {
        let backend = Arc::new(InMemoryBackend::new());
        let gate = ContentGate::new().with_check(OverwrittenDuringCheck {
            backend: backend.clone(),
        });
        let protocol = protocol_over(backend.clone(), gate, StagingPolicy::default());

        let err = protocol
            .publish(PublishRequest::new(seq("000007"), &b"<checked/>"[..]))
            .await
            .unwrap_err();

        assert!(matches!(err, CommitError::Superseded(id) if id == seq("000007")));
        assert_eq!(err.state(), Some(CommitState::PublishFailed));
        assert!(!backend.exists("taricfiles/000007.xml").await.unwrap());
        assert!(protocol.reconciler().index().load().await.unwrap().get(seq("000007")).is_none());
    }

    /// Backend that replaces one object whenever it is stat'ed or opened.
    struct ReplacedOnAccess {
        inner: Arc<InMemoryBackend>,
        key: &'static str,
        replacement: &'static [u8],
    }

    impl ReplacedOnAccess {
        async fn replace(&self) {
            self.inner
                .write(self.key, Bytes::from_static(self.replacement), None)
                .await
                .unwrap();
        }
    }

    #[async_trait]
    impl StorageBackend for ReplacedOnAccess {
        fn name(&self) -> &'static str {
            "replaced-on-access"
        }

        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }

        async fn open_reader(&self, key: &str) -> StoreResult<ObjectReader> {
            let reader = self.inner.open_reader(key).await?;
            self.replace().await;
            Ok(reader)
        }

        async fn write(&self, key: &str, data: Bytes, metadata: Option<Metadata>) -> StoreResult<()> {
            self.inner.write(key, data, metadata).await
        }

        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectInfo>> {
            self.inner.list(prefix).await
        }

        async fn stat(&self, key: &str) -> StoreResult<ObjectStat> {
            let stat = self.inner.stat(key).await?;
            self.replace().await;
            Ok(stat)
        }

        async fn rename(&self, from: &str, to: &str, metadata: Option<Metadata>) -> StoreResult<()> {
            self.inner.rename(from, to, metadata).await
        }

        async fn begin_upload(&self, key: &str) -> StoreResult<UploadId> {
            self.inner.begin_upload(key).await
        }

        async fn upload_part(&self, upload: &UploadId, number: u32, data: Bytes) -> StoreResult<PartReceipt> {
            self.inner.upload_part(upload, number, data).await
        }

        async fn complete_upload(&self, upload: &UploadId, parts: Vec<PartReceipt>) -> StoreResult<()> {
            self.inner.complete_upload(upload, parts).await
        }

        async fn abort_upload(&self, upload: &UploadId) -> StoreResult<()> {
            self.inner.abort_upload(upload).await
        }
    }

    #[tokio::test]
    async fn opened_size_matches_streamed_bytes_when_file_is_replaced() {
        let inner = Arc::new(InMemoryBackend::with_chunk_size(3));
        inner
            .write("taricfiles/000008.xml", Bytes::from_static(b"<original/>"), None)
            .await
            .unwrap();
        let backend = Arc::new(ReplacedOnAccess {
            inner: inner.clone(),
            key: "taricfiles/000008.xml",
            replacement: b"<a-much-longer-replacement/>",
        });
        let protocol = protocol_over(backend, ContentGate::default(), StagingPolicy::default());

        let opened = protocol.open(seq("000008")).await.unwrap();
        let chunks: Vec<Bytes> = opened.stream.try_collect().await.unwrap();
        assert_eq!(opened.size, chunks.concat().len() as u64);
        assert_eq!(chunks.concat(), b"<original/>".to_vec());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn publish_then_read_returns_same_bytes_for_any_content(
            value in 0u32..1_000_000,
            content in proptest::collection::vec(any::<u8>(), 0..600),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let f = fixture_with(
                    ContentGate::default(),
                    StagingPolicy {
                        multipart_threshold: 256,
                        part_size: 100,
                    },
                );
                let id = Seq::from_value(value).unwrap();
                let receipt = f
                    .protocol
                    .publish(PublishRequest::new(id, content.clone()))
                    .await
                    .unwrap();
                prop_assert_eq!(&receipt.entry.digest, &ContentDigest::of_bytes(&content).digest);
                prop_assert_eq!(receipt.entry.size, content.len() as u64);
                prop_assert_eq!(read(&f.protocol, id).await, content.clone());
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
