use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use sha2::{Digest, Sha512};

/// The digest algorithm recorded in the index.
///
/// There is a single fixed algorithm. Digests already recorded in an index
/// are only comparable with digests computed by the same algorithm, so a
/// change here must ship with a new variant and a full index rebuild.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    #[default]
    Sha512,
}

impl DigestAlgorithm {
    /// The algorithm used for every digest written today.
    pub const CURRENT: Self = Self::Sha512;

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the lowercase hex rendering.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha512 => 128,
        }
    }
}

/// Result of digesting one object: hex digest plus byte count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fingerprint {
    pub algorithm: DigestAlgorithm,
    /// Lowercase hex encoding of the digest.
    pub digest: String,
    /// Number of bytes fed through the hasher.
    pub size: u64,
}

/// Incremental content hasher.
///
/// Bytes are fed chunk by chunk, so an object never has to be held in memory
/// in full to be digested.
pub struct ContentDigest {
    hasher: Sha512,
    size: u64,
}

impl ContentDigest {
    pub fn new() -> Self {
        Self {
            hasher: Sha512::new(),
            size: 0,
        }
    }

    /// Feed one chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    /// Consume the hasher and produce the fingerprint.
    pub fn finish(self) -> Fingerprint {
        Fingerprint {
            algorithm: DigestAlgorithm::CURRENT,
            digest: hex::encode(self.hasher.finalize()),
            size: self.size,
        }
    }

    /// Digest an in-memory buffer.
    pub fn of_bytes(data: &[u8]) -> Fingerprint {
        let mut digest = Self::new();
        digest.update(data);
        digest.finish()
    }

    /// Drain a stream of byte chunks through the hasher.
    ///
    /// The stream is consumed exactly once; the first error it yields aborts
    /// the digest and is returned unchanged. Dropping the stream on either
    /// path releases whatever handle backs it.
    pub async fn of_stream<S, E>(stream: S) -> Result<Fingerprint, E>
    where
        S: Stream<Item = Result<Bytes, E>>,
    {
        let mut digest = Self::new();
        futures::pin_mut!(stream);
        while let Some(chunk) = stream.try_next().await? {
            digest.update(&chunk);
        }
        Ok(digest.finish())
    }
}

impl Default for ContentDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentDigest")
            .field("algorithm", &DigestAlgorithm::CURRENT.name())
            .field("size", &self.size)
            .finish()
    }
}
