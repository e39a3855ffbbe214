//! Error types for the index crate.

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Backend failure while reading or writing the index or a delta file.
    #[error("store error: {0}")]
    Store(#[from] taric_store::StoreError),

    /// The stored index document could not be parsed.
    #[error("index document {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    /// The index document could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl IndexError {
    pub fn corrupt(key: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
