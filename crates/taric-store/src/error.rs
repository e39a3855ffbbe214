use std::fmt;

/// The backend operation that failed, carried in [`StoreError::Backend`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Exists,
    Read,
    Write,
    Delete,
    List,
    Stat,
    Rename,
    Upload,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exists => "exists",
            Self::Read => "read",
            Self::Write => "write",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Stat => "stat",
            Self::Rename => "rename",
            Self::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// Errors from storage backend operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The key does not exist in the backend.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The key cannot be mapped onto the backend's namespace.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// A multipart upload id that the backend does not know about.
    #[error("unknown upload {0}")]
    UnknownUpload(String),

    /// Connectivity or backend-side failure.
    #[error("{op} failed for {key:?}: {message}")]
    Backend {
        op: Operation,
        key: String,
        message: String,
    },

    /// I/O error from the local filesystem.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn backend(op: Operation, key: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Backend {
            op,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` for "already gone" errors that cleanup paths may ignore.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
