use std::io;

use taric_gate::GateError;
use taric_index::IndexError;
use taric_store::StoreError;
use taric_types::Seq;

use crate::state::CommitState;

/// Errors from the commit protocol.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// The upload body could not be read. Nothing was published.
    #[error("reading upload failed: {0}")]
    Upload(#[source] io::Error),

    /// Writing the staging object failed. Nothing was published.
    #[error("staging failed: {0}")]
    Staging(#[source] StoreError),

    /// A validation hook refused the content. The staging object was removed.
    #[error(transparent)]
    Rejected(#[from] GateError),

    /// Moving the staged object into place failed. The staging object may
    /// remain until the next reconciliation.
    #[error("publish failed: {0}")]
    Publish(#[source] StoreError),

    /// The staging object changed between validation and publish, so the
    /// canonical key held bytes no check had seen. They were withdrawn and
    /// a reconciliation was scheduled.
    #[error("staged content for {0} changed before publish")]
    Superseded(Seq),

    /// The file was published but its index entry could not be written.
    #[error("index update failed: {0}")]
    Index(#[from] IndexError),

    /// No published file exists for this seq.
    #[error("delta file {0} not found")]
    NotFound(Seq),

    /// Backend failure outside the publish path (read, remove).
    #[error("storage error: {0}")]
    Store(#[source] StoreError),
}

impl CommitError {
    /// The state the protocol ended in.
    pub fn state(&self) -> Option<CommitState> {
        match self {
            Self::Upload(_) | Self::Staging(_) => Some(CommitState::Received),
            Self::Rejected(_) => Some(CommitState::Rejected),
            Self::Publish(_) | Self::Superseded(_) => Some(CommitState::PublishFailed),
            Self::Index(_) => Some(CommitState::Published),
            Self::NotFound(_) | Self::Store(_) => None,
        }
    }
}

/// Convenience alias for commit results.
pub type CommitResult<T> = Result<T, CommitError>;
