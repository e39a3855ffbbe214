use std::fmt;

/// States of one upload moving through the commit protocol.
///
/// ```text
/// Received -> Staged -> Validated -> Published
///                  \-> Rejected
///                              \-> PublishFailed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommitState {
    /// Bytes and seq accepted from the caller.
    Received,
    /// Bytes written under the staging key.
    Staged,
    /// Every validation hook passed.
    Validated,
    /// Renamed to the canonical key.
    Published,
    /// A validation hook failed; staging object removed.
    Rejected,
    /// Rename failed; staging object possibly left behind.
    PublishFailed,
}

impl CommitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Rejected | Self::PublishFailed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: CommitState) -> bool {
        use CommitState::*;
        matches!(
            (self, next),
            (Received, Staged)
                | (Staged, Validated)
                | (Staged, Rejected)
                | (Validated, Published)
                | (Validated, PublishFailed)
        )
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Staged => "staged",
            Self::Validated => "validated",
            Self::Published => "published",
            Self::Rejected => "rejected",
            Self::PublishFailed => "publish-failed",
        };
        f.write_str(name)
    }
}
