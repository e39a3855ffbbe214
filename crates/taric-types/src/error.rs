use thiserror::Error;

/// Errors produced when parsing boundary values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid seq {0:?}: expected exactly 6 digits")]
    InvalidSeq(String),

    #[error("seq out of range: {0}")]
    SeqOutOfRange(u32),

    #[error("invalid date {0:?}: expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("invalid timestamp {0:?}: expected YYYY-MM-DD[THH:MM:SS[.mmm]]")]
    InvalidTimestamp(String),
}
