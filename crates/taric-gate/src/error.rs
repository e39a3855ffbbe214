/// Errors produced by the content gate.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    /// A check looked at the content and refused it.
    #[error("content rejected by {check} check")]
    Rejected { check: String },
}

impl GateError {
    pub fn rejected(check: impl Into<String>) -> Self {
        Self::Rejected {
            check: check.into(),
        }
    }
}
