use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

/// A single yes/no verdict over uploaded content.
///
/// Checks run against the exact bytes that were staged. They must not
/// mutate storage; the caller owns cleanup of rejected content.
#[async_trait]
pub trait ContentCheck: Send + Sync {
    /// Short name reported when the check rejects content.
    fn name(&self) -> &str;

    /// Returns `true` if the content may be published.
    async fn check(&self, content: &Bytes) -> bool;
}

/// Check that passes every input.
///
/// Stands in for the virus scanner and the schema validator until a real
/// engine is wired in.
#[derive(Clone, Debug)]
pub struct AcceptAll {
    name: String,
}

impl AcceptAll {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ContentCheck for AcceptAll {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _content: &Bytes) -> bool {
        true
    }
}

/// Check backed by a synchronous predicate.
pub struct FnCheck<F> {
    name: String,
    predicate: F,
}

impl<F> FnCheck<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, predicate: F) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }
}

impl<F> fmt::Debug for FnCheck<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCheck").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> ContentCheck for FnCheck<F>
where
    F: Fn(&[u8]) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, content: &Bytes) -> bool {
        (self.predicate)(content)
    }
}
