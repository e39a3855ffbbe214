use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::check::{AcceptAll, ContentCheck};
use crate::error::GateError;

/// Name of the built-in virus scan slot.
pub const VIRUS_CHECK: &str = "virus";

/// Name of the built-in schema validation slot.
pub const SCHEMA_CHECK: &str = "schema";

/// Ordered pipeline of content checks run before a staged upload is
/// published.
///
/// The pipeline is fail-fast: the first check that rejects stops
/// evaluation. An empty pipeline accepts everything.
pub struct ContentGate {
    checks: Vec<Box<dyn ContentCheck>>,
}

impl ContentGate {
    /// Create a gate with no checks.
    pub fn new() -> Self {
        Self { checks: Vec::new() }
    }

    /// The standard pipeline: virus scan, then schema validation.
    pub fn with_default_checks() -> Self {
        Self::new()
            .with_check(AcceptAll::new(VIRUS_CHECK))
            .with_check(AcceptAll::new(SCHEMA_CHECK))
    }

    /// Builder form of [`Self::add_check`].
    pub fn with_check(mut self, check: impl ContentCheck + 'static) -> Self {
        self.add_check(Box::new(check));
        self
    }

    /// Append a check to the end of the pipeline.
    pub fn add_check(&mut self, check: Box<dyn ContentCheck>) {
        self.checks.push(check);
    }

    pub fn check_count(&self) -> usize {
        self.checks.len()
    }

    /// Names of the checks in evaluation order.
    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check against `content`.
    pub async fn evaluate(&self, content: &Bytes) -> Result<(), GateError> {
        for check in &self.checks {
            let started = Instant::now();
            let passed = check.check(content).await;
            debug!(
                check = check.name(),
                passed,
                elapsed_us = started.elapsed().as_micros() as u64,
                "content check evaluated"
            );
            if !passed {
                warn!(check = check.name(), size = content.len(), "content rejected");
                return Err(GateError::rejected(check.name()));
            }
        }
        Ok(())
    }
}

impl Default for ContentGate {
    fn default() -> Self {
        Self::with_default_checks()
    }
}

impl std::fmt::Debug for ContentGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentGate")
            .field("checks", &self.check_names())
            .finish()
    }
}
