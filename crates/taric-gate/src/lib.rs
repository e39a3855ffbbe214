//! Content validation pipeline for the tariff delta service.
//!
//! Every upload is staged and then passed through the gate before it is
//! published. The gate runs an ordered list of [`ContentCheck`]s (by
//! default a virus scan followed by a schema check) and rejects the
//! content as soon as one of them says no.
//!
//! # Quick Start
//!
//! ```rust
//! use taric_gate::{ContentGate, FnCheck, SCHEMA_CHECK, VIRUS_CHECK};
//!
//! let gate = ContentGate::new().with_check(FnCheck::new("non-empty", |b: &[u8]| !b.is_empty()));
//! assert_eq!(gate.check_count(), 1);
//! assert_eq!(ContentGate::default().check_names(), vec![VIRUS_CHECK, SCHEMA_CHECK]);
//! ```

pub mod check;
pub mod error;
pub mod gate;

pub use check::{AcceptAll, ContentCheck, FnCheck};
pub use error::GateError;
pub use gate::{ContentGate, SCHEMA_CHECK, VIRUS_CHECK};
