//! Foundation types for the tariff delta service.
//!
//! Every other crate in the workspace depends on `taric-types`. The types
//! here are the validated forms of the values that arrive at the service
//! boundary; once constructed they are known to be well formed.
//!
//! # Key Types
//!
//! - [`Seq`] -- 6-digit sequence id naming one delta file
//! - [`DeltaDate`] -- `YYYY-MM-DD` day used to filter the index
//! - [`ModTime`] -- client-supplied ISO-8601 modification timestamp

pub mod error;
pub mod seq;
pub mod temporal;

pub use error::TypeError;
pub use seq::Seq;
pub use temporal::{format_issue_date, DeltaDate, ModTime};
