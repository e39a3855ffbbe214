//! Delta file index for the tariff delta service.
//!
//! The index is a single JSON document listing every published delta file
//! with its issue date, download URL, SHA-512 digest and size. It is derived
//! state: the backend holds the truth, and the [`Reconciler`] can always
//! regenerate the document from a scan.
//!
//! # Key Types
//!
//! - [`IndexEntry`] -- metadata for one delta file
//! - [`IndexDocument`] -- the ordered, id-unique collection of entries
//! - [`IndexStore`] -- load, upsert and replace the stored document
//! - [`Reconciler`] -- full rebuild, orphan cleanup, background scheduling

pub mod entry;
pub mod error;
pub mod reconcile;
pub mod store;

pub use entry::{file_url, IndexDocument, IndexEntry};
pub use error::{IndexError, IndexResult};
pub use reconcile::{
    digest_object, RebuildMode, RebuildReport, Reconciler, Scheduled, STALE_STAGING_AGE,
};
pub use store::{IndexStore, DEFAULT_INDEX_KEY};
