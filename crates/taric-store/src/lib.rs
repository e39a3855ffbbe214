//! Storage backends for the tariff delta service.
//!
//! Every delta file and the index document live in one backend selected at
//! startup. Application code talks to the [`StorageBackend`] trait only.
//!
//! # Backends
//!
//! - [`FsBackend`] -- local directory tree, atomic rename
//! - [`InMemoryBackend`] -- `BTreeMap`-based store for tests and embedding
//! - `S3Backend` -- any S3-compatible endpoint (feature `s3`)
//!
//! # Key Layout
//!
//! [`NamingScheme`] maps sequence ids onto keys below a folder and
//! classifies keys found in listings. Staged uploads carry a `TEMP_` prefix
//! until they pass validation and are renamed into place.

pub mod error;
pub mod fs;
pub mod memory;
pub mod naming;
#[cfg(feature = "s3")]
pub mod s3;
pub mod traits;

pub use error::{Operation, StoreError, StoreResult};
pub use fs::FsBackend;
pub use memory::InMemoryBackend;
pub use naming::{KeyClass, NamingScheme, DEFAULT_FOLDER};
#[cfg(feature = "s3")]
pub use s3::S3Backend;
pub use traits::{
    ByteStream, Metadata, ObjectInfo, ObjectReader, ObjectStat, PartReceipt, StorageBackend,
    UploadId, MODIFIED_KEY,
};
