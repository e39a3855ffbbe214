//! Cryptographic primitives for the tariff delta service.
//!
//! Provides the streaming SHA-512 content digest recorded in the index, and
//! the SHA-256 API key hashing used by the request gate.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod api_key;
pub mod digest;

pub use api_key::{generate_api_key, hash_api_key, ApiKeyError, GeneratedKey};
pub use digest::{ContentDigest, DigestAlgorithm, Fingerprint};
