//! API key hashing and generation.
//!
//! The service never stores API keys, only their SHA-256 digests. A request
//! presents the key in clear; the gate hashes it and looks the digest up in
//! an allow-list.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Errors from API key handling.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ApiKeyError {
    #[error("api key must be a non-empty hexadecimal string")]
    NotHex,
}

/// A key handed to a client together with the digest to configure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedKey {
    pub key: String,
    pub digest: String,
}

/// Hash a presented API key into its allow-list form (lowercase hex SHA-256).
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Produce a key and its digest.
///
/// With `None` a fresh random 128-bit key is generated. A supplied key must
/// be hexadecimal; it is used as-is.
pub fn generate_api_key(supplied: Option<&str>) -> Result<GeneratedKey, ApiKeyError> {
    let key = match supplied {
        Some(key) => {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ApiKeyError::NotHex);
            }
            key.to_string()
        }
        None => {
            let mut raw = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut raw);
            hex::encode(raw)
        }
    };
    let digest = hash_api_key(&key);
    Ok(GeneratedKey { key, digest })
}
