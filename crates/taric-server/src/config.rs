use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use taric_commit::{StagingPolicy, DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE};
use taric_index::DEFAULT_INDEX_KEY;
use taric_store::DEFAULT_FOLDER;

use crate::error::{ServerError, ServerResult};

pub const DEFAULT_API_ROOT: &str = "http://localhost:8080/api/v1/";
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_MAX_UPLOAD: usize = 64 * 1024 * 1024;
pub const DEFAULT_TRUSTED_HOPS: usize = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Base URL written into each index entry's `url`.
    pub api_root: String,
    /// SHA-256 digests of keys allowed to read.
    pub api_keys: Vec<String>,
    /// SHA-256 digests of keys allowed to upload, remove and rebuild.
    pub api_keys_upload: Vec<String>,
    /// CIDR networks allowed to read. `None` disables the address check.
    pub whitelist: Option<Vec<String>>,
    pub whitelist_upload: Option<Vec<String>>,
    /// Number of trailing `X-Forwarded-For` entries taken into account.
    pub trusted_hops: usize,
    pub backend: BackendConfig,
    pub folder: String,
    pub index_key: String,
    pub chunk_size: usize,
    pub multipart_threshold: usize,
    pub part_size: usize,
    pub max_upload: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            api_root: DEFAULT_API_ROOT.to_string(),
            api_keys: Vec::new(),
            api_keys_upload: Vec::new(),
            whitelist: None,
            whitelist_upload: None,
            trusted_hops: DEFAULT_TRUSTED_HOPS,
            backend: BackendConfig::default(),
            folder: DEFAULT_FOLDER.to_string(),
            index_key: DEFAULT_INDEX_KEY.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            max_upload: DEFAULT_MAX_UPLOAD,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.folder.trim_matches('/').is_empty() {
            return Err(ServerError::Config("folder must not be empty".into()));
        }
        if self.index_key.is_empty() {
            return Err(ServerError::Config("index_key must not be empty".into()));
        }
        if self.chunk_size == 0 || self.part_size == 0 {
            return Err(ServerError::Config("chunk_size and part_size must be positive".into()));
        }
        if self.trusted_hops == 0 {
            return Err(ServerError::Config("trusted_hops must be at least 1".into()));
        }
        Ok(())
    }

    pub fn staging_policy(&self) -> StagingPolicy {
        StagingPolicy {
            multipart_threshold: self.multipart_threshold,
            part_size: self.part_size,
        }
    }
}

/// Where delta files and the index are kept.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Filesystem {
        root: PathBuf,
    },
    Memory,
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        prefix: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::Filesystem {
            root: PathBuf::from("data"),
        }
    }
}

/// Split a comma-separated list, trimming items and dropping empty ones.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
