use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use taric_server::{split_list, BackendConfig, ServerConfig};
use taric_types::{DeltaDate, ModTime, Seq};

#[derive(Parser)]
#[command(
    name = "taric",
    about = "Tariff delta file service: publish, index and serve TARIC delta files",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file, applied before flags and environment.
    #[arg(long, global = true, env = "TARIC_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, env = "TARIC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(flatten)]
    pub overrides: ConfigOverrides,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build the index if missing, then serve the HTTP API
    Serve(ServeArgs),
    /// Rescan storage, purge staging leftovers and rewrite the index
    RebuildIndex(RebuildArgs),
    /// Validate and publish a delta file
    Upload(UploadArgs),
    /// Remove a published delta file and reindex
    Remove(RemoveArgs),
    /// List delta files issued on a date
    Deltas(DeltasArgs),
    /// Generate an API key and the digest to put in the allow-list
    GenerateApiKey(GenerateApiKeyArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long, env = "TARIC_BIND")]
    pub bind: Option<SocketAddr>,
}

#[derive(Args)]
pub struct RebuildArgs {
    /// Only build when no index exists yet
    #[arg(long)]
    pub if_missing: bool,
}

#[derive(Args)]
pub struct UploadArgs {
    #[arg(value_parser = Seq::parse)]
    pub seq: Seq,
    pub file: PathBuf,
    /// Issue date to record, YYYY-MM-DD[THH:MM:SS[.mmm]]
    #[arg(long, value_parser = ModTime::parse)]
    pub modtime: Option<ModTime>,
}

#[derive(Args)]
pub struct RemoveArgs {
    #[arg(value_parser = Seq::parse)]
    pub seq: Seq,
}

#[derive(Args)]
pub struct DeltasArgs {
    /// Issue date, YYYY-MM-DD; yesterday (UTC) when omitted
    #[arg(value_parser = DeltaDate::parse)]
    pub date: Option<DeltaDate>,
}

#[derive(Args)]
pub struct GenerateApiKeyArgs {
    /// Use this hexadecimal key instead of a random one
    #[arg(long)]
    pub api_key: Option<String>,
}

/// Settings taken from flags or `TARIC_*` environment variables.
///
/// List values are comma separated.
#[derive(Args, Debug, Default)]
pub struct ConfigOverrides {
    #[arg(long, global = true, env = "TARIC_API_ROOT")]
    pub api_root: Option<String>,

    #[arg(long, global = true, env = "TARIC_APIKEYS")]
    pub api_keys: Option<String>,

    #[arg(long, global = true, env = "TARIC_APIKEYS_UPLOAD")]
    pub api_keys_upload: Option<String>,

    #[arg(long, global = true, env = "TARIC_WHITELIST")]
    pub whitelist: Option<String>,

    #[arg(long, global = true, env = "TARIC_WHITELIST_UPLOAD")]
    pub whitelist_upload: Option<String>,

    #[arg(long, global = true, env = "TARIC_FILES_FOLDER")]
    pub folder: Option<String>,

    #[arg(long, global = true, env = "TARIC_FILES_INDEX")]
    pub index_key: Option<String>,

    /// Store files under this directory
    #[arg(long, global = true, env = "TARIC_DATA_DIR", conflicts_with = "s3_bucket")]
    pub data_dir: Option<PathBuf>,

    /// Store files in this S3 bucket
    #[arg(long, global = true, env = "TARIC_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    #[arg(long, global = true, env = "TARIC_S3_REGION")]
    pub s3_region: Option<String>,

    #[arg(long, global = true, env = "TARIC_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, global = true, env = "TARIC_S3_PREFIX")]
    pub s3_prefix: Option<String>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut ServerConfig) {
        if let Some(api_root) = self.api_root {
            config.api_root = api_root;
        }
        if let Some(keys) = self.api_keys {
            config.api_keys = split_list(&keys);
        }
        if let Some(keys) = self.api_keys_upload {
            config.api_keys_upload = split_list(&keys);
        }
        // An empty network list here means "no network check".
        if let Some(networks) = self.whitelist {
            config.whitelist = Some(split_list(&networks)).filter(|l| !l.is_empty());
        }
        if let Some(networks) = self.whitelist_upload {
            config.whitelist_upload = Some(split_list(&networks)).filter(|l| !l.is_empty());
        }
        if let Some(folder) = self.folder {
            config.folder = folder;
        }
        if let Some(index_key) = self.index_key {
            config.index_key = index_key;
        }
        if let Some(root) = self.data_dir {
            config.backend = BackendConfig::Filesystem { root };
        }
        if let Some(bucket) = self.s3_bucket {
            config.backend = BackendConfig::S3 {
                bucket,
                region: self.s3_region,
                endpoint: self.s3_endpoint,
                prefix: self.s3_prefix.unwrap_or_default(),
            };
        }
    }
}
