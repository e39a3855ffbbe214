use std::net::SocketAddr;
use std::sync::Arc;

use taric_index::RebuildMode;
use taric_store::{FsBackend, InMemoryBackend, StorageBackend};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::config::{BackendConfig, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::router::build_router;
use crate::state::AppState;

/// Construct the storage backend named by `config`.
///
/// S3 credentials are resolved here, once, through the standard AWS
/// provider chain.
pub async fn open_backend(
    config: &BackendConfig,
    chunk_size: usize,
) -> ServerResult<Arc<dyn StorageBackend>> {
    match config {
        BackendConfig::Filesystem { root } => {
            let backend = FsBackend::open(root.clone()).await?.with_chunk_size(chunk_size);
            info!(root = %root.display(), "using filesystem backend");
            Ok(Arc::new(backend))
        }
        BackendConfig::Memory => {
            warn!("using in-memory backend, nothing will be persisted");
            Ok(Arc::new(InMemoryBackend::with_chunk_size(chunk_size)))
        }
        #[cfg(feature = "s3")]
        BackendConfig::S3 {
            bucket,
            region,
            endpoint,
            prefix,
        } => {
            let backend = taric_store::S3Backend::from_config(bucket.clone(), region.clone(), endpoint.clone())
                .await
                .with_prefix(prefix.clone());
            info!(bucket = %bucket, prefix = %prefix, "using S3 backend");
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "s3"))]
        BackendConfig::S3 { .. } => Err(ServerError::Config(
            "S3 backend requested but this build lacks the `s3` feature".into(),
        )),
    }
}

/// Tariff delta HTTP server.
pub struct TaricServer {
    config: ServerConfig,
}

impl TaricServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Open the backend, wire the state and make sure an index exists.
    pub async fn bootstrap(&self) -> ServerResult<AppState> {
        let backend = open_backend(&self.config.backend, self.config.chunk_size).await?;
        let state = AppState::build(backend, &self.config)?;
        let report = state.reconciler().rebuild(RebuildMode::IfMissing).await?;
        if report.skipped {
            info!(key = %state.index().key(), "index present, skipping initial rebuild");
        } else {
            info!(
                indexed = report.indexed,
                purged = report.purged,
                "initial index built"
            );
        }
        Ok(state)
    }

    /// Bootstrap, then serve until ctrl-c.
    pub async fn serve(self) -> ServerResult<()> {
        let state = self.bootstrap().await?;
        let app = build_router(state);
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("taric delta server listening on {}", self.config.bind_addr);
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| ServerError::Internal(e.to_string()))
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
