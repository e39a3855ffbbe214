use std::sync::Arc;

use taric_commit::CommitProtocol;
use taric_gate::ContentGate;
use taric_index::{IndexStore, Reconciler};
use taric_store::{NamingScheme, StorageBackend};

use crate::auth::Gate;
use crate::config::ServerConfig;
use crate::error::ServerResult;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    protocol: CommitProtocol,
    gate: Gate,
    backend: Arc<dyn StorageBackend>,
    max_upload: usize,
}

impl AppState {
    /// Wire the components for `backend` with the default content checks.
    pub fn build(backend: Arc<dyn StorageBackend>, config: &ServerConfig) -> ServerResult<Self> {
        Self::build_with_checks(backend, config, ContentGate::default())
    }

    pub fn build_with_checks(
        backend: Arc<dyn StorageBackend>,
        config: &ServerConfig,
        checks: ContentGate,
    ) -> ServerResult<Self> {
        config.validate()?;
        let gate = Gate::from_config(config)?;
        let index = Arc::new(IndexStore::new(backend.clone(), config.index_key.clone()));
        let reconciler = Reconciler::new(
            backend.clone(),
            NamingScheme::new(config.folder.clone()),
            index,
            config.api_root.clone(),
        );
        let protocol = CommitProtocol::new(
            backend.clone(),
            Arc::new(checks),
            reconciler,
            config.staging_policy(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                protocol,
                gate,
                backend,
                max_upload: config.max_upload,
            }),
        })
    }

    pub fn protocol(&self) -> &CommitProtocol {
        &self.inner.protocol
    }

    pub fn reconciler(&self) -> &Reconciler {
        self.inner.protocol.reconciler()
    }

    pub fn index(&self) -> &Arc<IndexStore> {
        self.reconciler().index()
    }

    pub fn gate(&self) -> &Gate {
        &self.inner.gate
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.inner.backend
    }

    pub fn max_upload(&self) -> usize {
        self.inner.max_upload
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("protocol", &self.inner.protocol)
            .field("gate", &self.inner.gate)
            .field("max_upload", &self.inner.max_upload)
            .finish()
    }
}
