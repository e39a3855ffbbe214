//! HTTP server for the tariff delta service.
//!
//! Serves the delta index by issue date, streams delta files, and accepts
//! uploads and removals behind an API-key and client-network gate.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod state;

pub use auth::{Access, AccessList, Gate};
pub use config::{split_list, BackendConfig, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use router::{build_router, API_PREFIX};
pub use server::{open_backend, TaricServer};
pub use state::AppState;
