use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{middleware, Router};
use tower_http::trace::TraceLayer;

use crate::auth::require_access;
use crate::handlers;
use crate::state::AppState;

/// Prefix all API routes are mounted under.
pub const API_PREFIX: &str = "/api/v1";

/// Build the axum router with all delta service endpoints.
///
/// Everything under [`API_PREFIX`] passes the access gate first; the
/// health check and root do not.
pub fn build_router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/taricdeltas", get(handlers::deltas_default))
        .route("/taricdeltas/", get(handlers::deltas_default))
        .route("/taricdeltas/:date", get(handlers::deltas_for_date))
        .route(
            "/taricfiles",
            get(handlers::missing_seq)
                .post(handlers::missing_seq)
                .delete(handlers::missing_seq),
        )
        .route(
            "/taricfiles/",
            get(handlers::missing_seq)
                .post(handlers::missing_seq)
                .delete(handlers::missing_seq),
        )
        .route(
            "/taricfiles/:seq",
            get(handlers::get_file)
                .post(handlers::upload_file)
                .delete(handlers::delete_file),
        )
        .route("/rebuildindex", post(handlers::rebuild_index))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_access));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthcheck", get(handlers::healthcheck))
        .nest(API_PREFIX, api_v1)
        .layer(DefaultBodyLimit::max(state.max_upload()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
