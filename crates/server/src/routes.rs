//! Route configuration.

use crate::auth::{auth_middleware, trace_middleware};
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

fn body_limit(state: &AppState) -> RequestBodyLimitLayer {
    let max = usize::try_from(state.config.server.max_upload_bytes).unwrap_or(usize::MAX);
    RequestBodyLimitLayer::new(max)
}

/// Create the external API router.
pub fn create_router(state: AppState) -> Router {
    let upload_routes = Router::new()
        .route("/.api/lsif/upload", post(handlers::upload_external))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Health stays unauthenticated for load balancer checks.
    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .merge(upload_routes);

    // When enabled, /metrics must be network-restricted to the scrapers.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(body_limit(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Create the internal API router. No bearer token and no code host check.
pub fn create_internal_router(state: AppState) -> Router {
    Router::new()
        .route("/.internal/lsif/upload", post(handlers::upload_internal))
        .route("/health", get(handlers::health_check))
        .layer(middleware::from_fn(trace_middleware))
        .layer(body_limit(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
