//! HTTP routes for the Voice Controller.
//!
//! - `/socket` - signaling WebSocket (query: `auth`, `channelId`)
//! - `/health` - liveness check
//! - `/ready` - readiness check (media engine reachable, not draining)
//! - `/metrics` - Prometheus metrics
//! - TraceLayer for request logging

use crate::observability::{health_router, HealthState};
use crate::signaling::handler::socket_handler;
use crate::signaling::SessionContext;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the application router.
pub fn build_routes(
    ctx: SessionContext,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let socket_routes = Router::new()
        .route("/socket", get(socket_handler))
        .with_state(ctx);

    // Metrics route with its own state
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    socket_routes
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}
