use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};

use super::registry::MetricsRegistry;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Serves the registry in the Prometheus text format
pub async fn metrics_endpoint(State(registry): State<Arc<MetricsRegistry>>) -> Response {
    let metrics_content = registry.render();

    tracing::debug!(
        metrics_size = metrics_content.len(),
        "Metrics served successfully"
    );

    (
        StatusCode::OK,
        [(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics_content,
    )
        .into_response()
}

/// Router exposing [`metrics_endpoint`] at `path`
pub fn metrics_router(path: &str, registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route(path, get(metrics_endpoint))
        .with_state(registry)
}
