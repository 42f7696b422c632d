use axum::{extract::State, http::StatusCode, response::Json};
use tracing::debug;

use super::{HealthManager, HealthResponse, HealthStatus};

/// Liveness probe: 200 while the process is up, regardless of readiness
pub async fn liveness_handler() -> (StatusCode, &'static str) {
    debug!("Liveness check requested");
    (StatusCode::OK, "OK")
}

/// Readiness probe returning the cached [`HealthResponse`] as JSON
///
/// Degraded still counts as ready: an open admin-service breaker only costs
/// the `bucket_owner` label, never traffic. `Starting` is tolerated during
/// the startup grace period.
pub async fn readiness_handler(
    State(health_manager): State<HealthManager>,
) -> Result<Json<HealthResponse>, StatusCode> {
    debug!("Readiness check requested");

    let health_response = health_manager.get_health().await;

    match health_response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => Ok(Json(health_response)),
        HealthStatus::Starting if health_manager.is_in_startup_period() => {
            Ok(Json(health_response))
        }
        HealthStatus::Starting | HealthStatus::Unhealthy => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}
