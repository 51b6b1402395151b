//! Health endpoints.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};

use crate::app::AppState;
use crate::domain::{HealthResponse, HealthStatus};

/// Detailed health check covering the database, the indexer and the status cache
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let health = state.service.health_check().await;
    Json(health)
}

/// Liveness probe
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe. A degraded cache does not take the service out of rotation.
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = state.service.health_check().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}
