//! HTTP routes for the health endpoints, wrapped in request tracing.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use super::handlers::{health_check_handler, liveness_handler, readiness_handler};
use crate::app::AppState;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
