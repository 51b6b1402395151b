//! Application state management.

use std::sync::Arc;

use super::service::TrackerService;

/// Shared state of the HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TrackerService>,
}

impl AppState {
    #[must_use]
    pub fn new(service: Arc<TrackerService>) -> Self {
        Self { service }
    }
}
