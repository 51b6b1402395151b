//! The API layer: operational HTTP endpoints.

pub mod handlers;
pub mod router;

pub use handlers::{health_check_handler, liveness_handler, readiness_handler};
pub use router::create_router;
