//! Application layer: lifecycle state machine, per-order processing and the
//! background loops that drive it.

pub mod backoff;
pub mod dispatcher;
pub mod lifecycle;
pub mod scanner;
pub mod service;
pub mod state;
pub mod worker;

pub use backoff::{AdaptiveBackoff, BackoffPolicy};
pub use dispatcher::{Dispatch, dispatch, dispatch_not_found};
pub use scanner::{OrderScanner, ScannerConfig, spawn_scanner};
pub use service::TrackerService;
pub use state::AppState;
pub use worker::{WorkerConfig, WorkerPool, spawn_worker_pool};
