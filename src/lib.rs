//! Escrow settlement tracker.
//!
//! Keeps marketplace escrow orders in step with the on-chain state of their
//! thread tokens: a scanner schedules stale orders, a worker pool polls the
//! indexer for each scheduled order and applies the resulting lifecycle
//! transition, recording notifications in the same transaction.

pub mod api;
pub mod app;
pub mod config;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
