//! Domain traits defining contracts for external systems.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::AppError;
use super::types::{ChainLookup, Order, OrderTransition, ScheduledJob};

/// Relational order store
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Check database connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Point lookup by id
    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, AppError>;

    /// Non-finished orders with `scanned_at` older than `cutoff`, oldest first.
    ///
    /// Rows locked by a concurrent scanner are skipped rather than waited on.
    async fn find_stale_orders(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, AppError>;

    /// Commit a transition atomically: the notification batch (if any) and the
    /// order update land together or not at all.
    ///
    /// Fails with `DatabaseError::Conflict` when the row's version differs from
    /// `transition.expected_version`.
    async fn apply_transition(&self, transition: &OrderTransition) -> Result<(), AppError>;
}

/// Read-only view of the escrow contract through the chain indexer
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Check indexer connectivity
    async fn health_check(&self) -> Result<(), AppError>;

    /// Resolve the UTXO holding `thread_token`, its transaction, metadata and datum.
    async fn resolve(&self, thread_token: &str) -> Result<ChainLookup, AppError>;
}

/// TTL key-value cache. Entries are advisory and may vanish at any time.
#[async_trait]
pub trait StatusCache: Send + Sync {
    /// Check cache connectivity
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError>;

    /// Increment an integer entry (absent counts as 0) and refresh its TTL.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, AppError>;
}

/// Persistent recurring job queue, one schedule per order id
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Create the order's schedule, or refresh its interval if it already exists.
    ///
    /// Never changes when an existing schedule fires next. Returns `false`
    /// without writing anything when the order is already finished.
    async fn upsert_schedule(
        &self,
        order_id: Uuid,
        every: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError>;

    /// Delete the order's schedule. Removing a missing schedule is not an error.
    async fn remove_schedule(&self, order_id: Uuid) -> Result<(), AppError>;

    /// Claim up to `limit` due schedules, leasing each until `now + lease` and
    /// moving its next run one interval ahead.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>, AppError>;

    /// Release the lease of a job that completed without finishing its order.
    async fn release(&self, order_id: Uuid) -> Result<(), AppError>;

    /// Release the lease of a failed job and remember the error.
    async fn record_failure(&self, order_id: Uuid, error: &str) -> Result<(), AppError>;
}
