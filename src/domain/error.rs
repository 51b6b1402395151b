//! Error taxonomy for the settlement tracker.
//!
//! `ChainLookup::NotFound` is not an error: a thread token with no UTXO is a
//! legitimate state. Everything in [`ChainError`] is a transient failure that
//! the next scheduled tick retries.

use thiserror::Error;
use uuid::Uuid;

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Chain reader error: {0}")]
    Chain(#[from] ChainError),

    #[error("Status cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Job scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the failed job should simply run again on its next tick.
    ///
    /// Only configuration errors are fatal; they are raised before any
    /// background task starts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }

    /// True when an update lost the optimistic-concurrency race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Database(DatabaseError::Conflict { .. }))
    }
}

/// Relational store errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    /// The row's version no longer matches the one the update was built from.
    #[error("Version conflict on order {id} (expected version {version})")]
    Conflict { id: Uuid, version: i32 },
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Connection(err.to_string())
            }
            other => Self::Query(other.to_string()),
        }
    }
}

/// Indexer failures. Every variant is transient.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Indexer request failed: {0}")]
    Request(String),

    #[error("Indexer returned HTTP {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("Indexer response did not match schema: {0}")]
    Schema(String),

    #[error("Datum decode failed: {0}")]
    Decode(String),

    #[error("Indexer request timed out: {0}")]
    Timeout(String),

    /// Two indexer endpoints disagree about the same asset.
    #[error("Indexer view is inconsistent: {0}")]
    Inconsistent(String),
}

/// Status cache failures. The cache is advisory, so callers usually log these.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache connection failed: {0}")]
    Connection(String),

    #[error("Cache command failed: {0}")]
    Command(String),
}

/// Startup configuration errors. The process must not start with one of these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(String),

    #[error("{key} is invalid: {message}")]
    Invalid { key: String, message: String },
}
