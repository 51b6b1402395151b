//! Recurring per-order jobs stored in the `order_jobs` table.
//!
//! Each order has at most one row. A worker claims due rows with
//! `FOR UPDATE SKIP LOCKED`, which moves `next_run_at` one interval ahead and
//! sets a lease so no other worker picks the same order while it runs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{AppError, JobScheduler, ScheduledJob};

fn millis(duration: Duration, what: &str) -> Result<i64, AppError> {
    i64::try_from(duration.as_millis())
        .map_err(|_| AppError::Scheduler(format!("{what} out of range: {duration:?}")))
}

pub struct PgJobScheduler {
    pool: PgPool,
}

impl PgJobScheduler {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobScheduler for PgJobScheduler {
    #[instrument(skip(self, now))]
    async fn upsert_schedule(
        &self,
        order_id: Uuid,
        every: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let every_ms = millis(every, "interval")?;

        // The order row is share-locked for the statement, so a transition that
        // is finishing the order either commits first and is seen here, or waits.
        // Only the interval is refreshed; an existing schedule keeps its next run.
        let result = sqlx::query(
            r#"
            WITH guard AS (
                SELECT finished FROM orders WHERE id = $1 FOR SHARE
            )
            INSERT INTO order_jobs (order_id, every_ms, next_run_at, created_at, updated_at)
            SELECT $1, $2, $3, $3, $3
            WHERE NOT EXISTS (SELECT 1 FROM guard WHERE finished)
            ON CONFLICT (order_id) DO UPDATE
            SET every_ms = EXCLUDED.every_ms,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(order_id)
        .bind(every_ms)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Scheduler(e.to_string()))?;

        let upserted = result.rows_affected() > 0;
        debug!(order_id = %order_id, upserted, "Schedule upserted");
        Ok(upserted)
    }

    #[instrument(skip(self))]
    async fn remove_schedule(&self, order_id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM order_jobs WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Scheduler(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, now))]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>, AppError> {
        let lease_ms = millis(lease, "lease")?;

        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT order_id
                FROM order_jobs
                WHERE next_run_at <= $1
                  AND (locked_until IS NULL OR locked_until <= $1)
                ORDER BY next_run_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE order_jobs AS j
            SET next_run_at = $1 + j.every_ms * INTERVAL '1 millisecond',
                locked_until = $1 + $3 * INTERVAL '1 millisecond',
                runs = j.runs + 1,
                updated_at = $1
            FROM due
            WHERE j.order_id = due.order_id
            RETURNING j.order_id, j.every_ms, j.runs
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(lease_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Scheduler(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let every_ms: i64 = row
                    .try_get("every_ms")
                    .map_err(|e| AppError::Scheduler(e.to_string()))?;
                Ok(ScheduledJob {
                    order_id: row
                        .try_get("order_id")
                        .map_err(|e| AppError::Scheduler(e.to_string()))?,
                    every: Duration::from_millis(u64::try_from(every_ms).unwrap_or(0)),
                    run: row
                        .try_get("runs")
                        .map_err(|e| AppError::Scheduler(e.to_string()))?,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn release(&self, order_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE order_jobs SET locked_until = NULL, updated_at = NOW() WHERE order_id = $1",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Scheduler(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn record_failure(&self, order_id: Uuid, error: &str) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE order_jobs
            SET locked_until = NULL,
                failures = failures + 1,
                last_error = $2,
                updated_at = NOW()
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Scheduler(e.to_string()))?;
        Ok(())
    }
}
