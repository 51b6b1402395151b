//! PostgreSQL order store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AppError, DatabaseError, Notification, Order, OrderStore, OrderTransition, Phase, PhaseLog,
    PhaseRecord,
};

const ORDER_COLUMNS: &str = r#"
    id, title, thread_token, status, finished, version, contract_state,
    buyer_id, buyer_address, seller_id, seller_address,
    pending_tx, pending_block, pending_metadata, pending_notified,
    locking_tx, locking_block, locking_metadata, locking_notified,
    shipping_tx, shipping_block, shipping_metadata, shipping_notified,
    received_tx, received_block, received_metadata, received_notified,
    collected_tx, collected_block, collected_metadata, collected_notified,
    canceled_tx, canceled_block, canceled_metadata, canceled_notified,
    returned_tx, returned_block, returned_metadata, returned_notified,
    appealed_tx, appealed_block, appealed_metadata, appealed_notified,
    watch_until, scanned_at, created_at, updated_at
"#;

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// `source` column of every event row written by this store
    pub event_source: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
            event_source: "settlement-tracker".to_string(),
        }
    }
}

/// PostgreSQL order store with connection pooling
pub struct PostgresClient {
    pool: PgPool,
    event_source: String,
}

impl PostgresClient {
    /// Create a new PostgreSQL client with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self {
            pool,
            event_source: config.event_source,
        })
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (shared with the job scheduler)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a freshly created order. Orders are normally created by the
    /// marketplace; this is used for seeding and tests.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn insert_order(&self, order: &Order) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, title, thread_token, status, finished, version, contract_state,
                buyer_id, buyer_address, seller_id, seller_address,
                watch_until, scanned_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(order.id)
        .bind(&order.title)
        .bind(&order.thread_token)
        .bind(order.status.as_str())
        .bind(order.finished)
        .bind(order.version)
        .bind(order.contract_state)
        .bind(&order.buyer_id)
        .bind(&order.buyer_address)
        .bind(&order.seller_id)
        .bind(&order.seller_address)
        .bind(order.watch_until)
        .bind(order.scanned_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;
        Ok(())
    }

    /// Notification batches written for an order, oldest first.
    #[instrument(skip(self))]
    pub async fn notifications_for(&self, order_id: Uuid) -> Result<Vec<Notification>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT payload FROM events
            WHERE correlation_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let mut notifications = Vec::new();
        for row in rows {
            let Json(batch): Json<Vec<Notification>> = row
                .try_get("payload")
                .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
            notifications.extend(batch);
        }
        Ok(notifications)
    }

    fn row_to_phase(row: &PgRow, phase: Phase) -> Result<PhaseRecord, sqlx::Error> {
        let prefix = phase.as_str();
        Ok(PhaseRecord {
            tx: row.try_get(format!("{prefix}_tx").as_str())?,
            block: row.try_get(format!("{prefix}_block").as_str())?,
            metadata: row.try_get(format!("{prefix}_metadata").as_str())?,
            notified: row.try_get(format!("{prefix}_notified").as_str())?,
        })
    }

    /// Parse a database row into an Order
    fn row_to_order(row: &PgRow) -> Result<Order, AppError> {
        let map = |e: sqlx::Error| AppError::Database(DatabaseError::Query(e.to_string()));

        let status: String = row.try_get("status").map_err(map)?;
        let status = status
            .parse()
            .map_err(|e: String| AppError::Database(DatabaseError::Query(e)))?;

        let mut phases = PhaseLog::default();
        for phase in Phase::ALL {
            *phases.get_mut(phase) = Self::row_to_phase(row, phase).map_err(map)?;
        }

        Ok(Order {
            id: row.try_get("id").map_err(map)?,
            title: row.try_get("title").map_err(map)?,
            thread_token: row.try_get("thread_token").map_err(map)?,
            status,
            finished: row.try_get("finished").map_err(map)?,
            version: row.try_get("version").map_err(map)?,
            contract_state: row.try_get("contract_state").map_err(map)?,
            buyer_id: row.try_get("buyer_id").map_err(map)?,
            buyer_address: row.try_get("buyer_address").map_err(map)?,
            seller_id: row.try_get("seller_id").map_err(map)?,
            seller_address: row.try_get("seller_address").map_err(map)?,
            phases,
            watch_until: row.try_get("watch_until").map_err(map)?,
            scanned_at: row.try_get("scanned_at").map_err(map)?,
            created_at: row.try_get("created_at").map_err(map)?,
            updated_at: row.try_get("updated_at").map_err(map)?,
        })
    }

    /// Build the compare-and-swap UPDATE for a transition.
    fn update_query(transition: &OrderTransition) -> QueryBuilder<'_, Postgres> {
        let update = &transition.update;
        let mut qb = QueryBuilder::new("UPDATE orders SET version = version + 1, updated_at = ");
        qb.push_bind(Utc::now());

        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(finished) = update.finished {
            qb.push(", finished = ").push_bind(finished);
        }
        if let Some(state) = update.contract_state {
            qb.push(", contract_state = ").push_bind(state);
        }
        if let Some((phase, record)) = &update.phase {
            let prefix = phase.as_str();
            qb.push(format!(", {prefix}_tx = "))
                .push_bind(record.tx.as_deref());
            qb.push(format!(", {prefix}_block = "))
                .push_bind(record.block);
            qb.push(format!(", {prefix}_metadata = "))
                .push_bind(record.metadata.as_ref());
            // Once set the flag stays set, whatever the update says.
            qb.push(format!(", {prefix}_notified = {prefix}_notified OR "))
                .push_bind(record.notified);
        }
        if let Some(at) = update.scanned_at {
            qb.push(", scanned_at = ").push_bind(at);
        }

        qb.push(" WHERE id = ")
            .push_bind(transition.order_id)
            .push(" AND version = ")
            .push_bind(transition.expected_version);
        qb
    }
}

#[async_trait]
impl OrderStore for PostgresClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        let row = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_order(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn find_stale_orders(
        &self,
        cutoff: chrono::DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, AppError> {
        // SKIP LOCKED passes over rows a transition is committing right now, so the
        // scan never waits on a worker. Those rows are picked up on the next tick.
        // The lock itself ends with the statement; each schedule upsert re-locks
        // its order row and refuses finished orders.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE finished = FALSE
              AND scanned_at < $1
            ORDER BY scanned_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        debug!(count = rows.len(), "Fetched stale orders");
        rows.iter().map(Self::row_to_order).collect()
    }

    #[instrument(
        skip(self, transition),
        fields(
            order_id = %transition.order_id,
            version = transition.expected_version,
            notifications = transition.notifications.len()
        )
    )]
    async fn apply_transition(&self, transition: &OrderTransition) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        if let Some(first) = transition.notifications.first() {
            sqlx::query(
                r#"
                INSERT INTO events (id, created_at, source, event_type, payload, correlation_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(first.created_at)
            .bind(&self.event_source)
            .bind(format!("order.{}", first.phase))
            .bind(Json(&transition.notifications))
            .bind(transition.order_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        }

        let result = Self::update_query(transition)
            .build()
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            // Dropping the transaction would roll back too; be explicit.
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "Rollback after version conflict failed");
            }
            return Err(AppError::Database(DatabaseError::Conflict {
                id: transition.order_id,
                version: transition.expected_version,
            }));
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }
}
