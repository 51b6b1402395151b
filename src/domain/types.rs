//! Domain types for orders, on-chain snapshots, and notifications.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an escrow order
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Placed by the marketplace, no on-chain activity seen yet
    #[default]
    Created,
    Pending,
    Locking,
    Shipping,
    Received,
    /// Seller collected the funds. Success terminal.
    Collected,
    Canceled,
    Returned,
    Appealed,
    /// No on-chain activity before `watch_until`. Timeout terminal.
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Locking => "locking",
            Self::Shipping => "shipping",
            Self::Received => "received",
            Self::Collected => "collected",
            Self::Canceled => "canceled",
            Self::Returned => "returned",
            Self::Appealed => "appealed",
            Self::Expired => "expired",
        }
    }

    /// Terminal statuses mark the order `finished` and end its schedule.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Collected | Self::Expired)
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "pending" => Ok(Self::Pending),
            "locking" => Ok(Self::Locking),
            "shipping" => Ok(Self::Shipping),
            "received" => Ok(Self::Received),
            "collected" => Ok(Self::Collected),
            "canceled" => Ok(Self::Canceled),
            "returned" => Ok(Self::Returned),
            "appealed" => Ok(Self::Appealed),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Invalid order status: {}", s)),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An on-chain phase an order can pass through. Each phase owns a set of
/// audit columns (`{phase}_tx`, `{phase}_block`, `{phase}_metadata`,
/// `{phase}_notified`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Locking,
    Shipping,
    Received,
    Collected,
    Canceled,
    Returned,
    Appealed,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Pending,
        Phase::Locking,
        Phase::Shipping,
        Phase::Received,
        Phase::Collected,
        Phase::Canceled,
        Phase::Returned,
        Phase::Appealed,
    ];

    /// Column prefix of this phase's audit fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Locking => "locking",
            Self::Shipping => "shipping",
            Self::Received => "received",
            Self::Collected => "collected",
            Self::Canceled => "canceled",
            Self::Returned => "returned",
            Self::Appealed => "appealed",
        }
    }

    pub fn status(&self) -> OrderStatus {
        match self {
            Self::Pending => OrderStatus::Pending,
            Self::Locking => OrderStatus::Locking,
            Self::Shipping => OrderStatus::Shipping,
            Self::Received => OrderStatus::Received,
            Self::Collected => OrderStatus::Collected,
            Self::Canceled => OrderStatus::Canceled,
            Self::Returned => OrderStatus::Returned,
            Self::Appealed => OrderStatus::Appealed,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State value carried in the escrow contract's datum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContractState {
    Pending,
    Locking,
    Shipping,
    Received,
    Collected,
    Returned,
    Canceled,
    Appealed,
}

impl ContractState {
    pub fn code(&self) -> i64 {
        match self {
            Self::Appealed => -3,
            Self::Canceled => -2,
            Self::Returned => -1,
            Self::Pending => 0,
            Self::Locking => 1,
            Self::Shipping => 2,
            Self::Received => 3,
            Self::Collected => 4,
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Pending => Phase::Pending,
            Self::Locking => Phase::Locking,
            Self::Shipping => Phase::Shipping,
            Self::Received => Phase::Received,
            Self::Collected => Phase::Collected,
            Self::Returned => Phase::Returned,
            Self::Canceled => Phase::Canceled,
            Self::Appealed => Phase::Appealed,
        }
    }
}

impl TryFrom<i64> for ContractState {
    type Error = i64;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            -3 => Ok(Self::Appealed),
            -2 => Ok(Self::Canceled),
            -1 => Ok(Self::Returned),
            0 => Ok(Self::Pending),
            1 => Ok(Self::Locking),
            2 => Ok(Self::Shipping),
            3 => Ok(Self::Received),
            4 => Ok(Self::Collected),
            other => Err(other),
        }
    }
}

/// Audit trail of a single phase
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseRecord {
    /// Hash of the transaction that moved the contract into this phase
    pub tx: Option<String>,
    /// Block height of that transaction
    pub block: Option<i64>,
    /// Transaction metadata as returned by the indexer
    pub metadata: Option<serde_json::Value>,
    /// Set once the phase's notifications were written. Never unset.
    pub notified: bool,
}

/// Audit records for every phase, one field per column group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseLog {
    pub pending: PhaseRecord,
    pub locking: PhaseRecord,
    pub shipping: PhaseRecord,
    pub received: PhaseRecord,
    pub collected: PhaseRecord,
    pub canceled: PhaseRecord,
    pub returned: PhaseRecord,
    pub appealed: PhaseRecord,
}

impl PhaseLog {
    pub fn get(&self, phase: Phase) -> &PhaseRecord {
        match phase {
            Phase::Pending => &self.pending,
            Phase::Locking => &self.locking,
            Phase::Shipping => &self.shipping,
            Phase::Received => &self.received,
            Phase::Collected => &self.collected,
            Phase::Canceled => &self.canceled,
            Phase::Returned => &self.returned,
            Phase::Appealed => &self.appealed,
        }
    }

    pub fn get_mut(&mut self, phase: Phase) -> &mut PhaseRecord {
        match phase {
            Phase::Pending => &mut self.pending,
            Phase::Locking => &mut self.locking,
            Phase::Shipping => &mut self.shipping,
            Phase::Received => &mut self.received,
            Phase::Collected => &mut self.collected,
            Phase::Canceled => &mut self.canceled,
            Phase::Returned => &mut self.returned,
            Phase::Appealed => &mut self.appealed,
        }
    }
}

/// Core escrow order entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: Uuid,
    /// Human readable listing title, used in notification messages
    pub title: String,
    /// Asset id (policy id + asset name) of the contract's thread token
    pub thread_token: String,
    pub status: OrderStatus,
    pub finished: bool,
    /// Optimistic-concurrency tag, bumped on every successful update
    pub version: i32,
    /// Last decoded on-chain state code
    pub contract_state: Option<i64>,
    pub buyer_id: String,
    pub buyer_address: String,
    pub seller_id: String,
    pub seller_address: String,
    pub phases: PhaseLog,
    /// Orders still `created` after this instant are expired
    pub watch_until: DateTime<Utc>,
    pub scanned_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    #[must_use]
    pub fn new(id: Uuid, thread_token: String, watch_until: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: String::new(),
            thread_token,
            status: OrderStatus::Created,
            finished: false,
            version: 0,
            contract_state: None,
            buyer_id: String::new(),
            buyer_address: String::new(),
            seller_id: String::new(),
            seller_address: String::new(),
            phases: PhaseLog::default(),
            watch_until,
            scanned_at: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Typed partial update of an order row.
///
/// Only the fields that were set are written; the store maps each one to
/// its column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderUpdate {
    pub status: Option<OrderStatus>,
    pub finished: Option<bool>,
    pub contract_state: Option<i64>,
    pub phase: Option<(Phase, PhaseRecord)>,
    pub scanned_at: Option<DateTime<Utc>>,
}

impl OrderUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: OrderStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn finished(mut self, finished: bool) -> Self {
        self.finished = Some(finished);
        self
    }

    #[must_use]
    pub fn contract_state(mut self, state: ContractState) -> Self {
        self.contract_state = Some(state.code());
        self
    }

    #[must_use]
    pub fn phase(mut self, phase: Phase, record: PhaseRecord) -> Self {
        self.phase = Some((phase, record));
        self
    }

    #[must_use]
    pub fn scanned_at(mut self, at: DateTime<Utc>) -> Self {
        self.scanned_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.finished.is_none()
            && self.contract_state.is_none()
            && self.phase.is_none()
            && self.scanned_at.is_none()
    }

    /// Apply the set fields to an in-memory order. Does not touch `version`.
    pub fn apply_to(&self, order: &mut Order) {
        if let Some(status) = self.status {
            order.status = status;
        }
        if let Some(finished) = self.finished {
            order.finished = finished;
        }
        if let Some(state) = self.contract_state {
            order.contract_state = Some(state);
        }
        if let Some((phase, record)) = &self.phase {
            *order.phases.get_mut(*phase) = record.clone();
        }
        if let Some(at) = self.scanned_at {
            order.scanned_at = at;
        }
    }
}

/// Which side of the trade a notification is addressed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Counterparty {
    Buyer,
    Seller,
}

/// Structured part of a notification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub tx_hash: Option<String>,
    pub block: Option<i64>,
    pub buyer_address: String,
    pub seller_address: String,
}

/// Immutable record telling one counterparty about a phase change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub phase: Phase,
    pub recipient: Counterparty,
    /// Marketplace user id of the recipient
    pub owner_id: String,
    pub title: String,
    pub message: String,
    pub payload: NotificationPayload,
    pub created_at: DateTime<Utc>,
}

/// Everything one lifecycle handler wants committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderTransition {
    pub order_id: Uuid,
    /// Version the update was derived from; a mismatch is a conflict
    pub expected_version: i32,
    pub update: OrderUpdate,
    /// Written in the same transaction as the update. May be empty.
    pub notifications: Vec<Notification>,
}

impl OrderTransition {
    /// Status the order ends up in, if the transition sets one.
    pub fn status(&self) -> Option<OrderStatus> {
        self.update.status
    }

    pub fn finished(&self) -> bool {
        self.update.finished.unwrap_or(false)
    }
}

/// Datum delivery field: the deadline for the current delivery step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delivery {
    /// POSIX time in milliseconds
    pub deadline_ms: i64,
}

/// Decoded contract datum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodedDatum {
    pub state: i64,
    pub delivery: Option<Delivery>,
}

/// UTXO currently holding the thread token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Utxo {
    pub tx_hash: String,
    pub output_index: u32,
    pub address: String,
    pub data_hash: Option<String>,
}

/// Producing transaction of the UTXO
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxInfo {
    pub hash: String,
    pub block: String,
    pub block_height: i64,
    pub block_time: i64,
}

/// One metadata label attached to a transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TxMetadata {
    pub label: String,
    pub json_metadata: serde_json::Value,
}

/// Everything the chain reader resolved for one thread token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSnapshot {
    pub utxo: Utxo,
    pub tx: TxInfo,
    pub metadata: Vec<TxMetadata>,
    pub datum: DecodedDatum,
}

impl ChainSnapshot {
    /// Metadata as stored in the `{phase}_metadata` column.
    pub fn metadata_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.metadata).unwrap_or(serde_json::Value::Null)
    }
}

/// Outcome of resolving a thread token
#[derive(Debug, Clone, PartialEq)]
pub enum ChainLookup {
    Found(Box<ChainSnapshot>),
    /// No UTXO holds the token: no on-chain activity yet
    NotFound,
}

/// Result of processing one job
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobOutcome {
    pub order_id: Uuid,
    pub finished: bool,
}

impl JobOutcome {
    pub fn pending(order_id: Uuid) -> Self {
        Self {
            order_id,
            finished: false,
        }
    }

    pub fn finished(order_id: Uuid) -> Self {
        Self {
            order_id,
            finished: true,
        }
    }
}

/// A claimed run of a recurring per-order schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub order_id: Uuid,
    pub every: Duration,
    /// How many times this schedule has fired, including this run
    pub run: i64,
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub database: HealthStatus,
    pub indexer: HealthStatus,
    /// The status cache is advisory: when it is down the service is degraded
    pub cache: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, indexer: HealthStatus, cache: HealthStatus) -> Self {
        let status = match (database, indexer, cache) {
            (HealthStatus::Unhealthy, _, _) | (_, HealthStatus::Unhealthy, _) => {
                HealthStatus::Unhealthy
            }
            (HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Healthy) => {
                HealthStatus::Healthy
            }
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            indexer,
            cache,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
