//! Domain layer containing core business types, traits, and error definitions.

pub mod error;
pub mod traits;
pub mod types;

pub use error::{AppError, CacheError, ChainError, ConfigError, DatabaseError};
pub use traits::{ChainReader, JobScheduler, OrderStore, StatusCache};
pub use types::{
    ChainLookup, ChainSnapshot, ContractState, Counterparty, DecodedDatum, Delivery,
    HealthResponse, HealthStatus, JobOutcome, Notification, NotificationPayload, Order,
    OrderStatus, OrderTransition, OrderUpdate, Phase, PhaseLog, PhaseRecord, ScheduledJob,
    TxInfo, TxMetadata, Utxo,
};
