//! Infrastructure layer implementations.

pub mod cache;
pub mod database;
pub mod indexer;
pub mod scheduler;

pub use cache::{InMemoryStatusCache, RedisStatusCache};
pub use database::{PostgresClient, PostgresConfig};
pub use indexer::{IndexerClient, IndexerConfig};
pub use scheduler::PgJobScheduler;
