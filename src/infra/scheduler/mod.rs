//! Persistent recurring job scheduler.

pub mod postgres;

pub use postgres::PgJobScheduler;
