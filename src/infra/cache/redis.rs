//! Redis status cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::domain::{AppError, CacheError, StatusCache};

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

fn command_error(e: redis::RedisError) -> AppError {
    AppError::Cache(CacheError::Command(e.to_string()))
}

/// Status cache on a shared, auto-reconnecting Redis connection
#[derive(Clone)]
pub struct RedisStatusCache {
    conn: ConnectionManager,
}

impl RedisStatusCache {
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Cache(CacheError::Connection(e.to_string())))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| AppError::Cache(CacheError::Connection(e.to_string())))?;
        info!("Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::Cache(CacheError::Connection(e.to_string())))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(command_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs(ttl))
            .await
            .map_err(command_error)
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, AppError> {
        let mut conn = self.conn.clone();
        let ttl = i64::try_from(ttl_secs(ttl)).unwrap_or(i64::MAX);
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }
}
