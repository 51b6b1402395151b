//! In-process status cache, used when no Redis URL is configured.
//!
//! Entries live only as long as the process; the backoff state they hold
//! is advisory, so a restart merely resets it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{AppError, StatusCache};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStatusCache {
    entries: DashMap<String, Entry>,
}

impl InMemoryStatusCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| entry.is_live());
    }
}

#[async_trait]
impl StatusCache for InMemoryStatusCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let value = self
            .entries
            .get(key)
            .filter(|entry| entry.is_live())
            .map(|entry| entry.value.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live());
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AppError> {
        self.entries
            .insert(key.to_string(), Entry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, AppError> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new("0".to_string(), ttl));
        let current = if entry.is_live() {
            entry.value.parse::<i64>().unwrap_or(0)
        } else {
            0
        };
        let next = current + 1;
        *entry = Entry::new(next.to_string(), ttl);
        Ok(next)
    }
}
