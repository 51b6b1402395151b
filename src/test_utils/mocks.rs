//! Mock implementations for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use crate::domain::{
    AppError, CacheError, ChainError, ChainLookup, ChainReader, ChainSnapshot, DatabaseError,
    JobScheduler, Notification, Order, OrderStore, OrderTransition, ScheduledJob, StatusCache,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

/// Mock order store with the same commit semantics as the Postgres store:
/// version compare-and-swap, and notifications written only with the update.
pub struct MockOrderStore {
    orders: Arc<Mutex<HashMap<Uuid, Order>>>,
    events: Arc<Mutex<Vec<Notification>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
    fail_commit: AtomicBool,
}

impl MockOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            orders: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            config,
            is_healthy: AtomicBool::new(true),
            fail_commit: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Make every following `apply_transition` fail at commit time.
    pub fn set_fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::Relaxed);
    }

    pub fn insert(&self, order: Order) {
        self.orders.lock().unwrap().insert(order.id, order);
    }

    pub fn get(&self, id: Uuid) -> Option<Order> {
        self.orders.lock().unwrap().get(&id).cloned()
    }

    /// Bump the stored version as if another writer committed first.
    pub fn touch(&self, id: Uuid) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(&id) {
            order.version += 1;
        }
    }

    /// Every notification committed so far, in commit order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockOrderStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderStore for MockOrderStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }

    async fn find_order(&self, id: Uuid) -> Result<Option<Order>, AppError> {
        self.check_should_fail()?;
        Ok(self.get(id))
    }

    async fn find_stale_orders(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, AppError> {
        self.check_should_fail()?;
        let orders = self.orders.lock().unwrap();
        let mut stale: Vec<Order> = orders
            .values()
            .filter(|o| !o.finished && o.scanned_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|o| o.scanned_at);
        stale.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stale)
    }

    async fn apply_transition(&self, transition: &OrderTransition) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut orders = self.orders.lock().unwrap();
        let order = orders.get_mut(&transition.order_id).ok_or_else(|| {
            AppError::Database(DatabaseError::NotFound(transition.order_id.to_string()))
        })?;

        if order.version != transition.expected_version {
            return Err(AppError::Database(DatabaseError::Conflict {
                id: transition.order_id,
                version: transition.expected_version,
            }));
        }

        if self.fail_commit.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Query(
                "commit failed".to_string(),
            )));
        }

        self.events
            .lock()
            .unwrap()
            .extend(transition.notifications.iter().cloned());
        transition.update.apply_to(order);
        order.version += 1;
        order.updated_at = Utc::now();
        Ok(())
    }
}

/// Mock chain reader keyed by thread token. Unknown tokens resolve to `NotFound`.
pub struct MockChainReader {
    lookups: Arc<Mutex<HashMap<String, ChainLookup>>>,
    failure: Mutex<Option<String>>,
    resolve_calls: AtomicUsize,
    is_healthy: AtomicBool,
}

impl MockChainReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lookups: Arc::new(Mutex::new(HashMap::new())),
            failure: Mutex::new(None),
            resolve_calls: AtomicUsize::new(0),
            is_healthy: AtomicBool::new(true),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn set_found(&self, token: &str, snapshot: ChainSnapshot) {
        self.lookups
            .lock()
            .unwrap()
            .insert(token.to_string(), ChainLookup::Found(Box::new(snapshot)));
    }

    pub fn set_not_found(&self, token: &str) {
        self.lookups.lock().unwrap().remove(token);
    }

    /// Fail every resolve with a transient error until cleared with `None`.
    pub fn set_failure(&self, message: impl Into<Option<&'static str>>) {
        *self.failure.lock().unwrap() = message.into().map(str::to_string);
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::Relaxed)
    }
}

impl Default for MockChainReader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn health_check(&self) -> Result<(), AppError> {
        if self.is_healthy.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(AppError::Chain(ChainError::Request("Unhealthy".to_string())))
        }
    }

    async fn resolve(&self, thread_token: &str) -> Result<ChainLookup, AppError> {
        self.resolve_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(AppError::Chain(ChainError::Request(message)));
        }
        Ok(self
            .lookups
            .lock()
            .unwrap()
            .get(thread_token)
            .cloned()
            .unwrap_or(ChainLookup::NotFound))
    }
}

/// Mock status cache. TTLs are accepted and ignored.
pub struct MockStatusCache {
    entries: Arc<Mutex<HashMap<String, String>>>,
    config: MockConfig,
}

impl MockStatusCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Drop every entry, as after a cache restart.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Cache(CacheError::Connection(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockStatusCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusCache for MockStatusCache {
    async fn health_check(&self) -> Result<(), AppError> {
        self.check_should_fail()
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        self.check_should_fail()?;
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: &str, _ttl: Duration) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr(&self, key: &str, _ttl: Duration) -> Result<i64, AppError> {
        self.check_should_fail()?;
        let mut entries = self.entries.lock().unwrap();
        let current = entries
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        entries.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

/// One in-memory schedule row
#[derive(Debug, Clone)]
pub struct MockSchedule {
    pub every: Duration,
    pub next_run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub runs: i64,
    pub failures: i64,
    pub last_error: Option<String>,
}

/// Mock job scheduler with the same upsert and claim semantics as the
/// Postgres scheduler.
pub struct MockJobScheduler {
    schedules: Arc<Mutex<HashMap<Uuid, MockSchedule>>>,
    config: MockConfig,
}

impl MockJobScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            schedules: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Ids with a live schedule, sorted.
    pub fn scheduled_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.schedules.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn schedule(&self, id: Uuid) -> Option<MockSchedule> {
        self.schedules.lock().unwrap().get(&id).cloned()
    }

    pub fn failures(&self, id: Uuid) -> i64 {
        self.schedule(id).map_or(0, |s| s.failures)
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Scheduler(self.config.message()));
        }
        Ok(())
    }
}

impl Default for MockJobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn chrono_delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

#[async_trait]
impl JobScheduler for MockJobScheduler {
    async fn upsert_schedule(
        &self,
        order_id: Uuid,
        every: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.check_should_fail()?;
        self.schedules
            .lock()
            .unwrap()
            .entry(order_id)
            .and_modify(|s| s.every = every)
            .or_insert(MockSchedule {
                every,
                next_run_at: now,
                locked_until: None,
                runs: 0,
                failures: 0,
                last_error: None,
            });
        Ok(true)
    }

    async fn remove_schedule(&self, order_id: Uuid) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.schedules.lock().unwrap().remove(&order_id);
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>, AppError> {
        self.check_should_fail()?;
        let mut schedules = self.schedules.lock().unwrap();
        let mut due: Vec<(Uuid, DateTime<Utc>)> = schedules
            .iter()
            .filter(|(_, s)| s.next_run_at <= now && s.locked_until.is_none_or(|l| l <= now))
            .map(|(id, s)| (*id, s.next_run_at))
            .collect();
        due.sort_by_key(|(_, next)| *next);
        due.truncate(usize::try_from(limit).unwrap_or(0));

        let mut jobs = Vec::with_capacity(due.len());
        for (id, _) in due {
            if let Some(s) = schedules.get_mut(&id) {
                s.next_run_at = now + chrono_delta(s.every);
                s.locked_until = Some(now + chrono_delta(lease));
                s.runs += 1;
                jobs.push(ScheduledJob {
                    order_id: id,
                    every: s.every,
                    run: s.runs,
                });
            }
        }
        Ok(jobs)
    }

    async fn release(&self, order_id: Uuid) -> Result<(), AppError> {
        self.check_should_fail()?;
        if let Some(s) = self.schedules.lock().unwrap().get_mut(&order_id) {
            s.locked_until = None;
        }
        Ok(())
    }

    async fn record_failure(&self, order_id: Uuid, error: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        if let Some(s) = self.schedules.lock().unwrap().get_mut(&order_id) {
            s.locked_until = None;
            s.failures += 1;
            s.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
