//! Application service: per-order job processing and schedule management.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::backoff::{AdaptiveBackoff, BackoffPolicy};
use super::dispatcher::{Dispatch, dispatch, dispatch_not_found};
use crate::domain::{
    AppError, ChainLookup, ChainReader, HealthResponse, HealthStatus, JobOutcome, JobScheduler,
    OrderStatus, OrderStore, ScheduledJob, StatusCache,
};

/// Service wiring the order store, chain reader, status cache and job scheduler
pub struct TrackerService {
    store: Arc<dyn OrderStore>,
    chain: Arc<dyn ChainReader>,
    cache: Arc<dyn StatusCache>,
    scheduler: Arc<dyn JobScheduler>,
    backoff: AdaptiveBackoff,
}

impl TrackerService {
    #[must_use]
    pub fn new(
        store: Arc<dyn OrderStore>,
        chain: Arc<dyn ChainReader>,
        cache: Arc<dyn StatusCache>,
        scheduler: Arc<dyn JobScheduler>,
        policy: BackoffPolicy,
    ) -> Self {
        let backoff = AdaptiveBackoff::new(Arc::clone(&cache), policy);
        Self {
            store,
            chain,
            cache,
            scheduler,
            backoff,
        }
    }

    /// Process one scheduled run for an order.
    ///
    /// Returns `finished: true` when the order no longer needs polling: it is
    /// gone, already finished, or reached a terminal status in this run.
    #[instrument(skip(self, now))]
    pub async fn process_order(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome, AppError> {
        if let Some(until) = self.backoff.sleeping_until(order_id, now).await {
            debug!(order_id = %order_id, sleep_until = %until, "Order is backing off, skipping poll");
            return Ok(JobOutcome::pending(order_id));
        }

        let Some(order) = self.store.find_order(order_id).await? else {
            warn!(order_id = %order_id, "Scheduled order no longer exists");
            return Ok(JobOutcome::finished(order_id));
        };

        if order.finished {
            debug!(order_id = %order_id, status = %order.status, "Order already finished");
            return Ok(JobOutcome::finished(order_id));
        }

        let decision = match self.chain.resolve(&order.thread_token).await? {
            ChainLookup::Found(snapshot) => dispatch(now, &order, &snapshot),
            ChainLookup::NotFound => dispatch_not_found(now, &order),
        };

        let transition = match decision {
            Dispatch::Transition(transition) => transition,
            Dispatch::Idle => {
                debug!(order_id = %order_id, status = %order.status, "No on-chain activity yet");
                self.remember_status(order_id, order.status, now).await;
                return Ok(JobOutcome::pending(order_id));
            }
            Dispatch::Unknown(state) => {
                warn!(order_id = %order_id, state, "Unknown contract state, ignoring");
                return Ok(JobOutcome::pending(order_id));
            }
        };

        self.store
            .apply_transition(&transition)
            .await
            .inspect_err(|e| {
                if e.is_conflict() {
                    warn!(order_id = %order_id, version = order.version, "Order changed concurrently");
                }
            })?;

        let finished = transition.finished();
        if let Some(status) = transition.status() {
            info!(
                order_id = %order_id,
                from = %order.status,
                to = %status,
                notifications = transition.notifications.len(),
                finished,
                "Order transitioned"
            );
            if !finished {
                self.remember_status(order_id, status, now).await;
            }
        }

        Ok(JobOutcome {
            order_id,
            finished,
        })
    }

    /// Feed the backoff. The cache is advisory, so failures are only logged.
    async fn remember_status(&self, order_id: Uuid, status: OrderStatus, now: DateTime<Utc>) {
        if let Err(e) = self.backoff.record(order_id, status, now).await {
            warn!(order_id = %order_id, error = %e, "Failed to record status for backoff");
        }
    }

    /// Upsert a recurring schedule for every stale, unfinished order.
    ///
    /// Returns how many schedules were upserted. A failing upsert is logged
    /// and does not stop the rest of the batch.
    #[instrument(skip(self, now))]
    pub async fn schedule_stale_orders(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        batch_size: i64,
        every: Duration,
    ) -> Result<usize, AppError> {
        let cutoff = chrono::Duration::from_std(stale_after)
            .ok()
            .and_then(|range| now.checked_sub_signed(range))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let orders = self.store.find_stale_orders(cutoff, batch_size).await?;

        if orders.is_empty() {
            debug!("No stale orders");
            return Ok(0);
        }

        let mut scheduled = 0;
        for order in &orders {
            match self.scheduler.upsert_schedule(order.id, every, now).await {
                Ok(true) => scheduled += 1,
                Ok(false) => {
                    debug!(order_id = %order.id, "Order finished before it was scheduled");
                }
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "Failed to schedule order");
                }
            }
        }

        info!(found = orders.len(), scheduled, "Scheduled stale orders");
        Ok(scheduled)
    }

    /// Claim due jobs for the worker pool.
    pub async fn claim_jobs(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<ScheduledJob>, AppError> {
        self.scheduler.claim_due(now, limit, lease).await
    }

    /// Completion callback: drop the schedule of a finished order, keep the rest.
    #[instrument(skip(self))]
    pub async fn complete_job(&self, outcome: JobOutcome) -> Result<(), AppError> {
        if outcome.finished {
            self.scheduler.remove_schedule(outcome.order_id).await?;
            info!(order_id = %outcome.order_id, "Order finished, schedule removed");
        } else {
            self.scheduler.release(outcome.order_id).await?;
        }
        Ok(())
    }

    /// Failure callback: the schedule stays, the next tick retries.
    #[instrument(skip(self, err))]
    pub async fn fail_job(&self, order_id: Uuid, err: &AppError) -> Result<(), AppError> {
        error!(order_id = %order_id, error = %err, retryable = err.is_retryable(), "Job failed");
        self.scheduler
            .record_failure(order_id, &err.to_string())
            .await
    }

    /// Perform health check on all dependencies
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthResponse {
        let database = match self.store.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let indexer = match self.chain.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        let cache = match self.cache.health_check().await {
            Ok(()) => HealthStatus::Healthy,
            Err(_) => HealthStatus::Unhealthy,
        };
        HealthResponse::new(database, indexer, cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ChainSnapshot, DecodedDatum, Order, Phase, TxInfo, Utxo,
    };
    use crate::test_utils::{
        MockChainReader, MockConfig, MockJobScheduler, MockOrderStore, MockStatusCache,
    };

    struct Harness {
        store: Arc<MockOrderStore>,
        chain: Arc<MockChainReader>,
        cache: Arc<MockStatusCache>,
        scheduler: Arc<MockJobScheduler>,
        service: TrackerService,
    }

    fn harness() -> Harness {
        let store = Arc::new(MockOrderStore::new());
        let chain = Arc::new(MockChainReader::new());
        let cache = Arc::new(MockStatusCache::new());
        let scheduler = Arc::new(MockJobScheduler::new());
        let service = TrackerService::new(
            Arc::clone(&store) as Arc<dyn OrderStore>,
            Arc::clone(&chain) as Arc<dyn ChainReader>,
            Arc::clone(&cache) as Arc<dyn StatusCache>,
            Arc::clone(&scheduler) as Arc<dyn JobScheduler>,
            BackoffPolicy::default(),
        );
        Harness {
            store,
            chain,
            cache,
            scheduler,
            service,
        }
    }

    fn order(token: &str) -> Order {
        let mut order = Order::new(
            Uuid::new_v4(),
            token.to_string(),
            Utc::now() + chrono::Duration::hours(1),
        );
        order.title = "Desk lamp".to_string();
        order.buyer_id = "buyer".to_string();
        order.seller_id = "seller".to_string();
        order
    }

    fn snapshot(state: i64) -> ChainSnapshot {
        ChainSnapshot {
            utxo: Utxo {
                tx_hash: format!("tx{state}"),
                output_index: 0,
                address: "addr_script".to_string(),
                data_hash: Some("dh".to_string()),
            },
            tx: TxInfo {
                hash: format!("tx{state}"),
                block: "blk".to_string(),
                block_height: 100,
                block_time: 0,
            },
            metadata: Vec::new(),
            datum: DecodedDatum {
                state,
                delivery: None,
            },
        }
    }

    #[tokio::test]
    async fn test_pending_scenario() {
        let h = harness();
        let order = order("token.a");
        h.store.insert(order.clone());
        h.chain.set_found("token.a", snapshot(0));

        let outcome = h.service.process_order(order.id, Utc::now()).await.unwrap();
        assert!(!outcome.finished);

        let stored = h.store.get(order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(stored.phases.get(Phase::Pending).notified);
        assert_eq!(stored.version, order.version + 1);
        assert_eq!(h.store.notifications().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_order_finishes_job() {
        let h = harness();
        let outcome = h
            .service
            .process_order(Uuid::new_v4(), Utc::now())
            .await
            .unwrap();
        assert!(outcome.finished);
        assert_eq!(h.chain.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_finished_order_skips_chain() {
        let h = harness();
        let mut order = order("token.b");
        order.finished = true;
        order.status = OrderStatus::Collected;
        h.store.insert(order.clone());

        let outcome = h.service.process_order(order.id, Utc::now()).await.unwrap();
        assert!(outcome.finished);
        assert_eq!(h.chain.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_state_is_a_no_op() {
        let h = harness();
        let order = order("token.c");
        h.store.insert(order.clone());
        h.chain.set_found("token.c", snapshot(17));

        let outcome = h.service.process_order(order.id, Utc::now()).await.unwrap();
        assert!(!outcome.finished);
        assert_eq!(h.store.get(order.id).unwrap(), order);
        assert!(h.store.notifications().is_empty());
    }

    #[tokio::test]
    async fn test_transient_chain_failure_propagates() {
        let h = harness();
        let order = order("token.d");
        h.store.insert(order.clone());
        h.chain.set_failure("indexer down");

        let err = h
            .service
            .process_order(order.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Chain(_)));
        assert!(err.is_retryable());
        assert_eq!(h.store.get(order.id).unwrap(), order);
    }

    #[tokio::test]
    async fn test_cache_outage_does_not_fail_job() {
        let store = Arc::new(MockOrderStore::new());
        let chain = Arc::new(MockChainReader::new());
        let service = TrackerService::new(
            Arc::clone(&store) as Arc<dyn OrderStore>,
            Arc::clone(&chain) as Arc<dyn ChainReader>,
            Arc::new(MockStatusCache::with_config(MockConfig::failure("redis gone"))),
            Arc::new(MockJobScheduler::new()),
            BackoffPolicy::default(),
        );
        let order = order("token.e");
        store.insert(order.clone());
        chain.set_found("token.e", snapshot(1));

        let outcome = service.process_order(order.id, Utc::now()).await.unwrap();
        assert!(!outcome.finished);
        assert_eq!(store.get(order.id).unwrap().status, OrderStatus::Locking);

        let health = service.health_check().await;
        assert_eq!(health.cache, HealthStatus::Unhealthy);
        assert_eq!(health.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_schedule_stale_orders_skips_fresh_and_finished() {
        let h = harness();
        let now = Utc::now();

        let mut stale = order("token.f");
        stale.scanned_at = now - chrono::Duration::minutes(10);
        let mut fresh = order("token.g");
        fresh.scanned_at = now;
        let mut done = order("token.h");
        done.scanned_at = now - chrono::Duration::minutes(10);
        done.finished = true;
        for o in [&stale, &fresh, &done] {
            h.store.insert(o.clone());
        }

        let scheduled = h
            .service
            .schedule_stale_orders(now, Duration::from_secs(120), 100, Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(scheduled, 1);
        assert_eq!(h.scheduler.scheduled_ids(), vec![stale.id]);
    }

    #[tokio::test]
    async fn test_complete_job_removes_only_finished_schedules() {
        let h = harness();
        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let every = Duration::from_secs(30);
        h.scheduler.upsert_schedule(a, every, now).await.unwrap();
        h.scheduler.upsert_schedule(b, every, now).await.unwrap();

        h.service.complete_job(JobOutcome::finished(a)).await.unwrap();
        h.service.complete_job(JobOutcome::pending(b)).await.unwrap();

        assert_eq!(h.scheduler.scheduled_ids(), vec![b]);
    }

    #[tokio::test]
    async fn test_fail_job_keeps_schedule() {
        let h = harness();
        let id = Uuid::new_v4();
        h.scheduler
            .upsert_schedule(id, Duration::from_secs(30), Utc::now())
            .await
            .unwrap();

        let err = AppError::Internal("boom".to_string());
        h.service.fail_job(id, &err).await.unwrap();

        assert_eq!(h.scheduler.scheduled_ids(), vec![id]);
        assert_eq!(h.scheduler.failures(id), 1);
        assert!(h.cache.is_empty());
    }
}
