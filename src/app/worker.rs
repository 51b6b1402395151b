//! Bounded worker pool running claimed per-order jobs.
//!
//! Each poll claims at most as many due jobs as there are free permits, so the
//! number of in-flight jobs never exceeds `concurrency`. A claimed job holds a
//! lease in the scheduler; the completion or failure callback releases it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::service::TrackerService;
use crate::domain::{AppError, ScheduledJob};

/// Extra lease time on top of the job timeout, so a job that just timed out
/// can still run its failure callback before the row is claimable again.
const LEASE_GRACE: Duration = Duration::from_secs(5);

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often due jobs are claimed
    pub poll_interval: Duration,
    /// Maximum jobs in flight
    pub concurrency: usize,
    /// Per-job deadline
    pub job_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            concurrency: 50,
            job_timeout: Duration::from_secs(60),
        }
    }
}

pub struct WorkerPool {
    service: Arc<TrackerService>,
    config: WorkerConfig,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(service: Arc<TrackerService>, config: WorkerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            service,
            config,
            permits,
            tasks: JoinSet::new(),
        }
    }

    /// Claim due jobs up to the free capacity and start them.
    /// Returns how many jobs were started.
    pub async fn poll_once(&mut self) -> Result<usize, AppError> {
        self.reap();

        let free = self.permits.available_permits();
        if free == 0 {
            debug!("Worker pool saturated");
            return Ok(0);
        }

        let jobs = self
            .service
            .claim_jobs(
                Utc::now(),
                i64::try_from(free).unwrap_or(i64::MAX),
                self.config.job_timeout + LEASE_GRACE,
            )
            .await?;

        let started = jobs.len();
        for job in jobs {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|e| AppError::Internal(e.to_string()))?;
            let service = Arc::clone(&self.service);
            let timeout = self.config.job_timeout;
            self.tasks.spawn(async move {
                run_job(&service, job, timeout).await;
                drop(permit);
            });
        }

        if started > 0 {
            debug!(started, in_flight = self.tasks.len(), "Started jobs");
        }
        Ok(started)
    }

    /// Wait for every in-flight job to finish.
    pub async fn drain(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Job task panicked");
            }
        }
    }

    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Job task panicked");
            }
        }
    }

    /// Poll until the shutdown signal flips to `true`, then let in-flight
    /// jobs finish. No new jobs are claimed after the signal.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = saturating_millis(self.config.poll_interval),
            job_timeout_secs = self.config.job_timeout.as_secs(),
            "Worker pool started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(in_flight = self.tasks.len(), "Worker pool received shutdown signal");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "Failed to claim due jobs");
                    }
                }
            }
        }

        self.drain().await;
        info!("Worker pool stopped");
    }
}

/// Process one claimed job and run its completion or failure callback.
async fn run_job(service: &TrackerService, job: ScheduledJob, timeout: Duration) {
    let order_id = job.order_id;
    debug!(order_id = %order_id, run = job.run, "Running job");

    let result = match tokio::time::timeout(timeout, service.process_order(order_id, Utc::now()))
        .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(order_id = %order_id, timeout_secs = timeout.as_secs(), "Job timed out");
            Err(AppError::Internal(format!(
                "job timed out after {}s",
                timeout.as_secs()
            )))
        }
    };

    let callback = match result {
        Ok(outcome) => service.complete_job(outcome).await,
        Err(e) => service.fail_job(order_id, &e).await,
    };

    if let Err(e) = callback {
        error!(order_id = %order_id, error = %e, "Job callback failed");
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Spawn the worker pool. Send `true` on the returned sender to stop it.
pub fn spawn_worker_pool(
    service: Arc<TrackerService>,
    config: WorkerConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = WorkerPool::new(service, config);
    let handle = tokio::spawn(pool.run(shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturating_millis() {
        assert_eq!(saturating_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(saturating_millis(Duration::MAX), u64::MAX);
    }
    use crate::app::BackoffPolicy;
    use crate::domain::{
        ChainReader, ChainSnapshot, DecodedDatum, JobScheduler, Order, OrderStatus, OrderStore,
        StatusCache, TxInfo, Utxo,
    };
    use crate::test_utils::{MockChainReader, MockJobScheduler, MockOrderStore, MockStatusCache};
    use uuid::Uuid;

    struct Harness {
        store: Arc<MockOrderStore>,
        chain: Arc<MockChainReader>,
        scheduler: Arc<MockJobScheduler>,
        service: Arc<TrackerService>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MockOrderStore::new());
        let chain = Arc::new(MockChainReader::new());
        let scheduler = Arc::new(MockJobScheduler::new());
        let service = Arc::new(TrackerService::new(
            Arc::clone(&store) as Arc<dyn OrderStore>,
            Arc::clone(&chain) as Arc<dyn ChainReader>,
            Arc::new(MockStatusCache::new()) as Arc<dyn StatusCache>,
            Arc::clone(&scheduler) as Arc<dyn JobScheduler>,
            BackoffPolicy::default(),
        ));
        Harness {
            store,
            chain,
            scheduler,
            service,
        }
    }

    fn snapshot(state: i64) -> ChainSnapshot {
        ChainSnapshot {
            utxo: Utxo {
                tx_hash: "tx".to_string(),
                output_index: 0,
                address: "addr".to_string(),
                data_hash: None,
            },
            tx: TxInfo {
                hash: "tx".to_string(),
                block: "b".to_string(),
                block_height: 1,
                block_time: 0,
            },
            metadata: Vec::new(),
            datum: DecodedDatum {
                state,
                delivery: None,
            },
        }
    }

    async fn schedule(h: &Harness, token: &str) -> Order {
        let order = Order::new(
            Uuid::new_v4(),
            token.to_string(),
            Utc::now() + chrono::Duration::hours(1),
        );
        h.store.insert(order.clone());
        h.scheduler
            .upsert_schedule(order.id, Duration::from_secs(30), Utc::now())
            .await
            .unwrap();
        order
    }

    #[tokio::test]
    async fn test_finished_job_removes_schedule() {
        let h = harness();
        let order = schedule(&h, "collected.token").await;
        h.chain.set_found("collected.token", snapshot(4));

        let mut pool = WorkerPool::new(Arc::clone(&h.service), WorkerConfig::default());
        assert_eq!(pool.poll_once().await.unwrap(), 1);
        pool.drain().await;

        assert_eq!(h.store.get(order.id).unwrap().status, OrderStatus::Collected);
        assert!(h.scheduler.scheduled_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unfinished_job_keeps_schedule_and_releases_lease() {
        let h = harness();
        let order = schedule(&h, "shipping.token").await;
        h.chain.set_found("shipping.token", snapshot(2));

        let mut pool = WorkerPool::new(Arc::clone(&h.service), WorkerConfig::default());
        pool.poll_once().await.unwrap();
        pool.drain().await;

        let entry = h.scheduler.schedule(order.id).unwrap();
        assert!(entry.locked_until.is_none());
        assert_eq!(entry.runs, 1);
        assert!(entry.next_run_at > Utc::now());
    }

    #[tokio::test]
    async fn test_failed_job_keeps_schedule_and_counts_failure() {
        let h = harness();
        let order = schedule(&h, "flaky.token").await;
        h.chain.set_failure("502 bad gateway");

        let mut pool = WorkerPool::new(Arc::clone(&h.service), WorkerConfig::default());
        pool.poll_once().await.unwrap();
        pool.drain().await;

        let entry = h.scheduler.schedule(order.id).unwrap();
        assert_eq!(entry.failures, 1);
        assert!(entry.last_error.unwrap().contains("502 bad gateway"));
        assert_eq!(h.store.get(order.id).unwrap().status, OrderStatus::Created);
    }

    #[tokio::test]
    async fn test_claims_never_exceed_concurrency() {
        let h = harness();
        for i in 0..5 {
            schedule(&h, &format!("token.{i}")).await;
        }

        let mut pool = WorkerPool::new(
            Arc::clone(&h.service),
            WorkerConfig {
                concurrency: 2,
                ..WorkerConfig::default()
            },
        );
        assert_eq!(pool.poll_once().await.unwrap(), 2);
        pool.drain().await;
        assert_eq!(pool.poll_once().await.unwrap(), 2);
        pool.drain().await;
        assert_eq!(pool.poll_once().await.unwrap(), 1);
        pool.drain().await;
        // Every schedule has moved to its next interval.
        assert_eq!(pool.poll_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_pool_drains_on_shutdown() {
        let h = harness();
        let order = schedule(&h, "pending.token").await;
        h.chain.set_found("pending.token", snapshot(0));

        let (handle, shutdown_tx) = spawn_worker_pool(
            Arc::clone(&h.service),
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                ..WorkerConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker pool should stop")
            .unwrap();

        assert_eq!(h.store.get(order.id).unwrap().status, OrderStatus::Pending);
        assert_eq!(h.store.notifications().len(), 2);
    }
}
