//! Scanner loop: keeps a recurring schedule alive for every stale, unfinished order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use super::service::TrackerService;
use crate::domain::AppError;

/// Scanner loop configuration
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Time between scans
    pub interval: Duration,
    /// Orders whose `scanned_at` is older than this are considered stale
    pub stale_after: Duration,
    /// Maximum orders per scan
    pub batch_size: i64,
    /// Repeat interval of the per-order schedule
    pub job_every: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(120),
            batch_size: 100,
            job_every: Duration::from_secs(30),
        }
    }
}

pub struct OrderScanner {
    service: Arc<TrackerService>,
    config: ScannerConfig,
}

impl OrderScanner {
    #[must_use]
    pub fn new(service: Arc<TrackerService>, config: ScannerConfig) -> Self {
        Self { service, config }
    }

    /// Run one scan. Returns how many schedules were upserted.
    pub async fn scan_once(&self) -> Result<usize, AppError> {
        self.service
            .schedule_stale_orders(
                Utc::now(),
                self.config.stale_after,
                self.config.batch_size,
                self.config.job_every,
            )
            .await
    }

    /// Scan on every tick until the shutdown signal flips to `true`.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            batch_size = self.config.batch_size,
            "Order scanner started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Order scanner received shutdown signal");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    // A failed scan only loses this iteration.
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "Order scan failed");
                    }
                }
            }
        }

        info!("Order scanner stopped");
    }
}

/// Spawn the scanner loop. Send `true` on the returned sender to stop it.
pub fn spawn_scanner(
    service: Arc<TrackerService>,
    config: ScannerConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scanner = OrderScanner::new(service, config);
    let handle = tokio::spawn(scanner.run(shutdown_rx));
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::BackoffPolicy;
    use crate::domain::{ChainReader, JobScheduler, Order, OrderStore, StatusCache};
    use crate::test_utils::{
        MockChainReader, MockConfig, MockJobScheduler, MockOrderStore, MockStatusCache,
    };
    use uuid::Uuid;

    fn service(
        store: Arc<MockOrderStore>,
        scheduler: Arc<MockJobScheduler>,
    ) -> Arc<TrackerService> {
        Arc::new(TrackerService::new(
            store as Arc<dyn OrderStore>,
            Arc::new(MockChainReader::new()) as Arc<dyn ChainReader>,
            Arc::new(MockStatusCache::new()) as Arc<dyn StatusCache>,
            scheduler as Arc<dyn JobScheduler>,
            BackoffPolicy::default(),
        ))
    }

    fn stale_order() -> Order {
        let mut order = Order::new(
            Uuid::new_v4(),
            "token".to_string(),
            Utc::now() + chrono::Duration::hours(1),
        );
        order.scanned_at = Utc::now() - chrono::Duration::hours(1);
        order
    }

    #[tokio::test]
    async fn test_scan_respects_batch_size_oldest_first() {
        let store = Arc::new(MockOrderStore::new());
        let scheduler = Arc::new(MockJobScheduler::new());
        let mut oldest = stale_order();
        oldest.scanned_at -= chrono::Duration::hours(5);
        store.insert(oldest.clone());
        store.insert(stale_order());
        store.insert(stale_order());

        let scanner = OrderScanner::new(
            service(Arc::clone(&store), Arc::clone(&scheduler)),
            ScannerConfig {
                batch_size: 1,
                ..ScannerConfig::default()
            },
        );

        assert_eq!(scanner.scan_once().await.unwrap(), 1);
        assert_eq!(scheduler.scheduled_ids(), vec![oldest.id]);
    }

    #[tokio::test]
    async fn test_rescan_does_not_duplicate_or_reset_schedule() {
        let store = Arc::new(MockOrderStore::new());
        let scheduler = Arc::new(MockJobScheduler::new());
        let order = stale_order();
        store.insert(order.clone());

        let scanner = OrderScanner::new(
            service(Arc::clone(&store), Arc::clone(&scheduler)),
            ScannerConfig::default(),
        );

        scanner.scan_once().await.unwrap();
        let first = scheduler.schedule(order.id).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        scanner.scan_once().await.unwrap();
        let second = scheduler.schedule(order.id).unwrap();

        assert_eq!(scheduler.scheduled_ids(), vec![order.id]);
        assert_eq!(first.next_run_at, second.next_run_at);
    }

    #[tokio::test]
    async fn test_scan_failure_is_reported_not_fatal() {
        let store = Arc::new(MockOrderStore::failing("db down"));
        let scheduler = Arc::new(MockJobScheduler::new());
        let scanner = OrderScanner::new(
            service(store, Arc::clone(&scheduler)),
            ScannerConfig::default(),
        );

        assert!(scanner.scan_once().await.is_err());
        assert!(scheduler.scheduled_ids().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_failures_do_not_abort_batch() {
        let store = Arc::new(MockOrderStore::new());
        store.insert(stale_order());
        store.insert(stale_order());
        let scheduler = Arc::new(MockJobScheduler::with_config(MockConfig::failure(
            "scheduler down",
        )));
        let scanner = OrderScanner::new(service(store, scheduler), ScannerConfig::default());

        assert_eq!(scanner.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_scanner_stops_on_shutdown() {
        let store = Arc::new(MockOrderStore::new());
        let scheduler = Arc::new(MockJobScheduler::new());
        let order = stale_order();
        store.insert(order.clone());

        let (handle, shutdown_tx) = spawn_scanner(
            service(store, Arc::clone(&scheduler)),
            ScannerConfig {
                interval: Duration::from_millis(10),
                ..ScannerConfig::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scanner should stop")
            .unwrap();

        assert_eq!(scheduler.scheduled_ids(), vec![order.id]);
    }
}
