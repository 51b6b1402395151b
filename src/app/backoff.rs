//! Adaptive polling backoff backed by the status cache.
//!
//! Every processed order records the status it was observed in. When the same
//! status is seen `threshold` times in a row, a `sleep_until` instant is stored
//! and the worker skips chain resolution for that order until it passes. The
//! schedule itself keeps firing; only the job body is skipped.
//!
//! All entries carry a TTL. Losing them only makes polling more frequent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{AppError, OrderStatus, StatusCache};

/// Backoff tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Consecutive observations of one status before the order sleeps
    pub threshold: i64,
    /// Sleep length per tier: index 0 applies at `threshold` occurrences,
    /// index 1 at `threshold + 1`, and the last entry from then on
    pub delays: Vec<Duration>,
    /// TTL of every cache entry written by the backoff
    pub ttl: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            delays: vec![Duration::from_secs(300); 3],
            ttl: Duration::from_secs(3600),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given number of consecutive occurrences, if any.
    pub fn delay_for(&self, occurrences: i64) -> Option<Duration> {
        if occurrences < self.threshold {
            return None;
        }
        let tier = usize::try_from(occurrences - self.threshold).unwrap_or(usize::MAX);
        self.delays
            .get(tier)
            .or_else(|| self.delays.last())
            .copied()
    }
}

/// Status-cache gate in front of the chain reader
#[derive(Clone)]
pub struct AdaptiveBackoff {
    cache: Arc<dyn StatusCache>,
    policy: BackoffPolicy,
}

impl AdaptiveBackoff {
    #[must_use]
    pub fn new(cache: Arc<dyn StatusCache>, policy: BackoffPolicy) -> Self {
        Self { cache, policy }
    }

    fn status_key(order_id: Uuid) -> String {
        format!("order:{order_id}:status")
    }

    fn counter_key(order_id: Uuid, status: OrderStatus) -> String {
        format!("order:{order_id}:{status}:count")
    }

    fn sleep_key(order_id: Uuid) -> String {
        format!("order:{order_id}:sleep_until")
    }

    /// The instant the order may be polled again, when it is still in the future.
    ///
    /// Cache failures read as "no history" so the order gets polled.
    pub async fn sleeping_until(&self, order_id: Uuid, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.stored_sleep(order_id).await {
            Ok(Some(until)) if until > now => Some(until),
            Ok(_) => None,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Backoff gate unavailable, polling anyway");
                None
            }
        }
    }

    /// Record an observed status and return the sleep instant it produced, if any.
    pub async fn record(
        &self,
        order_id: Uuid,
        status: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, AppError> {
        let ttl = self.policy.ttl;
        let status_key = Self::status_key(order_id);
        let counter_key = Self::counter_key(order_id, status);

        let previous = self.cache.get(&status_key).await?;
        if previous.as_deref() != Some(status.as_str()) {
            self.cache.set(&status_key, status.as_str(), ttl).await?;
            self.cache.set(&counter_key, "0", ttl).await?;
            debug!(order_id = %order_id, status = %status, "Fresh status streak");
            return Ok(None);
        }

        // The counter counts repeats, so occurrences are one higher.
        let repeats = self.cache.incr(&counter_key, ttl).await?;
        let occurrences = repeats + 1;
        // Keep the status entry alive for as long as the streak lasts.
        self.cache.set(&status_key, status.as_str(), ttl).await?;

        let Some(delay) = self.policy.delay_for(occurrences) else {
            return Ok(None);
        };

        let candidate = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        // Stored at millisecond precision, so compare and return at that precision too.
        let candidate = truncate_to_millis(candidate);
        let until = match self.stored_sleep(order_id).await? {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };

        self.cache
            .set(
                &Self::sleep_key(order_id),
                &until.timestamp_millis().to_string(),
                ttl,
            )
            .await?;

        debug!(
            order_id = %order_id,
            status = %status,
            occurrences,
            sleep_until = %until,
            "Order backing off"
        );
        Ok(Some(until))
    }

    async fn stored_sleep(&self, order_id: Uuid) -> Result<Option<DateTime<Utc>>, AppError> {
        let raw = self.cache.get(&Self::sleep_key(order_id)).await?;
        Ok(raw
            .and_then(|value| value.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()))
    }
}

fn truncate_to_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(instant.timestamp_millis())
        .single()
        .unwrap_or(instant)
}
