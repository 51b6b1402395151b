//! Environment configuration.
//!
//! Everything is read once at startup. A missing required key or a value that
//! does not parse is a [`ConfigError`] and the process must not start.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::app::{BackoffPolicy, ScannerConfig, WorkerConfig};
use crate::domain::ConfigError;
use crate::infra::{IndexerConfig, PostgresConfig};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("expected `text` or `json`, got `{other}`")),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub postgres: PostgresConfig,
    pub indexer: IndexerConfig,
    /// Absent means the in-process cache
    pub redis_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub scanner: ScannerConfig,
    pub worker: WorkerConfig,
    pub backoff: BackoffPolicy,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.required("DATABASE_URL")?;

        let mut indexer = IndexerConfig::new(env.required("INDEXER_URL")?);
        indexer.api_key = env.optional("INDEXER_API_KEY").map(SecretString::from);
        indexer.timeout = Duration::from_secs(env.parse("INDEXER_TIMEOUT_SECS", 10)?);

        let postgres = PostgresConfig {
            event_source: env
                .optional("NOTIFICATION_SOURCE")
                .unwrap_or_else(|| "settlement-tracker".to_string()),
            ..PostgresConfig::default()
        };

        let scan_interval: u64 = env.parse("SCAN_INTERVAL_SECS", 60)?;
        let scan_range: u64 = env.parse("SCAN_RANGE_SECS", 120)?;
        let scan_batch_size: i64 = env.parse("SCAN_BATCH_SIZE", 100)?;
        let job_repeat: u64 = env.parse("JOB_REPEAT_SECS", 30)?;

        positive("SCAN_INTERVAL_SECS", scan_interval)?;
        positive("JOB_REPEAT_SECS", job_repeat)?;
        if scan_batch_size < 1 {
            return Err(invalid("SCAN_BATCH_SIZE", "must be at least 1"));
        }
        // A shorter scan range would re-upsert schedules faster than they fire.
        if scan_range < job_repeat {
            return Err(invalid(
                "SCAN_RANGE_SECS",
                format!("must be at least JOB_REPEAT_SECS ({job_repeat})"),
            ));
        }

        let concurrency: usize = env.parse("WORKER_CONCURRENCY", 50)?;
        if concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY", "must be greater than 0"));
        }
        let poll_interval_ms: u64 = env.parse("WORKER_POLL_INTERVAL_MS", 1000)?;
        positive("WORKER_POLL_INTERVAL_MS", poll_interval_ms)?;
        let job_timeout: u64 = env.parse("JOB_TIMEOUT_SECS", 60)?;
        positive("JOB_TIMEOUT_SECS", job_timeout)?;

        let threshold: i64 = env.parse("BACKOFF_THRESHOLD", 3)?;
        if threshold < 1 {
            return Err(invalid("BACKOFF_THRESHOLD", "must be at least 1"));
        }
        let delays = parse_delays(
            &env.optional("BACKOFF_DELAYS_SECS")
                .unwrap_or_else(|| "300,300,300".to_string()),
        )?;
        let backoff_ttl: u64 = env.parse("BACKOFF_TTL_SECS", 3600)?;
        positive("BACKOFF_TTL_SECS", backoff_ttl)?;

        Ok(Self {
            database_url,
            postgres,
            indexer,
            redis_url: env.optional("REDIS_URL"),
            host: env
                .optional("HOST")
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env.parse("PORT", 3000)?,
            scanner: ScannerConfig {
                interval: Duration::from_secs(scan_interval),
                stale_after: Duration::from_secs(scan_range),
                batch_size: scan_batch_size,
                job_every: Duration::from_secs(job_repeat),
            },
            worker: WorkerConfig {
                poll_interval: Duration::from_millis(poll_interval_ms),
                concurrency,
                job_timeout: Duration::from_secs(job_timeout),
            },
            backoff: BackoffPolicy {
                threshold,
                delays,
                ttl: Duration::from_secs(backoff_ttl),
            },
            log_format: env.parse("LOG_FORMAT", LogFormat::Text)?,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Value of `key`; empty strings count as unset.
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| invalid(key, e.to_string())),
            None => Ok(default),
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        message: message.into(),
    }
}

fn positive(key: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(key, "must be greater than 0"));
    }
    Ok(())
}

/// Comma-separated, non-empty, non-decreasing list of seconds.
fn parse_delays(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    const KEY: &str = "BACKOFF_DELAYS_SECS";

    let secs = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u64>()
                .map_err(|e| invalid(KEY, format!("`{s}`: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if secs.is_empty() {
        return Err(invalid(KEY, "at least one delay is required"));
    }
    if secs.windows(2).any(|w| w[1] < w[0]) {
        return Err(invalid(KEY, "delays must not decrease"));
    }
    Ok(secs.into_iter().map(Duration::from_secs).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/tracker"),
        ("INDEXER_URL", "http://indexer:3000/api/v0"),
    ];

    fn with(extra: &[(&'static str, &'static str)]) -> Result<Config, ConfigError> {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(extra);
        load(&pairs)
    }

    #[test]
    fn test_defaults() {
        let config = with(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.host, "0.0.0.0");
        assert!(config.redis_url.is_none());
        assert!(config.indexer.api_key.is_none());
        assert_eq!(config.indexer.timeout, Duration::from_secs(10));
        assert_eq!(config.scanner.interval, Duration::from_secs(60));
        assert_eq!(config.scanner.stale_after, Duration::from_secs(120));
        assert_eq!(config.scanner.batch_size, 100);
        assert_eq!(config.scanner.job_every, Duration::from_secs(30));
        assert_eq!(config.worker.concurrency, 50);
        assert_eq!(config.backoff, BackoffPolicy::default());
        assert_eq!(config.postgres.event_source, "settlement-tracker");
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_missing_required_keys() {
        let err = load(&[("INDEXER_URL", "http://indexer")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL".to_string()));

        let err = load(&[("DATABASE_URL", "postgres://x"), ("INDEXER_URL", "  ")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("INDEXER_URL".to_string()));
    }

    #[test]
    fn test_unparsable_value_is_invalid() {
        let err = with(&[("PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "PORT"));
    }

    #[test]
    fn test_scan_range_must_cover_job_interval() {
        let err = with(&[("SCAN_RANGE_SECS", "10"), ("JOB_REPEAT_SECS", "30")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "SCAN_RANGE_SECS"));
        assert!(with(&[("SCAN_RANGE_SECS", "30"), ("JOB_REPEAT_SECS", "30")]).is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        assert!(with(&[("WORKER_CONCURRENCY", "0")]).is_err());
    }

    #[test]
    fn test_backoff_settings() {
        let config = with(&[
            ("BACKOFF_THRESHOLD", "2"),
            ("BACKOFF_DELAYS_SECS", "60, 120,600"),
            ("BACKOFF_TTL_SECS", "900"),
        ])
        .unwrap();
        assert_eq!(config.backoff.threshold, 2);
        assert_eq!(
            config.backoff.delays,
            vec![
                Duration::from_secs(60),
                Duration::from_secs(120),
                Duration::from_secs(600)
            ]
        );
        assert_eq!(config.backoff.ttl, Duration::from_secs(900));

        assert!(with(&[("BACKOFF_THRESHOLD", "0")]).is_err());
        assert!(with(&[("BACKOFF_DELAYS_SECS", "600,60")]).is_err());
        assert!(with(&[("BACKOFF_DELAYS_SECS", ",")]).is_err());
    }

    #[test]
    fn test_optional_integrations() {
        let config = with(&[
            ("REDIS_URL", "redis://cache:6379"),
            ("INDEXER_API_KEY", "mainnetXYZ"),
            ("NOTIFICATION_SOURCE", "escrow-prod"),
            ("LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(
            config.indexer.api_key.as_ref().map(|k| k.expose_secret().to_string()),
            Some("mainnetXYZ".to_string())
        );
        assert_eq!(config.postgres.event_source, "escrow-prod");
        assert_eq!(config.log_format, LogFormat::Json);

        assert!(with(&[("LOG_FORMAT", "yaml")]).is_err());
    }
}
