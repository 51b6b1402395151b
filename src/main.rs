//! Application entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use escrow_settlement_tracker::api::create_router;
use escrow_settlement_tracker::app::{AppState, TrackerService, spawn_scanner, spawn_worker_pool};
use escrow_settlement_tracker::config::{Config, LogFormat};
use escrow_settlement_tracker::domain::StatusCache;
use escrow_settlement_tracker::infra::{
    InMemoryStatusCache, IndexerClient, PgJobScheduler, PostgresClient, RedisStatusCache,
};

const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let config = Config::from_env();
    init_tracing(
        config
            .as_ref()
            .map(|c| c.log_format)
            .unwrap_or_default(),
    );

    info!(
        "🏗️  Escrow Settlement Tracker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = config
        .inspect_err(|e| error!(error = %e, "Invalid configuration"))
        .context("Failed to load configuration")?;

    info!("📦 Initializing infrastructure...");

    let postgres_client = PostgresClient::new(&config.database_url, config.postgres.clone())
        .await
        .context("Failed to connect to PostgreSQL")?;
    postgres_client.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    let scheduler = PgJobScheduler::new(postgres_client.pool().clone());
    info!("   ✓ Job scheduler ready");

    let indexer_url = config.indexer.base_url.clone();
    let has_api_key = config.indexer.api_key.is_some();
    let indexer = IndexerClient::new(config.indexer.clone())?;
    if has_api_key {
        info!("   ✓ Indexer client created ({})", indexer_url);
    } else {
        warn!("   ⚠ Indexer client created without an API key ({})", indexer_url);
    }

    let mut purge_handle = None;
    let cache: Arc<dyn StatusCache> = match &config.redis_url {
        Some(url) => {
            let cache = RedisStatusCache::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            info!("   ✓ Status cache: Redis");
            Arc::new(cache)
        }
        None => {
            let cache = Arc::new(InMemoryStatusCache::new());
            let purged = Arc::clone(&cache);
            purge_handle = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
                loop {
                    ticker.tick().await;
                    purged.purge_expired();
                }
            }));
            info!("   ○ Status cache: in-process (REDIS_URL not set)");
            cache
        }
    };

    let service = Arc::new(TrackerService::new(
        Arc::new(postgres_client),
        Arc::new(indexer),
        cache,
        Arc::new(scheduler),
        config.backoff.clone(),
    ));
    info!(
        "   ✓ Tracker service initialized (backoff threshold: {}, tiers: {:?})",
        config.backoff.threshold, config.backoff.delays
    );

    let (scanner_handle, scanner_shutdown_tx) =
        spawn_scanner(Arc::clone(&service), config.scanner.clone());
    info!(
        "   ✓ Order scanner started (interval: {}s, range: {}s)",
        config.scanner.interval.as_secs(),
        config.scanner.stale_after.as_secs()
    );

    let (worker_handle, worker_shutdown_tx) =
        spawn_worker_pool(Arc::clone(&service), config.worker.clone());
    info!(
        "   ✓ Worker pool started (concurrency: {}, job timeout: {}s)",
        config.worker.concurrency,
        config.worker.job_timeout.as_secs()
    );

    let router = create_router(Arc::new(AppState::new(service)));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("🚀 Health endpoints on http://{}/health", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop taking new work, then let in-flight jobs finish
    let _ = scanner_shutdown_tx.send(true);
    let _ = worker_shutdown_tx.send(true);
    if let Err(e) = scanner_handle.await {
        error!(error = %e, "Scanner task ended abnormally");
    }
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Worker pool task ended abnormally");
    }
    if let Some(handle) = purge_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}
