//! Live Price Service Binary
//!
//! Starts the live price ingestion and caching service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin live-price-service
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `LIVE_PRICES_FALLBACK_URL`: Base URL of the pull-based quote source
//!
//! ## Optional
//! - `LIVE_PRICES_FEED_URL`: Push feed WebSocket URL (unset: fallback only)
//! - `LIVE_PRICES_FEED_TOKEN`: Push feed credential
//! - `LIVE_PRICES_SYMBOLS`: Initial universe, `market=A,B;market2=C`
//! - `LIVE_PRICES_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `OTEL_SERVICE_NAME`: Service name (default: live-price-service)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use live_price_service::infrastructure::health::{HealthServer, HealthServerState};
use live_price_service::infrastructure::telemetry;
use live_price_service::{
    HttpFallbackSource, LivePriceService, ObserverError, PriceObserver, PriceRecord,
    ServiceConfig, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Interval between metrics summaries in the log.
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("rustls crypto provider already installed");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init()?;

    tracing::info!("Starting Live Price Service");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable");
    }

    let config = ServiceConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let source = Arc::new(HttpFallbackSource::new(&config.fallback)?);
    let health_port = config.server.health_port;
    let service = Arc::new(LivePriceService::new(config, source)?);
    service.start().await?;
    service.register_observer(Arc::new(LoggingObserver))?;

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&service),
    ));
    let health_server = HealthServer::new(health_port, health_state, shutdown_token.clone());
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn periodic metrics summary
    let metrics_service = Arc::clone(&service);
    let metrics_shutdown = shutdown_token.clone();
    tokio::spawn(async move {
        log_metrics_periodically(metrics_service, metrics_shutdown).await;
    });

    tracing::info!("Live price service ready");

    await_shutdown(shutdown_token).await;
    service.stop().await;

    tracing::info!("Live price service exited");
    Ok(())
}

/// Logs every accepted price at debug level.
struct LoggingObserver;

#[async_trait]
impl PriceObserver for LoggingObserver {
    async fn on_price(&self, record: &PriceRecord) -> Result<(), ObserverError> {
        tracing::debug!(
            symbol = record.symbol(),
            price = %record.price(),
            source = %record.source(),
            timestamp = record.event_timestamp(),
            "Price update"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

async fn log_metrics_periodically(service: Arc<LivePriceService>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(METRICS_LOG_INTERVAL);
    interval.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let metrics = service.metrics();
                tracing::info!(
                    feed_status = %metrics.feed_status,
                    cached = metrics.cache.size,
                    hit_rate = metrics.cache.hit_rate(),
                    evictions = metrics.cache.eviction_count,
                    subscribed = metrics.subscribed_symbols(),
                    observers = metrics.observers.observer_count,
                    ingest_p95_ms = metrics.ingest_latency.p95_ms,
                    fallback_p95_ms = metrics.fallback_latency.p95_ms,
                    fallback_success_rate = metrics.fallback_latency.success_rate,
                    "Service metrics"
                );
            }
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ServiceConfig) {
    tracing::info!(
        feed = config.feed.is_some(),
        fallback_url = %config.fallback.base_url,
        symbols = config.universe_len(),
        markets = config.universe.len(),
        cache_capacity = config.cache.capacity,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    if let Some(feed) = &config.feed {
        tracing::debug!(
            feed_url = %feed.url,
            max_reconnect_attempts = feed.max_reconnect_attempts,
            heartbeat_interval_secs = feed.heartbeat_interval.as_secs(),
            "Push feed endpoint"
        );
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
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
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
    tracing::info!("Graceful shutdown started");
}
