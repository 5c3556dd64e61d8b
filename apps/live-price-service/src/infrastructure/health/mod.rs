//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, service status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status with the full service metrics
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (service running with a price source)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{FeedStatus, LivePriceService, ServiceMetrics};
use crate::infrastructure::metrics::get_metrics_handle;

/// Fallback success rate below which the service reports degraded.
const MIN_FALLBACK_SUCCESS_RATE: f64 = 0.5;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Full service metrics.
    pub service: ServiceMetrics,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Prices flowing from the configured sources.
    Healthy,
    /// Serving, but the push feed is down or the fallback is failing.
    Degraded,
    /// Not serving prices.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    service: Arc<LivePriceService>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, service: Arc<LivePriceService>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            service,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let metrics = state.service.metrics();

    let has_source = matches!(
        metrics.feed_status,
        FeedStatus::Active | FeedStatus::Disabled
    ) || metrics.cache.size > 0;

    if metrics.running && has_source {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let service = state.service.metrics();

    HealthResponse {
        status: determine_health_status(&service),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        service,
    }
}

fn determine_health_status(metrics: &ServiceMetrics) -> HealthStatus {
    if !metrics.running {
        return HealthStatus::Unhealthy;
    }

    match metrics.feed_status {
        FeedStatus::Active | FeedStatus::Disabled => {
            if metrics.fallback_latency.success_rate < MIN_FALLBACK_SUCCESS_RATE {
                HealthStatus::Degraded
            } else {
                HealthStatus::Healthy
            }
        }
        FeedStatus::Connecting | FeedStatus::Reconnecting => HealthStatus::Degraded,
        FeedStatus::Unavailable => {
            if metrics.cache.size > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::MockFallbackSource;
    use crate::infrastructure::config::ServiceConfig;

    fn service() -> Arc<LivePriceService> {
        let config = ServiceConfig::new("http://localhost:9");
        Arc::new(LivePriceService::new(config, Arc::new(MockFallbackSource::new())).unwrap())
    }

    fn state(service: Arc<LivePriceService>) -> Arc<HealthServerState> {
        Arc::new(HealthServerState::new("0.1.0".to_string(), service))
    }

    async fn get(state: Arc<HealthServerState>, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn stopped_service_is_unhealthy() {
        let metrics = service().metrics();
        assert_eq!(determine_health_status(&metrics), HealthStatus::Unhealthy);
    }

    #[test]
    fn feed_status_drives_health() {
        let mut metrics = service().metrics();
        metrics.running = true;

        metrics.feed_status = FeedStatus::Disabled;
        assert_eq!(determine_health_status(&metrics), HealthStatus::Healthy);

        metrics.feed_status = FeedStatus::Reconnecting;
        assert_eq!(determine_health_status(&metrics), HealthStatus::Degraded);

        metrics.feed_status = FeedStatus::Unavailable;
        assert_eq!(determine_health_status(&metrics), HealthStatus::Unhealthy);

        metrics.cache.size = 3;
        assert_eq!(determine_health_status(&metrics), HealthStatus::Degraded);
    }

    #[test]
    fn failing_fallback_degrades() {
        let mut metrics = service().metrics();
        metrics.running = true;
        metrics.feed_status = FeedStatus::Active;
        metrics.fallback_latency.success_rate = 0.2;
        assert_eq!(determine_health_status(&metrics), HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let (status, body) = get(state(service()), "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn health_reports_service_metrics() {
        let service = service();
        service.start().await.unwrap();

        let (status, body) = get(state(Arc::clone(&service)), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"]["feed_status"], "disabled");
        assert_eq!(json["service"]["running"], true);

        let (status, body) = get(state(Arc::clone(&service)), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "READY");

        service.stop().await;
        let (status, _) = get(state(service), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
