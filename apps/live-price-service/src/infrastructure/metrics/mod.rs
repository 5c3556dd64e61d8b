//! Prometheus Metrics Module
//!
//! Exposes service metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Feed**: messages received, decode errors, connection state, reconnects
//! - **Cache**: writes by outcome, size, purges
//! - **Fallback**: symbols requested by outcome
//! - **Observers**: dropped updates and deregistrations
//! - **Latency**: ingest processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::cache::SetOutcome;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if the global recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Feed
    describe_counter!(
        "live_prices_feed_messages_total",
        "Total frames received from the push feed by type"
    );
    describe_counter!(
        "live_prices_decode_errors_total",
        "Total frames or trade items that failed to decode"
    );
    describe_gauge!(
        "live_prices_feed_connected",
        "Whether the push feed session is active (1) or not (0)"
    );
    describe_counter!(
        "live_prices_reconnects_total",
        "Total push feed reconnection attempts"
    );

    // Cache
    describe_counter!(
        "live_prices_cache_writes_total",
        "Total cache writes by outcome"
    );
    describe_gauge!("live_prices_cache_size", "Number of cached symbols");
    describe_counter!(
        "live_prices_cache_purged_total",
        "Total entries removed by age purges"
    );

    // Subscriptions
    describe_gauge!(
        "live_prices_subscribed_symbols",
        "Number of symbols in the subscription set"
    );

    // Fallback
    describe_counter!(
        "live_prices_fallback_symbols_total",
        "Total symbols requested from the fallback source by outcome"
    );

    // Observers
    describe_counter!(
        "live_prices_observer_dropped_total",
        "Total updates dropped from full observer queues"
    );
    describe_counter!(
        "live_prices_observer_deregistered_total",
        "Total observers removed after repeated failures"
    );

    // Latency
    describe_histogram!(
        "live_prices_ingest_processing_seconds",
        "Time from frame receipt to cache write and fan-out"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Metric labels for inbound frame types.
#[derive(Debug, Clone, Copy)]
pub enum FrameType {
    /// Trade batch.
    Trade,
    /// Ping or pong.
    Heartbeat,
    /// Server error.
    Error,
    /// Unrecognized type.
    Unknown,
}

impl FrameType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Trade => "trade",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Metric labels for fallback outcomes.
#[derive(Debug, Clone, Copy)]
pub enum FallbackOutcome {
    /// Price returned.
    Success,
    /// Symbol absent from a successful response.
    NotFound,
    /// Request failed or timed out.
    Failed,
}

impl FallbackOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotFound => "not_found",
            Self::Failed => "failed",
        }
    }
}

const fn set_outcome_label(outcome: &SetOutcome) -> &'static str {
    match outcome {
        SetOutcome::Inserted => "inserted",
        SetOutcome::Replaced => "replaced",
        SetOutcome::Evicted { .. } => "evicted",
        SetOutcome::Rejected { .. } => "rejected",
    }
}

/// Record a frame received from the push feed.
pub fn record_feed_message(frame: FrameType) {
    counter!(
        "live_prices_feed_messages_total",
        "frame_type" => frame.as_str()
    )
    .increment(1);
}

/// Record decode failures.
pub fn record_decode_errors(count: u64) {
    counter!("live_prices_decode_errors_total").increment(count);
}

/// Update the feed connection gauge.
pub fn set_feed_connected(connected: bool) {
    gauge!("live_prices_feed_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record a reconnection attempt.
pub fn record_reconnect() {
    counter!("live_prices_reconnects_total").increment(1);
}

/// Record a cache write.
pub fn record_cache_write(outcome: &SetOutcome) {
    counter!(
        "live_prices_cache_writes_total",
        "outcome" => set_outcome_label(outcome)
    )
    .increment(1);
}

/// Update the cache size gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_cache_size(size: usize) {
    gauge!("live_prices_cache_size").set(size as f64);
}

/// Record entries removed by a purge.
pub fn record_cache_purged(count: usize) {
    counter!("live_prices_cache_purged_total").increment(count as u64);
}

/// Update the subscribed symbol gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribed_symbols(count: usize) {
    gauge!("live_prices_subscribed_symbols").set(count as f64);
}

/// Record fallback symbols by outcome.
pub fn record_fallback_symbols(outcome: FallbackOutcome, count: usize) {
    counter!(
        "live_prices_fallback_symbols_total",
        "outcome" => outcome.as_str()
    )
    .increment(count as u64);
}

/// Record updates dropped from an observer queue.
pub fn record_observer_dropped(count: u64) {
    counter!("live_prices_observer_dropped_total").increment(count);
}

/// Record an observer removed after repeated failures.
pub fn record_observer_deregistered() {
    counter!("live_prices_observer_deregistered_total").increment(1);
}

/// Record ingest processing duration.
pub fn record_ingest_duration(duration: Duration) {
    histogram!("live_prices_ingest_processing_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
