//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the caching and fan-out machinery
//! the service is built on.

/// Bounded LRU price cache.
pub mod cache;

/// Configuration loading and validation.
pub mod config;

/// Batched fallback fetching and the HTTP fallback adapter.
pub mod fallback;

/// Push feed WebSocket client, heartbeat, reconnect and supervision.
pub mod feed;

/// Health check HTTP endpoint.
pub mod health;

/// Observer fan-out with per-observer bounded queues.
pub mod hub;

/// Rolling latency statistics.
pub mod latency;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
