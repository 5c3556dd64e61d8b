#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Live Price Service - Price Ingestion and Caching Layer
//!
//! Maintains one push-feed WebSocket session for a configured symbol
//! universe, keeps the latest price per symbol in a bounded in-memory cache,
//! and backfills from a pull-based HTTP source when the feed is down or a
//! symbol has gone stale.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core price types and subscription tracking
//!   - `price`: Price records and the timestamp-wins overwrite rule
//!   - `subscription`: Symbol validation and the subscription set
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Fallback source and price observer interfaces
//!   - `services`: The live price service orchestrator
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `feed`: Push feed WebSocket client and supervisor
//!   - `fallback`: Batched fallback fetcher and HTTP adapter
//!   - `cache`: Bounded LRU price cache
//!   - `hub`: Observer fan-out
//!   - `config`, `health`, `metrics`, `telemetry`, `latency`
//!
//! # Data Flow
//!
//! ```text
//! Push feed WS ──► StreamConnection ──► ingest ──┐
//!                                                ├──► BoundedPriceCache ──► get_price
//! Fallback HTTP ◄── FallbackFetcher ◄── backfill ┘            │
//!                                                             └──► SubscriberHub ──► observers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core price types with no I/O dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::price::{PriceRecord, PriceRecordError, PriceSource};
pub use domain::subscription::{
    DEFAULT_MARKET, Market, SubscriptionChanges, SubscriptionSet, SubscriptionStats, Symbol,
    SymbolError,
};

// Ports and services
pub use application::ports::{FallbackError, FallbackSource, ObserverError, PriceObserver};
pub use application::services::{FeedStatus, LivePriceService, ServiceError, ServiceMetrics};

// Infrastructure config
pub use infrastructure::config::{
    CacheSettings, ConfigError, FallbackSettings, FeedSettings, ServerSettings, ServiceConfig,
    SubscriberSettings,
};

// Adapters
pub use infrastructure::fallback::HttpFallbackSource;
pub use infrastructure::hub::ObserverId;

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
