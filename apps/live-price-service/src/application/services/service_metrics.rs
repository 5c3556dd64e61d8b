//! Service metrics snapshot.

use serde::Serialize;

use crate::domain::subscription::SubscriptionStats;
use crate::infrastructure::cache::CacheStats;
use crate::infrastructure::feed::{ConnectionState, HealthSnapshot};
use crate::infrastructure::hub::HubStats;
use crate::infrastructure::latency::LatencySnapshot;

/// Coarse push feed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    /// No push feed configured.
    Disabled,
    /// First session not yet established.
    Connecting,
    /// Session streaming.
    Active,
    /// Between sessions, backing off.
    Reconnecting,
    /// Reconnect budget exhausted; waiting for `resume_feed`.
    Unavailable,
}

impl FeedStatus {
    /// Derive the status from a connection health snapshot.
    #[must_use]
    pub const fn from_health(health: Option<&HealthSnapshot>) -> Self {
        let Some(health) = health else {
            return Self::Disabled;
        };
        if health.feed_unavailable {
            return Self::Unavailable;
        }
        if matches!(health.state, ConnectionState::Active) {
            return Self::Active;
        }
        if health.established_sessions == 0 && health.reconnect_attempts == 0 {
            Self::Connecting
        } else {
            Self::Reconnecting
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Unavailable => "unavailable",
        }
    }
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    /// Whether `start` has run and `stop` has not.
    pub running: bool,
    /// Coarse push feed status.
    pub feed_status: FeedStatus,
    /// Connection detail, absent when no feed is configured.
    pub connection: Option<HealthSnapshot>,
    /// Ingest latency from frame arrival to cache write.
    pub ingest_latency: LatencySnapshot,
    /// Fallback request latency.
    pub fallback_latency: LatencySnapshot,
    /// Cache statistics.
    pub cache: CacheStats,
    /// Observer fan-out statistics.
    pub observers: HubStats,
    /// Subscribed symbols per market.
    pub subscriptions: SubscriptionStats,
}

impl ServiceMetrics {
    /// Number of subscribed symbols.
    #[must_use]
    pub const fn subscribed_symbols(&self) -> usize {
        self.subscriptions.total_symbols
    }
}
