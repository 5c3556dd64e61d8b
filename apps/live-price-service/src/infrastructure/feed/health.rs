//! Connection Health
//!
//! Shared, mutex-guarded view of the push feed session: lifecycle state,
//! heartbeat bookkeeping, reconnect attempts and error counters. Written by
//! the connection and supervisor, read by the service and health endpoint.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle state of one feed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session.
    #[default]
    Disconnected,
    /// WebSocket handshake in progress.
    Connecting,
    /// Replaying the subscription set.
    Subscribing,
    /// Streaming.
    Active,
    /// Session ended on a protocol failure.
    Faulted,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Faulted => "faulted",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Health Snapshot
// =============================================================================

/// Point-in-time copy of the connection health.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    /// Session state.
    pub state: ConnectionState,
    /// Whether the session is streaming.
    pub connected: bool,
    /// Last heartbeat activity.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Consecutive unanswered heartbeats in the current session.
    pub missed_heartbeats: u32,
    /// Cumulative session errors.
    pub error_count: u64,
    /// Consecutive failed reconnects.
    pub reconnect_attempts: u32,
    /// Reconnects exhausted; waiting for a manual resume.
    pub feed_unavailable: bool,
    /// Sessions that reached `Active`.
    pub established_sessions: u64,
    /// Frames or items that failed to decode.
    pub decode_errors: u64,
    /// Most recent session error.
    pub last_error: Option<String>,
}

// =============================================================================
// Connection Health
// =============================================================================

/// Thread-safe connection health record.
#[derive(Debug, Default)]
pub struct ConnectionHealth {
    inner: Mutex<HealthSnapshot>,
}

impl ConnectionHealth {
    /// Create a record in the `Disconnected` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition the session state.
    pub fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.connected = state == ConnectionState::Active;
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Record a session reaching `Active`.
    ///
    /// Clears missed heartbeats and reconnect attempts.
    pub fn record_session_established(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Active;
        inner.connected = true;
        inner.established_sessions += 1;
        inner.missed_heartbeats = 0;
        inner.reconnect_attempts = 0;
        inner.feed_unavailable = false;
        inner.last_heartbeat = Some(Utc::now());
    }

    /// Record heartbeat activity.
    pub fn record_heartbeat(&self) {
        let mut inner = self.inner.lock();
        inner.last_heartbeat = Some(Utc::now());
        inner.missed_heartbeats = 0;
    }

    /// Mirror the consecutive missed heartbeat count.
    pub fn set_missed_heartbeats(&self, missed: u32) {
        self.inner.lock().missed_heartbeats = missed;
    }

    /// Consecutive missed heartbeats.
    #[must_use]
    pub fn missed_heartbeats(&self) -> u32 {
        self.inner.lock().missed_heartbeats
    }

    /// Record a session error.
    pub fn record_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.error_count += 1;
        inner.last_error = Some(message.into());
    }

    /// Record decode failures.
    pub fn record_decode_errors(&self, count: u64) {
        self.inner.lock().decode_errors += count;
    }

    /// Mirror the reconnect attempt counter.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.inner.lock().reconnect_attempts = attempts;
    }

    /// Flag or clear terminal feed unavailability.
    pub fn set_feed_unavailable(&self, unavailable: bool) {
        self.inner.lock().feed_unavailable = unavailable;
    }

    /// Clear terminal unavailability.
    ///
    /// Returns `false` if the feed was not unavailable.
    pub fn take_feed_unavailable(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.feed_unavailable, false)
    }

    /// Whether reconnects have been exhausted.
    #[must_use]
    pub fn is_feed_unavailable(&self) -> bool {
        self.inner.lock().feed_unavailable
    }

    /// Sessions that reached `Active`.
    #[must_use]
    pub fn established_sessions(&self) -> u64 {
        self.inner.lock().established_sessions
    }

    /// Copy the current health.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let health = ConnectionHealth::new();
        let snapshot = health.snapshot();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert!(!snapshot.connected);
        assert!(snapshot.last_heartbeat.is_none());
    }

    #[test]
    fn take_feed_unavailable_clears_once() {
        let health = ConnectionHealth::new();
        assert!(!health.take_feed_unavailable());
        health.set_feed_unavailable(true);
        assert!(health.take_feed_unavailable());
        assert!(!health.take_feed_unavailable());
        assert!(!health.is_feed_unavailable());
    }

    #[test]
    fn connected_tracks_active_state() {
        let health = ConnectionHealth::new();
        health.set_state(ConnectionState::Connecting);
        assert!(!health.snapshot().connected);
        health.set_state(ConnectionState::Active);
        assert!(health.snapshot().connected);
        health.set_state(ConnectionState::Faulted);
        assert!(!health.snapshot().connected);
    }

    #[test]
    fn established_session_resets_counters() {
        let health = ConnectionHealth::new();
        health.set_missed_heartbeats(2);
        health.set_reconnect_attempts(4);
        health.set_feed_unavailable(true);

        health.record_session_established();

        let snapshot = health.snapshot();
        assert_eq!(snapshot.missed_heartbeats, 0);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(!snapshot.feed_unavailable);
        assert_eq!(snapshot.established_sessions, 1);
        assert!(snapshot.last_heartbeat.is_some());
    }

    #[test]
    fn errors_accumulate() {
        let health = ConnectionHealth::new();
        health.record_error("first");
        health.record_error("second");
        health.record_decode_errors(3);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.error_count, 2);
        assert_eq!(snapshot.last_error.as_deref(), Some("second"));
        assert_eq!(snapshot.decode_errors, 3);
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Subscribing).unwrap();
        assert_eq!(json, "\"subscribing\"");
    }
}
