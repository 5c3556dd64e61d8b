//! Heartbeat Manager
//!
//! Monitors push feed liveness through periodic application-level pings.
//! Each tick with the previous ping still unanswered counts as a missed
//! heartbeat; a tick after more than the configured timeout without any
//! heartbeat activity reports the session as stale.
//!
//! Pings go straight onto the session's outbound frame queue, so a receive
//! loop stalled on ingest backpressure never holds them up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::config::FeedSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence after which the connection is considered stale.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, timeout: Duration) -> Self {
        Self {
            ping_interval,
            timeout,
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &FeedSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            timeout: settings.heartbeat_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// The previous ping went unanswered.
    Missed {
        /// Consecutive unanswered pings.
        consecutive: u32,
    },
    /// No heartbeat activity within the timeout; the session is stale.
    Timeout {
        /// Time since the last activity.
        silent_for: Duration,
    },
}

/// State shared between the heartbeat manager and the receive loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_activity: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
    missed: AtomicU32,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
            missed: AtomicU32::new(0),
        }
    }

    /// Record heartbeat activity (pong, server ping, or WebSocket control frame).
    pub fn record_activity(&self) {
        *self.last_activity.write() = Instant::now();
        self.waiting_for_pong.store(false, Ordering::SeqCst);
        self.missed.store(0, Ordering::SeqCst);
    }

    /// Mark that a ping is outstanding.
    pub fn mark_ping_sent(&self) {
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Check if a ping is outstanding.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Consecutive unanswered pings.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.missed.load(Ordering::SeqCst)
    }

    /// Time since the last heartbeat activity.
    #[must_use]
    pub fn time_since_activity(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    fn record_missed(&self) -> u32 {
        self.missed.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Heartbeat manager that monitors connection liveness.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    outbound: mpsc::Sender<Message>,
    ping_frame: String,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    ///
    /// `ping_frame` is written to `outbound` on every tick.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        outbound: mpsc::Sender<Message>,
        ping_frame: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            outbound,
            ping_frame,
            cancel,
        }
    }

    /// Run until cancelled, the receiver is dropped, or a timeout is reported.
    pub async fn run(self) {
        let start = tokio::time::Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check_and_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Returns `Err(())` when the loop should exit.
    async fn check_and_ping(&self) -> Result<(), ()> {
        let silent_for = self.state.time_since_activity();
        if silent_for > self.config.timeout {
            tracing::warn!(
                silent_ms = u64::try_from(silent_for.as_millis()).unwrap_or(u64::MAX),
                timeout_ms = u64::try_from(self.config.timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat timeout detected"
            );
            let _ = self
                .event_tx
                .send(HeartbeatEvent::Timeout { silent_for })
                .await;
            return Err(());
        }

        if self.state.is_waiting_for_pong() {
            let consecutive = self.state.record_missed();
            tracing::debug!(consecutive, "Heartbeat missed");
            // A full queue only delays the gauge; the count lives in `state`.
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                self.event_tx.try_send(HeartbeatEvent::Missed { consecutive })
            {
                return Err(());
            }
        }

        self.state.mark_ping_sent();
        if self
            .outbound
            .send(Message::text(self.ping_frame.clone()))
            .await
            .is_err()
        {
            tracing::debug!("Outbound queue closed, stopping heartbeat");
            return Err(());
        }

        Ok(())
    }
}
