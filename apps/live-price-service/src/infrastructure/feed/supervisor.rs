//! Connection Supervisor
//!
//! Owns the push feed session lifecycle: runs `StreamConnection` sessions
//! back to back, waits out the reconnect backoff between them, and declares
//! the feed unavailable once the reconnect budget is spent. While a session
//! runs, the supervisor also checks heartbeat health on its own schedule and
//! periodically replays the subscription set.

use std::sync::Arc;

use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::domain::subscription::SubscriptionSet;
use crate::infrastructure::config::FeedSettings;
use crate::infrastructure::metrics;

use super::connection::{ControlRequest, StreamConnection, StreamEvent};
use super::health::{ConnectionHealth, ConnectionState, HealthSnapshot};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};

/// Supervises the push feed connection.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use live_price_service::domain::subscription::SubscriptionSet;
/// use live_price_service::infrastructure::config::FeedSettings;
/// use live_price_service::infrastructure::feed::ConnectionSupervisor;
/// use tokio::sync::mpsc;
/// use tokio_util::sync::CancellationToken;
///
/// async fn example() {
///     let (control_tx, control_rx) = mpsc::channel(64);
///     let (events_tx, mut events_rx) = mpsc::channel(1024);
///     let supervisor = Arc::new(ConnectionSupervisor::new(
///         FeedSettings::new("wss://feed.example.com/ws"),
///         Arc::new(SubscriptionSet::new()),
///         control_tx,
///     ));
///     let cancel = CancellationToken::new();
///
///     tokio::spawn(Arc::clone(&supervisor).run(events_tx, control_rx, cancel.clone()));
///
///     while let Some(event) = events_rx.recv().await {
///         println!("{event:?}");
///     }
/// }
/// ```
#[derive(Debug)]
pub struct ConnectionSupervisor {
    settings: FeedSettings,
    connection: StreamConnection,
    health: Arc<ConnectionHealth>,
    subscriptions: Arc<SubscriptionSet>,
    control_tx: mpsc::Sender<ControlRequest>,
    resume: Notify,
}

impl ConnectionSupervisor {
    /// Create a supervisor.
    ///
    /// `control_tx` must feed the receiver later passed to `run`; it carries
    /// the periodic full re-subscription.
    #[must_use]
    pub fn new(
        settings: FeedSettings,
        subscriptions: Arc<SubscriptionSet>,
        control_tx: mpsc::Sender<ControlRequest>,
    ) -> Self {
        let health = Arc::new(ConnectionHealth::new());
        Self {
            connection: StreamConnection::new(settings.clone(), Arc::clone(&health)),
            settings,
            health,
            subscriptions,
            control_tx,
            resume: Notify::new(),
        }
    }

    /// Shared connection health.
    #[must_use]
    pub fn health(&self) -> Arc<ConnectionHealth> {
        Arc::clone(&self.health)
    }

    /// Copy of the connection health.
    #[must_use]
    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.health.snapshot()
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether the reconnect budget is exhausted.
    #[must_use]
    pub fn is_feed_unavailable(&self) -> bool {
        self.health.is_feed_unavailable()
    }

    /// Leave the terminal unavailable state and start reconnecting.
    ///
    /// Returns `false` if the feed was not unavailable.
    pub fn resume(&self) -> bool {
        if !self.health.take_feed_unavailable() {
            return false;
        }
        tracing::info!("Resuming push feed after unavailability");
        self.resume.notify_one();
        true
    }

    /// Run sessions until `cancel` fires or `events` has no receiver.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Sender<StreamEvent>,
        mut control: mpsc::Receiver<ControlRequest>,
        cancel: CancellationToken,
    ) {
        let mut policy = ReconnectPolicy::new(ReconnectConfig::from_feed_settings(&self.settings));

        loop {
            if cancel.is_cancelled() || events.is_closed() {
                break;
            }

            let established_before = self.health.established_sessions();
            let session_cancel = cancel.child_token();
            let outcome = self
                .supervise_session(&events, &mut control, &session_cancel)
                .await;

            if cancel.is_cancelled() {
                break;
            }
            if self.health.established_sessions() > established_before {
                policy.reset();
            }
            match outcome {
                Ok(()) => tracing::info!("Push feed session closed by health check"),
                Err(e) => tracing::warn!(error = %e, "Push feed session failed"),
            }

            if let Some(delay) = policy.next_delay() {
                let attempt = policy.attempt_count();
                self.health.set_reconnect_attempts(attempt);
                metrics::record_reconnect();
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Reconnecting to push feed"
                );

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            } else {
                self.health.set_feed_unavailable(true);
                tracing::error!(
                    attempts = policy.attempt_count(),
                    "Push feed unavailable, waiting for resume"
                );

                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = self.resume.notified() => {}
                }
                policy.reset();
                self.health.set_reconnect_attempts(0);
            }
        }

        self.health.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection supervisor stopped");
    }

    /// Drive one session alongside the health check and re-subscription
    /// timers.
    async fn supervise_session(
        &self,
        events: &mpsc::Sender<StreamEvent>,
        control: &mut mpsc::Receiver<ControlRequest>,
        session_cancel: &CancellationToken,
    ) -> Result<(), super::connection::StreamConnectionError> {
        let session = self
            .connection
            .run(&self.subscriptions, events, control, session_cancel);
        tokio::pin!(session);

        let mut health_check = tokio::time::interval_at(
            Instant::now() + self.settings.health_check_interval,
            self.settings.health_check_interval,
        );
        health_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut resubscribe = tokio::time::interval_at(
            Instant::now() + self.settings.resubscribe_interval,
            self.settings.resubscribe_interval,
        );
        resubscribe.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut session => return result,
                _ = health_check.tick() => {
                    let missed = self.health.missed_heartbeats();
                    if self.health.state() == ConnectionState::Active
                        && missed >= self.settings.max_missed_heartbeats
                    {
                        tracing::warn!(
                            missed,
                            max = self.settings.max_missed_heartbeats,
                            "Too many missed heartbeats, forcing reconnect"
                        );
                        self.health.record_error(format!("{missed} missed heartbeats"));
                        session_cancel.cancel();
                    }
                }
                _ = resubscribe.tick() => {
                    if self.health.state() == ConnectionState::Active
                        && self.control_tx.try_send(ControlRequest::ResubscribeAll).is_err()
                    {
                        tracing::debug!("Control queue full, skipping periodic resubscribe");
                    }
                }
            }
        }
    }
}
