//! Push Feed Connection
//!
//! One WebSocket session against the push feed. A session walks
//! `Disconnected → Connecting → Subscribing → Active` and ends either
//! `Disconnected` (cancellation, transport failure, server close) or
//! `Faulted` (heartbeat timeout, server error frame). Reconnecting is the
//! supervisor's job; a `StreamConnection` never retries on its own.
//!
//! The write half belongs to a per-session writer task fed by a queue.
//! Control frames from the session loop and pings from the heartbeat manager
//! share that queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::domain::price::PriceRecord;
use crate::domain::subscription::{SubscriptionSet, Symbol};
use crate::infrastructure::config::{ConfigError, FeedSettings};
use crate::infrastructure::metrics::{self, FrameType};

use super::codec::{CodecError, FeedCodec};
use super::health::{ConnectionHealth, ConnectionState};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::messages::{ControlMessage, InboundMessage};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Frames buffered for the writer task.
const OUTBOUND_CAPACITY: usize = 64;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a feed session.
#[derive(Debug, thiserror::Error)]
pub enum StreamConnectionError {
    /// Endpoint could not be built from configuration.
    #[error("invalid feed endpoint: {0}")]
    Config(#[from] ConfigError),

    /// Handshake did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Control message could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// No heartbeat activity within the timeout.
    #[error("heartbeat timeout after {0:?} of silence")]
    HeartbeatTimeout(Duration),

    /// Server sent an error frame.
    #[error("server error: {0}")]
    Server(String),

    /// Server closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Event consumer went away.
    #[error("event channel closed")]
    ChannelClosed,
}

impl StreamConnectionError {
    /// Whether the session failed at the protocol level rather than the
    /// transport level.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::HeartbeatTimeout(_) | Self::Server(_))
    }
}

// =============================================================================
// Requests and Events
// =============================================================================

/// Incremental subscription change for an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Subscribe additional symbols.
    Subscribe(Vec<Symbol>),
    /// Unsubscribe symbols.
    Unsubscribe(Vec<Symbol>),
    /// Replay the whole subscription set.
    ResubscribeAll,
}

/// Output of a feed session.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A decoded trade.
    Price {
        /// Stream-sourced record.
        record: PriceRecord,
        /// When the carrying frame arrived.
        received_at: Instant,
    },
    /// A frame or trade item that could not be decoded.
    DecodeFailed {
        /// Decoder message.
        reason: String,
        /// When the frame arrived.
        received_at: Instant,
    },
}

// =============================================================================
// Stream Connection
// =============================================================================

/// Single push feed session runner.
#[derive(Debug)]
pub struct StreamConnection {
    settings: FeedSettings,
    codec: FeedCodec,
    health: Arc<ConnectionHealth>,
}

impl StreamConnection {
    /// Create a connection reporting into `health`.
    #[must_use]
    pub const fn new(settings: FeedSettings, health: Arc<ConnectionHealth>) -> Self {
        Self {
            settings,
            codec: FeedCodec::new(),
            health,
        }
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.health.state()
    }

    /// Shared health record.
    #[must_use]
    pub const fn health(&self) -> &Arc<ConnectionHealth> {
        &self.health
    }

    /// Run one session until cancellation or failure.
    ///
    /// Replays every symbol in `subscriptions` after connecting, then streams
    /// decoded trades to `events` and applies `control` requests.
    ///
    /// # Errors
    ///
    /// Returns the reason the session ended; `Ok(())` means `cancel` fired.
    pub async fn run(
        &self,
        subscriptions: &SubscriptionSet,
        events: &mpsc::Sender<StreamEvent>,
        control: &mut mpsc::Receiver<ControlRequest>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamConnectionError> {
        let result = self.run_session(subscriptions, events, control, cancel).await;

        let final_state = match &result {
            Err(e) if e.is_protocol() => ConnectionState::Faulted,
            _ => ConnectionState::Disconnected,
        };
        self.health.set_state(final_state);
        metrics::set_feed_connected(false);

        match &result {
            Ok(()) => tracing::info!("Push feed session closed"),
            Err(e) => {
                self.health.record_error(e.to_string());
                tracing::warn!(error = %e, state = %final_state, "Push feed session ended");
            }
        }
        result
    }

    async fn run_session(
        &self,
        subscriptions: &SubscriptionSet,
        events: &mpsc::Sender<StreamEvent>,
        control: &mut mpsc::Receiver<ControlRequest>,
        cancel: &CancellationToken,
    ) -> Result<(), StreamConnectionError> {
        self.health.set_state(ConnectionState::Connecting);
        let url = self.settings.connect_url()?;
        tracing::info!(url = %self.settings.url, "Connecting to push feed");

        let connect = tokio::time::timeout(
            self.settings.connect_timeout,
            tokio_tungstenite::connect_async(url),
        );
        let (ws_stream, _response) = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            result = connect => result
                .map_err(|_| StreamConnectionError::ConnectTimeout(self.settings.connect_timeout))??,
        };
        let (write, mut read) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
        let mut writer = AbortOnDropHandle::new(tokio::spawn(write_frames(write, outbound_rx)));

        // Requests queued before the snapshot below are covered by it.
        while control.try_recv().is_ok() {}

        self.health.set_state(ConnectionState::Subscribing);
        let symbols = subscriptions.symbols();
        if !self
            .send_batched(&outbound, &symbols, ControlMessage::subscribe, cancel)
            .await?
        {
            return Ok(());
        }

        self.health.record_session_established();
        metrics::set_feed_connected(true);
        tracing::info!(symbols = symbols.len(), "Push feed session active");

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(8);
        let heartbeat_cancel = cancel.child_token();
        tokio::spawn(
            HeartbeatManager::new(
                HeartbeatConfig::from_feed_settings(&self.settings),
                heartbeat_state.clone(),
                heartbeat_tx,
                outbound.clone(),
                self.codec.encode(&ControlMessage::Ping)?,
                heartbeat_cancel.clone(),
            )
            .run(),
        );
        let _heartbeat_guard = heartbeat_cancel.drop_guard();

        let mut control_open = true;
        let mut heartbeat_open = true;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
                        if outbound.send(Message::Close(None)).await.is_ok() {
                            let _ = (&mut writer).await;
                        }
                    })
                    .await;
                    return Ok(());
                }
                written = &mut writer => {
                    return Err(match written {
                        Ok(Err(e)) => e.into(),
                        Ok(Ok(())) | Err(_) => StreamConnectionError::ConnectionClosed,
                    });
                }
                request = control.recv(), if control_open => {
                    match request {
                        Some(request) => {
                            self.apply_control(&outbound, request, subscriptions, cancel).await?;
                        }
                        None => control_open = false,
                    }
                }
                event = heartbeat_rx.recv(), if heartbeat_open => {
                    match event {
                        Some(HeartbeatEvent::Missed { consecutive }) => {
                            self.health.set_missed_heartbeats(consecutive);
                        }
                        Some(HeartbeatEvent::Timeout { silent_for }) => {
                            return Err(StreamConnectionError::HeartbeatTimeout(silent_for));
                        }
                        None => heartbeat_open = false,
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_text(text.as_str(), &heartbeat_state, events).await?;
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            self.record_activity(&heartbeat_state);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Push feed sent close frame");
                            return Err(StreamConnectionError::ConnectionClosed);
                        }
                        Some(Ok(Message::Binary(_) | Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(StreamConnectionError::ConnectionClosed),
                    }
                }
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        heartbeat: &HeartbeatState,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), StreamConnectionError> {
        let received_at = Instant::now();

        match self.codec.decode(text) {
            Ok(InboundMessage::Trade(items)) => {
                metrics::record_feed_message(FrameType::Trade);
                let decoded = self.codec.decode_trades(items);
                for reason in decoded.rejected {
                    self.report_decode_failure(reason, received_at, events)
                        .await?;
                }
                for record in decoded.records {
                    events
                        .send(StreamEvent::Price {
                            record,
                            received_at,
                        })
                        .await
                        .map_err(|_| StreamConnectionError::ChannelClosed)?;
                }
            }
            Ok(InboundMessage::Ping | InboundMessage::Pong) => {
                metrics::record_feed_message(FrameType::Heartbeat);
                self.record_activity(heartbeat);
            }
            Ok(InboundMessage::Error(message)) => {
                metrics::record_feed_message(FrameType::Error);
                return Err(StreamConnectionError::Server(message));
            }
            Ok(InboundMessage::Unknown(kind)) => {
                metrics::record_feed_message(FrameType::Unknown);
                tracing::debug!(kind, "Ignoring unknown frame type");
            }
            Err(e) => {
                self.report_decode_failure(e.to_string(), received_at, events)
                    .await?;
            }
        }
        Ok(())
    }

    async fn report_decode_failure(
        &self,
        reason: String,
        received_at: Instant,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), StreamConnectionError> {
        tracing::warn!(reason = %reason, "Skipping undecodable feed data");
        self.health.record_decode_errors(1);
        metrics::record_decode_errors(1);
        events
            .send(StreamEvent::DecodeFailed {
                reason,
                received_at,
            })
            .await
            .map_err(|_| StreamConnectionError::ChannelClosed)
    }

    fn record_activity(&self, heartbeat: &HeartbeatState) {
        heartbeat.record_activity();
        self.health.record_heartbeat();
    }

    async fn apply_control(
        &self,
        outbound: &mpsc::Sender<Message>,
        request: ControlRequest,
        subscriptions: &SubscriptionSet,
        cancel: &CancellationToken,
    ) -> Result<(), StreamConnectionError> {
        match request {
            ControlRequest::Subscribe(symbols) => {
                tracing::debug!(count = symbols.len(), "Subscribing symbols");
                self.send_batched(outbound, &symbols, ControlMessage::subscribe, cancel)
                    .await?;
            }
            ControlRequest::Unsubscribe(symbols) => {
                tracing::debug!(count = symbols.len(), "Unsubscribing symbols");
                self.send_batched(outbound, &symbols, ControlMessage::unsubscribe, cancel)
                    .await?;
            }
            ControlRequest::ResubscribeAll => {
                let symbols = subscriptions.symbols();
                tracing::info!(count = symbols.len(), "Replaying subscription set");
                self.send_batched(outbound, &symbols, ControlMessage::subscribe, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Send `symbols` in batches with a pause between batches.
    ///
    /// Returns `Ok(false)` if cancelled between batches.
    async fn send_batched(
        &self,
        outbound: &mpsc::Sender<Message>,
        symbols: &[Symbol],
        build: fn(&[Symbol]) -> ControlMessage,
        cancel: &CancellationToken,
    ) -> Result<bool, StreamConnectionError> {
        let batch_size = self.settings.subscribe_batch_size.max(1);

        for (index, batch) in symbols.chunks(batch_size).enumerate() {
            if index > 0 {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(false),
                    () = tokio::time::sleep(self.settings.subscribe_batch_delay) => {}
                }
            }
            self.send(outbound, &build(batch)).await?;
        }
        Ok(true)
    }

    async fn send(
        &self,
        outbound: &mpsc::Sender<Message>,
        message: &ControlMessage,
    ) -> Result<(), StreamConnectionError> {
        let text = self.codec.encode(message)?;
        outbound
            .send(Message::text(text))
            .await
            .map_err(|_| StreamConnectionError::ConnectionClosed)
    }
}

/// Sole owner of the write half. Ends after writing a close frame, when every
/// sender is gone, or on the first transport error.
async fn write_frames(
    mut sink: WsSink,
    mut frames: mpsc::Receiver<Message>,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    while let Some(frame) = frames.recv().await {
        let closing = matches!(frame, Message::Close(_));
        sink.send(frame).await?;
        if closing {
            break;
        }
    }
    Ok(())
}
