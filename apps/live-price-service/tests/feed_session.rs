//! Push Feed Session Integration Tests
//!
//! Drives `StreamConnection` and `ConnectionSupervisor` against local
//! WebSocket and raw TCP servers.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use live_price_service::infrastructure::feed::{
    ConnectionHealth, ConnectionState, ConnectionSupervisor, ControlRequest, StreamConnection,
    StreamConnectionError, StreamEvent,
};
use live_price_service::{FeedSettings, PriceSource, SubscriptionSet};

fn trade(symbol: &str, price: &str, ts: i64) -> String {
    format!(r#"{{"type":"trade","data":[{{"s":"{symbol}","p":{price},"v":10,"t":{ts}}}]}}"#)
}

fn subscriptions(symbols: &[&str]) -> Arc<SubscriptionSet> {
    let set = SubscriptionSet::new();
    let symbols: Vec<String> = symbols.iter().map(ToString::to_string).collect();
    set.add("us", &symbols);
    Arc::new(set)
}

/// Accept one WebSocket client, forward its first message, send `frames`,
/// then keep reading until the client goes away.
async fn serve_frames(frames: Vec<String>) -> (String, mpsc::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (first_tx, first_rx) = mpsc::channel(4);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        if let Some(Ok(Message::Text(text))) = ws.next().await {
            first_tx.send(text.as_str().to_string()).await.unwrap();
        }
        for frame in frames {
            ws.send(Message::text(frame)).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });

    (format!("ws://{addr}"), first_rx)
}

#[tokio::test]
async fn malformed_frame_is_skipped_and_session_stays_active() {
    let frames = vec![
        trade("AAPL", "101.5", 1_700_000_000_001),
        "this is not json".to_string(),
        trade("MSFT", "402.25", 1_700_000_000_002),
        r#"{"type":"status","msg":"ok"}"#.to_string(),
        trade("AAPL", "101.75", 1_700_000_000_003),
    ];
    let (url, mut first_rx) = serve_frames(frames).await;

    let connection = Arc::new(StreamConnection::new(
        FeedSettings::new(url),
        Arc::new(ConnectionHealth::new()),
    ));
    let subs = subscriptions(&["MSFT", "AAPL"]);
    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (_control_tx, mut control_rx) = mpsc::channel::<ControlRequest>(8);
    let cancel = CancellationToken::new();

    let session = {
        let connection = Arc::clone(&connection);
        let subs = Arc::clone(&subs);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            connection
                .run(&subs, &events_tx, &mut control_rx, &cancel)
                .await
        })
    };

    let subscribe = timeout(Duration::from_secs(2), first_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let subscribe: serde_json::Value = serde_json::from_str(&subscribe).unwrap();
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["symbol"], serde_json::json!(["AAPL", "MSFT"]));

    let mut records = Vec::new();
    let mut decode_failures = 0;
    while records.len() < 3 {
        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            StreamEvent::Price { record, .. } => records.push(record),
            StreamEvent::DecodeFailed { .. } => decode_failures += 1,
        }
    }

    assert_eq!(decode_failures, 1);
    assert_eq!(
        records.iter().map(|r| r.symbol()).collect::<Vec<_>>(),
        vec!["AAPL", "MSFT", "AAPL"]
    );
    assert_eq!(records[1].price(), Decimal::new(40_225, 2));
    assert!(records.iter().all(|r| r.source() == PriceSource::Stream));

    assert_eq!(connection.state(), ConnectionState::Active);
    let health = connection.health().snapshot();
    assert!(health.connected);
    assert_eq!(health.decode_errors, 1);

    cancel.cancel();
    let result = timeout(Duration::from_secs(3), session).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_error_frame_faults_session() {
    let frames = vec![r#"{"type":"error","msg":"invalid token"}"#.to_string()];
    let (url, _first_rx) = serve_frames(frames).await;

    let connection = StreamConnection::new(FeedSettings::new(url), Arc::new(ConnectionHealth::new()));
    let subs = subscriptions(&["AAPL"]);
    let (events_tx, _events_rx) = mpsc::channel(8);
    let (_control_tx, mut control_rx) = mpsc::channel::<ControlRequest>(8);
    let cancel = CancellationToken::new();

    let result = timeout(
        Duration::from_secs(3),
        connection.run(&subs, &events_tx, &mut control_rx, &cancel),
    )
    .await
    .unwrap();

    let err = result.unwrap_err();
    assert!(err.is_protocol());
    assert_eq!(connection.state(), ConnectionState::Faulted);
    assert!(
        connection
            .health()
            .snapshot()
            .last_error
            .unwrap()
            .contains("invalid token")
    );
}

fn fast_reconnect(url: String, max_attempts: u32) -> FeedSettings {
    let mut settings = FeedSettings::new(url);
    settings.reconnect_base = Duration::from_millis(10);
    settings.reconnect_max = Duration::from_millis(40);
    settings.max_reconnect_attempts = max_attempts;
    settings.connect_timeout = Duration::from_secs(1);
    settings
}

#[tokio::test]
async fn exhausted_reconnects_go_terminal_until_resumed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    {
        let accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                accepts.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
    }

    let (control_tx, control_rx) = mpsc::channel(8);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        fast_reconnect(format!("ws://{addr}"), 3),
        subscriptions(&["AAPL"]),
        control_tx,
    ));
    let (events_tx, _events_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&supervisor).run(events_tx, control_rx, cancel.clone()));

    timeout(Duration::from_secs(5), async {
        while !supervisor.is_feed_unavailable() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Initial connect plus three reconnects.
    assert_eq!(accepts.load(Ordering::SeqCst), 4);
    assert_eq!(supervisor.health_snapshot().reconnect_attempts, 3);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), 4);

    assert!(supervisor.resume());
    timeout(Duration::from_secs(5), async {
        while accepts.load(Ordering::SeqCst) < 8 || !supervisor.is_feed_unavailable() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(accepts.load(Ordering::SeqCst), 8);

    cancel.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_replays_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                seen_tx.send(text.as_str().to_string()).await.unwrap();
            }
            let _ = ws.close(None).await;
        }
    });

    let (control_tx, control_rx) = mpsc::channel(8);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        fast_reconnect(format!("ws://{addr}"), 5),
        subscriptions(&["AAPL", "MSFT"]),
        control_tx,
    ));
    let (events_tx, _events_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&supervisor).run(events_tx, control_rx, cancel.clone()));

    for _ in 0..2 {
        let text = timeout(Duration::from_secs(3), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let message: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(message["type"], "subscribe");
        assert_eq!(message["symbol"], serde_json::json!(["AAPL", "MSFT"]));
    }

    assert!(supervisor.health_snapshot().established_sessions >= 2);
    assert!(!supervisor.is_feed_unavailable());

    cancel.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}

/// WebSocket server that accepts every client and reads frames without ever
/// answering a ping.
async fn silent_server() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    {
        let accepts = Arc::clone(&accepts);
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                accepts.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                    while let Some(Ok(_)) = ws.next().await {}
                });
            }
        });
    }
    (format!("ws://{addr}"), accepts)
}

#[tokio::test]
async fn heartbeat_timeout_faults_session() {
    let (url, _accepts) = silent_server().await;
    let mut settings = FeedSettings::new(url);
    settings.heartbeat_interval = Duration::from_millis(50);
    settings.heartbeat_timeout = Duration::from_millis(120);

    let connection = StreamConnection::new(settings, Arc::new(ConnectionHealth::new()));
    let subs = subscriptions(&["AAPL"]);
    let (events_tx, _events_rx) = mpsc::channel(8);
    let (_control_tx, mut control_rx) = mpsc::channel::<ControlRequest>(8);
    let cancel = CancellationToken::new();

    let result = timeout(
        Duration::from_secs(3),
        connection.run(&subs, &events_tx, &mut control_rx, &cancel),
    )
    .await
    .unwrap();

    assert!(matches!(
        result,
        Err(StreamConnectionError::HeartbeatTimeout(_))
    ));
    assert_eq!(connection.state(), ConnectionState::Faulted);
    assert!(!connection.health().snapshot().connected);
}

#[tokio::test]
async fn missed_heartbeats_force_reconnect() {
    let (url, accepts) = silent_server().await;
    let mut settings = fast_reconnect(url, 5);
    settings.heartbeat_interval = Duration::from_millis(30);
    settings.heartbeat_timeout = Duration::from_secs(10);
    settings.max_missed_heartbeats = 2;
    settings.health_check_interval = Duration::from_millis(50);

    let (control_tx, control_rx) = mpsc::channel(8);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        settings,
        subscriptions(&["AAPL"]),
        control_tx,
    ));
    let (events_tx, _events_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&supervisor).run(events_tx, control_rx, cancel.clone()));

    timeout(Duration::from_secs(5), async {
        while supervisor.health_snapshot().established_sessions < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("supervisor never reconnected after missed heartbeats");

    assert!(accepts.load(Ordering::SeqCst) >= 2);
    let health = supervisor.health_snapshot();
    assert!(health.last_error.unwrap().contains("missed heartbeats"));
    assert!(!health.feed_unavailable);

    cancel.cancel();
    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
}
