//! Connection pool behaviour over an in-memory transport.
//!
//! Timer-driven tests run on a paused clock, so backoff and heartbeat
//! schedules are checked exactly without waiting in real time.

mod common;

use common::{init_tracing, MockConnector, Plan, ServerEnd, URL};
use serde_json::{json, Value};
use std::time::Duration;
use switchboard::{
    ChannelMessage, ConnectionPool, ConnectionState, DisconnectReason, HeartbeatPolicy, PoolConfig,
    PoolNotification, SwitchboardError,
};
use tokio::sync::{broadcast, mpsc};

fn config() -> PoolConfig {
    PoolConfig {
        connect_timeout_ms: 500,
        heartbeat_interval_ms: 60_000,
        reconnect_base_delay_ms: 1_000,
        max_reconnect_attempts: 3,
        ..PoolConfig::default()
    }
}

async fn next_matching(
    notes: &mut broadcast::Receiver<PoolNotification>,
    pred: impl Fn(&PoolNotification) -> bool,
) -> PoolNotification {
    loop {
        let note = notes.recv().await.unwrap();
        if pred(&note) {
            return note;
        }
    }
}

async fn connected(notes: &mut broadcast::Receiver<PoolNotification>) {
    next_matching(notes, |n| matches!(n, PoolNotification::Connected { .. })).await;
}

// --- Opening ---

#[tokio::test(start_paused = true)]
async fn test_get_connection_opens_once() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector.clone());

    let (a, b) = tokio::join!(
        pool.get_connection("orders", URL),
        pool.get_connection("orders", URL)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_open() && b.is_open());
    assert_eq!(a.key(), "orders");
    assert_eq!(connector.attempts().len(), 1);

    // Already open: no new attempt
    pool.get_connection("orders", URL).await.unwrap();
    assert_eq!(connector.attempts().len(), 1);
    assert!(servers.recv().await.is_some());

    let status = pool.connection_status("orders").unwrap();
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.url, URL);
    assert_eq!(status.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    init_tracing();
    let (connector, _servers) = MockConnector::new(&[], Plan::Hang);
    let pool = ConnectionPool::with_connector(config(), connector);

    let err = pool.get_connection("orders", URL).await.unwrap_err();
    match err {
        SwitchboardError::ConnectTimeout { channel, timeout_ms } => {
            assert_eq!(channel, "orders");
            assert_eq!(timeout_ms, 500);
        }
        other => panic!("Expected ConnectTimeout, got {:?}", other),
    }
    // The channel keeps trying in the background
    assert_eq!(
        pool.connection_status("orders").unwrap().state,
        ConnectionState::Reconnecting
    );
    pool.close_all();
}

// --- Reconnection ---

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_then_gives_up_once() {
    init_tracing();
    let (connector, _servers) = MockConnector::new(&[], Plan::Refuse);
    let pool = ConnectionPool::with_connector(config(), connector.clone());
    let mut notes = pool.notifications();

    let err = pool.get_connection("orders", URL).await.unwrap_err();
    assert!(matches!(err, SwitchboardError::Transport { .. }));

    let mut scheduled = Vec::new();
    loop {
        match notes.recv().await.unwrap() {
            PoolNotification::Reconnecting {
                attempt, delay_ms, ..
            } => scheduled.push((attempt, delay_ms)),
            PoolNotification::ReconnectFailed { channel, attempts } => {
                assert_eq!(channel, "orders");
                assert_eq!(attempts, 3);
                break;
            }
            _ => {}
        }
    }
    assert_eq!(scheduled, vec![(1, 1_000), (2, 2_000), (3, 4_000)]);

    // Initial attempt plus three retries, spaced d, 2d, 4d
    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<u64> = attempts
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    for (gap, expected) in gaps.iter().zip([1_000u64, 2_000, 4_000]) {
        assert!(*gap >= expected && *gap < expected + 5, "gap {gap}ms, expected {expected}ms");
    }

    // Terminal: nothing further happens
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts().len(), 4);
    assert!(matches!(
        notes.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(
        pool.connection_status("orders").unwrap().state,
        ConnectionState::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_channel_restarts_on_request() {
    let config = PoolConfig {
        max_reconnect_attempts: 0,
        ..config()
    };
    let (connector, _servers) = MockConnector::new(&[Plan::Refuse], Plan::Accept);
    let pool = ConnectionPool::with_connector(config, connector.clone());
    let mut notes = pool.notifications();

    assert!(pool.get_connection("orders", URL).await.is_err());
    next_matching(&mut notes, |n| matches!(n, PoolNotification::ReconnectFailed { .. })).await;
    assert_eq!(
        pool.connection_status("orders").unwrap().state,
        ConnectionState::Failed
    );

    let handle = pool.get_connection("orders", URL).await.unwrap();
    assert!(handle.is_open());
    assert_eq!(connector.attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_reconnects_and_resets_attempts() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector.clone());
    let mut notes = pool.notifications();

    pool.get_connection("orders", URL).await.unwrap();
    let server = servers.recv().await.unwrap();
    connected(&mut notes).await;

    server
        .to_client
        .send(switchboard::TransportFrame::Closed(Some("restart".into())))
        .await
        .unwrap();

    let note = next_matching(&mut notes, |n| {
        matches!(n, PoolNotification::Disconnected { .. })
    })
    .await;
    assert_eq!(
        note,
        PoolNotification::Disconnected {
            channel: "orders".into(),
            reason: DisconnectReason::Remote(Some("restart".into())),
        }
    );
    let note = notes.recv().await.unwrap();
    assert_eq!(
        note,
        PoolNotification::Reconnecting {
            channel: "orders".into(),
            attempt: 1,
            delay_ms: 1_000,
        }
    );

    connected(&mut notes).await;
    let _second = servers.recv().await.unwrap();
    let status = pool.connection_status("orders").unwrap();
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(connector.attempts().len(), 2);
}

// --- Closing ---

#[tokio::test(start_paused = true)]
async fn test_explicit_close_does_not_reconnect() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector.clone());
    let mut notes = pool.notifications();

    pool.get_connection("orders", URL).await.unwrap();
    let mut server = servers.recv().await.unwrap();
    connected(&mut notes).await;

    assert!(pool.close_connection("orders"));
    assert!(!pool.close_connection("orders"));
    assert_eq!(
        notes.recv().await.unwrap(),
        PoolNotification::Disconnected {
            channel: "orders".into(),
            reason: DisconnectReason::Explicit,
        }
    );

    // Transport released
    assert!(server.from_client.recv().await.is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts().len(), 1);
    assert!(pool.connection_status("orders").is_none());
    assert!(!pool.send("orders", &ChannelMessage::new("late")));
}

#[tokio::test(start_paused = true)]
async fn test_last_unsubscribe_closes_channel() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector);
    let mut notes = pool.notifications();

    let first = pool.subscribe("orders", |_| {}, Some(URL)).unwrap();
    let second = pool.subscribe("orders", |_| {}, None).unwrap();
    connected(&mut notes).await;
    let mut server = servers.recv().await.unwrap();
    assert_eq!(pool.connection_status("orders").unwrap().subscribers, 2);

    assert!(first.unsubscribe());
    assert_eq!(pool.connection_status("orders").unwrap().subscribers, 1);

    assert!(second.unsubscribe());
    assert_eq!(
        notes.recv().await.unwrap(),
        PoolNotification::Disconnected {
            channel: "orders".into(),
            reason: DisconnectReason::Idle,
        }
    );
    assert!(pool.connection_status("orders").is_none());
    assert!(server.from_client.recv().await.is_none());
}

// --- Fan-out and sending ---

fn recording(
    tx: mpsc::UnboundedSender<(usize, String)>,
    idx: usize,
) -> impl Fn(&ChannelMessage) + Send + Sync + 'static {
    move |msg: &ChannelMessage| {
        let _ = tx.send((idx, msg.message_type.clone()));
    }
}

async fn take(rx: &mut mpsc::UnboundedReceiver<(usize, String)>, n: usize) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    for _ in 0..n {
        out.push(rx.recv().await.unwrap());
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_to_every_subscriber() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = pool.subscribe("orders", recording(tx.clone(), 0), Some(URL)).unwrap();
    pool.subscribe("orders", recording(tx.clone(), 1), None).unwrap();
    pool.subscribe("orders", recording(tx.clone(), 2), None).unwrap();
    let server = servers.recv().await.unwrap();

    server.push(json!({"type": "order-placed", "data": {"id": 1}})).await;
    let got = take(&mut rx, 3).await;
    assert_eq!(
        got,
        vec![
            (0, "order-placed".to_string()),
            (1, "order-placed".to_string()),
            (2, "order-placed".to_string()),
        ]
    );

    // Removing one subscriber leaves the others untouched
    first.unsubscribe();
    server.push(json!({"type": "order-shipped"})).await;
    let got = take(&mut rx, 2).await;
    assert_eq!(got.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 2]);

    // Pong is consumed by the heartbeat; the next message arrives first
    server.pong().await;
    server.push(json!({"type": "order-cancelled"})).await;
    let got = take(&mut rx, 2).await;
    assert!(got.iter().all(|(_, t)| t == "order-cancelled"));
    assert!(pool.connection_status("orders").unwrap().last_heartbeat.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failing_subscriber_is_isolated() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector);
    let (tx, mut rx) = mpsc::unbounded_channel();

    pool.subscribe("orders", |_| panic!("subscriber bug"), Some(URL))
        .unwrap();
    pool.subscribe("orders", recording(tx.clone(), 1), None).unwrap();
    let server = servers.recv().await.unwrap();

    // Malformed frames are dropped, not fanned out
    server
        .to_client
        .send(switchboard::TransportFrame::Text("not json".into()))
        .await
        .unwrap();
    server.push(json!({"type": "tick"})).await;
    assert_eq!(take(&mut rx, 1).await, vec![(1, "tick".to_string())]);
    assert_eq!(
        pool.connection_status("orders").unwrap().state,
        ConnectionState::Open
    );
}

#[tokio::test(start_paused = true)]
async fn test_send_stamps_and_writes() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector);

    let handle = pool.get_connection("orders", URL).await.unwrap();
    let mut server = servers.recv().await.unwrap();

    assert!(handle.send(&ChannelMessage::new("subscribe").with_data(json!({"topic": "eu"}))));
    let text = server.from_client.recv().await.unwrap();
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "subscribe");
    assert_eq!(value["data"]["topic"], "eu");
    assert!(value["timestamp"].is_string());

    assert!(!pool.send("unknown", &ChannelMessage::new("x")));
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_reaches_open_channels() {
    init_tracing();
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config(), connector);

    pool.get_connection("orders", URL).await.unwrap();
    pool.get_connection("prices", URL).await.unwrap();
    let mut a = servers.recv().await.unwrap();
    let mut b = servers.recv().await.unwrap();

    assert_eq!(pool.broadcast(&ChannelMessage::new("hello")), 2);
    for server in [&mut a, &mut b] {
        let text = server.from_client.recv().await.unwrap();
        assert!(text.contains("\"hello\""));
    }

    let report = pool.health_check();
    assert_eq!(report.total, 2);
    assert_eq!(report.open, 2);
    assert!(report.channels.contains_key("prices"));

    assert_eq!(pool.close_all(), 2);
    assert_eq!(pool.health_check().total, 0);
}

// --- Heartbeat ---

async fn next_ping(server: &mut ServerEnd) -> Value {
    loop {
        let text = server.from_client.recv().await.unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        if value["type"] == "ping" {
            return value;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_observe_reports_and_recovers() {
    let config = PoolConfig {
        heartbeat_interval_ms: 1_000,
        ..config()
    };
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config, connector);
    let mut notes = pool.notifications();

    pool.get_connection("orders", URL).await.unwrap();
    let mut server = servers.recv().await.unwrap();

    next_ping(&mut server).await;
    let note = next_matching(&mut notes, |n| {
        matches!(n, PoolNotification::HeartbeatMissed { .. })
    })
    .await;
    assert_eq!(
        note,
        PoolNotification::HeartbeatMissed {
            channel: "orders".into(),
            missed: 1,
        }
    );
    assert_eq!(pool.connection_status("orders").unwrap().missed_heartbeats, 1);

    // Answer the next probe; the miss counter resets and the channel stays open
    next_ping(&mut server).await;
    server.pong().await;
    next_ping(&mut server).await;
    let status = pool.connection_status("orders").unwrap();
    assert_eq!(status.state, ConnectionState::Open);
    assert_eq!(status.missed_heartbeats, 0);
    assert!(status.last_heartbeat.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_close_after_misses() {
    let config = PoolConfig {
        heartbeat_interval_ms: 1_000,
        heartbeat_policy: HeartbeatPolicy::CloseAfter(2),
        ..config()
    };
    let (connector, mut servers) = MockConnector::accepting();
    let pool = ConnectionPool::with_connector(config, connector.clone());
    let mut notes = pool.notifications();

    pool.get_connection("orders", URL).await.unwrap();
    let _server = servers.recv().await.unwrap();

    let note = next_matching(&mut notes, |n| {
        matches!(n, PoolNotification::Disconnected { .. })
    })
    .await;
    assert_eq!(
        note,
        PoolNotification::Disconnected {
            channel: "orders".into(),
            reason: DisconnectReason::HeartbeatTimeout,
        }
    );
    assert!(matches!(
        notes.recv().await.unwrap(),
        PoolNotification::Reconnecting { attempt: 1, .. }
    ));
    connected(&mut notes).await;
    assert_eq!(connector.attempts().len(), 2);
    pool.close_all();
}
