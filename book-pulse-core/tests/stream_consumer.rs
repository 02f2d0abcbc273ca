//! Drives the stream consumer against an in-process venue

use book_pulse_core::{
    ConnectionState, EngineConfig, HealthState, OrderBookEngine, ReconnectPolicy, Rejection, Symbol,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing_subscriber::EnvFilter;

const CLOSED: &str = "<closed>";

enum Outgoing {
    Text(String),
    Ping(Vec<u8>),
    Close,
}

/// Minimal venue: records client text frames, sends whatever the test queues.
struct MockVenue {
    endpoint: String,
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    connections: Arc<AtomicUsize>,
    keepalives: Arc<AtomicUsize>,
    refusing: Arc<AtomicBool>,
}

impl MockVenue {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let outbound_rx = Arc::new(Mutex::new(outbound_rx));
        let connections = Arc::new(AtomicUsize::new(0));
        let keepalives = Arc::new(AtomicUsize::new(0));
        let refusing = Arc::new(AtomicBool::new(false));

        let counter = connections.clone();
        let pings = keepalives.clone();
        let refuse = refusing.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if refuse.load(Ordering::SeqCst) {
                    // Drop the socket before the handshake.
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, inbound_tx.clone(), outbound_rx.clone(), pings.clone()));
            }
        });

        Self {
            endpoint,
            inbound,
            outbound,
            connections,
            keepalives,
            refusing,
        }
    }

    fn send(&self, text: String) {
        self.outbound.send(Outgoing::Text(text)).unwrap();
    }

    fn close(&self) {
        self.outbound.send(Outgoing::Close).unwrap();
    }

    fn ping(&self, payload: &[u8]) {
        self.outbound.send(Outgoing::Ping(payload.to_vec())).unwrap();
    }

    /// Fail every later handshake.
    fn refuse_handshakes(&self) {
        self.refusing.store(true, Ordering::SeqCst);
    }

    fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    async fn next_text(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("no frame from client")
            .unwrap()
    }

    async fn next_json(&mut self) -> Value {
        serde_json::from_str(&self.next_text().await).unwrap()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve(
    stream: TcpStream,
    inbound: mpsc::UnboundedSender<String>,
    outbound: Arc<Mutex<mpsc::UnboundedReceiver<Outgoing>>>,
    keepalives: Arc<AtomicUsize>,
) {
    let Ok(websocket) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = websocket.split();
    let mut outbound = outbound.lock().await;

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if text == "ping" {
                        keepalives.fetch_add(1, Ordering::SeqCst);
                    } else {
                        let _ = inbound.send(text);
                    }
                }
                Some(Ok(Message::Pong(payload))) => {
                    let _ = inbound.send(format!("pong:{}", String::from_utf8_lossy(&payload)));
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    let _ = inbound.send(CLOSED.to_string());
                    return;
                }
                Some(Ok(_)) => {}
            },
            outgoing = outbound.recv() => match outgoing {
                Some(Outgoing::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Some(Outgoing::Ping(payload)) => {
                    if sink.send(Message::Ping(payload)).await.is_err() {
                        return;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
        }
    }
}

fn book_frame(instrument: &str, bids: Value, asks: Value) -> String {
    json!({
        "arg": { "channel": "books5", "instId": instrument },
        "data": [{ "asks": asks, "bids": bids, "ts": "1700000000000", "checksum": 0 }]
    })
    .to_string()
}

fn engine(venue: &MockVenue) -> OrderBookEngine {
    OrderBookEngine::new(venue_config(venue)).unwrap()
}

fn venue_config(venue: &MockVenue) -> EngineConfig {
    EngineConfig::new(venue.endpoint.clone(), Symbol::new("BTC-USDT"))
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn open_session(venue: &mut MockVenue, engine: &OrderBookEngine) -> Value {
    engine.start().unwrap();
    let subscribe = venue.next_json().await;
    wait_for(|| engine.connection_state() == ConnectionState::Open).await;
    subscribe
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_and_accept_tick() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);

    let subscribe = open_session(&mut venue, &engine).await;
    assert_eq!(
        subscribe,
        json!({ "op": "subscribe", "args": [{ "channel": "books5", "instId": "BTC-USDT" }] })
    );

    venue.send(book_frame(
        "BTC-USDT",
        json!([["100.00", "2"], ["99.90", "1"]]),
        json!([["100.10", "3"], ["100.20", "1"]]),
    ));
    wait_for(|| engine.get_latest().is_some()).await;

    let latest = engine.get_latest().unwrap();
    assert_eq!(latest.best_bid.to_string(), "100.00");
    assert_eq!(latest.best_ask.to_string(), "100.10");
    assert_eq!(latest.spread.to_string(), "0.10");
    assert_eq!(latest.mid_price.to_string(), "100.05");
    assert_eq!(latest.total_bid_volume.to_string(), "3");
    assert_eq!(latest.total_ask_volume.to_string(), "4");
    assert_eq!(latest.instrument_id, Some(Symbol::new("BTC-USDT")));
    assert_eq!(latest.source_timestamp, Some(1_700_000_000_000));

    let latency = engine.get_latency_ms().unwrap();
    assert!(latency >= 0.0);

    let history = engine.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].latency_ms, latency);

    let summary = engine.get_health_summary();
    assert_eq!(summary.connection_state, ConnectionState::Open);
    assert_ne!(summary.instantaneous, HealthState::Unknown);
    assert_eq!(summary.window_len, 1);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_and_foreign_frames() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);
    open_session(&mut venue, &engine).await;

    // Crossed, empty asks, another channel, undecodable, keepalive reply.
    venue.send(book_frame("BTC-USDT", json!([["100.10", "1"]]), json!([["100.00", "1"]])));
    venue.send(book_frame("BTC-USDT", json!([["100.00", "1"]]), json!([])));
    venue.send(
        json!({ "arg": { "channel": "trades", "instId": "BTC-USDT" }, "data": [{ "px": "1" }] }).to_string(),
    );
    venue.send("{not json".to_string());
    venue.send("pong".to_string());
    venue.send(json!({ "event": "subscribe", "arg": { "channel": "books5", "instId": "BTC-USDT" } }).to_string());
    venue.send(book_frame("BTC-USDT", json!([["100.00", "1"]]), json!([["100.10", "1"]])));

    wait_for(|| engine.stream_metrics().ticks_accepted == 1).await;

    let metrics = engine.stream_metrics();
    assert_eq!(metrics.rejected_crossed_book, 1);
    assert_eq!(metrics.rejected_empty_side, 1);
    assert_eq!(metrics.ticks_rejected(), 2);
    assert_eq!(metrics.decode_errors, 1);
    assert_eq!(metrics.ignored_frames, 1);
    assert_eq!(metrics.book_frames, 3);
    assert_eq!(metrics.frames_received, 7);

    assert_eq!(engine.get_history().len(), 1);
    assert_eq!(engine.get_health_summary().samples, 3);
    assert_eq!(engine.connection_state(), ConnectionState::Open);
    assert!(matches!(
        engine.reader().last_rejection(),
        Some(Rejection::EmptySide(_))
    ));

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_data_is_rejected_with_latency() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);
    open_session(&mut venue, &engine).await;

    venue.send(json!({ "arg": { "channel": "books5", "instId": "BTC-USDT" }, "data": [] }).to_string());
    wait_for(|| engine.stream_metrics().rejected_empty_side == 1).await;

    let metrics = engine.stream_metrics();
    assert_eq!(metrics.book_frames, 1);
    assert_eq!(metrics.ignored_frames, 0);
    assert!(engine.get_latency_ms().is_some());
    assert_eq!(engine.get_health_summary().samples, 1);
    assert!(engine.get_latest().is_none());
    assert!(engine.get_history().is_empty());
    assert!(matches!(
        engine.reader().last_rejection(),
        Some(Rejection::EmptySide(_))
    ));

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_is_idempotent() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);

    engine.start().unwrap();
    engine.start().unwrap();
    venue.next_json().await;
    engine.start().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(venue.connections(), 1);
    assert_eq!(engine.connection_state(), ConnectionState::Open);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_and_restart() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);

    engine.stop();
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);

    open_session(&mut venue, &engine).await;
    venue.send(book_frame("BTC-USDT", json!([["1", "1"]]), json!([["2", "1"]])));
    wait_for(|| engine.get_latest().is_some()).await;

    engine.stop();
    assert_eq!(venue.next_text().await, CLOSED);
    wait_for(|| engine.connection_state() == ConnectionState::Disconnected).await;
    assert!(engine.get_latest().is_some());

    open_session(&mut venue, &engine).await;
    assert_eq!(venue.connections(), 2);
    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_close_fails_stream() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);
    open_session(&mut venue, &engine).await;

    venue.send(book_frame("BTC-USDT", json!([["1", "1"]]), json!([["2", "1"]])));
    wait_for(|| engine.get_latest().is_some()).await;

    venue.close();
    wait_for(|| engine.connection_state() == ConnectionState::Failed).await;
    wait_for(|| !engine.is_running()).await;
    assert!(engine.get_latest().is_some());
    assert_eq!(engine.get_history().len(), 1);
    assert_eq!(engine.stream_metrics().connection_errors, 1);
    assert_eq!(engine.stream_metrics().reconnect_attempts, 0);

    engine.stop();
    assert_eq!(engine.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_venue_error_fails_stream() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);
    open_session(&mut venue, &engine).await;

    venue.send(json!({ "event": "error", "code": "60012", "msg": "Invalid request" }).to_string());
    wait_for(|| engine.connection_state() == ConnectionState::Failed).await;
    assert!(engine.get_latest().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resubscribe_while_open() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);
    open_session(&mut venue, &engine).await;

    venue.send(book_frame("BTC-USDT", json!([["100", "1"]]), json!([["101", "1"]])));
    wait_for(|| engine.get_latest().is_some()).await;

    engine.resubscribe(Symbol::new("ETH-USDT")).unwrap();
    assert_eq!(
        venue.next_json().await,
        json!({ "op": "unsubscribe", "args": [{ "channel": "books5", "instId": "BTC-USDT" }] })
    );
    assert_eq!(
        venue.next_json().await,
        json!({ "op": "subscribe", "args": [{ "channel": "books5", "instId": "ETH-USDT" }] })
    );
    assert!(engine.get_latest().is_none());
    assert!(engine.get_history().is_empty());
    assert_eq!(engine.instrument(), Symbol::new("ETH-USDT"));

    // A late frame for the old instrument is dropped.
    venue.send(book_frame("BTC-USDT", json!([["100", "1"]]), json!([["101", "1"]])));
    venue.send(book_frame("ETH-USDT", json!([["2000", "1"]]), json!([["2001", "1"]])));
    wait_for(|| engine.get_latest().is_some()).await;

    let latest = engine.get_latest().unwrap();
    assert_eq!(latest.instrument_id, Some(Symbol::new("ETH-USDT")));
    assert_eq!(engine.get_history().len(), 1);
    assert_eq!(venue.connections(), 1);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_after_close() {
    let mut venue = MockVenue::start().await;
    let policy = ReconnectPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(50),
    };
    let config = EngineConfig::new(venue.endpoint.clone(), Symbol::new("BTC-USDT")).with_reconnect(policy);
    let engine = OrderBookEngine::new(config).unwrap();
    open_session(&mut venue, &engine).await;

    venue.close();
    // Second subscribe arrives on the new connection.
    let resubscribe = venue.next_json().await;
    assert_eq!(resubscribe["op"], "subscribe");
    wait_for(|| engine.connection_state() == ConnectionState::Open).await;

    assert_eq!(venue.connections(), 2);
    let metrics = engine.stream_metrics();
    assert_eq!(metrics.connection_errors, 1);
    assert_eq!(metrics.reconnect_attempts, 1);

    engine.stop();
    wait_for(|| engine.connection_state() == ConnectionState::Disconnected).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_endpoint_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let engine = OrderBookEngine::new(EngineConfig::new(endpoint, Symbol::new("BTC-USDT"))).unwrap();
    engine.start().unwrap();
    wait_for(|| engine.connection_state() == ConnectionState::Failed).await;
    assert_eq!(engine.stream_metrics().connection_errors, 1);
    assert!(engine.get_latest().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_venue_hits_idle_timeout() {
    let mut venue = MockVenue::start().await;
    let mut config = venue_config(&venue).with_idle_timeout(Duration::from_millis(300));
    config.stream.keepalive_interval = Duration::from_millis(100);
    let engine = OrderBookEngine::new(config).unwrap();
    open_session(&mut venue, &engine).await;

    // Keepalives go out but nothing comes back.
    wait_for(|| engine.connection_state() == ConnectionState::Failed).await;
    assert!(venue.keepalives() >= 1);
    assert_eq!(engine.stream_metrics().connection_errors, 1);
    assert_eq!(engine.stream_metrics().frames_received, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_push_back_idle_timeout() {
    let mut venue = MockVenue::start().await;
    let engine = OrderBookEngine::new(venue_config(&venue).with_idle_timeout(Duration::from_millis(300))).unwrap();
    open_session(&mut venue, &engine).await;

    for _ in 0..8 {
        venue.send("pong".to_string());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(engine.connection_state(), ConnectionState::Open);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keepalive_is_sent() {
    let mut venue = MockVenue::start().await;
    let mut config = venue_config(&venue);
    config.stream.keepalive_interval = Duration::from_millis(50);
    let engine = OrderBookEngine::new(config).unwrap();
    open_session(&mut venue, &engine).await;

    wait_for(|| venue.keepalives() >= 3).await;
    assert_eq!(engine.connection_state(), ConnectionState::Open);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_is_answered_with_pong() {
    let mut venue = MockVenue::start().await;
    let engine = engine(&venue);
    open_session(&mut venue, &engine).await;

    venue.ping(b"heartbeat");
    assert_eq!(venue.next_text().await, "pong:heartbeat");
    wait_for(|| engine.stream_metrics().frames_received == 1).await;
    assert_eq!(engine.connection_state(), ConnectionState::Open);

    engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnect_gives_up_after_max_attempts() {
    let mut venue = MockVenue::start().await;
    let policy = ReconnectPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
    };
    let engine = OrderBookEngine::new(venue_config(&venue).with_reconnect(policy)).unwrap();
    open_session(&mut venue, &engine).await;

    venue.refuse_handshakes();
    venue.close();

    wait_for(|| !engine.is_running()).await;
    assert_eq!(engine.connection_state(), ConnectionState::Failed);
    let metrics = engine.stream_metrics();
    assert_eq!(metrics.reconnect_attempts, 2);
    assert_eq!(metrics.connection_errors, 3);
    assert_eq!(venue.connections(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_interrupts_backoff() {
    let mut venue = MockVenue::start().await;
    let policy = ReconnectPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
    };
    let engine = OrderBookEngine::new(venue_config(&venue).with_reconnect(policy)).unwrap();
    open_session(&mut venue, &engine).await;

    venue.close();
    wait_for(|| engine.stream_metrics().reconnect_attempts == 1).await;
    assert_eq!(engine.connection_state(), ConnectionState::Failed);

    engine.stop();
    wait_for(|| engine.connection_state() == ConnectionState::Disconnected).await;
    assert_eq!(venue.connections(), 1);
}
