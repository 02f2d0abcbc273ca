//! WebSocket stream consumer for order-book snapshots
//!
//! One background task per stream owns the connection. Callers talk to it
//! through a control channel and read results through the shared
//! [`BookState`]; they never touch the socket.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::errors::{ConfigError, ExchangeError, ExchangeResult};
use super::okx::{self, Frame, BOOK_CHANNEL, DEFAULT_ENDPOINT, KEEPALIVE};
use super::types::{ConnectionState, RawTick, Symbol};
use crate::market_data::normalize;
use crate::metrics::LatencySample;
use crate::snapshot::{BookState, StreamCounters};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Bounded exponential backoff between failed sessions
///
/// `max_attempts == 0` disables reconnection: a failed stream stays `Failed`
/// until the caller starts it again.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self::bounded(0)
    }

    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Delay before retry number `attempt` (0-based), `None` once exhausted.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << attempt.min(16);
        Some(self.initial_backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: String,
    pub channel: String,
    pub connect_timeout: Duration,
    /// A read that yields nothing for this long fails the session.
    pub idle_timeout: Duration,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            channel: BOOK_CHANNEL.to_string(),
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(25),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Internal control messages
#[derive(Debug)]
enum ControlMessage {
    Resubscribe(Symbol),
    Shutdown,
}

struct Worker {
    control: mpsc::UnboundedSender<ControlMessage>,
    task: JoinHandle<()>,
}

/// Owner of the single logical subscription to the book feed
pub struct OrderBookStream {
    config: StreamConfig,
    state: Arc<BookState>,
    runtime: Option<Handle>,
    worker: Mutex<Option<Worker>>,
}

impl OrderBookStream {
    pub(crate) fn new(config: StreamConfig, state: Arc<BookState>) -> Self {
        Self {
            config,
            state,
            runtime: Handle::try_current().ok(),
            worker: Mutex::new(None),
        }
    }

    /// Host the stream task on `handle` instead of the ambient runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    /// Whether a stream task is alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|w| !w.task.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the stream task and return immediately.
    ///
    /// A no-op while a task is alive, so repeated calls never open a
    /// second connection.
    pub fn start(&self) -> ExchangeResult<()> {
        let mut worker = self.worker.lock();
        if let Some(active) = worker.as_ref() {
            if !active.task.is_finished() {
                debug!("Stream already {}, start ignored", self.state.connection_state());
                return Ok(());
            }
        }

        let runtime = match &self.runtime {
            Some(handle) => handle.clone(),
            None => Handle::try_current().map_err(|_| ConfigError::NoRuntime)?,
        };

        let (control_sender, control_receiver) = mpsc::unbounded_channel();
        let generation = self.state.begin_generation();
        let task = StreamTask {
            config: self.config.clone(),
            state: self.state.clone(),
            generation,
            control: control_receiver,
        };

        info!(
            "Starting order book stream {} {} on {}",
            self.config.channel,
            self.state.instrument(),
            self.config.endpoint
        );
        *worker = Some(Worker {
            control: control_sender,
            task: runtime.spawn(task.run()),
        });
        Ok(())
    }

    /// Ask the stream task to close the connection and exit.
    ///
    /// Only signals; the task finishes teardown on its own. Safe before
    /// `start()` and from any thread.
    pub fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            debug!("Stop requested while stream idle");
            return;
        };

        if worker.task.is_finished() || worker.control.send(ControlMessage::Shutdown).is_err() {
            // Nothing left to signal; settle on the terminal state here.
            worker.task.abort();
            self.state
                .transition(self.state.generation(), ConnectionState::Disconnected);
        }
        info!("Stop requested for order book stream");
    }

    /// Switch the subscription to another instrument.
    ///
    /// While running, the task unsubscribes the old instrument, clears the
    /// latest slot and history, and subscribes the new one. While idle, the
    /// instrument applies to the next `start()`.
    pub fn resubscribe(&self, symbol: Symbol) -> ExchangeResult<()> {
        if !symbol.validate() {
            return Err(ConfigError::InvalidInstrument(symbol.to_string()).into());
        }

        let worker = self.worker.lock();
        match worker.as_ref() {
            Some(active) if !active.task.is_finished() => {
                active
                    .control
                    .send(ControlMessage::Resubscribe(symbol))
                    .map_err(|_| ExchangeError::Connection {
                        message: "stream task is not accepting commands".to_string(),
                    })
            }
            _ => {
                self.state.switch_instrument(symbol);
                Ok(())
            }
        }
    }
}

impl Drop for OrderBookStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a session ended
enum SessionEnd {
    Shutdown,
    Failed { error: ExchangeError, opened: bool },
}

impl SessionEnd {
    fn failed(error: ExchangeError, opened: bool) -> Self {
        Self::Failed { error, opened }
    }
}

/// State owned by the background task
struct StreamTask {
    config: StreamConfig,
    state: Arc<BookState>,
    generation: u64,
    control: mpsc::UnboundedReceiver<ControlMessage>,
}

impl StreamTask {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            match self.session().await {
                SessionEnd::Shutdown => {
                    self.state.transition(self.generation, ConnectionState::Disconnected);
                    info!("Order book stream stopped");
                    return;
                }
                SessionEnd::Failed { error, opened } => {
                    StreamCounters::bump(&self.state.counters.connection_errors);
                    error!("Order book stream failed: {}", error);
                    self.state.transition(self.generation, ConnectionState::Failed);

                    if opened {
                        failures = 0;
                    }
                    let delay = if error.should_retry() {
                        self.config.reconnect.backoff(failures)
                    } else {
                        None
                    };
                    let Some(delay) = delay else {
                        if self.config.reconnect.is_enabled() {
                            error!("Giving up on order book stream after {} attempts", failures);
                        }
                        return;
                    };

                    failures += 1;
                    StreamCounters::bump(&self.state.counters.reconnect_attempts);
                    warn!(
                        "Reconnecting in {:?} (attempt {}/{})",
                        delay, failures, self.config.reconnect.max_attempts
                    );
                    if self.wait_backoff(delay).await {
                        self.state.transition(self.generation, ConnectionState::Disconnected);
                        info!("Order book stream stopped during backoff");
                        return;
                    }
                    self.state.transition(self.generation, ConnectionState::Connecting);
                }
            }
        }
    }

    /// Sleep for `delay`; `true` if a shutdown arrived meanwhile.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let deadline = time::Instant::now() + delay;
        loop {
            tokio::select! {
                biased;
                command = self.control.recv() => match command {
                    Some(ControlMessage::Resubscribe(symbol)) => self.state.switch_instrument(symbol),
                    Some(ControlMessage::Shutdown) | None => return true,
                },
                _ = time::sleep_until(deadline) => return false,
            }
        }
    }

    /// Connect, subscribe and pump frames until the session ends.
    async fn session(&mut self) -> SessionEnd {
        let endpoint = self.config.endpoint.clone();
        let connect = timeout(self.config.connect_timeout, connect_async(endpoint.as_str()));
        tokio::pin!(connect);

        let websocket = loop {
            tokio::select! {
                biased;
                command = self.control.recv() => match command {
                    Some(ControlMessage::Resubscribe(symbol)) => self.state.switch_instrument(symbol),
                    Some(ControlMessage::Shutdown) | None => return SessionEnd::Shutdown,
                },
                result = &mut connect => match result {
                    Ok(Ok((websocket, _))) => break websocket,
                    Ok(Err(e)) => {
                        return SessionEnd::failed(
                            ExchangeError::Connection {
                                message: format!("WebSocket connection failed: {}", e),
                            },
                            false,
                        )
                    }
                    Err(_) => {
                        return SessionEnd::failed(
                            ExchangeError::Timeout {
                                millis: self.config.connect_timeout.as_millis() as u64,
                            },
                            false,
                        )
                    }
                },
            }
        };

        let (mut sink, mut stream) = websocket.split();
        self.state.transition(self.generation, ConnectionState::Open);
        info!("WebSocket connection opened");

        let mut instrument = self.state.instrument();
        let subscribe = okx::subscribe_message(&self.config.channel, &instrument);
        if let Err(e) = sink.send(Message::Text(subscribe)).await {
            return SessionEnd::failed(e.into(), true);
        }
        info!("Subscribed to {} {}", self.config.channel, instrument);

        let period = self.config.keepalive_interval;
        let mut keepalive = time::interval_at(time::Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Pushed back only when a frame arrives; keepalives do not count.
        let idle_timeout = self.config.idle_timeout;
        let idle = time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                command = self.control.recv() => match command {
                    Some(ControlMessage::Resubscribe(symbol)) => {
                        if symbol == instrument {
                            debug!("Already subscribed to {}", symbol);
                            continue;
                        }
                        let unsubscribe = okx::unsubscribe_message(&self.config.channel, &instrument);
                        if let Err(e) = sink.send(Message::Text(unsubscribe)).await {
                            return SessionEnd::failed(e.into(), true);
                        }
                        self.state.switch_instrument(symbol.clone());
                        let subscribe = okx::subscribe_message(&self.config.channel, &symbol);
                        if let Err(e) = sink.send(Message::Text(subscribe)).await {
                            return SessionEnd::failed(e.into(), true);
                        }
                        info!("Resubscribed {} -> {}", instrument, symbol);
                        instrument = symbol;
                    }
                    Some(ControlMessage::Shutdown) | None => {
                        self.state.transition(self.generation, ConnectionState::Closing);
                        if let Ok(Err(e)) = timeout(Duration::from_secs(1), sink.send(Message::Close(None))).await {
                            debug!("Close frame not delivered: {}", e);
                        }
                        return SessionEnd::Shutdown;
                    }
                },
                frame = stream.next() => {
                    let arrived = Instant::now();
                    idle.as_mut().reset(time::Instant::now() + idle_timeout);
                    match frame {
                        Some(Ok(message)) => {
                            StreamCounters::bump(&self.state.counters.frames_received);
                            if let Some(end) = self.handle_message(message, arrived, &mut sink, &instrument).await {
                                return end;
                            }
                        }
                        Some(Err(e)) => return SessionEnd::failed(e.into(), true),
                        None => {
                            return SessionEnd::failed(
                                ExchangeError::Closed {
                                    reason: "stream ended".to_string(),
                                },
                                true,
                            )
                        }
                    }
                },
                _ = &mut idle => {
                    warn!("No frame received for {:?}", idle_timeout);
                    return SessionEnd::failed(
                        ExchangeError::Timeout {
                            millis: idle_timeout.as_millis() as u64,
                        },
                        true,
                    );
                },
                _ = keepalive.tick() => {
                    if let Err(e) = sink.send(Message::Text(KEEPALIVE.to_string())).await {
                        return SessionEnd::failed(e.into(), true);
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        message: Message,
        arrived: Instant,
        sink: &mut WsSink,
        instrument: &Symbol,
    ) -> Option<SessionEnd> {
        match message {
            Message::Text(text) => self.handle_text(&text, arrived, instrument),
            Message::Ping(payload) => match sink.send(Message::Pong(payload)).await {
                Ok(()) => None,
                Err(e) => Some(SessionEnd::failed(e.into(), true)),
            },
            Message::Pong(_) => {
                debug!("Received pong");
                None
            }
            Message::Close(frame) => {
                info!("WebSocket close frame: {:?}", frame);
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                Some(SessionEnd::failed(ExchangeError::Closed { reason }, true))
            }
            Message::Binary(_) | Message::Frame(_) => {
                debug!("Ignoring non-text frame");
                StreamCounters::bump(&self.state.counters.ignored_frames);
                None
            }
        }
    }

    fn handle_text(&self, text: &str, arrived: Instant, instrument: &Symbol) -> Option<SessionEnd> {
        let counters = &self.state.counters;
        let frame = match okx::decode_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to decode frame: {}", e);
                StreamCounters::bump(&counters.decode_errors);
                return None;
            }
        };

        match frame {
            Frame::Data { arg, tick } => {
                let other_instrument = arg.inst_id.as_deref().is_some_and(|id| id != instrument.as_str());
                if arg.channel != self.config.channel || other_instrument {
                    debug!("Ignoring {} frame for {:?}", arg.channel, arg.inst_id);
                    StreamCounters::bump(&counters.ignored_frames);
                    return None;
                }
                StreamCounters::bump(&counters.book_frames);

                // `data: []` carries no levels; it is rejected as an empty book.
                let mut tick = tick.unwrap_or_else(|| {
                    warn!("Received empty orderbook data");
                    RawTick::default()
                });
                if tick.inst_id.is_none() {
                    tick.inst_id = arg.inst_id;
                }

                let outcome = normalize(&tick);
                let latency = LatencySample::from_duration(arrived.elapsed());
                if let Some(health) = self.state.record_tick(self.generation, outcome, latency) {
                    debug!(
                        "Processed tick for {}: latency {:.3} ms ({})",
                        instrument,
                        latency.as_millis(),
                        health
                    );
                }
                None
            }
            Frame::Pong => {
                debug!("Keepalive acknowledged");
                None
            }
            Frame::Ack { event, arg } => {
                info!("Venue acknowledged {} {:?}", event, arg);
                None
            }
            Frame::VenueError { code, message } => Some(SessionEnd::failed(
                ExchangeError::Subscription { code, message },
                true,
            )),
            Frame::Other => {
                debug!("Message received: {}", text);
                StreamCounters::bump(&counters.ignored_frames);
                None
            }
        }
    }
}
