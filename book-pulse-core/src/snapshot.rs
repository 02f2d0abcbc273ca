//! Shared book state and the read-only snapshot accessor
//!
//! Single writer (the stream task), any number of readers. The latest tick
//! is an `ArcSwapOption`, so a reader gets a whole record or nothing; the
//! history window is copied out under a short read lock.

use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::exchanges::{ConnectionState, Rejection, Symbol};
use crate::market_data::{HistoryEntry, HistoryWindow, NormalizedMetrics};
use crate::metrics::{HealthState, HealthThresholds, LatencySample, LatencyTracker, SESSION_PERCENTILE};

// Never produced by a valid sample: those are finite.
const NO_LATENCY: u64 = u64::MAX;

/// Monotonic stream counters
#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
    pub frames_received: AtomicU64,
    pub book_frames: AtomicU64,
    pub ignored_frames: AtomicU64,
    pub decode_errors: AtomicU64,
    pub ticks_accepted: AtomicU64,
    pub rejected_empty_side: AtomicU64,
    pub rejected_malformed_level: AtomicU64,
    pub rejected_crossed_book: AtomicU64,
    pub connection_errors: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

impl StreamCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StreamMetrics {
            frames_received: load(&self.frames_received),
            book_frames: load(&self.book_frames),
            ignored_frames: load(&self.ignored_frames),
            decode_errors: load(&self.decode_errors),
            ticks_accepted: load(&self.ticks_accepted),
            rejected_empty_side: load(&self.rejected_empty_side),
            rejected_malformed_level: load(&self.rejected_malformed_level),
            rejected_crossed_book: load(&self.rejected_crossed_book),
            connection_errors: load(&self.connection_errors),
            reconnect_attempts: load(&self.reconnect_attempts),
        }
    }
}

/// Stream health counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamMetrics {
    pub frames_received: u64,
    pub book_frames: u64,
    pub ignored_frames: u64,
    pub decode_errors: u64,
    pub ticks_accepted: u64,
    pub rejected_empty_side: u64,
    pub rejected_malformed_level: u64,
    pub rejected_crossed_book: u64,
    pub connection_errors: u64,
    pub reconnect_attempts: u64,
}

impl StreamMetrics {
    pub fn ticks_rejected(&self) -> u64 {
        self.rejected_empty_side + self.rejected_malformed_level + self.rejected_crossed_book
    }
}

/// Latency health of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub connection_state: ConnectionState,
    /// Classification of the most recent sample.
    pub instantaneous: HealthState,
    /// Classification of the p95 over the history window.
    pub session: HealthState,
    pub latest_latency_ms: Option<f64>,
    pub session_p95_ms: Option<f64>,
    pub window_len: usize,
    /// Tracker statistics, rejected ticks included.
    pub average_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    pub samples: usize,
}

/// State written by the stream task and read through [`SnapshotReader`]
pub(crate) struct BookState {
    /// `generation << 8 | state`; a stale worker cannot overwrite a newer one.
    status: AtomicU64,
    instrument: RwLock<Symbol>,
    latest: ArcSwapOption<NormalizedMetrics>,
    latest_latency: AtomicU64,
    history: RwLock<HistoryWindow>,
    latency: Mutex<LatencyTracker>,
    last_rejection: ArcSwapOption<Rejection>,
    pub(crate) counters: StreamCounters,
    thresholds: HealthThresholds,
}

impl BookState {
    pub fn new(instrument: Symbol, history: HistoryWindow, latency_window: usize, thresholds: HealthThresholds) -> Self {
        Self {
            status: AtomicU64::new(ConnectionState::Disconnected.as_u8() as u64),
            instrument: RwLock::new(instrument),
            latest: ArcSwapOption::empty(),
            latest_latency: AtomicU64::new(NO_LATENCY),
            history: RwLock::new(history),
            latency: Mutex::new(LatencyTracker::new(latency_window)),
            last_rejection: ArcSwapOption::empty(),
            counters: StreamCounters::default(),
            thresholds,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8((self.status.load(Ordering::Acquire) & 0xff) as u8)
    }

    pub fn generation(&self) -> u64 {
        self.status.load(Ordering::Acquire) >> 8
    }

    /// Start a new worker generation in `Connecting`.
    pub fn begin_generation(&self) -> u64 {
        let previous = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((((current >> 8) + 1) << 8) | ConnectionState::Connecting.as_u8() as u64)
            })
            .unwrap_or_else(|current| current);
        (previous >> 8) + 1
    }

    /// Move to `next` if `generation` is still current.
    pub fn transition(&self, generation: u64, next: ConnectionState) -> bool {
        let result = self.status.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            if current >> 8 == generation {
                Some((generation << 8) | next.as_u8() as u64)
            } else {
                None
            }
        });
        match result {
            Ok(previous) => {
                let previous = ConnectionState::from_u8((previous & 0xff) as u8);
                if previous != next {
                    debug!("Connection state {} -> {}", previous, next);
                }
                true
            }
            Err(_) => false,
        }
    }

    pub fn instrument(&self) -> Symbol {
        self.instrument.read().clone()
    }

    /// Replace the instrument and drop everything recorded for the old one.
    pub fn switch_instrument(&self, symbol: Symbol) {
        *self.instrument.write() = symbol;
        self.latest.store(None);
        self.history.write().clear();
    }

    pub fn latest(&self) -> Option<Arc<NormalizedMetrics>> {
        self.latest.load_full()
    }

    pub fn latest_latency_ms(&self) -> Option<f64> {
        match self.latest_latency.load(Ordering::Acquire) {
            NO_LATENCY => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    pub fn classify(&self, latency_ms: f64) -> HealthState {
        self.thresholds.classify(latency_ms)
    }

    /// Publish the outcome of one book frame.
    ///
    /// The latency is recorded either way; only accepted ticks reach the
    /// history window and the latest slot.
    pub fn record_tick(
        &self,
        generation: u64,
        outcome: Result<NormalizedMetrics, Rejection>,
        latency: LatencySample,
    ) -> Option<HealthState> {
        if self.generation() != generation {
            debug!("Dropping tick from a stopped stream worker");
            return None;
        }

        let latency_ms = latency.as_millis();
        self.latest_latency.store(latency_ms.to_bits(), Ordering::Release);
        self.latency.lock().record(latency);

        match outcome {
            Ok(metrics) => {
                let health = self.thresholds.classify(latency_ms);
                let metrics = Arc::new(metrics);
                self.history
                    .write()
                    .push_parts(metrics.received_at, metrics.clone(), latency_ms, health);
                self.latest.store(Some(metrics));
                StreamCounters::bump(&self.counters.ticks_accepted);
                Some(health)
            }
            Err(rejection) => {
                warn!("Skipped invalid orderbook tick: {}", rejection);
                let counter = match rejection {
                    Rejection::EmptySide(_) => &self.counters.rejected_empty_side,
                    Rejection::MalformedLevel { .. } => &self.counters.rejected_malformed_level,
                    Rejection::CrossedOrInvertedBook { .. } => &self.counters.rejected_crossed_book,
                };
                StreamCounters::bump(counter);
                self.last_rejection.store(Some(Arc::new(rejection)));
                None
            }
        }
    }

    fn health_summary(&self) -> HealthSummary {
        let latest_latency_ms = self.latest_latency_ms();
        let (window, window_len) = {
            let history = self.history.read();
            (history.latencies(), history.len())
        };
        let (average_latency_ms, max_latency_ms, samples) = {
            let tracker = self.latency.lock();
            (tracker.average(), tracker.max(), tracker.len())
        };

        HealthSummary {
            connection_state: self.connection_state(),
            instantaneous: latest_latency_ms
                .map(|ms| self.thresholds.classify(ms))
                .unwrap_or(HealthState::Unknown),
            session: self.thresholds.classify_percentile(&window, SESSION_PERCENTILE),
            latest_latency_ms,
            session_p95_ms: crate::metrics::percentile(&window, SESSION_PERCENTILE),
            window_len,
            average_latency_ms,
            max_latency_ms,
            samples,
        }
    }
}

/// Cloneable, read-only handle over the engine's published state
///
/// Nothing here blocks the stream task beyond a short copy.
#[derive(Clone)]
pub struct SnapshotReader {
    state: Arc<BookState>,
}

impl SnapshotReader {
    pub(crate) fn new(state: Arc<BookState>) -> Self {
        Self { state }
    }

    /// Most recent accepted tick, `None` before the first one.
    pub fn get_latest(&self) -> Option<Arc<NormalizedMetrics>> {
        self.state.latest()
    }

    /// Most recent latency sample in milliseconds, rejected ticks included.
    pub fn get_latency_ms(&self) -> Option<f64> {
        self.state.latest_latency_ms()
    }

    /// Oldest-first copy of the history window.
    pub fn get_history(&self) -> Vec<HistoryEntry> {
        self.state.history.read().snapshot()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        self.state.health_summary()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.connection_state()
    }

    pub fn instrument(&self) -> Symbol {
        self.state.instrument()
    }

    pub fn stream_metrics(&self) -> StreamMetrics {
        self.state.counters.snapshot()
    }

    /// Why the most recent rejected tick was dropped.
    pub fn last_rejection(&self) -> Option<Rejection> {
        self.state.last_rejection.load_full().map(|r| (*r).clone())
    }

    pub fn mid_price_volatility_pct(&self) -> f64 {
        self.state.history.read().mid_price_volatility_pct()
    }

    /// Seconds since the latest accepted tick was captured.
    pub fn staleness_secs(&self) -> Option<f64> {
        self.state
            .latest()
            .map(|m| (Utc::now() - m.received_at).num_milliseconds() as f64 / 1_000.0)
    }
}
