//! Order Book Stream Metrics Library
//!
//! Consumes a venue's top-of-book WebSocket feed, normalizes every snapshot
//! into spread, mid-price and depth metrics, stamps each tick with its
//! processing latency and health, and keeps a bounded rolling history.
//! Callers poll the published state through [`SnapshotReader`].

pub mod config;
pub mod exchanges;
pub mod market_data;
pub mod metrics;
pub mod registry;
pub mod snapshot;

// Re-export main types for easy access
pub use config::EngineConfig;
pub use exchanges::{
    ConnectionState, ExchangeError, ExchangeResult, RawTick, ReconnectPolicy, Rejection, StreamConfig, Symbol,
};
pub use market_data::{normalize, HistoryEntry, HistoryWindow, NormalizedMetrics};
pub use metrics::{classify, HealthState, HealthThresholds, LatencySample, LatencyTracker};
pub use registry::EngineRegistry;
pub use snapshot::{HealthSummary, SnapshotReader, StreamMetrics};

use std::sync::Arc;
use tokio::runtime::Handle;

use exchanges::OrderBookStream;
use snapshot::BookState;

/// One subscription to one instrument, with its published metrics
pub struct OrderBookEngine {
    config: EngineConfig,
    stream: OrderBookStream,
    reader: SnapshotReader,
}

impl OrderBookEngine {
    /// Validate the configuration and build an idle engine.
    pub fn new(config: EngineConfig) -> ExchangeResult<Self> {
        config.validate()?;

        let history = HistoryWindow::new(config.history_capacity)?;
        let state = Arc::new(BookState::new(
            config.instrument.clone(),
            history,
            config.latency_window,
            config.thresholds,
        ));

        Ok(Self {
            stream: OrderBookStream::new(config.stream.clone(), state.clone()),
            reader: SnapshotReader::new(state),
            config,
        })
    }

    /// Run the stream task on `handle` rather than the runtime current at
    /// construction.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.stream = self.stream.with_runtime(handle);
        self
    }

    /// Open the connection in the background and return immediately.
    pub fn start(&self) -> ExchangeResult<()> {
        self.stream.start()
    }

    /// Request shutdown; published state stays readable.
    pub fn stop(&self) {
        self.stream.stop()
    }

    /// Move the subscription to `symbol`, discarding the old instrument's data.
    pub fn resubscribe(&self, symbol: Symbol) -> ExchangeResult<()> {
        self.stream.resubscribe(symbol)
    }

    pub fn is_running(&self) -> bool {
        self.stream.is_running()
    }

    pub fn get_latest(&self) -> Option<Arc<NormalizedMetrics>> {
        self.reader.get_latest()
    }

    pub fn get_latency_ms(&self) -> Option<f64> {
        self.reader.get_latency_ms()
    }

    pub fn get_history(&self) -> Vec<HistoryEntry> {
        self.reader.get_history()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        self.reader.get_health_summary()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.reader.connection_state()
    }

    pub fn stream_metrics(&self) -> StreamMetrics {
        self.reader.stream_metrics()
    }

    pub fn instrument(&self) -> Symbol {
        self.reader.instrument()
    }

    /// Detached read handle for other threads or tasks
    pub fn reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    /// Configuration the engine was built with.
    ///
    /// `resubscribe` does not rewrite it; use [`instrument`](Self::instrument)
    /// for the symbol currently subscribed.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
