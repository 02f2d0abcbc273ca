//! Fixed-capacity rolling history of accepted ticks

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use super::NormalizedMetrics;
use crate::exchanges::ConfigError;
use crate::metrics::HealthState;

/// Default number of ticks retained
pub const DEFAULT_HISTORY_CAPACITY: usize = 120;

/// One accepted tick with the latency and health stamped on it
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub metrics: Arc<NormalizedMetrics>,
    pub latency_ms: f64,
    pub health: HealthState,
}

/// Time-ascending FIFO window; the oldest entry is evicted on overflow.
///
/// Metrics, latency and health share one entry, so the three sequences
/// stay index-aligned.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryWindow {
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Zero {
                name: "history_capacity",
            });
        }
        Ok(Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Append an entry, evicting the oldest when full.
    ///
    /// A timestamp earlier than the newest entry (wall clock stepped back)
    /// is raised to it so the window stays ordered.
    pub fn push(&mut self, mut entry: HistoryEntry) {
        if let Some(last) = self.entries.back() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn push_parts(
        &mut self,
        timestamp: DateTime<Utc>,
        metrics: Arc<NormalizedMetrics>,
        latency_ms: f64,
        health: HealthState,
    ) {
        self.push(HistoryEntry {
            timestamp,
            metrics,
            latency_ms,
            health,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Owned, oldest-first copy, independent of later pushes.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.entries.iter().map(|e| e.timestamp).collect()
    }

    pub fn latencies(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.latency_ms).collect()
    }

    pub fn health_states(&self) -> Vec<HealthState> {
        self.entries.iter().map(|e| e.health).collect()
    }

    pub fn mid_prices(&self) -> Vec<f64> {
        self.entries.iter().map(|e| e.metrics.mid_price_f64()).collect()
    }

    /// Population standard deviation of consecutive mid-price returns, in percent.
    pub fn mid_price_volatility_pct(&self) -> f64 {
        let mids = self.mid_prices();
        if mids.len() < 2 {
            return 0.0;
        }

        let returns: Vec<f64> = mids
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        if returns.is_empty() {
            return 0.0;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        variance.sqrt() * 100.0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
