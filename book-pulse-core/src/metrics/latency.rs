//! Rolling latency statistics

use std::collections::VecDeque;

use super::{percentile, LatencySample};

/// Tracks the most recent latency samples, rejected ticks included.
#[derive(Debug, Clone)]
pub struct LatencyTracker {
    samples: VecDeque<f64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    pub fn record(&mut self, sample: LatencySample) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample.as_millis());
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn max(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::max)
    }

    pub fn percentile(&self, pct: f64) -> Option<f64> {
        let samples: Vec<f64> = self.samples.iter().copied().collect();
        percentile(&samples, pct)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
