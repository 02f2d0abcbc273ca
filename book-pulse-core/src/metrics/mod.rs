//! Latency sampling and health classification
//!
//! Every book frame yields one latency sample (frame arrival to
//! normalization complete). The instantaneous policy stamps each tick; the
//! percentile policy characterizes the session over the history window.

pub mod latency;

pub use latency::LatencyTracker;

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::exchanges::ConfigError;

/// Percentile used by the session health policy
pub const SESSION_PERCENTILE: f64 = 95.0;

/// Health of the feed, derived from processing latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HealthState {
    Healthy,
    Warning,
    Unhealthy,
    /// No samples yet.
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Healthy => write!(f, "Healthy"),
            HealthState::Warning => write!(f, "Warning"),
            HealthState::Unhealthy => write!(f, "Unhealthy"),
            HealthState::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Processing time for one tick, in milliseconds. Never negative or non-finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct LatencySample(f64);

impl LatencySample {
    /// `None` for negative, NaN or infinite input; such samples are dropped.
    pub fn from_millis(ms: f64) -> Option<Self> {
        if ms.is_finite() && ms >= 0.0 {
            Some(Self(ms))
        } else {
            None
        }
    }

    pub fn from_duration(elapsed: Duration) -> Self {
        Self(elapsed.as_secs_f64() * 1_000.0)
    }

    pub fn as_millis(&self) -> f64 {
        self.0
    }
}

/// Latency bands: `< warning_ms` healthy, `[warning_ms, unhealthy_ms)` warning,
/// `>= unhealthy_ms` unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthThresholds {
    pub warning_ms: f64,
    pub unhealthy_ms: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warning_ms: 100.0,
            unhealthy_ms: 300.0,
        }
    }
}

impl HealthThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.warning_ms.is_finite()
            && self.unhealthy_ms.is_finite()
            && self.warning_ms > 0.0
            && self.warning_ms < self.unhealthy_ms;
        if ordered {
            Ok(())
        } else {
            Err(ConfigError::InvalidThresholds {
                warning_ms: self.warning_ms,
                unhealthy_ms: self.unhealthy_ms,
            })
        }
    }

    /// Instantaneous policy: classify one latency sample.
    pub fn classify(&self, latency_ms: f64) -> HealthState {
        if !latency_ms.is_finite() || latency_ms < 0.0 {
            HealthState::Unknown
        } else if latency_ms < self.warning_ms {
            HealthState::Healthy
        } else if latency_ms < self.unhealthy_ms {
            HealthState::Warning
        } else {
            HealthState::Unhealthy
        }
    }

    /// Session policy: classify a percentile of the samples, `Unknown` when empty.
    pub fn classify_percentile(&self, samples: &[f64], pct: f64) -> HealthState {
        match percentile(samples, pct) {
            Some(value) => self.classify(value),
            None => HealthState::Unknown,
        }
    }
}

/// Classify with the default 100/300 ms bands.
pub fn classify(latency_ms: f64) -> HealthState {
    HealthThresholds::default().classify(latency_ms)
}

/// Nearest-rank percentile (`pct` in 0..=100) over the finite samples.
pub fn percentile(samples: &[f64], pct: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|s| s.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let pct = pct.clamp(0.0, 100.0);
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}
