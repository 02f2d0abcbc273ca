//! Tick normalization and rolling history

pub mod history;
pub mod normalizer;

pub use history::{HistoryEntry, HistoryWindow, DEFAULT_HISTORY_CAPACITY};
pub use normalizer::{normalize, normalize_at, NormalizedMetrics};
