//! Exchange error types

use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Custom result type for engine operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Timeout after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Connection closed by venue: {reason}")]
    Closed { reason: String },

    #[error("Subscription rejected by venue: {code} {message}")]
    Subscription { code: String, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Tick rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Failure class, used to decide how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ends the session; the stream transitions to `Failed`.
    Transport,
    /// One frame is skipped.
    Decode,
    /// One tick is skipped, its latency is still recorded.
    Validation,
    /// Fatal at construction time.
    Configuration,
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. }
            | Self::WebSocket(_)
            | Self::Timeout { .. }
            | Self::Closed { .. }
            | Self::Subscription { .. } => ErrorKind::Transport,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Rejected(_) => ErrorKind::Validation,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether a reconnect policy may retry after this error.
    ///
    /// A venue that rejected the subscription will reject it again.
    pub fn should_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport) && !matches!(self, Self::Subscription { .. })
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Invalid engine configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing setting: {0}")]
    Missing(&'static str),

    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid instrument {0:?}")]
    InvalidInstrument(String),

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },

    #[error("invalid health thresholds: warning {warning_ms} ms, unhealthy {unhealthy_ms} ms")]
    InvalidThresholds { warning_ms: f64, unhealthy_ms: f64 },

    #[error("invalid value {value:?} for {name}")]
    InvalidValue { name: &'static str, value: String },

    #[error("no tokio runtime available to host the stream task")]
    NoRuntime,
}

/// Side of the book a level belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bid => write!(f, "bid"),
            BookSide::Ask => write!(f, "ask"),
        }
    }
}

/// Reason a raw tick was dropped by the normalizer
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum Rejection {
    #[error("empty {0} side")]
    EmptySide(BookSide),

    #[error("malformed best {side} level: {detail}")]
    MalformedLevel { side: BookSide, detail: String },

    #[error("crossed or inverted book: bid {bid} >= ask {ask}")]
    CrossedOrInvertedBook { bid: Decimal, ask: Decimal },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        let transport = ExchangeError::Timeout { millis: 500 };
        assert_eq!(transport.kind(), ErrorKind::Transport);
        assert!(transport.should_retry());

        let venue = ExchangeError::Subscription {
            code: "60018".to_string(),
            message: "channel doesn't exist".to_string(),
        };
        assert_eq!(venue.kind(), ErrorKind::Transport);
        assert!(!venue.should_retry());

        let rejected: ExchangeError = Rejection::EmptySide(BookSide::Ask).into();
        assert_eq!(rejected.kind(), ErrorKind::Validation);
        assert!(!rejected.should_retry());

        let config: ExchangeError = ConfigError::Zero { name: "history_capacity" }.into();
        assert_eq!(config.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_json_error_is_decode() {
        let err: ExchangeError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Decode);
    }

    #[test]
    fn test_rejection_messages() {
        assert_eq!(Rejection::EmptySide(BookSide::Bid).to_string(), "empty bid side");
        let crossed = Rejection::CrossedOrInvertedBook {
            bid: Decimal::new(10010, 2),
            ask: Decimal::new(10000, 2),
        };
        assert_eq!(crossed.to_string(), "crossed or inverted book: bid 100.10 >= ask 100.00");
    }
}
