//! Exchange data types

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Trading symbol (venue instrument id, e.g. `BTC-USDT`)
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn validate(&self) -> bool {
        !self.0.is_empty() && self.0.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of the stream connection
///
/// `Disconnected -> Connecting -> Open -> Closing -> Disconnected` on an
/// explicit stop, `Open -> Failed` on a transport error. `Failed -> Connecting`
/// only happens through `start()` or an enabled reconnect policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Failed,
}

impl ConnectionState {
    /// A worker is alive and holds (or is acquiring) the connection.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Open => 2,
            Self::Closing => 3,
            Self::Failed => 4,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Open,
            3 => Self::Closing,
            4 => Self::Failed,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// Exchange-native book snapshot, as found in `data[0]` of a book frame
///
/// Levels are kept as raw JSON so one unparsable level does not fail the
/// whole frame; the normalizer decides what to skip.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawTick {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub asks: Vec<serde_json::Value>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub bids: Vec<serde_json::Value>,
    #[serde(default)]
    pub ts: Option<serde_json::Value>,
    #[serde(default, rename = "instId")]
    pub inst_id: Option<String>,
}

/// A side sent as `null` is treated like a missing one.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Vec<serde_json::Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

impl RawTick {
    /// Exchange timestamp in milliseconds, accepted as string or number.
    pub fn source_timestamp_ms(&self) -> Option<i64> {
        match self.ts.as_ref()? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_validation() {
        assert!(Symbol::new("BTC-USDT").validate());
        assert!(Symbol::new("BTC-USDT-SWAP").validate());
        assert!(!Symbol::new("").validate());
        assert!(!Symbol::new("BTC/USDT").validate());
    }

    #[test]
    fn test_connection_state_roundtrip() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Failed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert!(ConnectionState::Open.is_active());
        assert!(!ConnectionState::Failed.is_active());
    }

    #[test]
    fn test_raw_tick_timestamp() {
        let tick: RawTick = serde_json::from_str(
            r#"{"asks":[["100.1","1","0","1"]],"bids":[],"ts":"1597026383085","instId":"BTC-USDT"}"#,
        )
        .unwrap();
        assert_eq!(tick.source_timestamp_ms(), Some(1597026383085));
        assert_eq!(tick.inst_id.as_deref(), Some("BTC-USDT"));
        assert!(tick.bids.is_empty());

        let numeric: RawTick = serde_json::from_str(r#"{"ts":42}"#).unwrap();
        assert_eq!(numeric.source_timestamp_ms(), Some(42));
    }

    #[test]
    fn test_null_sides_are_empty() {
        let tick: RawTick = serde_json::from_str(r#"{"asks":null,"bids":[["1","1"]]}"#).unwrap();
        assert!(tick.asks.is_empty());
        assert_eq!(tick.bids.len(), 1);
    }
}
