//! Engine configuration

use std::time::Duration;
use url::Url;

use crate::exchanges::{ConfigError, ReconnectPolicy, StreamConfig, Symbol};
use crate::market_data::DEFAULT_HISTORY_CAPACITY;
use crate::metrics::HealthThresholds;

/// Instrument subscribed when none is configured
pub const DEFAULT_INSTRUMENT: &str = "BTC-USDT";

/// Default window of the latency tracker
pub const DEFAULT_LATENCY_WINDOW: usize = 100;

/// Full configuration of one engine instance
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stream: StreamConfig,
    pub instrument: Symbol,
    pub history_capacity: usize,
    pub thresholds: HealthThresholds,
    pub latency_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stream: StreamConfig::default(),
            instrument: Symbol::new(DEFAULT_INSTRUMENT),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            thresholds: HealthThresholds::default(),
            latency_window: DEFAULT_LATENCY_WINDOW,
        }
    }
}

impl EngineConfig {
    pub fn new(endpoint: impl Into<String>, instrument: Symbol) -> Self {
        let mut config = Self::default();
        config.stream.endpoint = endpoint.into();
        config.instrument = instrument;
        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint(&self.stream.endpoint)?;
        if !self.instrument.validate() {
            return Err(ConfigError::InvalidInstrument(self.instrument.to_string()));
        }
        if self.stream.channel.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "channel",
                value: self.stream.channel.clone(),
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Zero {
                name: "history_capacity",
            });
        }
        if self.latency_window == 0 {
            return Err(ConfigError::Zero {
                name: "latency_window",
            });
        }
        for (name, value) in [
            ("connect_timeout", self.stream.connect_timeout),
            ("idle_timeout", self.stream.idle_timeout),
            ("keepalive_interval", self.stream.keepalive_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero { name });
            }
        }
        self.thresholds.validate()
    }

    /// Load from process environment variables.
    ///
    /// `API_URL` is required; `BOOK_INSTRUMENT`, `BOOK_CHANNEL`,
    /// `BOOK_HISTORY_CAPACITY`, `BOOK_WARNING_MS`, `BOOK_UNHEALTHY_MS` and
    /// `BOOK_RECONNECT_ATTEMPTS` override the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, then validate.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.stream.endpoint = lookup("API_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("API_URL"))?;

        if let Some(instrument) = lookup("BOOK_INSTRUMENT") {
            config.instrument = Symbol::new(instrument.trim());
        }
        if let Some(channel) = lookup("BOOK_CHANNEL") {
            config.stream.channel = channel.trim().to_string();
        }
        if let Some(raw) = lookup("BOOK_HISTORY_CAPACITY") {
            config.history_capacity = parse_setting("BOOK_HISTORY_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("BOOK_WARNING_MS") {
            config.thresholds.warning_ms = parse_setting("BOOK_WARNING_MS", &raw)?;
        }
        if let Some(raw) = lookup("BOOK_UNHEALTHY_MS") {
            config.thresholds.unhealthy_ms = parse_setting("BOOK_UNHEALTHY_MS", &raw)?;
        }
        if let Some(raw) = lookup("BOOK_RECONNECT_ATTEMPTS") {
            let attempts: u32 = parse_setting("BOOK_RECONNECT_ATTEMPTS", &raw)?;
            config.stream.reconnect = ReconnectPolicy::bounded(attempts);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.stream.reconnect = policy;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream.idle_timeout = timeout;
        self
    }
}

pub(crate) fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let url = Url::parse(endpoint).map_err(|e| ConfigError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: format!("unsupported scheme {}", other),
        }),
    }
}

fn parse_setting<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_capacity, 120);
        assert_eq!(config.instrument, Symbol::new("BTC-USDT"));
        assert_eq!(config.stream.channel, "books5");
        assert_eq!(config.thresholds, HealthThresholds::default());
    }

    #[test]
    fn test_invalid_settings() {
        let config = EngineConfig::new("https://example.com", Symbol::new("BTC-USDT"));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEndpoint { .. })));

        let config = EngineConfig::new("not a url", Symbol::new("BTC-USDT"));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidEndpoint { .. })));

        let config = EngineConfig::new("wss://example.com/ws", Symbol::new(""));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidInstrument(_))));

        let config = EngineConfig::new("wss://example.com/ws", Symbol::new("BTC-USDT")).with_history_capacity(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                name: "history_capacity"
            })
        );

        let config = EngineConfig::new("wss://example.com/ws", Symbol::new("BTC-USDT")).with_idle_timeout(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::Zero { name: "idle_timeout" }));
    }

    #[test]
    fn test_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("API_URL", "ws://127.0.0.1:9000/ws"),
            ("BOOK_INSTRUMENT", "ETH-USDT"),
            ("BOOK_HISTORY_CAPACITY", "60"),
            ("BOOK_WARNING_MS", "50"),
            ("BOOK_UNHEALTHY_MS", "200"),
            ("BOOK_RECONNECT_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.stream.endpoint, "ws://127.0.0.1:9000/ws");
        assert_eq!(config.instrument, Symbol::new("ETH-USDT"));
        assert_eq!(config.history_capacity, 60);
        assert_eq!(config.thresholds.warning_ms, 50.0);
        assert_eq!(config.thresholds.unhealthy_ms, 200.0);
        assert_eq!(config.stream.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_from_lookup_errors() {
        assert_eq!(
            EngineConfig::from_lookup(lookup_from(&[])).unwrap_err(),
            ConfigError::Missing("API_URL")
        );

        let err = EngineConfig::from_lookup(lookup_from(&[
            ("API_URL", "wss://example.com/ws"),
            ("BOOK_HISTORY_CAPACITY", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "BOOK_HISTORY_CAPACITY", .. }));

        let err = EngineConfig::from_lookup(lookup_from(&[
            ("API_URL", "wss://example.com/ws"),
            ("BOOK_WARNING_MS", "400"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidThresholds { .. }));
    }
}
