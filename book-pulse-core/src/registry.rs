//! Engine instances owned by the composing application
//!
//! Keyed by `(endpoint, instrument)`. Engines are created and stopped
//! explicitly; nothing here is process-global.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::EngineConfig;
use crate::exchanges::{ConfigError, ExchangeResult, Symbol};
use crate::OrderBookEngine;

type EngineKey = (String, Symbol);

/// Registry of running or idle engines
#[derive(Default)]
pub struct EngineRegistry {
    engines: DashMap<EngineKey, Arc<OrderBookEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the engine for the config's endpoint and instrument, creating
    /// it if absent. An existing engine keeps its original configuration.
    pub fn get_or_create(&self, config: EngineConfig) -> ExchangeResult<Arc<OrderBookEngine>> {
        let key = (config.stream.endpoint.clone(), config.instrument.clone());
        match self.engines.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                info!(
                    "Registering engine for {} on {}",
                    config.instrument, config.stream.endpoint
                );
                let engine = Arc::new(OrderBookEngine::new(config)?);
                entry.insert(engine.clone());
                Ok(engine)
            }
        }
    }

    pub fn get(&self, endpoint: &str, instrument: &Symbol) -> Option<Arc<OrderBookEngine>> {
        self.engines
            .get(&(endpoint.to_string(), instrument.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Move an engine to another instrument and re-key it.
    ///
    /// `Ok(None)` if no engine is registered under `from`. Fails without
    /// touching either engine when `to` is already registered.
    pub fn resubscribe(
        &self,
        endpoint: &str,
        from: &Symbol,
        to: Symbol,
    ) -> ExchangeResult<Option<Arc<OrderBookEngine>>> {
        if !to.validate() {
            return Err(ConfigError::InvalidInstrument(to.to_string()).into());
        }
        if from == &to {
            let Some(engine) = self.get(endpoint, from) else {
                return Ok(None);
            };
            engine.resubscribe(to)?;
            return Ok(Some(engine));
        }

        let source = (endpoint.to_string(), from.clone());
        let Some((_, engine)) = self.engines.remove(&source) else {
            return Ok(None);
        };

        // The target slot is claimed under its shard lock, so a concurrent
        // `get_or_create` either wins the slot or sees the moved engine.
        let outcome: ExchangeResult<()> = match self.engines.entry((endpoint.to_string(), to.clone())) {
            Entry::Occupied(_) => Err(ConfigError::InvalidValue {
                name: "instrument",
                value: format!("{} already registered on {}", to, endpoint),
            }
            .into()),
            Entry::Vacant(slot) => match engine.resubscribe(to) {
                Ok(()) => {
                    slot.insert(engine.clone());
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => Ok(Some(engine)),
            Err(e) => {
                if let Entry::Vacant(slot) = self.engines.entry(source) {
                    slot.insert(engine);
                }
                Err(e)
            }
        }
    }

    /// Stop the engine and drop it from the registry.
    pub fn stop(&self, endpoint: &str, instrument: &Symbol) -> bool {
        match self.engines.remove(&(endpoint.to_string(), instrument.clone())) {
            Some((_, engine)) => {
                engine.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let keys: Vec<EngineKey> = self.engines.iter().map(|entry| entry.key().clone()).collect();
        for (endpoint, instrument) in keys {
            self.stop(&endpoint, &instrument);
        }
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}
