//! Book Pulse Monitor
//!
//! Headless consumer of the order-book metrics engine: starts one stream,
//! polls the published snapshot at a fixed cadence and logs it.

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use book_pulse_core::{ConnectionState, EngineConfig, EngineRegistry, HealthState, SnapshotReader};

const DEFAULT_REFRESH_MS: u64 = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Book Pulse monitor");

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let refresh = refresh_interval(std::env::var("BOOK_REFRESH_MS").ok().as_deref())?;
    let endpoint = config.stream.endpoint.clone();
    let instrument = config.instrument.clone();

    let registry = EngineRegistry::new();
    let engine = registry.get_or_create(config)?;
    engine.start()?;
    info!("📈 Streaming {} from {}", instrument, endpoint);

    let reader = engine.reader();
    let monitor = tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh);
        loop {
            interval.tick().await;
            report(&reader);
        }
    });

    info!("📊 Monitor is running. Press Ctrl+C to stop.");

    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("🛑 Shutdown signal received...");

    monitor.abort();
    registry.stop_all();

    let metrics = engine.stream_metrics();
    info!(
        "✅ Stopped after {} accepted / {} rejected ticks",
        metrics.ticks_accepted,
        metrics.ticks_rejected()
    );
    Ok(())
}

fn refresh_interval(raw: Option<&str>) -> Result<Duration> {
    let millis = match raw {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("BOOK_REFRESH_MS must be a whole number of milliseconds, got {:?}", value))?,
        None => DEFAULT_REFRESH_MS,
    };
    anyhow::ensure!(millis > 0, "BOOK_REFRESH_MS must be positive");
    Ok(Duration::from_millis(millis))
}

/// Log one observation of the engine state.
fn report(reader: &SnapshotReader) {
    let state = reader.connection_state();
    let summary = reader.get_health_summary();

    let Some(latest) = reader.get_latest() else {
        match state {
            ConnectionState::Failed => warn!("Stream failed before any tick was accepted"),
            _ => info!("⏳ Waiting for data ({})", state),
        }
        return;
    };

    let latency = reader
        .get_latency_ms()
        .map(|ms| format!("{:.2} ms", ms))
        .unwrap_or_else(|| "n/a".to_string());
    let line = format!(
        "{} bid {} ask {} spread {} ({:.2} bps) mid {} | latency {} [{}] session {} | {}",
        reader.instrument(),
        latest.best_bid,
        latest.best_ask,
        latest.spread,
        latest.spread_bps(),
        latest.mid_price,
        latency,
        summary.instantaneous,
        summary.session,
        state
    );

    match summary.session {
        HealthState::Unhealthy => warn!("{}", line),
        _ => info!("{}", line),
    }
    if state == ConnectionState::Failed {
        warn!(
            "Stream failed; showing data {:.1}s old",
            reader.staleness_secs().unwrap_or_default()
        );
    }

    if let Ok(json) = serde_json::to_string(&reader.stream_metrics()) {
        debug!("Stream metrics: {}", json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_refresh_interval() {
        assert_eq!(assert_ok!(refresh_interval(None)), Duration::from_millis(1_000));
        assert_eq!(assert_ok!(refresh_interval(Some(" 250 "))), Duration::from_millis(250));
        assert_err!(refresh_interval(Some("0")));
        assert_err!(refresh_interval(Some("soon")));
    }
}
