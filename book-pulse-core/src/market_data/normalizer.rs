//! Tick normalizer: raw book snapshot -> validated microstructure metrics

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

use crate::exchanges::{BookSide, RawTick, Rejection, Symbol};

/// Canonical output for one accepted tick. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedMetrics {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    /// `best_ask - best_bid`, always positive.
    pub spread: Decimal,
    /// `(best_bid + best_ask) / 2`
    pub mid_price: Decimal,
    pub total_bid_volume: Decimal,
    pub total_ask_volume: Decimal,
    pub bid_depth_weighted_price: Decimal,
    pub ask_depth_weighted_price: Decimal,
    /// Levels that parsed and contributed to the side totals.
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub instrument_id: Option<Symbol>,
    /// Exchange timestamp, milliseconds since the epoch.
    pub source_timestamp: Option<i64>,
    pub received_at: DateTime<Utc>,
}

impl NormalizedMetrics {
    pub fn mid_price_f64(&self) -> f64 {
        self.mid_price.to_f64().unwrap_or(f64::NAN)
    }

    pub fn spread_f64(&self) -> f64 {
        self.spread.to_f64().unwrap_or(f64::NAN)
    }

    /// Spread in basis points of the mid price
    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid_price_f64();
        if mid == 0.0 {
            return 0.0;
        }
        (self.spread_f64() / mid) * 10_000.0
    }

    /// Bid share of the visible volume, in [0, 1]
    pub fn book_imbalance(&self) -> f64 {
        let total = self.total_bid_volume + self.total_ask_volume;
        if total.is_zero() {
            return 0.5;
        }
        (self.total_bid_volume / total).to_f64().unwrap_or(0.5)
    }
}

/// Normalize a raw tick, stamping it with the current wall-clock time.
pub fn normalize(raw: &RawTick) -> Result<NormalizedMetrics, Rejection> {
    normalize_at(raw, Utc::now())
}

/// Normalize a raw tick with an explicit capture time.
pub fn normalize_at(raw: &RawTick, received_at: DateTime<Utc>) -> Result<NormalizedMetrics, Rejection> {
    if raw.asks.is_empty() {
        return Err(Rejection::EmptySide(BookSide::Ask));
    }
    if raw.bids.is_empty() {
        return Err(Rejection::EmptySide(BookSide::Bid));
    }

    let (best_ask, _) = parse_level(&raw.asks[0]).map_err(|detail| Rejection::MalformedLevel {
        side: BookSide::Ask,
        detail,
    })?;
    let (best_bid, _) = parse_level(&raw.bids[0]).map_err(|detail| Rejection::MalformedLevel {
        side: BookSide::Bid,
        detail,
    })?;

    if best_bid >= best_ask {
        return Err(Rejection::CrossedOrInvertedBook {
            bid: best_bid,
            ask: best_ask,
        });
    }

    let spread = best_ask - best_bid;
    let mid_price = best_bid
        .checked_add(best_ask)
        .map(|sum| sum / Decimal::TWO)
        .ok_or_else(|| Rejection::MalformedLevel {
            side: BookSide::Ask,
            detail: "price out of range".to_string(),
        })?;

    let bids = SideDepth::collect(BookSide::Bid, &raw.bids);
    let asks = SideDepth::collect(BookSide::Ask, &raw.asks);

    Ok(NormalizedMetrics {
        best_bid,
        best_ask,
        spread,
        mid_price,
        total_bid_volume: bids.volume,
        total_ask_volume: asks.volume,
        bid_depth_weighted_price: bids.weighted_price(best_bid),
        ask_depth_weighted_price: asks.weighted_price(best_ask),
        bid_levels: bids.levels,
        ask_levels: asks.levels,
        instrument_id: raw.inst_id.as_deref().map(Symbol::new),
        source_timestamp: raw.source_timestamp_ms(),
        received_at,
    })
}

/// Running totals over the parsable levels of one side
#[derive(Debug, Default)]
struct SideDepth {
    volume: Decimal,
    notional: Decimal,
    levels: usize,
}

impl SideDepth {
    fn collect(side: BookSide, levels: &[Value]) -> Self {
        let mut depth = Self::default();
        for (index, level) in levels.iter().enumerate() {
            let (price, size) = match parse_level(level) {
                Ok(parsed) => parsed,
                Err(detail) => {
                    debug!("Skipping {} level {}: {}", side, index, detail);
                    continue;
                }
            };
            let sums = depth
                .volume
                .checked_add(size)
                .zip(price.checked_mul(size).and_then(|n| depth.notional.checked_add(n)));
            match sums {
                Some((volume, notional)) => {
                    depth.volume = volume;
                    depth.notional = notional;
                    depth.levels += 1;
                }
                None => debug!("Skipping {} level {}: overflow", side, index),
            }
        }
        depth
    }

    fn weighted_price(&self, best: Decimal) -> Decimal {
        if self.volume.is_zero() {
            return best;
        }
        self.notional.checked_div(self.volume).unwrap_or(best)
    }
}

/// Parse `[price, size, ...]`; prices must be positive, sizes non-negative.
fn parse_level(level: &Value) -> Result<(Decimal, Decimal), String> {
    let fields = level.as_array().ok_or_else(|| format!("level is not an array: {}", level))?;
    let price = fields
        .first()
        .and_then(parse_number)
        .ok_or_else(|| format!("unparsable price in {}", level))?;
    let size = fields
        .get(1)
        .and_then(parse_number)
        .ok_or_else(|| format!("unparsable size in {}", level))?;

    if price <= Decimal::ZERO {
        return Err(format!("non-positive price {}", price));
    }
    if size < Decimal::ZERO {
        return Err(format!("negative size {}", size));
    }
    Ok((price, size))
}

fn parse_number(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => parse_decimal(s.trim()),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

// Decimal has no NaN or infinity, so anything non-finite fails here.
fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s).or_else(|_| Decimal::from_scientific(s)).ok()
}
