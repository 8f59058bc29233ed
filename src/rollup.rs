//! Mergeable partial-aggregate states for the 1-minute OHLCV rollup.
//!
//! Each aggregate kind implements [`Merge`]. Merges are associative; they
//! are commutative except when two partials carry the same time key, where
//! the earlier-arrived partial keeps `open` and the later one keeps `close`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::candle::OhlcvBar;
use crate::model::tick::{datetime_from_micros, TickEvent};

pub trait Merge: Sized {
    fn merge(self, other: Self) -> Self;
}

/// Fold any number of partials into one. `None` for an empty input.
pub fn merge_all<T: Merge>(parts: impl IntoIterator<Item = T>) -> Option<T> {
    parts.into_iter().reduce(T::merge)
}

/// Value at the smallest time key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgMin {
    pub value: f64,
    pub key_us: i64,
}

impl Merge for ArgMin {
    fn merge(self, other: Self) -> Self {
        if other.key_us < self.key_us {
            other
        } else {
            self
        }
    }
}

/// Value at the largest time key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArgMax {
    pub value: f64,
    pub key_us: i64,
}

impl Merge for ArgMax {
    fn merge(self, other: Self) -> Self {
        if other.key_us >= self.key_us {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Max(pub f64);

impl Merge for Max {
    fn merge(self, other: Self) -> Self {
        Max(self.0.max(other.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Min(pub f64);

impl Merge for Min {
    fn merge(self, other: Self) -> Self {
        Min(self.0.min(other.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sum<T>(pub T);

impl<T: std::ops::Add<Output = T>> Merge for Sum<T> {
    fn merge(self, other: Self) -> Self {
        Sum(self.0 + other.0)
    }
}

/// Partial OHLCV state for one (symbol, minute) bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OhlcvState {
    pub open: ArgMin,
    pub close: ArgMax,
    pub high: Max,
    pub low: Min,
    pub volume: Sum<u64>,
    /// Σ price × size, the VWAP numerator.
    pub pv: Sum<f64>,
}

impl OhlcvState {
    pub fn from_trade(price: f64, size: u32, ts_us: i64) -> Self {
        Self {
            open: ArgMin {
                value: price,
                key_us: ts_us,
            },
            close: ArgMax {
                value: price,
                key_us: ts_us,
            },
            high: Max(price),
            low: Min(price),
            volume: Sum(u64::from(size)),
            pv: Sum(price * f64::from(size)),
        }
    }

    pub fn vwap(&self) -> f64 {
        if self.volume.0 == 0 {
            return f64::NAN;
        }
        self.pv.0 / self.volume.0 as f64
    }

    pub fn finish(&self, symbol: &str, minute: DateTime<Utc>) -> OhlcvBar {
        OhlcvBar {
            minute,
            symbol: symbol.to_string(),
            open: self.open.value,
            high: self.high.0,
            low: self.low.0,
            close: self.close.value,
            volume: self.volume.0,
            vwap: self.vwap(),
        }
    }
}

impl Merge for OhlcvState {
    fn merge(self, other: Self) -> Self {
        Self {
            open: self.open.merge(other.open),
            close: self.close.merge(other.close),
            high: self.high.merge(other.high),
            low: self.low.merge(other.low),
            volume: self.volume.merge(other.volume),
            pv: self.pv.merge(other.pv),
        }
    }
}

/// Rollup key: symbol plus minute bucket start in microseconds.
pub type BucketKey = (String, i64);

/// Fold a batch of events (in arrival order) into one partial state per
/// bucket. Non-trade events are skipped.
pub fn fold_trades<'a>(
    events: impl IntoIterator<Item = &'a TickEvent>,
) -> BTreeMap<BucketKey, OhlcvState> {
    let mut buckets: BTreeMap<BucketKey, OhlcvState> = BTreeMap::new();
    for event in events.into_iter().filter(|e| e.is_trade()) {
        let state = OhlcvState::from_trade(event.price, event.size, event.event_time_us());
        let key = (event.symbol.clone(), event.minute_bucket_us());
        buckets
            .entry(key)
            .and_modify(|existing| *existing = existing.merge(state))
            .or_insert(state);
    }
    buckets
}

/// Finish folded buckets for one symbol, newest minute first, at most `limit`.
pub fn bars_for_symbol(
    buckets: &BTreeMap<BucketKey, OhlcvState>,
    symbol: &str,
    limit: usize,
) -> Vec<OhlcvBar> {
    buckets
        .iter()
        .rev()
        .filter(|((sym, _), _)| sym == symbol)
        .filter_map(|((sym, minute_us), state)| {
            datetime_from_micros(*minute_us)
                .ok()
                .map(|minute| state.finish(sym, minute))
        })
        .take(limit)
        .collect()
}
