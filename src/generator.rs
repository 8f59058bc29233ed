//! Synthetic tick stream with correction injection.
//!
//! A correction is an additional row: it reuses the `(symbol, seq_id)` of a
//! recent fresh event with a higher `source_version` and a new price. The
//! original row is never replaced.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::model::tick::{EventType, Side, TickEvent, MAX_STORED_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    pub base_price: f64,
}

impl SymbolSpec {
    pub fn new(symbol: &str, base_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            base_price,
        }
    }
}

pub fn default_universe() -> Vec<SymbolSpec> {
    vec![
        SymbolSpec::new("AAPL", 170.0),
        SymbolSpec::new("GOOG", 2800.0),
        SymbolSpec::new("MSFT", 300.0),
        SymbolSpec::new("AMZN", 3300.0),
        SymbolSpec::new("TSLA", 700.0),
        SymbolSpec::new("BTC-USD", 60000.0),
        SymbolSpec::new("ETH-USD", 4000.0),
        SymbolSpec::new("EUR-USD", 1.1),
        SymbolSpec::new("USD-JPY", 150.0),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub exchange: String,
    pub universe: Vec<SymbolSpec>,
    /// Probability in [0, 1] that an emission is a correction.
    pub correction_rate: f64,
    /// Capacity of the recent-event window corrections draw from.
    pub correction_window: usize,
    /// Relative half-width of the uniform price perturbation.
    pub price_jitter: f64,
    pub price_decimals: u32,
    pub max_size: u32,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            exchange: "XNAS".to_string(),
            universe: default_universe(),
            correction_rate: 0.05,
            correction_window: 200,
            price_jitter: 0.001,
            price_decimals: 6,
            max_size: 100,
        }
    }
}

impl GeneratorConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.universe.is_empty() {
            return Err("symbol universe must not be empty".to_string());
        }
        let invalid = |s: &&SymbolSpec| {
            s.symbol.trim().is_empty() || !s.base_price.is_finite() || s.base_price <= 0.0
        };
        if let Some(spec) = self.universe.iter().find(invalid) {
            return Err(format!(
                "invalid symbol spec '{}' with base price {}",
                spec.symbol, spec.base_price
            ));
        }
        if !(0.0..=1.0).contains(&self.correction_rate) {
            return Err(format!(
                "correction_rate must be within [0, 1], got {}",
                self.correction_rate
            ));
        }
        if self.correction_window == 0 {
            return Err("correction_window must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.price_jitter) {
            return Err(format!(
                "price_jitter must be within [0, 1), got {}",
                self.price_jitter
            ));
        }
        if self.max_size == 0 || self.max_size > MAX_STORED_SIZE {
            return Err(format!(
                "max_size must be within [1, {}], got {}",
                MAX_STORED_SIZE, self.max_size
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WindowEntry {
    universe_idx: usize,
    seq_id: u64,
    version: u64,
}

/// Bounded ring of recently emitted fresh events. The oldest entry is
/// evicted once capacity is reached.
#[derive(Debug, Clone)]
pub struct CorrectionWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
}

impl CorrectionWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, seq_id: u64) -> bool {
        self.entries.iter().any(|e| e.seq_id == seq_id)
    }

    fn push(&mut self, entry: WindowEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn get_mut(&mut self, idx: usize) -> Option<&mut WindowEntry> {
        self.entries.get_mut(idx)
    }

    fn find_mut(&mut self, seq_id: u64) -> Option<&mut WindowEntry> {
        self.entries.iter_mut().find(|e| e.seq_id == seq_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub emitted: u64,
    pub fresh: u64,
    pub corrections: u64,
}

pub struct TickGenerator {
    config: GeneratorConfig,
    rng: StdRng,
    next_seq_id: u64,
    window: CorrectionWindow,
    stats: GeneratorStats,
}

impl TickGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, String> {
        Self::from_rng(config, StdRng::from_entropy())
    }

    /// Deterministic stream for a given seed.
    pub fn with_seed(config: GeneratorConfig, seed: u64) -> Result<Self, String> {
        Self::from_rng(config, StdRng::seed_from_u64(seed))
    }

    fn from_rng(config: GeneratorConfig, rng: StdRng) -> Result<Self, String> {
        config.validate()?;
        let window = CorrectionWindow::new(config.correction_window);
        Ok(Self {
            config,
            rng,
            next_seq_id: 1,
            window,
            stats: GeneratorStats::default(),
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn stats(&self) -> GeneratorStats {
        self.stats
    }

    pub fn window(&self) -> &CorrectionWindow {
        &self.window
    }

    /// Next emission: a correction with probability `correction_rate` once
    /// the window holds something, otherwise a fresh event.
    pub fn next_event(&mut self, now: DateTime<Utc>) -> TickEvent {
        let correct = !self.window.is_empty()
            && self.config.correction_rate > 0.0
            && self.rng.gen_bool(self.config.correction_rate);
        if correct {
            let idx = self.rng.gen_range(0..self.window.len());
            if let Some(event) = self.correction_at(idx, now) {
                return event;
            }
        }
        self.fresh_event(now)
    }

    /// Force a correction for `seq_id`. `None` if it has left the window.
    pub fn correct(&mut self, seq_id: u64, now: DateTime<Utc>) -> Option<TickEvent> {
        let entry = *self.window.find_mut(seq_id)?;
        let event = self.bump(entry, now);
        if let Some(slot) = self.window.find_mut(seq_id) {
            slot.version = event.source_version;
        }
        Some(event)
    }

    fn correction_at(&mut self, idx: usize, now: DateTime<Utc>) -> Option<TickEvent> {
        let entry = *self.window.get_mut(idx)?;
        let event = self.bump(entry, now);
        if let Some(slot) = self.window.get_mut(idx) {
            slot.version = event.source_version;
        }
        Some(event)
    }

    fn bump(&mut self, entry: WindowEntry, now: DateTime<Utc>) -> TickEvent {
        let mut event = self.build(entry.universe_idx, entry.seq_id, now);
        event.source_version = entry.version + 1;
        self.stats.emitted += 1;
        self.stats.corrections += 1;
        event
    }

    fn fresh_event(&mut self, now: DateTime<Utc>) -> TickEvent {
        let universe_idx = self.rng.gen_range(0..self.config.universe.len());
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        let event = self.build(universe_idx, seq_id, now);
        self.window.push(WindowEntry {
            universe_idx,
            seq_id,
            version: event.source_version,
        });
        self.stats.emitted += 1;
        self.stats.fresh += 1;
        event
    }

    fn build(&mut self, universe_idx: usize, seq_id: u64, now: DateTime<Utc>) -> TickEvent {
        let spec = &self.config.universe[universe_idx];
        let spread = spec.base_price * self.config.price_jitter;
        let raw_price = if spread > 0.0 {
            spec.base_price + self.rng.gen_range(-spread..=spread)
        } else {
            spec.base_price
        };
        let scale = 10f64.powi(self.config.price_decimals as i32);
        let mut price = (raw_price * scale).round() / scale;
        if price <= 0.0 {
            price = spec.base_price;
        }
        TickEvent {
            exchange: self.config.exchange.clone(),
            symbol: spec.symbol.clone(),
            event_time: now,
            seq_id,
            event_type: EventType::Trade,
            price,
            size: self.rng.gen_range(1..=self.config.max_size),
            side: if self.rng.gen_bool(0.5) {
                Side::Buy
            } else {
                Side::Sell
            },
            source_version: 1,
        }
    }
}
