use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rendering of the `minute` column in OHLCV result sets.
pub const MINUTE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One finished 1-minute OHLCV bar for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub minute: DateTime<Utc>,
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub vwap: f64,
}

impl OhlcvBar {
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// `low <= open, close <= high`, and `vwap` inside the range when volume > 0.
    pub fn is_consistent(&self) -> bool {
        let ohlc = self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high;
        if !ohlc {
            return false;
        }
        if self.volume == 0 {
            return true;
        }
        // vwap is a ratio of float sums; allow rounding at the range edges.
        let tol = self.high.abs().max(1.0) * 1e-12;
        self.vwap >= self.low - tol && self.vwap <= self.high + tol
    }

    /// Decode one normalized result record (`minute, symbol, open, high, low,
    /// close, volume, vwap`).
    pub fn from_record(record: &Map<String, Value>) -> Result<Self, String> {
        let minute_raw = record
            .get("minute")
            .and_then(Value::as_str)
            .ok_or("missing text column 'minute'")?;
        let minute = NaiveDateTime::parse_from_str(minute_raw, MINUTE_FORMAT)
            .map_err(|e| format!("invalid minute '{}': {}", minute_raw, e))?
            .and_utc();
        let symbol = record
            .get("symbol")
            .and_then(Value::as_str)
            .ok_or("missing text column 'symbol'")?
            .to_string();
        let volume = record
            .get("volume")
            .and_then(Value::as_u64)
            .ok_or("missing integer column 'volume'")?;

        Ok(Self {
            minute,
            symbol,
            open: float_field(record, "open")?,
            high: float_field(record, "high")?,
            low: float_field(record, "low")?,
            close: float_field(record, "close")?,
            volume,
            vwap: float_field(record, "vwap")?,
        })
    }
}

fn float_field(record: &Map<String, Value>, name: &str) -> Result<f64, String> {
    record
        .get(name)
        .and_then(Value::as_f64)
        .ok_or_else(|| format!("missing numeric column '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Map<String, Value> {
        match json!({
            "minute": "2024-03-01T14:30:00",
            "symbol": "AAPL",
            "open": 170.0,
            "high": 171.0,
            "low": 169.5,
            "close": 170.5,
            "volume": 30,
            "vwap": 170.25,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn decodes_normalized_record() {
        let bar = OhlcvBar::from_record(&record()).unwrap();
        assert_eq!(bar.symbol, "AAPL");
        assert_eq!(bar.volume, 30);
        assert_eq!(bar.minute.format(MINUTE_FORMAT).to_string(), "2024-03-01T14:30:00");
        assert!(bar.is_bullish());
        assert!(bar.is_consistent());
    }

    #[test]
    fn rejects_missing_columns() {
        let mut rec = record();
        rec.remove("vwap");
        assert!(OhlcvBar::from_record(&rec).is_err());
    }

    #[test]
    fn flags_inconsistent_bar() {
        let mut bar = OhlcvBar::from_record(&record()).unwrap();
        bar.open = 172.0;
        assert!(!bar.is_consistent());
        bar.open = 170.0;
        bar.vwap = 180.0;
        assert!(!bar.is_consistent());
    }
}
