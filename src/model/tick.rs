use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire format for `event_time`: microsecond precision, UTC, no offset suffix.
pub const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const EVENT_TIME_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

pub const MINUTE_US: i64 = 60_000_000;

/// Largest `seq_id`/`source_version` the store can hold (signed BIGINT).
pub const MAX_STORED_ID: u64 = i64::MAX as u64;

/// Largest `size` the store can hold (signed INTEGER).
pub const MAX_STORED_SIZE: u32 = i32::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Trade,
    Quote,
    Book,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Trade => "trade",
            EventType::Quote => "quote",
            EventType::Book => "book",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(EventType::Trade),
            "quote" => Ok(EventType::Quote),
            "book" => Ok(EventType::Book),
            other => Err(format!("unknown event_type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

/// One tick/trade record as produced, transported and stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickEvent {
    pub exchange: String,
    pub symbol: String,
    #[serde(with = "event_time_serde")]
    pub event_time: DateTime<Utc>,
    /// Logical event id. Corrections reuse an earlier id.
    pub seq_id: u64,
    pub event_type: EventType,
    pub price: f64,
    pub size: u32,
    pub side: Side,
    /// Highest version wins when several rows share `(symbol, seq_id)`.
    pub source_version: u64,
}

impl TickEvent {
    pub fn is_trade(&self) -> bool {
        self.event_type == EventType::Trade
    }

    pub fn event_time_us(&self) -> i64 {
        self.event_time.timestamp_micros()
    }

    pub fn minute_bucket_us(&self) -> i64 {
        minute_bucket_us(self.event_time_us())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("symbol must not be empty".to_string());
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(format!("price must be positive, got {}", self.price));
        }
        if self.size == 0 {
            return Err("size must be positive".to_string());
        }
        if self.size > MAX_STORED_SIZE {
            return Err(format!("size {} exceeds {}", self.size, MAX_STORED_SIZE));
        }
        if self.seq_id > MAX_STORED_ID {
            return Err(format!("seq_id {} exceeds {}", self.seq_id, MAX_STORED_ID));
        }
        if self.source_version > MAX_STORED_ID {
            return Err(format!(
                "source_version {} exceeds {}",
                self.source_version, MAX_STORED_ID
            ));
        }
        Ok(())
    }
}

/// Truncate a microsecond timestamp to the start of its minute.
pub fn minute_bucket_us(ts_us: i64) -> i64 {
    ts_us - ts_us.rem_euclid(MINUTE_US)
}

pub fn format_event_time(ts: &DateTime<Utc>) -> String {
    ts.format(EVENT_TIME_FORMAT).to_string()
}

/// Accepts the wire format (any fractional precision) and RFC 3339.
pub fn parse_event_time(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, EVENT_TIME_PARSE_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| format!("invalid event_time '{}': {}", raw, e))
}

pub fn datetime_from_micros(ts_us: i64) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_micros(ts_us)
        .ok_or_else(|| format!("timestamp {} us is out of range", ts_us))
}

mod event_time_serde {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_event_time(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_event_time(&raw).map_err(serde::de::Error::custom)
    }
}
