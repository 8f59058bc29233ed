use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// The four benchmark query families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    /// Raw-scan OHLCV over the fact table.
    Slow,
    /// Rollup-merge OHLCV over the partial-state table.
    Fast,
    /// Row count including superseded duplicates.
    RawCount,
    /// Row count after resolving the current record per seq_id.
    FinalCount,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [
        QueryKind::Slow,
        QueryKind::Fast,
        QueryKind::RawCount,
        QueryKind::FinalCount,
    ];

    /// `query_type` value reported over HTTP.
    pub fn as_str(self) -> &'static str {
        match self {
            QueryKind::Slow => "slow",
            QueryKind::Fast => "fast",
            QueryKind::RawCount => "raw_count",
            QueryKind::FinalCount => "final_count",
        }
    }

    /// `query_type` value written to the history file.
    pub fn history_label(self) -> &'static str {
        match self {
            QueryKind::Slow => "slow",
            QueryKind::Fast => "fast",
            QueryKind::RawCount => "dedup_raw",
            QueryKind::FinalCount => "dedup_final",
        }
    }

    pub fn from_history_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.history_label() == label || kind.as_str() == label)
    }

    pub fn is_ohlcv(self) -> bool {
        matches!(self, QueryKind::Slow | QueryKind::Fast)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const HISTORY_COLUMNS: [&str; 7] = [
    "timestamp",
    "query_type",
    "symbol",
    "query_time_ms",
    "rows_returned",
    "total_rows",
    "speedup",
];

/// One persisted benchmark invocation. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub timestamp: DateTime<Utc>,
    pub query_kind: QueryKind,
    pub symbol: String,
    pub elapsed_ms: f64,
    pub rows_returned: u64,
    pub total_rows: u64,
    /// Slow-over-fast ratio for the pair this record closed, if any.
    pub speedup: Option<f64>,
}

impl BenchmarkRecord {
    pub fn to_csv_row(&self) -> String {
        let speedup = self
            .speedup
            .filter(|s| s.is_finite())
            .map(|s| format!("{:.2}", s))
            .unwrap_or_default();
        [
            self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            self.query_kind.history_label().to_string(),
            escape_csv_field(&self.symbol),
            format!("{:.2}", self.elapsed_ms),
            self.rows_returned.to_string(),
            self.total_rows.to_string(),
            speedup,
        ]
        .join(",")
    }

    pub fn from_csv_row(line: &str) -> Result<Self, String> {
        let fields = split_csv_line(line);
        if fields.len() != HISTORY_COLUMNS.len() {
            return Err(format!(
                "expected {} fields, got {}",
                HISTORY_COLUMNS.len(),
                fields.len()
            ));
        }
        let timestamp = DateTime::parse_from_rfc3339(&fields[0])
            .map_err(|e| format!("invalid timestamp '{}': {}", fields[0], e))?
            .with_timezone(&Utc);
        let query_kind = QueryKind::from_history_label(&fields[1])
            .ok_or_else(|| format!("unknown query_type '{}'", fields[1]))?;
        let elapsed_ms = fields[3]
            .parse::<f64>()
            .map_err(|e| format!("invalid query_time_ms '{}': {}", fields[3], e))?;
        let rows_returned = fields[4]
            .parse::<u64>()
            .map_err(|e| format!("invalid rows_returned '{}': {}", fields[4], e))?;
        let total_rows = fields[5]
            .parse::<u64>()
            .map_err(|e| format!("invalid total_rows '{}': {}", fields[5], e))?;
        let speedup = if fields[6].is_empty() {
            None
        } else {
            Some(
                fields[6]
                    .parse::<f64>()
                    .map_err(|e| format!("invalid speedup '{}': {}", fields[6], e))?,
            )
        };
        Ok(Self {
            timestamp,
            query_kind,
            symbol: fields[2].clone(),
            elapsed_ms,
            rows_returned,
            total_rows,
            speedup,
        })
    }
}

pub fn history_header() -> String {
    HISTORY_COLUMNS.join(",")
}

fn escape_csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim_end_matches(['\r', '\n']).chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(speedup: Option<f64>) -> BenchmarkRecord {
        BenchmarkRecord {
            timestamp: DateTime::parse_from_rfc3339("2024-03-01T14:30:00.250000Z")
                .unwrap()
                .with_timezone(&Utc),
            query_kind: QueryKind::Fast,
            symbol: "BTC-USD".to_string(),
            elapsed_ms: 3.14159,
            rows_returned: 100,
            total_rows: 0,
            speedup,
        }
    }

    #[test]
    fn csv_row_rounds_and_labels() {
        let row = record(Some(12.5)).to_csv_row();
        assert_eq!(
            row,
            "2024-03-01T14:30:00.250000Z,fast,BTC-USD,3.14,100,0,12.50"
        );
    }

    #[test]
    fn nan_speedup_is_written_empty() {
        let row = record(Some(f64::NAN)).to_csv_row();
        assert!(row.ends_with(",0,"));
        let parsed = BenchmarkRecord::from_csv_row(&row).unwrap();
        assert_eq!(parsed.speedup, None);
    }

    #[test]
    fn parses_quoted_symbol() {
        let mut rec = record(None);
        rec.symbol = "ODD,\"SYM\"".to_string();
        let parsed = BenchmarkRecord::from_csv_row(&rec.to_csv_row()).unwrap();
        assert_eq!(parsed.symbol, "ODD,\"SYM\"");
        assert_eq!(parsed.query_kind, QueryKind::Fast);
    }

    #[test]
    fn history_labels_map_back_to_kinds() {
        for kind in QueryKind::ALL {
            assert_eq!(QueryKind::from_history_label(kind.history_label()), Some(kind));
        }
        assert_eq!(QueryKind::RawCount.history_label(), "dedup_raw");
        assert_eq!(QueryKind::from_history_label("compression"), None);
    }
}
