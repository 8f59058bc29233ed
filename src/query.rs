//! The four benchmark query families and their timed execution.

use std::time::{Duration, Instant};

use duckdb::types::Value;
use serde_json::{Map, Value as JsonValue};

use crate::error::BenchError;
use crate::model::bench::QueryKind;
use crate::model::candle::OhlcvBar;
use crate::store::{QueryRows, QueryTemplate, TickStore};

pub const OHLCV_COLUMNS: &[&str] = &[
    "minute", "symbol", "open", "high", "low", "close", "volume", "vwap",
];

pub const COUNT_COLUMNS: &[&str] = &["count"];

/// Raw scan: groups every trade row for the symbol. No deduplication.
pub const RAW_SCAN_OHLCV: QueryTemplate = QueryTemplate {
    sql: r#"
SELECT
    strftime(bucket, '%Y-%m-%dT%H:%M:%S') AS minute,
    symbol, open, high, low, close, volume, vwap
FROM (
    SELECT
        date_trunc('minute', event_time) AS bucket,
        symbol,
        arg_min(price, event_time) AS open,
        max(price) AS high,
        min(price) AS low,
        arg_max(price, event_time) AS close,
        CAST(sum(size) AS BIGINT) AS volume,
        sum(price * size) / sum(size) AS vwap
    FROM ticks
    WHERE symbol = ? AND event_type = 'trade'
    GROUP BY symbol, bucket
)
ORDER BY bucket DESC
LIMIT ?
"#,
    columns: OHLCV_COLUMNS,
};

/// Rollup merge: finalizes the partial states per bucket.
pub const ROLLUP_MERGE_OHLCV: QueryTemplate = QueryTemplate {
    sql: r#"
SELECT
    strftime(bucket, '%Y-%m-%dT%H:%M:%S') AS minute,
    symbol, open, high, low, close, volume, vwap
FROM (
    SELECT
        minute AS bucket,
        symbol,
        arg_min(open_price, open_time) AS open,
        max(high) AS high,
        min(low) AS low,
        arg_max(close_price, close_time) AS close,
        CAST(sum(volume) AS BIGINT) AS volume,
        sum(pv) / sum(volume) AS vwap
    FROM trades_1m_agg
    WHERE symbol = ?
    GROUP BY symbol, minute
)
ORDER BY bucket DESC
LIMIT ?
"#,
    columns: OHLCV_COLUMNS,
};

pub const RAW_COUNT: QueryTemplate = QueryTemplate {
    sql: "SELECT count(*) AS count FROM ticks WHERE symbol = ?",
    columns: COUNT_COLUMNS,
};

/// One row per (symbol, seq_id): highest source_version, latest arrival on ties.
pub const FINAL_COUNT: QueryTemplate = QueryTemplate {
    sql: r#"
SELECT count(*) AS count
FROM (
    SELECT row_number() OVER (
        PARTITION BY symbol, seq_id
        ORDER BY source_version DESC, arrival_id DESC
    ) AS version_rank
    FROM ticks
    WHERE symbol = ?
)
WHERE version_rank = 1
"#,
    columns: COUNT_COLUMNS,
};

impl QueryKind {
    pub fn template(self) -> &'static QueryTemplate {
        match self {
            QueryKind::Slow => &RAW_SCAN_OHLCV,
            QueryKind::Fast => &ROLLUP_MERGE_OHLCV,
            QueryKind::RawCount => &RAW_COUNT,
            QueryKind::FinalCount => &FINAL_COUNT,
        }
    }

    /// Bound parameters in placeholder order. Count families ignore `limit`.
    pub fn bind(self, symbol: &str, limit: u32) -> Vec<Value> {
        let mut params = vec![Value::Text(symbol.to_string())];
        if self.is_ohlcv() {
            params.push(Value::BigInt(i64::from(limit)));
        }
        params
    }
}

/// A result set together with the wall-clock time its execution took.
#[derive(Debug, Clone)]
pub struct TimedRows {
    pub kind: QueryKind,
    pub elapsed_ms: f64,
    pub rows: QueryRows,
}

impl TimedRows {
    pub fn records(&self) -> Vec<Map<String, JsonValue>> {
        self.rows.records()
    }

    pub fn bars(&self) -> Result<Vec<OhlcvBar>, BenchError> {
        self.records()
            .iter()
            .map(|record| OhlcvBar::from_record(record).map_err(|e| self.malformed(e)))
            .collect()
    }

    pub fn count(&self) -> Result<u64, BenchError> {
        match self.rows.rows.as_slice() {
            [row] => row
                .first()
                .and_then(JsonValue::as_u64)
                .ok_or_else(|| self.malformed("count is not a non-negative integer".to_string())),
            rows => Err(self.malformed(format!("expected one count row, got {}", rows.len()))),
        }
    }

    fn malformed(&self, cause: String) -> BenchError {
        BenchError::QueryFailed {
            kind: self.kind,
            elapsed_ms: self.elapsed_ms,
            cause: format!("malformed result: {}", cause),
        }
    }
}

/// Runs query families against the store. Never retries.
#[derive(Clone)]
pub struct QueryEngine {
    store: Option<TickStore>,
    timeout: Duration,
}

impl QueryEngine {
    pub fn new(store: Option<TickStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    pub fn store(&self) -> Option<&TickStore> {
        self.store.as_ref()
    }

    /// Execute one family. Connection setup happens before the clock starts;
    /// a timeout yields `QueryFailed` and no partial result.
    pub async fn execute(
        &self,
        kind: QueryKind,
        symbol: &str,
        limit: u32,
    ) -> Result<TimedRows, BenchError> {
        let store = self.store.as_ref().ok_or_else(|| {
            BenchError::StoreUnavailable("database connection not available".to_string())
        })?;
        let conn = store.handle()?;
        let template = kind.template();
        let params = kind.bind(symbol, limit);

        let started = Instant::now();
        let task =
            tokio::task::spawn_blocking(move || TickStore::run_template(&conn, template, &params));
        let outcome = tokio::time::timeout(self.timeout, task).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let failed = |cause: String| BenchError::QueryFailed {
            kind,
            elapsed_ms,
            cause,
        };
        let rows = match outcome {
            Err(_) => {
                return Err(failed(format!(
                    "timed out after {} ms",
                    self.timeout.as_millis()
                )))
            }
            Ok(Err(join_err)) => return Err(failed(format!("query task failed: {}", join_err))),
            Ok(Ok(Err(e))) => return Err(failed(e.to_string())),
            Ok(Ok(Ok(rows))) => rows,
        };

        tracing::debug!(
            kind = %kind,
            symbol,
            limit,
            elapsed_ms,
            rows = rows.len(),
            "Query executed"
        );
        Ok(TimedRows {
            kind,
            elapsed_ms,
            rows,
        })
    }

    pub async fn raw_scan_ohlcv(&self, symbol: &str, limit: u32) -> Result<TimedRows, BenchError> {
        self.execute(QueryKind::Slow, symbol, limit).await
    }

    pub async fn rollup_ohlcv(&self, symbol: &str, limit: u32) -> Result<TimedRows, BenchError> {
        self.execute(QueryKind::Fast, symbol, limit).await
    }

    pub async fn raw_count(&self, symbol: &str) -> Result<TimedRows, BenchError> {
        self.execute(QueryKind::RawCount, symbol, 0).await
    }

    pub async fn final_count(&self, symbol: &str) -> Result<TimedRows, BenchError> {
        self.execute(QueryKind::FinalCount, symbol, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_families_bind_symbol_only() {
        assert_eq!(QueryKind::RawCount.bind("AAPL", 50).len(), 1);
        assert_eq!(QueryKind::FinalCount.bind("AAPL", 50).len(), 1);
        let params = QueryKind::Slow.bind("AAPL", 50);
        assert_eq!(params.len(), 2);
        assert_eq!(params[1], Value::BigInt(50));
    }

    #[test]
    fn ohlcv_templates_share_output_shape() {
        assert_eq!(RAW_SCAN_OHLCV.columns, ROLLUP_MERGE_OHLCV.columns);
        assert_eq!(QueryKind::Fast.template().columns, OHLCV_COLUMNS);
        assert_eq!(QueryKind::FinalCount.template().columns, COUNT_COLUMNS);
    }

    #[test]
    fn count_rejects_malformed_rows() {
        let timed = TimedRows {
            kind: QueryKind::RawCount,
            elapsed_ms: 1.0,
            rows: QueryRows {
                columns: vec!["count".to_string()],
                rows: vec![],
            },
        };
        let err = timed.count().unwrap_err();
        assert!(matches!(
            err,
            BenchError::QueryFailed {
                kind: QueryKind::RawCount,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn missing_store_is_unavailable() {
        let engine = QueryEngine::new(None, Duration::from_secs(1));
        assert!(!engine.is_available());
        let err = engine.raw_count("AAPL").await.unwrap_err();
        assert!(matches!(err, BenchError::StoreUnavailable(_)));
    }
}
