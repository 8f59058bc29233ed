//! Benchmark orchestration: timing, result shaping, comparisons and the
//! append-only run history.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::BenchError;
use crate::model::bench::{history_header, BenchmarkRecord, QueryKind};
use crate::query::{QueryEngine, TimedRows};

/// Slow-over-fast ratio. NaN when `fast_ms` is zero; never panics.
pub fn speedup(slow_ms: f64, fast_ms: f64) -> f64 {
    if fast_ms == 0.0 {
        return f64::NAN;
    }
    slow_ms / fast_ms
}

/// `raw - final`. A final count above the raw count breaks the dedup
/// invariant and is reported, never clamped.
pub fn duplicate_count(raw: u64, final_count: u64) -> Result<u64, BenchError> {
    raw.checked_sub(final_count).ok_or_else(|| {
        BenchError::ContractViolation(format!(
            "final count {} exceeds raw count {} (duplicate count {})",
            final_count,
            raw,
            i128::from(raw) - i128::from(final_count)
        ))
    })
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Response of the raw-scan and rollup-merge endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub query_type: QueryKind,
    pub query_time_ms: f64,
    pub rows_returned: usize,
    pub data: Vec<Map<String, Value>>,
}

/// Response of the count endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountReport {
    pub query_type: QueryKind,
    pub query_time_ms: f64,
    pub symbol: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestComparison {
    pub symbol: String,
    pub slow: BacktestReport,
    pub fast: BacktestReport,
    /// `None` when the fast side took zero time.
    pub speedup: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupComparison {
    pub symbol: String,
    pub raw: CountReport,
    #[serde(rename = "final")]
    pub final_: CountReport,
    pub duplicate_count: u64,
    /// Final-count time over raw-count time.
    pub speedup: Option<f64>,
}

/// Append-only CSV history of benchmark invocations.
pub struct HistoryLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, writing the header first if the file is new.
    pub fn append(&self, record: &BenchmarkRecord) -> Result<(), BenchError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| BenchError::Io(std::io::Error::other("history lock poisoned")))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let is_new = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if is_new {
            writeln!(file, "{}", history_header())?;
        }
        writeln!(file, "{}", record.to_csv_row())?;
        Ok(())
    }

    /// All readable records in file order. Unparseable lines are skipped with
    /// a warning; a missing file is an empty history.
    pub fn load(&self) -> Result<Vec<BenchmarkRecord>, BenchError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if idx == 0 || line.trim().is_empty() {
                continue;
            }
            match BenchmarkRecord::from_csv_row(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(line = idx + 1, error = %e, "Skipping malformed history row")
                }
            }
        }
        Ok(records)
    }

    /// The newest `limit` records, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<BenchmarkRecord>, BenchError> {
        let mut records = self.load()?;
        records.reverse();
        records.truncate(limit);
        Ok(records)
    }
}

/// Invokes query families, shapes their results and records every
/// successful invocation.
pub struct BenchmarkRunner {
    engine: QueryEngine,
    history: Arc<HistoryLog>,
}

impl BenchmarkRunner {
    pub fn new(engine: QueryEngine, history: HistoryLog) -> Self {
        Self {
            engine,
            history: Arc::new(history),
        }
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    /// Raw-scan or rollup-merge OHLCV for one symbol.
    pub async fn backtest(
        &self,
        kind: QueryKind,
        symbol: &str,
        limit: u32,
    ) -> Result<BacktestReport, BenchError> {
        let report = self.run_backtest(kind, symbol, limit).await?;
        self.record(kind, symbol, report.query_time_ms, report.rows_returned, 0, None)
            .await;
        Ok(report)
    }

    /// Raw or final count for one symbol.
    pub async fn count(&self, kind: QueryKind, symbol: &str) -> Result<CountReport, BenchError> {
        let report = self.run_count(kind, symbol).await?;
        self.record(kind, symbol, report.query_time_ms, 0, report.count, None)
            .await;
        Ok(report)
    }

    pub async fn compare_backtest(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<BacktestComparison, BenchError> {
        let slow = self.run_backtest(QueryKind::Slow, symbol, limit).await?;
        let fast = self.run_backtest(QueryKind::Fast, symbol, limit).await?;
        let ratio = finite(speedup(slow.query_time_ms, fast.query_time_ms));

        self.record(QueryKind::Slow, symbol, slow.query_time_ms, slow.rows_returned, 0, None)
            .await;
        self.record(QueryKind::Fast, symbol, fast.query_time_ms, fast.rows_returned, 0, ratio)
            .await;
        tracing::info!(
            symbol,
            slow_ms = slow.query_time_ms,
            fast_ms = fast.query_time_ms,
            speedup = ?ratio,
            "Backtest comparison"
        );
        Ok(BacktestComparison {
            symbol: symbol.to_string(),
            slow,
            fast,
            speedup: ratio,
        })
    }

    pub async fn compare_dedup(&self, symbol: &str) -> Result<DedupComparison, BenchError> {
        let raw = self.run_count(QueryKind::RawCount, symbol).await?;
        let final_ = self.run_count(QueryKind::FinalCount, symbol).await?;
        let ratio = finite(speedup(final_.query_time_ms, raw.query_time_ms));

        self.record(QueryKind::RawCount, symbol, raw.query_time_ms, 0, raw.count, None)
            .await;
        self.record(
            QueryKind::FinalCount,
            symbol,
            final_.query_time_ms,
            0,
            final_.count,
            ratio,
        )
        .await;
        let duplicates = duplicate_count(raw.count, final_.count)?;
        tracing::info!(
            symbol,
            raw = raw.count,
            final_count = final_.count,
            duplicates,
            "Dedup comparison"
        );
        Ok(DedupComparison {
            symbol: symbol.to_string(),
            raw,
            final_,
            duplicate_count: duplicates,
            speedup: ratio,
        })
    }

    async fn run_backtest(
        &self,
        kind: QueryKind,
        symbol: &str,
        limit: u32,
    ) -> Result<BacktestReport, BenchError> {
        if !kind.is_ohlcv() {
            return Err(BenchError::Config(format!("{} is not an OHLCV query", kind)));
        }
        let timed = self.engine.execute(kind, symbol, limit).await?;
        Ok(BacktestReport {
            query_type: kind,
            query_time_ms: timed.elapsed_ms,
            rows_returned: timed.rows.len(),
            data: timed.records(),
        })
    }

    async fn run_count(&self, kind: QueryKind, symbol: &str) -> Result<CountReport, BenchError> {
        if kind.is_ohlcv() {
            return Err(BenchError::Config(format!("{} is not a count query", kind)));
        }
        let timed: TimedRows = self.engine.execute(kind, symbol, 0).await?;
        Ok(CountReport {
            query_type: kind,
            query_time_ms: timed.elapsed_ms,
            symbol: symbol.to_string(),
            count: timed.count()?,
        })
    }

    /// Appends off the async runtime. A failed append is logged and never
    /// fails the request.
    async fn record(
        &self,
        kind: QueryKind,
        symbol: &str,
        elapsed_ms: f64,
        rows_returned: usize,
        total_rows: u64,
        speedup: Option<f64>,
    ) {
        let record = BenchmarkRecord {
            timestamp: Utc::now(),
            query_kind: kind,
            symbol: symbol.to_string(),
            elapsed_ms,
            rows_returned: rows_returned as u64,
            total_rows,
            speedup,
        };
        let history = Arc::clone(&self.history);
        let outcome = tokio::task::spawn_blocking(move || history.append(&record))
            .await
            .unwrap_or_else(|e| Err(BenchError::Io(std::io::Error::other(e.to_string()))));
        if let Err(e) = outcome {
            tracing::warn!(
                error = %e,
                path = %self.history.path().display(),
                kind = %kind,
                "Failed to persist benchmark record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speedup_guards_zero_divisor() {
        assert!(speedup(12.0, 0.0).is_nan());
        assert!((speedup(12.0, 4.0) - 3.0).abs() < f64::EPSILON);
        assert_eq!(finite(speedup(1.0, 0.0)), None);
    }

    #[test]
    fn duplicate_count_flags_negative() {
        assert_eq!(duplicate_count(1001, 1000).unwrap(), 1);
        assert_eq!(duplicate_count(5, 5).unwrap(), 0);
        let err = duplicate_count(3, 4).unwrap_err();
        assert!(matches!(err, BenchError::ContractViolation(_)));
        assert!(err.to_string().contains("duplicate count -1"));
    }
}
