//! DuckDB-backed tick store: the raw fact table plus the 1-minute rollup of
//! partial aggregate states.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use duckdb::types::Value;
use duckdb::{params, params_from_iter, Connection};
use serde_json::{Map, Number, Value as JsonValue};

use crate::dedup::Versioned;
use crate::error::BenchError;
use crate::model::tick::{datetime_from_micros, TickEvent};
use crate::rollup::fold_trades;

pub const IN_MEMORY: &str = ":memory:";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ticks (
    arrival_id BIGINT NOT NULL,
    exchange VARCHAR NOT NULL,
    symbol VARCHAR NOT NULL,
    event_time TIMESTAMP NOT NULL,
    seq_id BIGINT NOT NULL,
    event_type VARCHAR NOT NULL,
    price DOUBLE NOT NULL,
    size INTEGER NOT NULL,
    side VARCHAR NOT NULL,
    source_version BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades_1m_agg (
    symbol VARCHAR NOT NULL,
    minute TIMESTAMP NOT NULL,
    open_time TIMESTAMP NOT NULL,
    open_price DOUBLE NOT NULL,
    close_time TIMESTAMP NOT NULL,
    close_price DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    volume BIGINT NOT NULL,
    pv DOUBLE NOT NULL
);
"#;

const INSERT_TICK: &str = r#"
INSERT INTO ticks (
    arrival_id, exchange, symbol, event_time, seq_id,
    event_type, price, size, side, source_version
) VALUES (?, ?, ?, make_timestamp(?), ?, ?, ?, ?, ?, ?)
"#;

const INSERT_PARTIAL: &str = r#"
INSERT INTO trades_1m_agg (
    symbol, minute, open_time, open_price, close_time,
    close_price, high, low, volume, pv
) VALUES (?, make_timestamp(?), make_timestamp(?), ?, make_timestamp(?), ?, ?, ?, ?, ?)
"#;

const SELECT_TICK_COLUMNS: &str = r#"
    arrival_id, exchange, symbol, epoch_us(event_time), seq_id,
    event_type, price, size, side, source_version
"#;

// Merges every bucket's partial rows into one. Column order matches the table.
// Runs inside a transaction owned by the caller.
const COMPACT_ROLLUP: &str = r#"
CREATE OR REPLACE TEMP TABLE rollup_compacted AS
SELECT
    symbol,
    minute,
    min(open_time) AS open_time,
    arg_min(open_price, open_time) AS open_price,
    max(close_time) AS close_time,
    arg_max(close_price, close_time) AS close_price,
    max(high) AS high,
    min(low) AS low,
    CAST(sum(volume) AS BIGINT) AS volume,
    sum(pv) AS pv
FROM trades_1m_agg
GROUP BY symbol, minute;
DELETE FROM trades_1m_agg;
INSERT INTO trades_1m_agg SELECT * FROM rollup_compacted;
DROP TABLE rollup_compacted;
"#;

/// A parameterized query plus the column names it must return.
#[derive(Debug, Clone, Copy)]
pub struct QueryTemplate {
    pub sql: &'static str,
    pub columns: &'static [&'static str],
}

/// Ordered rows with column names, cells already normalized to JSON values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One ordered record per row.
    pub fn records(&self) -> Vec<Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect::<Map<String, JsonValue>>()
            })
            .collect()
    }
}

/// A raw fact row together with its store-assigned arrival position.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredTick {
    pub arrival_id: i64,
    pub tick: TickEvent,
}

impl Versioned for StoredTick {
    type Key = (String, u64);

    fn dedup_key(&self) -> Self::Key {
        self.tick.dedup_key()
    }

    fn version(&self) -> u64 {
        self.tick.source_version
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertSummary {
    pub raw_rows: usize,
    pub rollup_rows: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionSummary {
    pub rows_before: u64,
    pub rows_after: u64,
}

struct StoreInner {
    conn: Connection,
    next_arrival_id: i64,
}

/// Shared handle to the store. Writes serialize on one connection; every
/// read runs on its own cloned connection.
#[derive(Clone)]
pub struct TickStore {
    inner: Arc<Mutex<StoreInner>>,
    location: String,
}

impl TickStore {
    /// Open (or create) the store at `path`; `:memory:` opens an in-memory one.
    pub fn open(path: &str) -> Result<Self, BenchError> {
        if path == IN_MEMORY {
            return Self::open_in_memory();
        }
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| BenchError::StoreUnavailable(format!("open {}: {}", path, e)))?;
        Self::init(conn, path)
    }

    pub fn open_in_memory() -> Result<Self, BenchError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BenchError::StoreUnavailable(format!("open in-memory: {}", e)))?;
        Self::init(conn, IN_MEMORY)
    }

    fn init(conn: Connection, location: &str) -> Result<Self, BenchError> {
        conn.execute_batch(SCHEMA)?;
        let last_arrival: i64 =
            conn.query_row("SELECT coalesce(max(arrival_id), 0) FROM ticks", [], |row| {
                row.get(0)
            })?;
        tracing::info!(location, last_arrival, "Tick store opened");
        Ok(Self {
            inner: Arc::new(Mutex::new(StoreInner {
                conn,
                next_arrival_id: last_arrival + 1,
            })),
            location: location.to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, BenchError> {
        self.inner
            .lock()
            .map_err(|_| BenchError::StoreUnavailable("store lock poisoned".to_string()))
    }

    /// A fresh connection to the same database for one reader.
    pub fn handle(&self) -> Result<Connection, BenchError> {
        let inner = self.lock()?;
        inner
            .conn
            .try_clone()
            .map_err(|e| BenchError::StoreUnavailable(format!("connection clone failed: {}", e)))
    }

    /// Append raw rows and one rollup partial per touched (symbol, minute),
    /// atomically.
    pub fn insert_batch(&self, ticks: &[TickEvent]) -> Result<InsertSummary, BenchError> {
        if ticks.is_empty() {
            return Ok(InsertSummary::default());
        }
        let partials = fold_trades(ticks);

        let mut inner = self.lock()?;
        let mut arrival_id = inner.next_arrival_id;
        let tx = inner.conn.transaction()?;
        {
            let mut stmt = tx.prepare(INSERT_TICK)?;
            for tick in ticks {
                stmt.execute(params![
                    arrival_id,
                    tick.exchange,
                    tick.symbol,
                    tick.event_time_us(),
                    to_i64(tick.seq_id, "seq_id")?,
                    tick.event_type.as_str(),
                    tick.price,
                    i64::from(tick.size),
                    tick.side.as_str(),
                    to_i64(tick.source_version, "source_version")?,
                ])?;
                arrival_id += 1;
            }

            let mut stmt = tx.prepare(INSERT_PARTIAL)?;
            for ((symbol, minute_us), state) in &partials {
                stmt.execute(params![
                    symbol,
                    minute_us,
                    state.open.key_us,
                    state.open.value,
                    state.close.key_us,
                    state.close.value,
                    state.high.0,
                    state.low.0,
                    to_i64(state.volume.0, "volume")?,
                    state.pv.0,
                ])?;
            }
        }
        tx.commit()?;
        inner.next_arrival_id = arrival_id;

        Ok(InsertSummary {
            raw_rows: ticks.len(),
            rollup_rows: partials.len(),
        })
    }

    /// Run a template on the given connection and normalize the result set.
    pub fn run_template(
        conn: &Connection,
        template: &QueryTemplate,
        params: &[Value],
    ) -> Result<QueryRows, BenchError> {
        let mut stmt = conn.prepare(template.sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter().cloned()))?;
        let width = template.columns.len();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(width);
            for idx in 0..width {
                let cell: Value = row.get(idx)?;
                cells.push(to_json(cell).map_err(|e| {
                    BenchError::ContractViolation(format!(
                        "column '{}' is malformed: {}",
                        template.columns[idx], e
                    ))
                })?);
            }
            out.push(cells);
        }
        Ok(QueryRows {
            columns: template.columns.iter().map(|c| c.to_string()).collect(),
            rows: out,
        })
    }

    pub fn query(&self, template: &QueryTemplate, params: &[Value]) -> Result<QueryRows, BenchError> {
        let conn = self.handle()?;
        Self::run_template(&conn, template, params)
    }

    /// Every raw row for `symbol` in arrival order, duplicates included.
    pub fn raw_ticks(&self, symbol: &str) -> Result<Vec<StoredTick>, BenchError> {
        let sql = format!(
            "SELECT {} FROM ticks WHERE symbol = ? ORDER BY arrival_id",
            SELECT_TICK_COLUMNS
        );
        self.load_ticks(&sql, symbol)
    }

    /// The current row per `(symbol, seq_id)`, resolved by the store.
    pub fn current_ticks(&self, symbol: &str) -> Result<Vec<StoredTick>, BenchError> {
        let sql = format!(
            "SELECT {} FROM ticks WHERE symbol = ? \
             QUALIFY row_number() OVER ( \
                 PARTITION BY symbol, seq_id \
                 ORDER BY source_version DESC, arrival_id DESC) = 1 \
             ORDER BY arrival_id",
            SELECT_TICK_COLUMNS
        );
        self.load_ticks(&sql, symbol)
    }

    fn load_ticks(&self, sql: &str, symbol: &str) -> Result<Vec<StoredTick>, BenchError> {
        let conn = self.handle()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params![symbol])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let event_time_us: i64 = row.get(3)?;
            let event_type: String = row.get(5)?;
            let side: String = row.get(8)?;
            let seq_id: i64 = row.get(4)?;
            let source_version: i64 = row.get(9)?;
            let size: i32 = row.get(7)?;
            let tick = TickEvent {
                exchange: row.get(1)?,
                symbol: row.get(2)?,
                event_time: datetime_from_micros(event_time_us)
                    .map_err(BenchError::ContractViolation)?,
                seq_id: to_u64(seq_id, "seq_id")?,
                event_type: event_type.parse().map_err(BenchError::ContractViolation)?,
                price: row.get(6)?,
                size: u32::try_from(size)
                    .map_err(|_| BenchError::ContractViolation(format!("negative size {}", size)))?,
                side: side.parse().map_err(BenchError::ContractViolation)?,
                source_version: to_u64(source_version, "source_version")?,
            };
            out.push(StoredTick {
                arrival_id: row.get(0)?,
                tick,
            });
        }
        Ok(out)
    }

    pub fn rollup_row_count(&self) -> Result<u64, BenchError> {
        let conn = self.handle()?;
        let count: i64 = conn.query_row("SELECT count(*) FROM trades_1m_agg", [], |row| row.get(0))?;
        to_u64(count, "count")
    }

    /// Merge partial rollup rows so each (symbol, minute) keeps one row.
    /// Query results are identical before and after.
    /// On failure the transaction rolls back and the writer stays usable.
    pub fn compact_rollup(&self) -> Result<CompactionSummary, BenchError> {
        let mut inner = self.lock()?;
        let count = |conn: &Connection| -> Result<u64, BenchError> {
            let n: i64 =
                conn.query_row("SELECT count(*) FROM trades_1m_agg", [], |row| row.get(0))?;
            to_u64(n, "count")
        };
        let tx = inner.conn.transaction()?;
        let rows_before = count(&tx)?;
        tx.execute_batch(COMPACT_ROLLUP)?;
        let rows_after = count(&tx)?;
        tx.commit()?;
        Ok(CompactionSummary {
            rows_before,
            rows_after,
        })
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64, BenchError> {
    i64::try_from(value)
        .map_err(|_| BenchError::InvalidEvent(format!("{} {} does not fit the store", field, value)))
}

fn to_u64(value: i64, field: &str) -> Result<u64, BenchError> {
    u64::try_from(value)
        .map_err(|_| BenchError::ContractViolation(format!("negative {} {} in store", field, value)))
}

fn float_to_json(value: f64) -> JsonValue {
    Number::from_f64(value)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn to_json(value: Value) -> Result<JsonValue, String> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(v) => JsonValue::Bool(v),
        Value::TinyInt(v) => v.into(),
        Value::SmallInt(v) => v.into(),
        Value::Int(v) => v.into(),
        Value::BigInt(v) => v.into(),
        Value::HugeInt(v) => i64::try_from(v)
            .map(JsonValue::from)
            .map_err(|_| format!("integer {} out of range", v))?,
        Value::UTinyInt(v) => v.into(),
        Value::USmallInt(v) => v.into(),
        Value::UInt(v) => v.into(),
        Value::UBigInt(v) => v.into(),
        Value::Float(v) => float_to_json(f64::from(v)),
        Value::Double(v) => float_to_json(v),
        Value::Text(v) => JsonValue::String(v),
        other => return Err(format!("unsupported value {:?}", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_json_normalizes_scalars() {
        assert_eq!(to_json(Value::BigInt(7)).unwrap(), JsonValue::from(7));
        assert_eq!(to_json(Value::HugeInt(12)).unwrap(), JsonValue::from(12));
        assert_eq!(to_json(Value::Double(f64::NAN)).unwrap(), JsonValue::Null);
        assert_eq!(
            to_json(Value::Text("AAPL".to_string())).unwrap(),
            JsonValue::from("AAPL")
        );
        assert!(to_json(Value::HugeInt(i128::MAX)).is_err());
        assert!(to_json(Value::Blob(vec![1, 2])).is_err());
    }

    #[test]
    fn records_preserve_column_order() {
        let rows = QueryRows {
            columns: vec!["minute".into(), "symbol".into(), "open".into()],
            rows: vec![vec![
                JsonValue::from("2024-03-01T14:30:00"),
                JsonValue::from("AAPL"),
                JsonValue::from(170.5),
            ]],
        };
        let records = rows.records();
        let keys: Vec<&String> = records[0].keys().collect();
        assert_eq!(keys, vec!["minute", "symbol", "open"]);
    }

    fn trade(seq_id: u64) -> TickEvent {
        use crate::model::tick::{parse_event_time, EventType, Side};
        TickEvent {
            exchange: "XNAS".to_string(),
            symbol: "AAPL".to_string(),
            event_time: parse_event_time("2024-03-01 14:30:05.000000").unwrap(),
            seq_id,
            event_type: EventType::Trade,
            price: 170.0,
            size: 3,
            side: Side::Buy,
            source_version: 1,
        }
    }

    #[test]
    fn failed_compaction_leaves_writer_usable() {
        let store = TickStore::open_in_memory().unwrap();
        store.insert_batch(&[trade(1)]).unwrap();

        // A rollup table without the partial-state columns makes the merge fail
        // after the transaction has started.
        let admin = store.handle().unwrap();
        admin
            .execute_batch("DROP TABLE trades_1m_agg; CREATE TABLE trades_1m_agg (symbol VARCHAR);")
            .unwrap();
        assert!(store.compact_rollup().is_err());

        admin
            .execute_batch(&format!("DROP TABLE trades_1m_agg; {}", SCHEMA))
            .unwrap();
        store.insert_batch(&[trade(2)]).unwrap();
        assert_eq!(store.raw_ticks("AAPL").unwrap().len(), 2);
        assert_eq!(store.rollup_row_count().unwrap(), 1);
        let summary = store.compact_rollup().unwrap();
        assert_eq!(summary.rows_after, 1);
    }

    #[test]
    fn empty_batch_is_noop() {
        let store = TickStore::open_in_memory().unwrap();
        assert_eq!(store.insert_batch(&[]).unwrap(), InsertSummary::default());
        assert_eq!(store.rollup_row_count().unwrap(), 0);
        assert!(store.raw_ticks("AAPL").unwrap().is_empty());
    }
}
