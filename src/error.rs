use thiserror::Error;

use crate::model::bench::QueryKind;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{kind} query failed after {elapsed_ms:.2} ms: {cause}")]
    QueryFailed {
        kind: QueryKind,
        elapsed_ms: f64,
        cause: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport unavailable after {attempts} attempts: {cause}")]
    TransportUnavailable { attempts: u32, cause: String },

    #[error("partition {partition} dropped {dropped} events: {cause}")]
    IngestDropped {
        partition: usize,
        dropped: usize,
        cause: String,
    },

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] duckdb::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// Query kind attached to query failures, if any.
    pub fn query_kind(&self) -> Option<QueryKind> {
        match self {
            BenchError::QueryFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn elapsed_ms(&self) -> Option<f64> {
        match self {
            BenchError::QueryFailed { elapsed_ms, .. } => Some(*elapsed_ms),
            _ => None,
        }
    }
}
