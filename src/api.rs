//! HTTP surface over the benchmark runner and the ingest broker.

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::bench::{BacktestComparison, BacktestReport, BenchmarkRunner, CountReport, DedupComparison};
use crate::error::BenchError;
use crate::ingest::{Broker, IngestAck, IngestEnvelope};
use crate::model::bench::{BenchmarkRecord, QueryKind};

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<BenchmarkRunner>,
    pub broker: Option<Arc<Broker>>,
    pub defaults: RequestDefaults,
}

#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub symbol: String,
    pub limit: u32,
    pub max_limit: u32,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            symbol: "AAPL".to_string(),
            limit: 100,
            max_limit: 10_000,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    Bench(BenchError),
    /// A failure while serving one known query family.
    Query(QueryKind, BenchError),
    BadRequest(String),
}

impl ApiError {
    fn for_query(kind: QueryKind) -> impl FnOnce(BenchError) -> ApiError {
        move |e| ApiError::Query(kind, e)
    }
}

impl From<BenchError> for ApiError {
    fn from(e: BenchError) -> Self {
        ApiError::Bench(e)
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (request_kind, error) = match self {
            ApiError::BadRequest(msg) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "bad_request", "detail": msg })),
                )
                    .into_response()
            }
            ApiError::Bench(e) => (None, e),
            ApiError::Query(kind, e) => (Some(kind), e),
        };
        let (status, mut body) = match error {
            BenchError::StoreUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "store_unavailable", "detail": msg }),
            ),
            BenchError::QueryFailed {
                kind,
                elapsed_ms,
                cause,
            } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "query_failed",
                    "query_kind": kind,
                    "elapsed_ms": elapsed_ms,
                    "detail": cause,
                }),
            ),
            BenchError::ContractViolation(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "contract_violation", "detail": msg }),
            ),
            e @ (BenchError::InvalidEvent(_) | BenchError::Json(_)) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "bad_request", "detail": e.to_string() }),
            ),
            e => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal_error", "detail": e.to_string() }),
            ),
        };
        if let (Some(kind), Some(fields)) = (request_kind, body.as_object_mut()) {
            fields.entry("query_kind").or_insert_with(|| json!(kind));
        }
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), body = %body, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct BacktestParams {
    pub symbol: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SymbolParams {
    pub symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

impl AppState {
    fn symbol(&self, requested: Option<String>) -> Result<String, ApiError> {
        match requested {
            None => Ok(self.defaults.symbol.clone()),
            Some(s) if s.trim().is_empty() => {
                Err(ApiError::BadRequest("symbol must not be empty".to_string()))
            }
            Some(s) => Ok(s.trim().to_string()),
        }
    }

    fn limit(&self, requested: Option<u32>) -> Result<u32, ApiError> {
        let limit = requested.unwrap_or(self.defaults.limit);
        if limit > self.defaults.max_limit {
            return Err(ApiError::BadRequest(format!(
                "limit {} exceeds maximum {}",
                limit, self.defaults.max_limit
            )));
        }
        Ok(limit)
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/backtest/slow", get(backtest_slow))
        .route("/backtest/fast", get(backtest_fast))
        .route("/backtest/compare", get(backtest_compare))
        .route("/dedup/raw_count", get(dedup_raw_count))
        .route("/dedup/final_count", get(dedup_final_count))
        .route("/dedup/compare", get(dedup_compare))
        .route("/bench/history", get(bench_history))
        .route("/ingest", post(ingest))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({ "status": "tick-bench analytics API is running" }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "store": state.runner.engine().is_available(),
        "ingest": state.broker.is_some(),
    }))
}

async fn run_backtest(
    state: &AppState,
    kind: QueryKind,
    params: Result<Query<BacktestParams>, QueryRejection>,
) -> Result<Json<BacktestReport>, ApiError> {
    let Query(params) = params?;
    let symbol = state.symbol(params.symbol)?;
    let limit = state.limit(params.limit)?;
    let report = state
        .runner
        .backtest(kind, &symbol, limit)
        .await
        .map_err(ApiError::for_query(kind))?;
    Ok(Json(report))
}

async fn backtest_slow(
    State(state): State<AppState>,
    params: Result<Query<BacktestParams>, QueryRejection>,
) -> Result<Json<BacktestReport>, ApiError> {
    run_backtest(&state, QueryKind::Slow, params).await
}

async fn backtest_fast(
    State(state): State<AppState>,
    params: Result<Query<BacktestParams>, QueryRejection>,
) -> Result<Json<BacktestReport>, ApiError> {
    run_backtest(&state, QueryKind::Fast, params).await
}

async fn backtest_compare(
    State(state): State<AppState>,
    params: Result<Query<BacktestParams>, QueryRejection>,
) -> Result<Json<BacktestComparison>, ApiError> {
    let Query(params) = params?;
    let symbol = state.symbol(params.symbol)?;
    let limit = state.limit(params.limit)?;
    Ok(Json(state.runner.compare_backtest(&symbol, limit).await?))
}

async fn run_count(
    state: &AppState,
    kind: QueryKind,
    params: Result<Query<SymbolParams>, QueryRejection>,
) -> Result<Json<CountReport>, ApiError> {
    let Query(params) = params?;
    let symbol = state.symbol(params.symbol)?;
    let report = state
        .runner
        .count(kind, &symbol)
        .await
        .map_err(ApiError::for_query(kind))?;
    Ok(Json(report))
}

async fn dedup_raw_count(
    State(state): State<AppState>,
    params: Result<Query<SymbolParams>, QueryRejection>,
) -> Result<Json<CountReport>, ApiError> {
    run_count(&state, QueryKind::RawCount, params).await
}

async fn dedup_final_count(
    State(state): State<AppState>,
    params: Result<Query<SymbolParams>, QueryRejection>,
) -> Result<Json<CountReport>, ApiError> {
    run_count(&state, QueryKind::FinalCount, params).await
}

async fn dedup_compare(
    State(state): State<AppState>,
    params: Result<Query<SymbolParams>, QueryRejection>,
) -> Result<Json<DedupComparison>, ApiError> {
    let Query(params) = params?;
    let symbol = state.symbol(params.symbol)?;
    Ok(Json(state.runner.compare_dedup(&symbol).await?))
}

async fn bench_history(
    State(state): State<AppState>,
    params: Result<Query<HistoryParams>, QueryRejection>,
) -> Result<Json<Vec<BenchmarkRecord>>, ApiError> {
    let Query(params) = params?;
    let limit = params.limit.unwrap_or(50);
    let runner = Arc::clone(&state.runner);
    let records = tokio::task::spawn_blocking(move || runner.history().recent(limit))
        .await
        .map_err(|e| BenchError::Io(std::io::Error::other(e.to_string())))??;
    Ok(Json(records))
}

async fn ingest(
    State(state): State<AppState>,
    body: Result<Json<Vec<IngestEnvelope>>, JsonRejection>,
) -> Result<Json<IngestAck>, ApiError> {
    let Json(envelopes) = body?;
    let broker = state.broker.as_ref().ok_or_else(|| {
        BenchError::StoreUnavailable("ingest broker not running".to_string())
    })?;
    Ok(Json(broker.publish(envelopes).await?))
}
