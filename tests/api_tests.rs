use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tower::ServiceExt;

use tick_bench::api::{create_router, AppState, RequestDefaults};
use tick_bench::bench::{BenchmarkRunner, HistoryLog};
use tick_bench::ingest::{Broker, BrokerConfig, IngestEnvelope, TICKS_TOPIC};
use tick_bench::model::tick::{EventType, Side, TickEvent};
use tick_bench::query::QueryEngine;
use tick_bench::store::TickStore;

fn temp_history(tag: &str) -> PathBuf {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    std::env::temp_dir().join(format!(
        "tick-bench-api-{}-{}-{}.csv",
        tag,
        std::process::id(),
        nanos
    ))
}

fn trade(seq_id: u64, offset_s: i64) -> TickEvent {
    TickEvent {
        exchange: "XNAS".to_string(),
        symbol: "AAPL".to_string(),
        event_time: DateTime::from_timestamp(1_709_303_400 + offset_s, 0).unwrap(),
        seq_id,
        event_type: EventType::Trade,
        price: 170.0 + (seq_id % 7) as f64,
        size: 5,
        side: Side::Sell,
        source_version: 1,
    }
}

fn app(store: Option<TickStore>, broker: Option<Arc<Broker>>, tag: &str) -> Router {
    let runner = BenchmarkRunner::new(
        QueryEngine::new(store, Duration::from_secs(30)),
        HistoryLog::new(temp_history(tag)),
    );
    create_router(AppState {
        runner: Arc::new(runner),
        broker,
        defaults: RequestDefaults::default(),
    })
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn missing_store_returns_503_on_every_query() {
    let app = app(None, None, "nostore");
    let (status, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"], Value::Bool(false));

    for (uri, kind) in [
        ("/backtest/slow", Some("slow")),
        ("/backtest/fast?symbol=MSFT&limit=5", Some("fast")),
        ("/backtest/compare", None),
        ("/dedup/raw_count", Some("raw_count")),
        ("/dedup/final_count", Some("final_count")),
        ("/dedup/compare", None),
    ] {
        let (status, body) = call(&app, get(uri)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
        assert_eq!(body["error"], "store_unavailable");
        match kind {
            Some(kind) => assert_eq!(body["query_kind"], kind, "{uri}"),
            None => assert!(body.get("query_kind").is_none(), "{uri}"),
        }
    }
}

#[tokio::test]
/// A query that fails in the store is a 500 carrying the family and the
/// elapsed time, and leaves no history behind.
async fn failed_query_returns_500_with_kind_and_elapsed() {
    let store = TickStore::open_in_memory().unwrap();
    store
        .insert_batch(&(1..=10).map(|i| trade(i, i as i64)).collect::<Vec<_>>())
        .unwrap();
    store
        .handle()
        .unwrap()
        .execute_batch("DROP TABLE ticks")
        .unwrap();
    let app = app(Some(store), None, "queryfail");

    for (uri, kind) in [
        ("/backtest/slow", "slow"),
        ("/dedup/raw_count", "raw_count"),
        ("/dedup/final_count", "final_count"),
        ("/dedup/compare", "raw_count"),
    ] {
        let (status, body) = call(&app, get(uri)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR, "{uri}");
        assert_eq!(body["error"], "query_failed", "{uri}");
        assert_eq!(body["query_kind"], kind, "{uri}");
        assert!(body["elapsed_ms"].as_f64().is_some_and(|ms| ms >= 0.0));
        assert!(body["detail"].as_str().is_some());
    }

    let (status, body) = call(&app, get("/bench/history")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn backtest_endpoints_use_defaults_and_shape_output() {
    let store = TickStore::open_in_memory().unwrap();
    store
        .insert_batch(&(1..=180).map(|i| trade(i, i as i64)).collect::<Vec<_>>())
        .unwrap();
    let app = app(Some(store), None, "backtest");

    let (status, body) = call(&app, get("/backtest/slow")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query_type"], "slow");
    assert_eq!(body["rows_returned"], 4);
    assert!(body["query_time_ms"].as_f64().unwrap() >= 0.0);
    let first = body["data"][0].as_object().unwrap();
    assert_eq!(first["symbol"], "AAPL");
    assert_eq!(first["minute"], "2024-03-01T14:33:00");

    let (status, body) = call(&app, get("/backtest/fast?symbol=AAPL&limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query_type"], "fast");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (status, body) = call(&app, get("/backtest/compare?limit=3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["symbol"], "AAPL");
    assert_eq!(body["slow"]["rows_returned"], 3);
    assert_eq!(body["fast"]["rows_returned"], 3);

    let (status, body) = call(&app, get("/bench/history?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    let history = body.as_array().unwrap();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0]["query_kind"], "fast");
}

#[tokio::test]
async fn dedup_endpoints_report_counts() {
    let store = TickStore::open_in_memory().unwrap();
    let mut events: Vec<_> = (1..=50).map(|i| trade(i, i as i64)).collect();
    let mut fix = trade(10, 70);
    fix.source_version = 2;
    events.push(fix);
    store.insert_batch(&events).unwrap();
    let app = app(Some(store), None, "dedup");

    let (_, raw) = call(&app, get("/dedup/raw_count?symbol=AAPL")).await;
    assert_eq!(raw["query_type"], "raw_count");
    assert_eq!(raw["count"], 51);

    let (_, final_count) = call(&app, get("/dedup/final_count")).await;
    assert_eq!(final_count["query_type"], "final_count");
    assert_eq!(final_count["count"], 50);

    let (status, cmp) = call(&app, get("/dedup/compare")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cmp["raw"]["count"], 51);
    assert_eq!(cmp["final"]["count"], 50);
    assert_eq!(cmp["duplicate_count"], 1);
}

#[tokio::test]
async fn malformed_parameters_are_bad_requests() {
    let store = TickStore::open_in_memory().unwrap();
    let app = app(Some(store), None, "params");
    for uri in [
        "/backtest/slow?limit=-1",
        "/backtest/fast?limit=abc",
        "/backtest/slow?limit=999999",
        "/dedup/raw_count?symbol=",
    ] {
        let (status, body) = call(&app, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["error"], "bad_request");
    }
}

#[tokio::test]
async fn ingest_endpoint_acks_and_persists() {
    let store = TickStore::open_in_memory().unwrap();
    let (broker, _handles) = Broker::spawn(store.clone(), BrokerConfig::default());
    let broker = Arc::new(broker);
    let app = app(Some(store.clone()), Some(Arc::clone(&broker)), "ingest");

    let envelopes: Vec<_> = (1..=20)
        .map(|i| IngestEnvelope::for_tick(TICKS_TOPIC, &trade(i, i as i64)).unwrap())
        .collect();
    let req = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&envelopes).unwrap()))
        .unwrap();
    let (status, ack) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["accepted"], 20);
    assert_eq!(ack["rejected"], 0);
    assert!(ack["batch_id"].as_str().is_some());

    broker.flush().await.unwrap();
    let (_, raw) = call(&app, get("/dedup/raw_count")).await;
    assert_eq!(raw["count"], 20);

    let bad = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _) = call(&app, bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ingest_without_broker_is_unavailable() {
    let app = app(None, None, "nobroker");
    let req = Request::builder()
        .method("POST")
        .uri("/ingest")
        .header("content-type", "application/json")
        .body(Body::from("[]"))
        .unwrap();
    let (status, _) = call(&app, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
