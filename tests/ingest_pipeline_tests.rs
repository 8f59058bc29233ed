use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use tick_bench::error::BenchError;
use tick_bench::generator::{GeneratorConfig, TickGenerator};
use tick_bench::ingest::{Broker, BrokerConfig, IngestEnvelope, TICKS_TOPIC};
use tick_bench::query::QueryEngine;
use tick_bench::store::TickStore;
use tick_bench::transport::{connect_with_retry, BrokerTransport, Transport};

fn clock(step: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(1_709_303_400_000_000 + step * 1_500).unwrap()
}

fn small_broker(store: &TickStore) -> (Arc<Broker>, Vec<tokio::task::JoinHandle<()>>) {
    let (broker, handles) = Broker::spawn(
        store.clone(),
        BrokerConfig {
            partitions: 3,
            batch_size: 64,
            linger: Duration::from_millis(5),
            ..BrokerConfig::default()
        },
    );
    (Arc::new(broker), handles)
}

#[tokio::test]
/// Generator -> transport -> broker -> store, with periodic flushes. Every
/// emitted event lands exactly once and per-symbol order is preserved.
async fn generated_stream_reaches_store_in_symbol_order() {
    let store = TickStore::open_in_memory().unwrap();
    let (broker, handles) = small_broker(&store);
    let mut transport = BrokerTransport::new(Arc::clone(&broker), 1000, Duration::from_secs(10));
    connect_with_retry(&transport, 1, Duration::from_millis(1))
        .await
        .unwrap();

    let cfg = GeneratorConfig {
        correction_rate: 0.05,
        ..GeneratorConfig::default()
    };
    let mut generator = TickGenerator::with_seed(cfg, 5).unwrap();
    let mut emitted = Vec::new();
    for i in 0..1500 {
        let event = generator.next_event(clock(i));
        let value = serde_json::to_vec(&event).unwrap();
        transport
            .send(TICKS_TOPIC, &event.symbol, &value)
            .await
            .unwrap();
        emitted.push(event);
        if (i + 1) % 100 == 0 {
            let ack = transport.flush().await.unwrap();
            assert_eq!(ack.accepted, 100);
            assert_eq!(ack.rejected, 0);
        }
    }
    assert_eq!(transport.pending(), 0);

    let engine = QueryEngine::new(Some(store.clone()), Duration::from_secs(30));
    for symbol in ["AAPL", "BTC-USD", "EUR-USD"] {
        let sent: Vec<_> = emitted.iter().filter(|e| e.symbol == symbol).cloned().collect();
        let stored: Vec<_> = store
            .raw_ticks(symbol)
            .unwrap()
            .into_iter()
            .map(|row| row.tick)
            .collect();
        assert_eq!(stored, sent, "per-symbol order for {symbol}");

        let raw = engine.raw_count(symbol).await.unwrap().count().unwrap();
        let final_count = engine.final_count(symbol).await.unwrap().count().unwrap();
        assert_eq!(raw, sent.len() as u64);
        assert!(final_count <= raw);
    }

    drop(transport);
    drop(broker);
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn broker_rejects_foreign_topic_and_bad_payloads() {
    let store = TickStore::open_in_memory().unwrap();
    let (broker, _handles) = small_broker(&store);
    let mut generator = TickGenerator::with_seed(GeneratorConfig::default(), 1).unwrap();
    let good = generator.next_event(clock(0));

    let mut wrong_key = IngestEnvelope::for_tick(TICKS_TOPIC, &good).unwrap();
    wrong_key.key = "SOMETHING-ELSE".to_string();
    let mut bad_price = IngestEnvelope::for_tick(TICKS_TOPIC, &good).unwrap();
    bad_price.value["price"] = serde_json::json!(-1.0);
    let envelopes = vec![
        IngestEnvelope::for_tick(TICKS_TOPIC, &good).unwrap(),
        IngestEnvelope::for_tick("quotes", &good).unwrap(),
        wrong_key,
        bad_price,
        IngestEnvelope {
            topic: TICKS_TOPIC.to_string(),
            key: good.symbol.clone(),
            value: serde_json::json!({ "symbol": good.symbol }),
        },
    ];

    let ack = broker.publish(envelopes).await.unwrap();
    assert_eq!(ack.accepted, 1);
    assert_eq!(ack.rejected, 4);
    assert!(!ack.batch_id.is_empty());

    broker.flush().await.unwrap();
    assert_eq!(store.raw_ticks(&good.symbol).unwrap().len(), 1);
}

#[tokio::test]
/// Buffered events become visible after the linger interval even without an
/// explicit flush.
async fn linger_writes_partial_batches() {
    let store = TickStore::open_in_memory().unwrap();
    let (broker, _handles) = small_broker(&store);
    let mut generator = TickGenerator::with_seed(GeneratorConfig::default(), 3).unwrap();
    let event = generator.next_event(clock(0));
    broker
        .publish(vec![IngestEnvelope::for_tick(TICKS_TOPIC, &event).unwrap()])
        .await
        .unwrap();

    let mut stored = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        stored = store.raw_ticks(&event.symbol).unwrap().len();
        if stored == 1 {
            break;
        }
    }
    assert_eq!(stored, 1);
}

fn single_partition_broker(store: &TickStore) -> Arc<Broker> {
    let (broker, _handles) = Broker::spawn(
        store.clone(),
        BrokerConfig {
            partitions: 1,
            linger: Duration::from_secs(60),
            ..BrokerConfig::default()
        },
    );
    Arc::new(broker)
}

#[tokio::test]
/// Values outside the stored column ranges are rejected at publish time and
/// do not take their batch siblings down with them.
async fn out_of_range_events_are_rejected_not_dropped_with_batch() {
    let store = TickStore::open_in_memory().unwrap();
    let broker = single_partition_broker(&store);
    let mut generator = TickGenerator::with_seed(GeneratorConfig::default(), 11).unwrap();
    let good = generator.next_event(clock(0));

    let mut huge_seq = good.clone();
    huge_seq.seq_id = u64::MAX;
    let mut huge_version = good.clone();
    huge_version.source_version = u64::MAX;
    let mut huge_size = good.clone();
    huge_size.size = u32::MAX;

    let envelopes = [&good, &huge_seq, &huge_version, &huge_size]
        .into_iter()
        .map(|tick| IngestEnvelope::for_tick(TICKS_TOPIC, tick).unwrap())
        .collect();
    let ack = broker.publish(envelopes).await.unwrap();
    assert_eq!(ack.accepted, 1);
    assert_eq!(ack.rejected, 3);

    broker.flush().await.unwrap();
    let stored = store.raw_ticks(&good.symbol).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].tick, good);
}

#[tokio::test]
/// A batch the store refuses surfaces as an error on the next flush, and
/// only on that one.
async fn failed_store_write_fails_flush() {
    let store = TickStore::open_in_memory().unwrap();
    let broker = single_partition_broker(&store);
    let mut generator = TickGenerator::with_seed(GeneratorConfig::default(), 12).unwrap();
    let event = generator.next_event(clock(0));

    store
        .handle()
        .unwrap()
        .execute_batch("DROP TABLE ticks")
        .unwrap();
    let ack = broker
        .publish(vec![IngestEnvelope::for_tick(TICKS_TOPIC, &event).unwrap()])
        .await
        .unwrap();
    assert_eq!(ack.accepted, 1);

    let err = broker.flush().await.unwrap_err();
    assert!(matches!(
        err,
        BenchError::IngestDropped {
            partition: 0,
            dropped: 1,
            ..
        }
    ));
    broker.flush().await.unwrap();
}
