//! Ingestion contract: the message envelope, symbol-keyed partitioning and
//! the partitioned broker that feeds the store.
//!
//! Each partition has exactly one consumer task, so events sharing a key are
//! written in the order they were published. Nothing orders events across
//! partitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::BenchError;
use crate::model::tick::TickEvent;
use crate::store::TickStore;

pub const TICKS_TOPIC: &str = "ticks";

/// One transported message: topic, routing key and the self-describing
/// JSON record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestEnvelope {
    pub topic: String,
    pub key: String,
    pub value: serde_json::Value,
}

impl IngestEnvelope {
    /// Build from raw value bytes, which must hold a JSON document.
    pub fn from_bytes(topic: &str, key: &str, value: &[u8]) -> Result<Self, BenchError> {
        Ok(Self {
            topic: topic.to_string(),
            key: key.to_string(),
            value: serde_json::from_slice(value)?,
        })
    }

    pub fn for_tick(topic: &str, tick: &TickEvent) -> Result<Self, BenchError> {
        Ok(Self {
            topic: topic.to_string(),
            key: key_for(tick).to_string(),
            value: serde_json::to_value(tick)?,
        })
    }

    pub fn decode_tick(&self) -> Result<TickEvent, BenchError> {
        let tick: TickEvent = serde_json::from_value(self.value.clone())?;
        tick.validate().map_err(BenchError::InvalidEvent)?;
        if tick.symbol != self.key {
            return Err(BenchError::InvalidEvent(format!(
                "key '{}' does not match symbol '{}'",
                self.key, tick.symbol
            )));
        }
        Ok(tick)
    }
}

/// Routing key: always the symbol.
pub fn key_for(tick: &TickEvent) -> &str {
    &tick.symbol
}

/// Stable partition for a key (FNV-1a, independent of process and platform).
pub fn partition_for(key: &str, partitions: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    if partitions <= 1 {
        return 0;
    }
    let hash = key
        .bytes()
        .fold(OFFSET, |acc, b| (acc ^ u64::from(b)).wrapping_mul(PRIME));
    (hash % partitions as u64) as usize
}

/// Acknowledgement for one published batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub batch_id: String,
    pub accepted: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub topic: String,
    pub partitions: usize,
    pub batch_size: usize,
    pub linger: Duration,
    pub queue_depth: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: TICKS_TOPIC.to_string(),
            partitions: 4,
            batch_size: 500,
            linger: Duration::from_millis(50),
            queue_depth: 10_000,
        }
    }
}

enum PartitionMessage {
    Event(TickEvent),
    /// Answered with the outcome of every write since the previous flush.
    Flush(oneshot::Sender<Result<(), BenchError>>),
}

/// In-process partitioned log in front of the store.
pub struct Broker {
    topic: String,
    partitions: Vec<mpsc::Sender<PartitionMessage>>,
}

impl Broker {
    /// Start one consumer task per partition. Tasks exit once the broker is
    /// dropped and their queues drain.
    pub fn spawn(store: TickStore, config: BrokerConfig) -> (Self, Vec<JoinHandle<()>>) {
        let partitions = config.partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_partition(
                partition,
                store.clone(),
                rx,
                config.batch_size.max(1),
                config.linger,
            )));
        }
        tracing::info!(topic = %config.topic, partitions, "Ingest broker started");
        (
            Self {
                topic: config.topic,
                partitions: senders,
            },
            handles,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Route envelopes to their partitions. Envelopes for another topic or
    /// with undecodable/invalid values are rejected and counted.
    pub async fn publish(&self, envelopes: Vec<IngestEnvelope>) -> Result<IngestAck, BenchError> {
        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut accepted = 0;
        let mut rejected = 0;
        for envelope in envelopes {
            if envelope.topic != self.topic {
                tracing::debug!(topic = %envelope.topic, "Rejecting envelope for unknown topic");
                rejected += 1;
                continue;
            }
            let tick = match envelope.decode_tick() {
                Ok(tick) => tick,
                Err(e) => {
                    tracing::debug!(key = %envelope.key, error = %e, "Rejecting envelope");
                    rejected += 1;
                    continue;
                }
            };
            let partition = partition_for(&envelope.key, self.partitions.len());
            self.partitions[partition]
                .send(PartitionMessage::Event(tick))
                .await
                .map_err(|_| {
                    BenchError::StoreUnavailable(format!("partition {} consumer stopped", partition))
                })?;
            accepted += 1;
        }
        if rejected > 0 {
            tracing::warn!(%batch_id, accepted, rejected, "Ingest batch had rejected envelopes");
        }
        Ok(IngestAck {
            batch_id,
            accepted,
            rejected,
        })
    }

    /// Wait until everything published so far has been written. Fails if
    /// any partition dropped a batch since the last flush.
    pub async fn flush(&self) -> Result<(), BenchError> {
        let mut pending = Vec::with_capacity(self.partitions.len());
        for (partition, tx) in self.partitions.iter().enumerate() {
            let (ack_tx, ack_rx) = oneshot::channel();
            tx.send(PartitionMessage::Flush(ack_tx)).await.map_err(|_| {
                BenchError::StoreUnavailable(format!("partition {} consumer stopped", partition))
            })?;
            pending.push((partition, ack_rx));
        }
        let mut first_error = None;
        for (partition, ack_rx) in pending {
            let outcome = ack_rx.await.map_err(|_| {
                BenchError::StoreUnavailable(format!("partition {} dropped flush", partition))
            })?;
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_partition(
    partition: usize,
    store: TickStore,
    mut rx: mpsc::Receiver<PartitionMessage>,
    batch_size: usize,
    linger: Duration,
) {
    let mut pending: Vec<TickEvent> = Vec::with_capacity(batch_size);
    // Oldest write failure not yet reported through a flush.
    let mut unreported: Option<BenchError> = None;
    loop {
        let message = if pending.is_empty() {
            rx.recv().await
        } else {
            match tokio::time::timeout(linger, rx.recv()).await {
                Ok(message) => message,
                Err(_) => {
                    let outcome = write_batch(partition, &store, &mut pending).await;
                    note_failure(&mut unreported, outcome);
                    continue;
                }
            }
        };
        match message {
            Some(PartitionMessage::Event(tick)) => {
                pending.push(tick);
                if pending.len() >= batch_size {
                    let outcome = write_batch(partition, &store, &mut pending).await;
                    note_failure(&mut unreported, outcome);
                }
            }
            Some(PartitionMessage::Flush(ack)) => {
                let outcome = write_batch(partition, &store, &mut pending).await;
                note_failure(&mut unreported, outcome);
                let _ = ack.send(unreported.take().map_or(Ok(()), Err));
            }
            None => {
                let outcome = write_batch(partition, &store, &mut pending).await;
                note_failure(&mut unreported, outcome);
                break;
            }
        }
    }
    tracing::debug!(partition, "Ingest partition consumer stopped");
}

fn note_failure(unreported: &mut Option<BenchError>, outcome: Result<(), BenchError>) {
    if let Err(e) = outcome {
        unreported.get_or_insert(e);
    }
}

async fn write_batch(
    partition: usize,
    store: &TickStore,
    pending: &mut Vec<TickEvent>,
) -> Result<(), BenchError> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(pending);
    let size = batch.len();
    let store = store.clone();
    let cause = match tokio::task::spawn_blocking(move || store.insert_batch(&batch)).await {
        Ok(Ok(summary)) => {
            tracing::debug!(
                partition,
                raw_rows = summary.raw_rows,
                rollup_rows = summary.rollup_rows,
                "Ingest batch written"
            );
            return Ok(());
        }
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("writer task failed: {}", e),
    };
    tracing::error!(partition, size, error = %cause, "Ingest batch dropped");
    Err(BenchError::IngestDropped {
        partition,
        dropped: size,
        cause,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tick::{parse_event_time, EventType, Side};

    fn tick(symbol: &str) -> TickEvent {
        TickEvent {
            exchange: "XNAS".to_string(),
            symbol: symbol.to_string(),
            event_time: parse_event_time("2024-03-01 14:30:00.000001").unwrap(),
            seq_id: 1,
            event_type: EventType::Trade,
            price: 10.0,
            size: 1,
            side: Side::Sell,
            source_version: 1,
        }
    }

    #[test]
    fn partition_is_stable_and_bounded() {
        for key in ["AAPL", "GOOG", "BTC-USD", ""] {
            let p = partition_for(key, 8);
            assert!(p < 8);
            assert_eq!(p, partition_for(key, 8));
        }
        assert_eq!(partition_for("AAPL", 1), 0);
        assert_eq!(partition_for("AAPL", 0), 0);
    }

    #[test]
    fn envelope_round_trips_tick() {
        let envelope = IngestEnvelope::for_tick(TICKS_TOPIC, &tick("MSFT")).unwrap();
        assert_eq!(envelope.key, "MSFT");
        assert_eq!(envelope.decode_tick().unwrap(), tick("MSFT"));

        let bytes = serde_json::to_vec(&tick("MSFT")).unwrap();
        let from_bytes = IngestEnvelope::from_bytes(TICKS_TOPIC, "MSFT", &bytes).unwrap();
        assert_eq!(from_bytes, envelope);
        assert!(IngestEnvelope::from_bytes(TICKS_TOPIC, "MSFT", b"not json").is_err());
    }

    #[test]
    fn envelope_key_must_match_symbol() {
        let mut envelope = IngestEnvelope::for_tick(TICKS_TOPIC, &tick("MSFT")).unwrap();
        envelope.key = "AAPL".to_string();
        assert!(matches!(
            envelope.decode_tick(),
            Err(BenchError::InvalidEvent(_))
        ));
    }
}
