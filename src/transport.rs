//! Producer-side transports. `send` is fire-and-forget into a local buffer;
//! `flush` hands the buffer over and waits for the acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::BenchError;
use crate::ingest::{Broker, IngestAck, IngestEnvelope};

#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Verify the far side is reachable.
    async fn ping(&self) -> Result<(), BenchError>;

    /// Queue one message. May flush when the local buffer is full.
    async fn send(&mut self, topic: &str, key: &str, value: &[u8]) -> Result<(), BenchError>;

    /// Deliver everything queued so far and confirm it.
    async fn flush(&mut self) -> Result<IngestAck, BenchError>;

    /// Messages queued but not yet confirmed.
    fn pending(&self) -> usize;
}

/// Ping with fixed backoff until it succeeds or `attempts` run out.
pub async fn connect_with_retry<T: Transport>(
    transport: &T,
    attempts: u32,
    backoff: Duration,
) -> Result<(), BenchError> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match transport.ping().await {
            Ok(()) => {
                tracing::info!(attempt, "Transport connected");
                return Ok(());
            }
            Err(e) => {
                last_error = e.to_string();
                tracing::warn!(
                    attempt,
                    attempts,
                    error = %e,
                    retry_in_ms = backoff.as_millis() as u64,
                    "Transport connect failed"
                );
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Err(BenchError::TransportUnavailable {
        attempts,
        cause: last_error,
    })
}

fn empty_ack() -> IngestAck {
    IngestAck {
        batch_id: String::new(),
        accepted: 0,
        rejected: 0,
    }
}

/// Posts buffered envelopes to the API server's `/ingest` endpoint.
pub struct HttpTransport {
    http: reqwest::Client,
    health_url: Url,
    ingest_url: Url,
    buffer: Vec<IngestEnvelope>,
    max_buffer: usize,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, max_buffer: usize, timeout: Duration) -> Result<Self, BenchError> {
        let base = Url::parse(base_url)
            .map_err(|e| BenchError::Config(format!("invalid api url '{}': {}", base_url, e)))?;
        let join = |path: &str| {
            base.join(path)
                .map_err(|e| BenchError::Config(format!("invalid api url '{}': {}", base_url, e)))
        };
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BenchError::Transport(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            health_url: join("/health")?,
            ingest_url: join("/ingest")?,
            buffer: Vec::with_capacity(max_buffer.max(1)),
            max_buffer: max_buffer.max(1),
            timeout,
        })
    }
}

impl Transport for HttpTransport {
    async fn ping(&self) -> Result<(), BenchError> {
        self.http
            .get(self.health_url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| BenchError::Transport(format!("ping failed: {}", e)))?;
        Ok(())
    }

    async fn send(&mut self, topic: &str, key: &str, value: &[u8]) -> Result<(), BenchError> {
        self.buffer.push(IngestEnvelope::from_bytes(topic, key, value)?);
        if self.buffer.len() >= self.max_buffer {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<IngestAck, BenchError> {
        if self.buffer.is_empty() {
            return Ok(empty_ack());
        }
        // A failed delivery drops the batch; there is no retry buffer.
        let batch = std::mem::take(&mut self.buffer);
        let resp = self
            .http
            .post(self.ingest_url.clone())
            .timeout(self.timeout)
            .json(&batch)
            .send()
            .await
            .map_err(|e| BenchError::Transport(format!("ingest post failed: {}", e)))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(BenchError::Transport(format!(
                "ingest returned {}: {}",
                status, body
            )));
        }
        let ack: IngestAck = resp
            .json()
            .await
            .map_err(|e| BenchError::Transport(format!("invalid ingest ack: {}", e)))?;
        tracing::debug!(
            batch_id = %ack.batch_id,
            accepted = ack.accepted,
            rejected = ack.rejected,
            "Batch acknowledged"
        );
        Ok(ack)
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Hands envelopes straight to an in-process broker.
pub struct BrokerTransport {
    broker: Arc<Broker>,
    buffer: Vec<IngestEnvelope>,
    max_buffer: usize,
    timeout: Duration,
}

impl BrokerTransport {
    pub fn new(broker: Arc<Broker>, max_buffer: usize, timeout: Duration) -> Self {
        Self {
            broker,
            buffer: Vec::new(),
            max_buffer: max_buffer.max(1),
            timeout,
        }
    }
}

impl Transport for BrokerTransport {
    async fn ping(&self) -> Result<(), BenchError> {
        Ok(())
    }

    async fn send(&mut self, topic: &str, key: &str, value: &[u8]) -> Result<(), BenchError> {
        self.buffer.push(IngestEnvelope::from_bytes(topic, key, value)?);
        if self.buffer.len() >= self.max_buffer {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<IngestAck, BenchError> {
        if self.buffer.is_empty() {
            return Ok(empty_ack());
        }
        let batch = std::mem::take(&mut self.buffer);
        let deliver = async {
            let ack = self.broker.publish(batch).await?;
            self.broker.flush().await?;
            Ok::<_, BenchError>(ack)
        };
        tokio::time::timeout(self.timeout, deliver)
            .await
            .map_err(|_| {
                BenchError::Transport(format!(
                    "broker flush timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }
}
