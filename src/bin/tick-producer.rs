use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;

use tick_bench::config::Config;
use tick_bench::generator::TickGenerator;
use tick_bench::model::tick::TickEvent;
use tick_bench::transport::{connect_with_retry, HttpTransport, Transport};

/// Synthetic tick producer. Streams trades (with corrections) to the API's
/// ingest endpoint at a fixed rate until Ctrl+C.
#[derive(Debug, Parser)]
#[command(name = "tick-producer", version)]
struct Args {
    /// API base URL, overrides producer.api_url.
    #[arg(long)]
    api_url: Option<String>,
    /// Messages per second.
    #[arg(long)]
    rate: Option<u32>,
    /// Correction probability in [0, 1].
    #[arg(long)]
    correction_rate: Option<f64>,
    /// Stop after this many messages.
    #[arg(long)]
    max_messages: Option<u64>,
    /// Seed for a reproducible stream.
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load().context("failed to load config")?;
    if let Some(url) = args.api_url {
        config.producer.api_url = url;
    }
    if let Some(rate) = args.rate {
        config.producer.rate_per_sec = rate.max(1);
    }
    if let Some(rate) = args.correction_rate {
        config.producer.correction_rate = rate;
    }
    tick_bench::logging::init(&config.logging);

    let producer = &config.producer;
    let generator_config = producer.generator_config();
    let mut generator = match args.seed {
        Some(seed) => TickGenerator::with_seed(generator_config, seed),
        None => TickGenerator::new(generator_config),
    }
    .map_err(anyhow::Error::msg)
    .context("invalid producer settings")?;

    let mut transport = HttpTransport::new(
        &producer.api_url,
        (producer.flush_every as usize).saturating_mul(2),
        producer.send_timeout(),
    )?;

    tracing::info!(api_url = %producer.api_url, "Connecting to ingest endpoint");
    if let Err(e) = connect_with_retry(
        &transport,
        producer.connect_attempts,
        producer.connect_backoff(),
    )
    .await
    {
        tracing::error!(error = %e, "Could not reach ingest endpoint, exiting");
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }

    tracing::info!(
        topic = %config.ingest.topic,
        rate_per_sec = producer.rate_per_sec,
        correction_rate = producer.correction_rate,
        "Producing ticks"
    );
    let mut ticker = tokio::time::interval(producer.emit_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sent: u64 = 0;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                let event = generator.next_event(Utc::now());
                emit(&mut transport, &config.ingest.topic, &event).await;
                sent += 1;
                if sent % producer.flush_every == 0 {
                    flush(&mut transport).await;
                }
                if producer.log_every > 0 && sent % producer.log_every == 0 {
                    let stats = generator.stats();
                    tracing::info!(
                        sent,
                        corrections = stats.corrections,
                        sample = %serde_json::to_string(&event).unwrap_or_default(),
                        "Producer progress"
                    );
                }
                if args.max_messages.is_some_and(|max| sent >= max) {
                    break;
                }
            }
        }
    }

    flush(&mut transport).await;
    let stats = generator.stats();
    tracing::info!(
        sent,
        fresh = stats.fresh,
        corrections = stats.corrections,
        "Producer stopped"
    );
    Ok(())
}

async fn emit(transport: &mut HttpTransport, topic: &str, event: &TickEvent) {
    let value = match serde_json::to_vec(event) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode tick");
            return;
        }
    };
    if let Err(e) = transport.send(topic, &event.symbol, &value).await {
        tracing::warn!(error = %e, "Send failed, batch dropped");
    }
}

async fn flush(transport: &mut HttpTransport) {
    match transport.flush().await {
        Ok(ack) if ack.rejected > 0 => tracing::warn!(
            batch_id = %ack.batch_id,
            accepted = ack.accepted,
            rejected = ack.rejected,
            "Ingest rejected part of a batch"
        ),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Flush failed, batch dropped"),
    }
}
