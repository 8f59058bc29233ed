use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use url::Url;

use tick_bench::bench::{BacktestComparison, DedupComparison};
use tick_bench::config::Config;

/// Runs the slow/fast and raw/final comparisons against a running API and
/// prints one line per symbol. History is recorded server-side.
#[derive(Debug, Parser)]
#[command(name = "bench-runner", version)]
struct Args {
    /// API base URL, overrides bench.api_url.
    #[arg(long)]
    api_url: Option<String>,
    /// Symbols to benchmark, overrides bench.symbols.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,
    /// Row limit for the OHLCV queries.
    #[arg(long)]
    limit: Option<u32>,
}

struct ApiClient {
    http: reqwest::Client,
    base: Url,
}

impl ApiClient {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid api url '{}'", base_url))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, base })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base.join(path)?;
        let resp = self
            .http
            .get(url.clone())
            .query(query)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("{} returned HTTP {}: {}", path, status, body);
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("unexpected response from {}", path))
    }
}

fn fmt_speedup(speedup: Option<f64>) -> String {
    speedup
        .map(|s| format!("{:.1}x", s))
        .unwrap_or_else(|| "n/a".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::load().context("failed to load config")?;
    if let Some(url) = args.api_url {
        config.bench.api_url = url;
    }
    if !args.symbols.is_empty() {
        config.bench.symbols = args.symbols;
    }
    if let Some(limit) = args.limit {
        config.bench.limit = limit;
    }
    tick_bench::logging::init(&config.logging);

    let client = ApiClient::new(
        &config.bench.api_url,
        Duration::from_millis(config.bench.request_timeout_ms),
    )?;
    let symbols = config.bench.bench_symbols();
    tracing::info!(api_url = %config.bench.api_url, symbols = ?symbols, "Running benchmarks");

    let mut failures = 0usize;
    println!("Backtest: raw scan vs rollup merge (limit {})", config.bench.limit);
    for symbol in &symbols {
        let query = [
            ("symbol", symbol.clone()),
            ("limit", config.bench.limit.to_string()),
        ];
        match client.get::<BacktestComparison>("/backtest/compare", &query).await {
            Ok(cmp) => println!(
                "  {:<8} {:>10.2} ms -> {:>10.2} ms = {} speedup ({} rows)",
                cmp.symbol,
                cmp.slow.query_time_ms,
                cmp.fast.query_time_ms,
                fmt_speedup(cmp.speedup),
                cmp.fast.rows_returned
            ),
            Err(e) => {
                failures += 1;
                println!("  {:<8} FAILED: {:#}", symbol, e);
            }
        }
    }

    println!("Dedup: raw count vs final count");
    for symbol in &symbols {
        let query = [("symbol", symbol.clone())];
        match client.get::<DedupComparison>("/dedup/compare", &query).await {
            Ok(cmp) => println!(
                "  {:<8} raw {:>10} final {:>10} duplicates removed {:>8} ({} slower)",
                cmp.symbol,
                cmp.raw.count,
                cmp.final_.count,
                cmp.duplicate_count,
                fmt_speedup(cmp.speedup)
            ),
            Err(e) => {
                failures += 1;
                println!("  {:<8} FAILED: {:#}", symbol, e);
            }
        }
    }

    if failures > 0 {
        tracing::warn!(failures, "Some benchmarks failed");
        std::process::exit(1);
    }
    Ok(())
}
