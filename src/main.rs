use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use tick_bench::api::{create_router, AppState, RequestDefaults};
use tick_bench::bench::{BenchmarkRunner, HistoryLog};
use tick_bench::config::Config;
use tick_bench::ingest::Broker;
use tick_bench::query::QueryEngine;
use tick_bench::store::TickStore;

/// Tick analytics API: ingest endpoint plus raw-scan vs rollup benchmarks.
#[derive(Debug, Parser)]
#[command(name = "tick-bench", version)]
struct Args {
    /// Listen address, overrides server.bind.
    #[arg(long)]
    bind: Option<String>,
    /// DuckDB file or `:memory:`, overrides store.db_path.
    #[arg(long)]
    db_path: Option<String>,
    /// Disable the in-process ingest broker (query-only server).
    #[arg(long)]
    no_ingest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {:#}", e);
            eprintln!("Set TICK_BENCH_CONFIG or create config/default.toml");
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(db_path) = args.db_path {
        config.store.db_path = db_path;
    }

    tick_bench::logging::init(&config.logging);
    tracing::info!(
        bind = %config.server.bind,
        db_path = %config.store.db_path,
        history = %config.store.history_path.display(),
        "Starting tick-bench"
    );

    // The API still serves (with 503s) when the store cannot be opened.
    let store = match TickStore::open(&config.store.db_path) {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::error!(error = %e, "Could not open tick store; queries will return 503");
            None
        }
    };

    let mut consumers = Vec::new();
    let broker = match (&store, args.no_ingest) {
        (Some(store), false) => {
            let (broker, handles) = Broker::spawn(store.clone(), config.ingest.broker_config());
            consumers = handles;
            Some(Arc::new(broker))
        }
        _ => None,
    };

    if let Some(store) = store.clone() {
        spawn_compactor(store, config.store.compaction_interval_secs);
    }

    let engine = QueryEngine::new(store, config.store.query_timeout());
    let runner = BenchmarkRunner::new(engine, HistoryLog::new(&config.store.history_path));
    let state = AppState {
        runner: Arc::new(runner),
        broker,
        defaults: RequestDefaults {
            symbol: config.server.default_symbol.clone(),
            limit: config.server.default_limit,
            max_limit: config.server.max_limit,
        },
    };
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    tracing::info!("tick-bench listening on http://{}", config.server.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // The router (and with it the broker) is gone; consumers drain and exit.
    for handle in consumers {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Ingest consumer ended abnormally");
        }
    }
    tracing::info!("tick-bench stopped");
    Ok(())
}

/// Periodically fold rollup partial rows into one row per bucket.
fn spawn_compactor(store: TickStore, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.compact_rollup()).await {
                Ok(Ok(summary)) if summary.rows_before != summary.rows_after => tracing::info!(
                    rows_before = summary.rows_before,
                    rows_after = summary.rows_after,
                    "Rollup compacted"
                ),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Rollup compaction failed"),
                Err(e) => tracing::warn!(error = %e, "Rollup compaction task failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, stopping");
}
