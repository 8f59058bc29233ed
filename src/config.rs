use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::generator::{default_universe, GeneratorConfig, SymbolSpec};
use crate::ingest::BrokerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub producer: ProducerConfig,
    pub bench: BenchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_symbol")]
    pub default_symbol: String,
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    /// Upper bound for `limit` on the backtest endpoints.
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// DuckDB file, or `:memory:`.
    pub db_path: String,
    pub history_path: PathBuf,
    pub query_timeout_ms: u64,
    /// Seconds between rollup compactions; 0 disables.
    #[serde(default)]
    pub compaction_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    pub topic: String,
    pub partitions: usize,
    pub batch_size: usize,
    pub linger_ms: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    pub api_url: String,
    pub rate_per_sec: u32,
    pub flush_every: u64,
    pub log_every: u64,
    pub connect_attempts: u32,
    pub connect_backoff_ms: u64,
    pub send_timeout_ms: u64,
    pub exchange: String,
    pub correction_rate: f64,
    pub correction_window: usize,
    #[serde(default = "default_universe")]
    pub universe: Vec<SymbolSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    pub api_url: String,
    pub symbols: Vec<String>,
    pub limit: u32,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_symbol() -> String {
    "AAPL".to_string()
}

fn default_limit() -> u32 {
    100
}

fn default_max_limit() -> u32 {
    10_000
}

impl StoreConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl IngestConfig {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            topic: self.topic.clone(),
            partitions: self.partitions,
            batch_size: self.batch_size,
            linger: Duration::from_millis(self.linger_ms),
            queue_depth: self.queue_depth,
        }
    }
}

impl ProducerConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            exchange: self.exchange.clone(),
            universe: self.universe.clone(),
            correction_rate: self.correction_rate,
            correction_window: self.correction_window,
            ..GeneratorConfig::default()
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Pause between emissions for the target rate.
    pub fn emit_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.rate_per_sec.max(1)))
    }
}

impl BenchConfig {
    /// Configured symbols, upper-cased, blanks and repeats dropped.
    pub fn bench_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for sym in &self.symbols {
            let s = sym.trim().to_ascii_uppercase();
            if !s.is_empty() && !out.iter().any(|v| v == &s) {
                out.push(s);
            }
        }
        out
    }
}

impl Config {
    /// Read `TICK_BENCH_CONFIG` (or `config/default.toml`), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var("TICK_BENCH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&config_path)?;

        if let Ok(path) = std::env::var("TICK_BENCH_DB_PATH") {
            config.store.db_path = path;
        }
        if let Ok(url) = std::env::var("TICK_BENCH_API_URL") {
            config.producer.api_url = url.clone();
            config.bench.api_url = url;
        }
        if let Ok(bind) = std::env::var("TICK_BENCH_BIND") {
            config.server.bind = bind;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&config_str)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.db_path.trim().is_empty() {
            bail!("store.db_path must not be empty");
        }
        if self.store.query_timeout_ms == 0 {
            bail!("store.query_timeout_ms must be > 0");
        }
        if self.ingest.topic.trim().is_empty() {
            bail!("ingest.topic must not be empty");
        }
        if self.ingest.partitions == 0 || self.ingest.batch_size == 0 {
            bail!("ingest.partitions and ingest.batch_size must be > 0");
        }
        if self.producer.rate_per_sec == 0 {
            bail!("producer.rate_per_sec must be > 0");
        }
        if self.producer.flush_every == 0 {
            bail!("producer.flush_every must be > 0");
        }
        if self.producer.send_timeout_ms == 0 {
            bail!("producer.send_timeout_ms must be > 0");
        }
        if self.server.default_limit > self.server.max_limit {
            bail!(
                "server.default_limit {} exceeds server.max_limit {}",
                self.server.default_limit,
                self.server.max_limit
            );
        }
        if self.bench.bench_symbols().is_empty() {
            bail!("bench.symbols must name at least one symbol");
        }
        self.producer
            .generator_config()
            .validate()
            .map_err(anyhow::Error::msg)
            .context("producer settings are invalid")?;
        url::Url::parse(&self.producer.api_url)
            .with_context(|| format!("producer.api_url '{}' is invalid", self.producer.api_url))?;
        url::Url::parse(&self.bench.api_url)
            .with_context(|| format!("bench.api_url '{}' is invalid", self.bench.api_url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
bind = "0.0.0.0:8000"

[store]
db_path = ":memory:"
history_path = "results/history.csv"
query_timeout_ms = 30000

[ingest]
topic = "ticks"
partitions = 4
batch_size = 500
linger_ms = 50
queue_depth = 10000

[producer]
api_url = "http://127.0.0.1:8000"
rate_per_sec = 100
flush_every = 100
log_every = 1000
connect_attempts = 5
connect_backoff_ms = 5000
send_timeout_ms = 10000
exchange = "XNAS"
correction_rate = 0.05
correction_window = 200

[bench]
api_url = "http://127.0.0.1:8000"
symbols = ["aapl", "MSFT", " ", "AAPL"]
limit = 100
request_timeout_ms = 60000

[logging]
level = "info"
"#;

    #[test]
    fn parse_sample_applies_defaults() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.default_symbol, "AAPL");
        assert_eq!(config.server.default_limit, 100);
        assert_eq!(config.store.compaction_interval_secs, 0);
        assert_eq!(config.producer.universe.len(), 9);
        assert!(!config.logging.json);
        config.validate().unwrap();
    }

    #[test]
    fn bench_symbols_dedup_and_normalize() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.bench.bench_symbols(),
            vec!["AAPL".to_string(), "MSFT".to_string()]
        );
    }

    #[test]
    fn validate_rejects_bad_correction_rate() {
        let mut config = Config::from_toml_str(SAMPLE).unwrap();
        config.producer.correction_rate = 2.0;
        assert!(config.validate().is_err());
    }
}
