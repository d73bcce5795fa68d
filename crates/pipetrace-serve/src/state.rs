//! Application state and configuration.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Duration;

use pipetrace_core::ValidationLimits;
use pipetrace_ingest::{EventStore, IdempotencyIndex};

use crate::cache::{new_cache, ResponseCache};
use crate::rate_limit::IngestRateLimiter;

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8075").
    pub bind_addr: String,

    /// ClickHouse connection URL.
    pub clickhouse_url: String,

    /// ClickHouse database name.
    pub clickhouse_database: String,

    /// Directory for the RocksDB idempotency index.
    pub index_path: PathBuf,

    /// Allowance for producer clocks running ahead, in seconds.
    pub max_future_skew_secs: u32,

    /// Global ingest cap in events per second (0 disables).
    pub events_per_second: u32,

    /// Port for the Prometheus /metrics server (0 disables).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `PIPETRACE_BIND_ADDR` (default: "0.0.0.0:8075")
    /// - `PIPETRACE_CLICKHOUSE_URL` (default: "http://localhost:8123")
    /// - `PIPETRACE_CLICKHOUSE_DB` (default: "pipetrace")
    /// - `PIPETRACE_INDEX_PATH` (default: "./data/idempotency")
    /// - `PIPETRACE_MAX_FUTURE_SKEW_SECS` (default: 0)
    /// - `PIPETRACE_EVENTS_PER_SECOND` (default: 500)
    /// - `PIPETRACE_METRICS_PORT` (default: 0, disabled)
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr =
            std::env::var("PIPETRACE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8075".to_string());

        let clickhouse_url = std::env::var("PIPETRACE_CLICKHOUSE_URL")
            .unwrap_or_else(|_| "http://localhost:8123".to_string());

        let clickhouse_database =
            std::env::var("PIPETRACE_CLICKHOUSE_DB").unwrap_or_else(|_| "pipetrace".to_string());

        let index_path = std::env::var("PIPETRACE_INDEX_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/idempotency"));

        let max_future_skew_secs = parse_env_u32("PIPETRACE_MAX_FUTURE_SKEW_SECS", 0)?;
        let events_per_second = parse_env_u32("PIPETRACE_EVENTS_PER_SECOND", 500)?;
        let metrics_port = parse_env_u32("PIPETRACE_METRICS_PORT", 0)? as u16;

        tracing::info!(
            bind_addr = %bind_addr,
            clickhouse_url = %clickhouse_url,
            clickhouse_database = %clickhouse_database,
            index_path = %index_path.display(),
            max_future_skew_secs,
            events_per_second,
            "configuration loaded"
        );

        Ok(Self {
            bind_addr,
            clickhouse_url,
            clickhouse_database,
            index_path,
            max_future_skew_secs,
            events_per_second,
            metrics_port,
        })
    }

    /// Validation limits derived from this configuration.
    pub fn validation_limits(&self) -> ValidationLimits {
        ValidationLimits {
            max_future_skew: Duration::seconds(i64::from(self.max_future_skew_secs)),
            ..ValidationLimits::default()
        }
    }
}

fn parse_env_u32(name: &str, default: u32) -> anyhow::Result<u32> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} must be an integer, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The event store (ClickHouse + idempotency index).
    pub store: EventStore,

    /// Aggregate response cache.
    pub cache: ResponseCache,

    /// Global ingest rate limiter.
    pub rate_limit: Arc<IngestRateLimiter>,

    /// Timestamp validation limits.
    pub limits: ValidationLimits,

    /// Application configuration.
    pub config: Arc<Config>,
}

impl AppState {
    /// Create application state: opens the idempotency index and connects
    /// to ClickHouse. Schema bootstrap happens separately at startup.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let index = Arc::new(IdempotencyIndex::open(&config.index_path)?);
        let store = EventStore::connect(
            &config.clickhouse_url,
            &config.clickhouse_database,
            index,
        );

        Ok(Self {
            store,
            cache: new_cache(),
            rate_limit: Arc::new(IngestRateLimiter::new(config.events_per_second)),
            limits: config.validation_limits(),
            config: Arc::new(config),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_limits_from_config() {
        let config = Config {
            bind_addr: "0.0.0.0:8075".to_string(),
            clickhouse_url: "http://localhost:8123".to_string(),
            clickhouse_database: "pipetrace".to_string(),
            index_path: PathBuf::from("/tmp/idx"),
            max_future_skew_secs: 5,
            events_per_second: 500,
            metrics_port: 0,
        };
        let limits = config.validation_limits();
        assert_eq!(limits.max_future_skew, Duration::seconds(5));
        assert_eq!(limits.max_event_age, Duration::hours(24));
    }
}
