//! Worker configuration loaded from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL` — PostgreSQL connection string (default: unset, in-memory stores)
/// - `SAGA_POLL_INTERVAL_MS` — saga poll interval (default: `1000`)
/// - `OUTBOX_POLL_INTERVAL_MS` — outbox scan interval (default: `500`)
/// - `OUTBOX_BATCH_SIZE` — entries per outbox scan (default: `100`)
/// - `SNAPSHOT_INTERVAL` — events between account snapshots, `0` disables (default: `50`)
/// - `METRICS_ADDR` — Prometheus listener (default: `"0.0.0.0:9000"`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT` — `text` or `json` (default: `text`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub saga_poll_interval: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_batch_size: usize,
    pub snapshot_interval: u64,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            saga_poll_interval: parse(&lookup, "SAGA_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.saga_poll_interval),
            outbox_poll_interval: parse(&lookup, "OUTBOX_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.outbox_poll_interval),
            outbox_batch_size: parse(&lookup, "OUTBOX_BATCH_SIZE")?
                .unwrap_or(defaults.outbox_batch_size),
            snapshot_interval: parse(&lookup, "SNAPSHOT_INTERVAL")?
                .unwrap_or(defaults.snapshot_interval),
            metrics_addr: parse(&lookup, "METRICS_ADDR")?.unwrap_or(defaults.metrics_addr),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT") {
                None => defaults.log_format,
                Some(value) => match value.to_ascii_lowercase().as_str() {
                    "text" | "pretty" => LogFormat::Text,
                    "json" => LogFormat::Json,
                    _ => {
                        return Err(ConfigError::Invalid {
                            key: "LOG_FORMAT",
                            value,
                            reason: "expected text or json".to_string(),
                        });
                    }
                },
            },
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            saga_poll_interval: Duration::from_millis(1000),
            outbox_poll_interval: Duration::from_millis(500),
            outbox_batch_size: 100,
            snapshot_interval: 50,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}
