//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::coordinator::DeliveryPolicy;
use crate::engine::detector::DEFAULT_SAMPLE_LINES;
use crate::engine::keys::MAX_ROW_NUMBER;
use crate::engine::reader::DEFAULT_SAMPLE_BYTES;
use crate::engine::writer::{
    WriterSettings, DEFAULT_BATCH_RETRIES, DEFAULT_BATCH_RETRY_DELAY, DEFAULT_BATCH_SIZE,
};

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default maximum data rows accepted per file.
pub const DEFAULT_MAX_ROWS: u64 = 1_000_000;

/// Default deliveries of one notification before it is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Default redelivery delay after the first failed attempt, in seconds.
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 10;

/// Default cap on the redelivery delay, in seconds.
pub const DEFAULT_BACKOFF_MAX_SECS: u64 = 600;

/// Default time a claimed delivery stays invisible to other workers, in seconds.
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 600;

/// Default time budget of a single attempt, in seconds.
pub const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 540;

/// Default number of concurrent consumer loops.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

/// Default pause between polls of an empty queue, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

// ============================================================================
// Database Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/csvflow";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Processor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub engine: EngineConfig,
    pub worker: WorkerSettings,
    pub database: DatabaseConfig,
}

/// Settings of the processing engine itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bucket notifications must refer to; `None` accepts any bucket
    pub bucket: Option<String>,
    pub writer: WriterSettings,
    pub max_rows: u64,
    pub sample_bytes: usize,
    pub sample_lines: usize,
    pub attempt_timeout: Duration,
    pub delivery: DeliveryPolicy,
}

/// Consumer loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub concurrency: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            writer: WriterSettings::default(),
            max_rows: DEFAULT_MAX_ROWS,
            sample_bytes: DEFAULT_SAMPLE_BYTES,
            sample_lines: DEFAULT_SAMPLE_LINES,
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
            delivery: DeliveryPolicy::default(),
        }
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            visibility_timeout: Duration::from_secs(DEFAULT_VISIBILITY_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Parse `key` from the environment, or use `default` when unset.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", key, raw, e)),
        _ => Ok(default),
    }
}

impl ProcessorConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without loading `.env` or validating.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            engine: EngineConfig {
                bucket: std::env::var("CSVFLOW_BUCKET")
                    .ok()
                    .filter(|b| !b.trim().is_empty()),
                writer: WriterSettings {
                    batch_size: env_or("CSVFLOW_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
                    batch_retries: env_or("CSVFLOW_BATCH_RETRIES", DEFAULT_BATCH_RETRIES)?,
                    retry_delay: Duration::from_millis(env_or(
                        "CSVFLOW_BATCH_RETRY_DELAY_MS",
                        DEFAULT_BATCH_RETRY_DELAY.as_millis() as u64,
                    )?),
                },
                max_rows: env_or("CSVFLOW_MAX_ROWS", DEFAULT_MAX_ROWS)?,
                sample_bytes: env_or("CSVFLOW_SAMPLE_BYTES", DEFAULT_SAMPLE_BYTES)?,
                sample_lines: env_or("CSVFLOW_SAMPLE_LINES", DEFAULT_SAMPLE_LINES)?,
                attempt_timeout: Duration::from_secs(env_or(
                    "CSVFLOW_ATTEMPT_TIMEOUT_SECS",
                    DEFAULT_ATTEMPT_TIMEOUT_SECS,
                )?),
                delivery: DeliveryPolicy {
                    max_attempts: env_or(
                        "CSVFLOW_MAX_DELIVERY_ATTEMPTS",
                        DEFAULT_MAX_DELIVERY_ATTEMPTS,
                    )?,
                    backoff_base: Duration::from_secs(env_or(
                        "CSVFLOW_BACKOFF_BASE_SECS",
                        DEFAULT_BACKOFF_BASE_SECS,
                    )?),
                    backoff_max: Duration::from_secs(env_or(
                        "CSVFLOW_BACKOFF_MAX_SECS",
                        DEFAULT_BACKOFF_MAX_SECS,
                    )?),
                },
            },
            worker: WorkerSettings {
                concurrency: env_or("CSVFLOW_WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?,
                visibility_timeout: Duration::from_secs(env_or(
                    "CSVFLOW_VISIBILITY_TIMEOUT_SECS",
                    DEFAULT_VISIBILITY_TIMEOUT_SECS,
                )?),
                poll_interval: Duration::from_millis(env_or(
                    "CSVFLOW_POLL_INTERVAL_MS",
                    DEFAULT_POLL_INTERVAL_MS,
                )?),
            },
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                )?,
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                )?,
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                )?,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let engine = &self.engine;

        if engine.writer.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }

        if engine.max_rows == 0 {
            anyhow::bail!("Max rows must be greater than 0");
        }

        if engine.max_rows > MAX_ROW_NUMBER {
            anyhow::bail!(
                "Max rows ({}) cannot exceed the row key capacity ({})",
                engine.max_rows,
                MAX_ROW_NUMBER
            );
        }

        if engine.sample_bytes == 0 || engine.sample_lines == 0 {
            anyhow::bail!("Detection sample must cover at least one byte and one line");
        }

        if engine.delivery.max_attempts == 0 {
            anyhow::bail!("Max delivery attempts must be greater than 0");
        }

        if engine.delivery.backoff_base > engine.delivery.backoff_max {
            anyhow::bail!(
                "Backoff base ({:?}) cannot be greater than backoff max ({:?})",
                engine.delivery.backoff_base,
                engine.delivery.backoff_max
            );
        }

        if engine.attempt_timeout.is_zero() {
            anyhow::bail!("Attempt timeout must be greater than 0");
        }

        if self.worker.concurrency == 0 {
            anyhow::bail!("Worker concurrency must be greater than 0");
        }

        if self.worker.visibility_timeout <= engine.attempt_timeout {
            tracing::warn!(
                visibility_timeout = ?self.worker.visibility_timeout,
                attempt_timeout = ?engine.attempt_timeout,
                "Visibility timeout does not exceed the attempt timeout - slow attempts may be redelivered while running"
            );
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if engine.bucket.is_none() {
            tracing::warn!("CSVFLOW_BUCKET not set - notifications for every bucket will be processed");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "CSVFLOW_BUCKET",
        "CSVFLOW_BATCH_SIZE",
        "CSVFLOW_MAX_ROWS",
        "CSVFLOW_BATCH_RETRIES",
        "CSVFLOW_BATCH_RETRY_DELAY_MS",
        "CSVFLOW_SAMPLE_BYTES",
        "CSVFLOW_SAMPLE_LINES",
        "CSVFLOW_MAX_DELIVERY_ATTEMPTS",
        "CSVFLOW_BACKOFF_BASE_SECS",
        "CSVFLOW_BACKOFF_MAX_SECS",
        "CSVFLOW_VISIBILITY_TIMEOUT_SECS",
        "CSVFLOW_ATTEMPT_TIMEOUT_SECS",
        "CSVFLOW_WORKER_CONCURRENCY",
        "CSVFLOW_POLL_INTERVAL_MS",
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "DATABASE_MIN_CONNECTIONS",
        "DATABASE_CONNECT_TIMEOUT",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.writer.batch_size, 1000);
        assert_eq!(config.engine.max_rows, 1_000_000);
        assert_eq!(config.engine.delivery.max_attempts, 5);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = ProcessorConfig::from_env().unwrap();
        assert!(config.engine.bucket.is_none());
        assert_eq!(config.engine.sample_bytes, DEFAULT_SAMPLE_BYTES);
        assert_eq!(config.worker.concurrency, DEFAULT_WORKER_CONCURRENCY);
        assert_eq!(config.database.url, DEFAULT_DATABASE_URL);
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("CSVFLOW_BUCKET", "uploads");
        std::env::set_var("CSVFLOW_BATCH_SIZE", "250");
        std::env::set_var("CSVFLOW_BACKOFF_BASE_SECS", "2");
        std::env::set_var("CSVFLOW_POLL_INTERVAL_MS", "50");

        let config = ProcessorConfig::from_env().unwrap();
        assert_eq!(config.engine.bucket.as_deref(), Some("uploads"));
        assert_eq!(config.engine.writer.batch_size, 250);
        assert_eq!(config.engine.delivery.backoff_base, Duration::from_secs(2));
        assert_eq!(config.worker.poll_interval, Duration::from_millis(50));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparsable_values_are_rejected() {
        clear_env();
        std::env::set_var("CSVFLOW_BATCH_SIZE", "lots");
        let err = ProcessorConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("CSVFLOW_BATCH_SIZE"));
        clear_env();
    }

    #[test]
    fn test_validation_rules() {
        let mut config = ProcessorConfig::default();
        config.engine.writer.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.engine.max_rows = MAX_ROW_NUMBER + 1;
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.engine.delivery.backoff_base = Duration::from_secs(700);
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = ProcessorConfig::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }
}
