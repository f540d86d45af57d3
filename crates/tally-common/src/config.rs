//! Configuration types for Tally
//!
//! Every field has a default so an empty (or missing) configuration file
//! yields a working service. [`Config::load`] layers an optional TOML file
//! and `TALLY__SECTION__FIELD` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for Tally
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Counter cache configuration
    pub cache: CacheConfig,
    /// Write-batching pipeline configuration
    pub pipeline: PipelineConfig,
    /// Full reconciliation worker configuration
    pub reconciliation: ReconciliationConfig,
    /// Consistency checker configuration
    pub consistency: ConsistencyConfig,
    /// Saga configuration
    pub saga: SagaConfig,
    /// Durable store configuration
    pub store: StoreConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Operational HTTP endpoint configuration
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("TALLY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache.url.trim().is_empty() {
            return Err(Error::Configuration("cache.url must be set".into()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(Error::Configuration("cache.ttl_secs must be > 0".into()));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(Error::Configuration(
                "pipeline.queue_capacity must be > 0".into(),
            ));
        }
        if self.pipeline.batch_size == 0 {
            return Err(Error::Configuration("pipeline.batch_size must be > 0".into()));
        }
        if self.pipeline.flush_interval_ms == 0 {
            return Err(Error::Configuration(
                "pipeline.flush_interval_ms must be > 0".into(),
            ));
        }
        if self.reconciliation.interval_secs == 0 {
            return Err(Error::Configuration(
                "reconciliation.interval_secs must be > 0".into(),
            ));
        }
        if self.consistency.interval_secs == 0 {
            return Err(Error::Configuration(
                "consistency.interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Counter cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Redis server holding the counters (`redis://host:port/db`)
    pub url: String,
    /// Retention of a counter after its last write (seconds)
    pub ttl_secs: u64,
}

impl CacheConfig {
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            ttl_secs: 24 * 60 * 60, // 24h
        }
    }
}

/// Write-batching pipeline configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded queue capacity
    pub queue_capacity: usize,
    /// Maximum updates per flushed batch
    pub batch_size: usize,
    /// Flush whatever is buffered at this interval (milliseconds)
    pub flush_interval_ms: u64,
    /// How long `enqueue` waits on a full queue before writing directly (milliseconds)
    pub enqueue_timeout_ms: u64,
}

impl PipelineConfig {
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub const fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            batch_size: 100,
            flush_interval_ms: 100,
            enqueue_timeout_ms: 100,
        }
    }
}

/// Full reconciliation worker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Run the periodic worker
    pub enabled: bool,
    /// Interval between full passes (seconds)
    pub interval_secs: u64,
    /// Pause between two users within a pass (milliseconds)
    pub inter_user_delay_ms: u64,
}

impl ReconciliationConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn inter_user_delay(&self) -> Duration {
        Duration::from_millis(self.inter_user_delay_ms)
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10 * 60,
            inter_user_delay_ms: 10,
        }
    }
}

/// Consistency checker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsistencyConfig {
    /// Run the periodic checker
    pub enabled: bool,
    /// Interval between checks (seconds)
    pub interval_secs: u64,
    /// Only users with unread rows created within this window are sampled (seconds)
    pub lookback_secs: u64,
    /// Relative tolerance, percent of the authoritative count
    pub tolerance_percent: i64,
    /// Absolute tolerance floor
    pub tolerance_floor: i64,
}

impl ConsistencyConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            lookback_secs: 24 * 60 * 60,
            tolerance_percent: 10,
            tolerance_floor: 5,
        }
    }
}

/// Saga configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Rows marked read within this window are flipped back when a
    /// mark-as-read saga compensates (seconds)
    pub read_undo_window_secs: u64,
}

impl SagaConfig {
    #[must_use]
    pub const fn read_undo_window(&self) -> Duration {
        Duration::from_secs(self.read_undo_window_secs)
    }
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            read_undo_window_secs: 60,
        }
    }
}

/// Durable store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./tally-data/tally.db"),
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Operational HTTP endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for `/metrics` and `/health`
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9400".to_string(),
        }
    }
}
