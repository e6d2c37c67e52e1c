//! Configuration management
//!
//! Settings load from environment variables (`RANGEFLOW_*`) or a TOML file;
//! the environment wins where both are present. Everything has a sensible
//! default so a bare `Config::default()` is runnable against a local SQLite
//! file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{EngineConfig, PartitionFailurePolicy, SplitEstimate};
use crate::error::{Error, Result};
use crate::scheduler::JobSettings;
use crate::utils::{DelaySchedule, RetryConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker configuration
    pub worker: WorkerConfig,

    /// Default job scheduling parameters
    pub job: JobConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Worker-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent worker slots per process
    pub slots: usize,

    /// Wait between acquisition attempts when no partition is free, in
    /// milliseconds
    pub poll_interval_ms: u64,

    /// Retry attempts for transient store/source failures
    pub max_retries: u32,

    /// Base delay for exponential retry backoff, in milliseconds
    pub retry_base_delay_ms: u64,

    /// Fail the whole job when one partition hits a non-transient error
    pub fail_job_on_partition_error: bool,

    /// Re-query the data source for split estimates instead of splitting
    /// proportionally
    pub requery_split_estimate: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slots: 2,
            poll_interval_ms: 5000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            fail_job_on_partition_error: false,
            requery_split_estimate: false,
        }
    }
}

/// Default scheduling parameters for new jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Maximum items per batch
    pub batch_size: usize,

    /// Upper bound on one batch cycle, in seconds
    pub batch_timeout_secs: i64,

    /// Clock tolerance between workers and the store, in seconds
    pub clock_drift_secs: i64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout_secs: 30,
            clock_drift_secs: 5,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/rangeflow.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_parse("RANGEFLOW_WORKER_SLOTS") {
            config.worker.slots = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_POLL_INTERVAL_MS") {
            config.worker.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_MAX_RETRIES") {
            config.worker.max_retries = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_RETRY_BASE_DELAY_MS") {
            config.worker.retry_base_delay_ms = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_FAIL_JOB_ON_PARTITION_ERROR") {
            config.worker.fail_job_on_partition_error = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_BATCH_SIZE") {
            config.job.batch_size = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_BATCH_TIMEOUT_SECS") {
            config.job.batch_timeout_secs = v;
        }
        if let Some(v) = env_parse("RANGEFLOW_CLOCK_DRIFT_SECS") {
            config.job.clock_drift_secs = v;
        }
        if let Ok(v) = std::env::var("RANGEFLOW_SQLITE_PATH") {
            config.storage.sqlite_path = v.into();
        }
        if let Ok(v) = std::env::var("RANGEFLOW_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("RANGEFLOW_LOG_FORMAT") {
            config.logging.format = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| Error::config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the system assumes.
    pub fn validate(&self) -> Result<()> {
        if self.worker.slots == 0 {
            return Err(Error::config("worker.slots must be at least 1"));
        }
        if self.job.batch_size == 0 {
            return Err(Error::config("job.batch_size must be at least 1"));
        }
        if self.job.batch_timeout_secs <= 0 {
            return Err(Error::config("job.batch_timeout_secs must be positive"));
        }
        if self.job.clock_drift_secs < 0 {
            return Err(Error::config("job.clock_drift_secs must not be negative"));
        }
        Ok(())
    }

    /// Engine configuration for one worker slot.
    pub fn engine_config(&self, worker_id: impl Into<String>) -> EngineConfig {
        let failure_policy = if self.worker.fail_job_on_partition_error {
            PartitionFailurePolicy::FailJob
        } else {
            PartitionFailurePolicy::AbandonPartition
        };
        let split_estimate = if self.worker.requery_split_estimate {
            SplitEstimate::Requery
        } else {
            SplitEstimate::Proportional
        };
        EngineConfig::new(worker_id)
            .with_poll_interval(Duration::from_millis(self.worker.poll_interval_ms))
            .with_failure_policy(failure_policy)
            .with_split_estimate(split_estimate)
            .with_retry(RetryConfig {
                max_retries: self.worker.max_retries,
                schedule: DelaySchedule::Exponential {
                    base: Duration::from_millis(self.worker.retry_base_delay_ms),
                    max: Duration::from_secs(30),
                    multiplier: 2.0,
                },
            })
    }

    /// Job settings seeded from the configured defaults.
    pub fn job_settings(&self, id: impl Into<String>) -> JobSettings {
        JobSettings::new(id)
            .with_batch_size(self.job.batch_size)
            .with_batch_timeout_secs(self.job.batch_timeout_secs)
            .with_clock_drift_secs(self.job.clock_drift_secs)
    }
}
