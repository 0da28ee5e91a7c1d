//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, ResultExt, StoreError};
use crate::retention::RetentionPolicy;
use crate::retry::RetryPolicy;

/// Default checkpoint cadence
pub const DEFAULT_CHECKPOINT_INTERVAL_SECS: u64 = 60;

/// Default number of full recovery attempts before degrading
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Storage engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between scheduled checkpoints
    pub checkpoint_interval_secs: u64,

    /// Full recovery attempts before falling back to degraded mode
    pub max_retries: u32,

    /// Delay before the second attempt, in milliseconds
    pub retry_base_delay_ms: u64,

    /// Backoff multiplier between attempts
    pub retry_factor: f64,

    /// Limits enforced by the retention scheduler
    pub retention: RetentionPolicy,

    /// Seconds between retention cycles
    pub retention_interval_secs: u64,

    /// Rows removed per batch by size-based purges
    pub purge_batch_size: u32,

    /// Cap on batches in one size-based purge
    pub max_purge_iterations: u32,

    /// Fraction of rows a purge must remove before a vacuum is queued
    pub vacuum_threshold: f64,

    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: 1000,
            retry_factor: 2.0,
            retention: RetentionPolicy::default(),
            retention_interval_secs: 3600,
            purge_batch_size: 100,
            max_purge_iterations: 50,
            vacuum_threshold: 0.25,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the checkpoint cadence
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Set retry attempts and base delay
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay_ms = base_delay.as_millis() as u64;
        self
    }

    /// Set the retention policy
    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = policy;
        self
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    /// Retry policy wrapped around the recovery protocol
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_base_delay_ms),
            self.retry_factor,
        )
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval_secs == 0 {
            return Err(StoreError::Config("checkpoint_interval_secs must be > 0".into()));
        }
        if self.max_retries == 0 {
            return Err(StoreError::Config("max_retries must be >= 1".into()));
        }
        if !(self.retry_factor >= 1.0) {
            return Err(StoreError::Config("retry_factor must be >= 1.0".into()));
        }
        if self.retention_interval_secs == 0 {
            return Err(StoreError::Config("retention_interval_secs must be > 0".into()));
        }
        if self.purge_batch_size == 0 {
            return Err(StoreError::Config("purge_batch_size must be > 0".into()));
        }
        if self.max_purge_iterations == 0 {
            return Err(StoreError::Config("max_purge_iterations must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(StoreError::Config("event_capacity must be > 0".into()));
        }
        if !(self.vacuum_threshold > 0.0 && self.vacuum_threshold <= 1.0) {
            return Err(StoreError::Config("vacuum_threshold must be in (0.0, 1.0]".into()));
        }
        Ok(())
    }

    /// Load configuration from a TOML or JSON file (by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(StoreError::from)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .map_err(StoreError::from)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            _ => toml::from_str(&content)
                .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?,
        };
        config
            .validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
