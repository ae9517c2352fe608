//! Partition configuration.
//!
//! Loaded from YAML; every field has a default, so an empty document is a
//! valid configuration.

use crate::types::PartitionId;
use crate::writer::ProcessingLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Retry delays for retriable processing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 50,
            max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub partition_id: PartitionId,

    /// Bounds on the follow-up batch of one record.
    pub limits: ProcessingLimits,

    /// How often the due-date checker looks for expired timers and job deadlines.
    pub due_date_check_interval_ms: u64,

    pub backoff: BackoffConfig,

    /// Capacity of the channel carrying read-only queries to the processing task.
    pub query_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partition_id: 1,
            limits: ProcessingLimits::default(),
            due_date_check_interval_ms: 100,
            backoff: BackoffConfig::default(),
            query_channel_capacity: 64,
        }
    }
}

impl EngineConfig {
    pub const PARTITION_ID_ENV: &'static str = "BROOK_PARTITION_ID";

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Applies `BROOK_PARTITION_ID` if set.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps an environment variable name to its value.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(Self::PARTITION_ID_ENV) {
            self.partition_id = value.trim().parse().map_err(|_| ConfigError::Env {
                name: Self::PARTITION_ID_ENV,
                value,
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_follow_up_records == 0 || self.limits.max_batch_bytes == 0 {
            return Err(ConfigError::Invalid("processing limits must be positive".into()));
        }
        if self.limits.max_job_timeout_ms <= 0 {
            return Err(ConfigError::Invalid("max_job_timeout_ms must be positive".into()));
        }
        if self.due_date_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "due_date_check_interval_ms must be positive".into(),
            ));
        }
        if self.backoff.initial_ms == 0 || self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff must satisfy 0 < initial_ms <= max_ms, got {} and {}",
                self.backoff.initial_ms, self.backoff.max_ms
            )));
        }
        if self.query_channel_capacity == 0 {
            return Err(ConfigError::Invalid("query_channel_capacity must be positive".into()));
        }
        Ok(())
    }

    pub fn due_date_check_interval(&self) -> Duration {
        Duration::from_millis(self.due_date_check_interval_ms)
    }
}
