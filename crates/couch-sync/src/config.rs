//! Plugin configuration.
//!
//! Loaded from JSON; every field has a default so an empty object is a valid
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Configuration for one plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Name of the backing database (used in logs)
    #[serde(default)]
    pub database: String,

    /// Design document holding the collection view
    #[serde(default = "default_design_document")]
    pub design_document: String,

    /// Name of the view keyed by collection prefix
    #[serde(default = "default_collection_view")]
    pub collection_view: String,

    /// Attribute marking a document as logically removed
    #[serde(default = "default_soft_delete_field")]
    pub soft_delete_field: String,

    /// Number of UUIDs fetched per pool refill
    #[serde(default = "default_uuid_batch_size")]
    pub uuid_batch_size: usize,

    /// Retry behavior for conflicts, unacknowledged writes and UUID refills
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database: String::new(),
            design_document: default_design_document(),
            collection_view: default_collection_view(),
            soft_delete_field: default_soft_delete_field(),
            uuid_batch_size: default_uuid_batch_size(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uuid_batch_size == 0 {
            return Err(ConfigError::Invalid("uuid_batch_size must be positive".into()));
        }
        if !self.design_document.starts_with("_design/") {
            return Err(ConfigError::Invalid(format!(
                "design_document must start with _design/: {}",
                self.design_document
            )));
        }
        if self.soft_delete_field.is_empty() || self.soft_delete_field.starts_with('_') {
            return Err(ConfigError::Invalid(format!(
                "soft_delete_field must be a plain attribute name: {:?}",
                self.soft_delete_field
            )));
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid("retry.backoff_factor must be >= 1".into()));
        }
        Ok(())
    }
}

fn default_design_document() -> String {
    "_design/backbone".to_string()
}

fn default_collection_view() -> String {
    "collection".to_string()
}

fn default_soft_delete_field() -> String {
    "isDeleted".to_string()
}

fn default_uuid_batch_size() -> usize {
    100
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (None = unlimited)
    #[serde(default = "default_max_retries")]
    pub max_retries: Option<u32>,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on the delay between retries, in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after each retry
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_retries() -> Option<u32> {
    Some(8)
}

fn default_initial_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Retry forever without waiting.
    pub fn unbounded() -> Self {
        Self {
            max_retries: None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_factor: 1.0,
        }
    }

    /// Retry up to `max_retries` times without waiting.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::unbounded()
        }
    }

    /// Whether retry number `retry` (1-based) is permitted.
    pub fn allows(&self, retry: u32) -> bool {
        self.max_retries.map(|max| retry <= max).unwrap_or(true)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay_ms = self.initial_delay_ms as f64
            * self.backoff_factor.powi(retry.saturating_sub(1) as i32);

        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Sleep for the backoff of retry number `retry`, if any.
    pub async fn wait(&self, retry: u32) {
        let delay = self.backoff(retry);
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
    }
}
