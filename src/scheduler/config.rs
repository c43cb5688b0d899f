//! Scheduler configuration.
//!
//! This module provides configuration options for the scheduler: pool size,
//! queue ordering, how results are scored, and unit supervision limits.

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::queue::QueueOrder;

/// Default name of the numeric response field used to rank results.
pub const DEFAULT_SCORE_FIELD: &str = "energy";

/// Default number of consecutive initialization faults before the pool gives up.
pub const DEFAULT_MAX_INIT_FAILURES: u32 = 5;

/// Default thread name prefix for execution units.
pub const DEFAULT_UNIT_NAME_PREFIX: &str = "solver-unit";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the scheduler and its worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Desired number of execution units.
    pub target_size: usize,
    /// Which queued job a free unit takes next.
    pub queue_order: QueueOrder,
    /// Numeric field of kernel responses compared by aggregation (higher is better).
    pub score_field: String,
    /// Consecutive initialization faults tolerated before the pool stops
    /// respawning. Zero means never give up.
    pub max_init_failures: u32,
    /// Thread name prefix for execution units.
    pub unit_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            queue_order: QueueOrder::default(),
            score_field: DEFAULT_SCORE_FIELD.to_string(),
            max_init_failures: DEFAULT_MAX_INIT_FAILURES,
            unit_name_prefix: DEFAULT_UNIT_NAME_PREFIX.to_string(),
        }
    }
}

/// Number of hardware threads available to this process, at least 1.
pub fn default_target_size() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

impl SchedulerConfig {
    /// Creates a configuration with the given pool size and defaults elsewhere.
    pub fn new(target_size: usize) -> Self {
        Self {
            target_size,
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SCHEDULER_TARGET_SIZE`: Number of execution units (default: available parallelism)
    /// - `SCHEDULER_QUEUE_ORDER`: `lifo` or `fifo` (default: lifo)
    /// - `SCHEDULER_SCORE_FIELD`: Response field used for ranking (default: energy)
    /// - `SCHEDULER_MAX_INIT_FAILURES`: Initialization faults before giving up (default: 5)
    /// - `SCHEDULER_UNIT_NAME_PREFIX`: Unit thread name prefix (default: solver-unit)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SCHEDULER_TARGET_SIZE") {
            config.target_size = parse_env_value(&val, "SCHEDULER_TARGET_SIZE")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_QUEUE_ORDER") {
            config.queue_order = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "SCHEDULER_QUEUE_ORDER".to_string(),
                message,
            })?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_SCORE_FIELD") {
            config.score_field = val;
        }

        if let Ok(val) = std::env::var("SCHEDULER_MAX_INIT_FAILURES") {
            config.max_init_failures = parse_env_value(&val, "SCHEDULER_MAX_INIT_FAILURES")?;
        }

        if let Ok(val) = std::env::var("SCHEDULER_UNIT_NAME_PREFIX") {
            config.unit_name_prefix = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.score_field.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "score_field cannot be empty".to_string(),
            ));
        }

        if self.unit_name_prefix.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "unit_name_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the pool size.
    pub fn with_target_size(mut self, target_size: usize) -> Self {
        self.target_size = target_size;
        self
    }

    /// Sets the queue order.
    pub fn with_queue_order(mut self, order: QueueOrder) -> Self {
        self.queue_order = order;
        self
    }

    /// Sets the score field.
    pub fn with_score_field(mut self, field: impl Into<String>) -> Self {
        self.score_field = field.into();
        self
    }

    /// Sets the initialization fault limit.
    pub fn with_max_init_failures(mut self, limit: u32) -> Self {
        self.max_init_failures = limit;
        self
    }

    /// Sets the unit thread name prefix.
    pub fn with_unit_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.unit_name_prefix = prefix.into();
        self
    }
}

fn parse_env_value<T: std::str::FromStr>(val: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    val.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();

        assert!(config.target_size >= 1);
        assert_eq!(config.queue_order, QueueOrder::Lifo);
        assert_eq!(config.score_field, "energy");
        assert_eq!(config.max_init_failures, 5);
        assert_eq!(config.unit_name_prefix, "solver-unit");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::new(8)
            .with_queue_order(QueueOrder::Fifo)
            .with_score_field("score")
            .with_max_init_failures(0)
            .with_unit_name_prefix("kernel");

        assert_eq!(config.target_size, 8);
        assert_eq!(config.queue_order, QueueOrder::Fifo);
        assert_eq!(config.score_field, "score");
        assert_eq!(config.max_init_failures, 0);
        assert_eq!(config.unit_name_prefix, "kernel");

        let config = config.with_target_size(0);
        assert_eq!(config.target_size, 0);
        assert!(config.validate().is_ok(), "an empty pool is a valid configuration");
    }

    #[test]
    fn test_validation_rejects_empty_fields() {
        let config = SchedulerConfig::new(2).with_score_field("  ");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("score_field")
        ));

        let config = SchedulerConfig::new(2).with_unit_name_prefix("");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(msg)) if msg.contains("unit_name_prefix")
        ));
    }

    #[test]
    fn test_parse_env_value() {
        let parsed: usize = parse_env_value(" 12 ", "KEY").expect("parses");
        assert_eq!(parsed, 12);

        let err = parse_env_value::<u32>("-1", "SCHEDULER_MAX_INIT_FAILURES")
            .expect_err("negative limit is invalid");
        assert!(err.to_string().contains("SCHEDULER_MAX_INIT_FAILURES"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "SCHEDULER_QUEUE_ORDER".to_string(),
            message: "unknown".to_string(),
        };
        assert!(err.to_string().contains("SCHEDULER_QUEUE_ORDER"));

        let err = ConfigError::ValidationFailed("bad".to_string());
        assert!(err.to_string().contains("bad"));
    }
}
