//! Engine configuration types for procflow.
//!
//! `EngineConfig` represents the `config.toml` that tunes lock leases,
//! expression budgets, and routing strictness.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lifetime of a per-instance lock lease, in milliseconds.
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// How long to keep retrying a busy lock before failing (0 = single attempt).
    #[serde(default)]
    pub lock_acquire_timeout_ms: u64,

    /// Delay between lock acquisition attempts.
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,

    /// Wall-clock budget for a single expression evaluation.
    #[serde(default = "default_expression_timeout_ms")]
    pub expression_timeout_ms: u64,

    /// Longest accepted expression, in characters.
    #[serde(default = "default_max_expression_length")]
    pub max_expression_length: usize,

    /// Fail routing with `NoMatchingEdge` instead of falling back to the
    /// first declared edge when no conditional edge matched.
    #[serde(default)]
    pub strict_edge_matching: bool,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

fn default_lock_ttl_ms() -> u64 {
    5_000
}

fn default_lock_retry_interval_ms() -> u64 {
    50
}

fn default_expression_timeout_ms() -> u64 {
    100
}

fn default_max_expression_length() -> usize {
    500
}

fn default_event_channel_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_acquire_timeout_ms: 0,
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            expression_timeout_ms: default_expression_timeout_ms(),
            max_expression_length: default_max_expression_length(),
            strict_edge_matching: false,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquire_timeout_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms.max(1))
    }

    pub fn expression_timeout(&self) -> Duration {
        Duration::from_millis(self.expression_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.lock_ttl_ms, 5_000);
        assert_eq!(config.lock_acquire_timeout_ms, 0);
        assert_eq!(config.expression_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_expression_length, 500);
        assert!(!config.strict_edge_matching);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.lock_ttl_ms, 5_000);
        assert_eq!(config.event_channel_capacity, 1024);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
lock_ttl_ms = 10000
lock_acquire_timeout_ms = 250
strict_edge_matching = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.lock_ttl(), Duration::from_secs(10));
        assert_eq!(config.lock_acquire_timeout(), Duration::from_millis(250));
        assert!(config.strict_edge_matching);
        assert_eq!(config.max_expression_length, 500);
    }

    #[test]
    fn test_retry_interval_never_zero() {
        let config = EngineConfig {
            lock_retry_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.lock_retry_interval(), Duration::from_millis(1));
    }
}
