//! Engine configuration loader for procflow.
//!
//! Reads `config.toml` from the data directory (`~/.procflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use procflow_types::config::EngineConfig;

/// Shortest lock lease accepted from configuration, in milliseconds.
const MIN_LOCK_TTL_MS: u64 = 100;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with [`clamp_engine_config`] applied.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => clamp_engine_config(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Enforce floors on values that would make the engine unusable.
///
/// A lease shorter than [`MIN_LOCK_TTL_MS`] would expire mid-action, and an
/// expression length of zero would reject every routing condition.
pub fn clamp_engine_config(mut config: EngineConfig) -> EngineConfig {
    if config.lock_ttl_ms < MIN_LOCK_TTL_MS {
        tracing::warn!(
            configured = config.lock_ttl_ms,
            floor = MIN_LOCK_TTL_MS,
            "lock_ttl_ms below minimum, clamping"
        );
        config.lock_ttl_ms = MIN_LOCK_TTL_MS;
    }
    if config.max_expression_length == 0 {
        config.max_expression_length = EngineConfig::default().max_expression_length;
    }
    config
}
