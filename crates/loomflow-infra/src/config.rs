//! Engine configuration loader for Loomflow.
//!
//! Reads `config.toml` from the data directory (`~/.loomflow/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::Path;

use loomflow_types::config::EngineConfig;

use crate::filesystem;

/// Smallest step timeout the engine will honor.
const MIN_STEP_TIMEOUT_SECS: u64 = 1;

/// Smallest event bus capacity; `tokio::sync::broadcast` rejects zero.
const MIN_EVENT_BUS_CAPACITY: usize = 16;

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to read or parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config with out-of-range values clamped.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = filesystem::config_path(data_dir);

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
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Clamp values the engine cannot run with.
fn normalize(mut config: EngineConfig) -> EngineConfig {
    if config.step_timeout_secs < MIN_STEP_TIMEOUT_SECS {
        tracing::warn!(
            step_timeout_secs = config.step_timeout_secs,
            "step_timeout_secs below minimum, clamping"
        );
        config.step_timeout_secs = MIN_STEP_TIMEOUT_SECS;
    }
    if config.event_bus_capacity < MIN_EVENT_BUS_CAPACITY {
        config.event_bus_capacity = MIN_EVENT_BUS_CAPACITY;
    }
    if config.retry.max_attempts == 0 {
        tracing::warn!("retry.max_attempts is 0, using 1");
        config.retry.max_attempts = 1;
    }
    config
}
