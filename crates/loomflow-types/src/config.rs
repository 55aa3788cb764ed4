//! Engine configuration types for Loomflow.
//!
//! `EngineConfig` represents `{data_dir}/config.toml`. Every field has a
//! default so an absent file yields a working engine.

use serde::{Deserialize, Serialize};

use crate::pipeline::RetryPolicy;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry policy applied to steps that do not declare their own.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-invocation timeout for steps that do not declare their own.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Re-drive interrupted runs when the server starts.
    #[serde(default = "default_true")]
    pub recover_on_start: bool,

    /// Export spans through OpenTelemetry.
    #[serde(default)]
    pub enable_otel: bool,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub work: WorkConfig,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout_secs: default_step_timeout_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            recover_on_start: true,
            enable_otel: false,
            server: ServerConfig::default(),
            work: WorkConfig::default(),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7430
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Where step and phase work is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Base URL joined with relative step targets.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// HTTP client timeout, separate from the per-step engine timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8700".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}
