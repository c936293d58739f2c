//! Configuration for the duplex orchestrator
//!
//! Settings are layered: built-in defaults, then `config/default.toml`,
//! then `config/{env}.toml`, then `DUPLEX_*` environment variables.
//! Validation is fail-fast at startup.

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, AnimationConfig, AudioConfig, LatencyConfig, LlmConfig, ObservabilityConfig,
    ServerConfig, SessionConfig, Settings, TailPolicy,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("missing required configuration: {0}")]
    Missing(String),
}
