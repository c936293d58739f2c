//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants;
use crate::ConfigError;

/// Main application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub animation: AnimationConfig,

    #[serde(default)]
    pub latency: LatencyConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_idle_timeout_s")]
    pub session_idle_timeout_s: u64,
}

fn default_max_sessions() -> usize {
    100
}

fn default_idle_timeout_s() -> u64 {
    300
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: default_max_sessions(),
            session_idle_timeout_s: default_idle_timeout_s(),
        }
    }
}

/// What to do with an incomplete final chunk at stream end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TailPolicy {
    /// Zero-pad any remaining audio to a full packet.
    #[default]
    Pad,
    /// Drop the incomplete tail.
    Drop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Fixed by the packet contract; validated, not tunable.
    #[serde(default = "default_packet_ms")]
    pub audio_packet_ms: u32,
    /// Fixed by the packet contract; validated, not tunable.
    #[serde(default = "default_overlap_ms")]
    pub audio_overlap_ms: u32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub tail_policy: TailPolicy,
}

fn default_packet_ms() -> u32 {
    constants::AUDIO_PACKET_MS
}

fn default_overlap_ms() -> u32 {
    constants::AUDIO_OVERLAP_MS
}

fn default_sample_rate() -> u32 {
    constants::AUDIO_SAMPLE_RATE
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            audio_packet_ms: default_packet_ms(),
            audio_overlap_ms: default_overlap_ms(),
            sample_rate: default_sample_rate(),
            tail_policy: TailPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_max_context_tokens")]
    pub llm_max_context_tokens: u32,
    #[serde(default = "default_true")]
    pub llm_prefix_caching: bool,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Endpoint for the HTTP streaming backend, when selected.
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
}

fn default_max_context_tokens() -> u32 {
    constants::LLM_MAX_CONTEXT_TOKENS
}

fn default_true() -> bool {
    true
}

fn default_llm_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.7
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            llm_max_context_tokens: default_max_context_tokens(),
            llm_prefix_caching: default_true(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_temperature(),
            endpoint: default_llm_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    #[serde(default = "default_true")]
    pub animation_enabled: bool,
    #[serde(default = "default_drop_if_lag_ms")]
    pub animation_drop_if_lag_ms: u64,
    #[serde(default = "default_slow_freeze_ms")]
    pub animation_slow_freeze_ms: u64,
    #[serde(default = "default_fps")]
    pub fps: u32,
}

fn default_drop_if_lag_ms() -> u64 {
    constants::ANIMATION_DROP_IF_LAG_MS
}

fn default_slow_freeze_ms() -> u64 {
    constants::ANIMATION_SLOW_FREEZE_MS
}

fn default_fps() -> u32 {
    constants::ANIMATION_MIN_FPS
}

impl Default for AnimationConfig {
    fn default() -> Self {
        Self {
            animation_enabled: true,
            animation_drop_if_lag_ms: default_drop_if_lag_ms(),
            animation_slow_freeze_ms: default_slow_freeze_ms(),
            fps: default_fps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    #[serde(default = "default_ttfa_target_ms")]
    pub ttfa_target_ms: u64,
    #[serde(default = "default_barge_in_cancel_ms")]
    pub barge_in_cancel_ms: u64,
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_pre_first_audio_timeout_ms: u64,
}

fn default_ttfa_target_ms() -> u64 {
    constants::TTFA_TARGET_MS
}

fn default_barge_in_cancel_ms() -> u64 {
    constants::BARGE_IN_CANCEL_MS
}

fn default_turn_timeout_ms() -> u64 {
    constants::TURN_PRE_FIRST_AUDIO_TIMEOUT_MS
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            ttfa_target_ms: default_ttfa_target_ms(),
            barge_in_cancel_ms: default_barge_in_cancel_ms(),
            turn_pre_first_audio_timeout_ms: default_turn_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl Settings {
    /// Validate settings; fail-fast at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.audio.audio_packet_ms != constants::AUDIO_PACKET_MS {
            return Err(ConfigError::InvalidValue {
                field: "audio.audio_packet_ms".to_string(),
                message: format!(
                    "packet duration is fixed at {} ms by the media contract",
                    constants::AUDIO_PACKET_MS
                ),
            });
        }
        if self.audio.audio_overlap_ms != constants::AUDIO_OVERLAP_MS {
            return Err(ConfigError::InvalidValue {
                field: "audio.audio_overlap_ms".to_string(),
                message: format!(
                    "overlap is fixed at {} ms by the media contract",
                    constants::AUDIO_OVERLAP_MS
                ),
            });
        }
        if self.audio.sample_rate < 8_000 || self.audio.sample_rate > 48_000 {
            return Err(ConfigError::InvalidValue {
                field: "audio.sample_rate".to_string(),
                message: format!("unsupported sample rate {}", self.audio.sample_rate),
            });
        }
        if self.llm.llm_max_context_tokens > constants::LLM_MAX_CONTEXT_TOKENS {
            return Err(ConfigError::InvalidValue {
                field: "llm.llm_max_context_tokens".to_string(),
                message: format!(
                    "hard cap is {} tokens",
                    constants::LLM_MAX_CONTEXT_TOKENS
                ),
            });
        }
        if self.llm.llm_max_context_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "llm.llm_max_context_tokens".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.session.max_concurrent_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.max_concurrent_sessions".to_string(),
                message: "must admit at least one session".to_string(),
            });
        }
        if self.animation.fps < constants::ANIMATION_MIN_FPS
            || self.animation.fps > constants::ANIMATION_MAX_FPS
        {
            return Err(ConfigError::InvalidValue {
                field: "animation.fps".to_string(),
                message: format!(
                    "cadence must be {}-{} Hz",
                    constants::ANIMATION_MIN_FPS,
                    constants::ANIMATION_MAX_FPS
                ),
            });
        }
        if self.latency.turn_pre_first_audio_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "latency.turn_pre_first_audio_timeout_ms".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Bytes of PCM16 mono per packet at the configured sample rate.
    pub fn bytes_per_packet(&self) -> usize {
        (self.audio.sample_rate as usize * 2 * self.audio.audio_packet_ms as usize) / 1000
    }

    /// Bytes of PCM16 mono in the cross-fade overlap.
    pub fn bytes_per_overlap(&self) -> usize {
        (self.audio.sample_rate as usize * 2 * self.audio.audio_overlap_ms as usize) / 1000
    }
}

/// Load layered settings: defaults < `config/default.toml` <
/// `config/{env}.toml` < `DUPLEX_*` environment variables.
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    let default_path = Path::new("config/default.toml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    if let Some(env) = env {
        let env_path = format!("config/{env}.toml");
        if Path::new(&env_path).exists() {
            builder = builder.add_source(File::with_name(&env_path));
        } else {
            tracing::warn!(env, "environment config file not found, skipping");
        }
    }

    builder = builder.add_source(Environment::with_prefix("DUPLEX").separator("__"));

    let settings: Settings = builder
        .build()
        .map_err(|e| ConfigError::Load(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Load(e.to_string()))?;

    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.audio.audio_packet_ms, 20);
        assert_eq!(settings.audio.audio_overlap_ms, 5);
    }

    #[test]
    fn packet_byte_math_at_16k() {
        let settings = Settings::default();
        assert_eq!(settings.bytes_per_packet(), 640);
        assert_eq!(settings.bytes_per_overlap(), 160);
    }

    #[test]
    fn rejects_non_contract_packet_duration() {
        let mut settings = Settings::default();
        settings.audio.audio_packet_ms = 40;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_context_above_hard_cap() {
        let mut settings = Settings::default();
        settings.llm.llm_max_context_tokens = 16_384;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut settings = Settings::default();
        settings.session.max_concurrent_sessions = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_out_of_band_fps() {
        let mut settings = Settings::default();
        settings.animation.fps = 120;
        assert!(settings.validate().is_err());
    }
}
