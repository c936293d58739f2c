//! Contract constants
//!
//! The latency and degradation contracts the orchestrator is built around.
//! All timing values are milliseconds unless noted.

/// Time to first audio, p95, measured from endpoint detection.
pub const TTFA_TARGET_MS: u64 = 250;

/// Barge-in: VAD event to halted packetizer output, p95.
pub const BARGE_IN_CANCEL_MS: u64 = 150;

/// Hard turn timeout before the first audio packet.
pub const TURN_PRE_FIRST_AUDIO_TIMEOUT_MS: u64 = 500;

// Audio packet contract.
pub const AUDIO_PACKET_MS: u32 = 20;
pub const AUDIO_OVERLAP_MS: u32 = 5;
pub const AUDIO_SAMPLE_RATE: u32 = 16_000;

// Per-stage cancel deadlines inside the 150 ms budget.
pub const LLM_CANCEL_DEADLINE_MS: u64 = 30;
pub const TTS_CANCEL_DEADLINE_MS: u64 = 30;
pub const PACKETIZER_CANCEL_DEADLINE_MS: u64 = 20;
pub const ANIMATION_CANCEL_DEADLINE_MS: u64 = 20;

// LLM context management.
pub const LLM_MAX_CONTEXT_TOKENS: u32 = 8192;
pub const CONTEXT_ROLLOVER_THRESHOLD: u32 = 7500;
/// Pinned prefix may occupy at most this fraction of the hard cap.
pub const PINNED_PREFIX_MAX_FRACTION: f32 = 0.25;
pub const CONTEXT_SUMMARIZATION_TIMEOUT_MS: u64 = 5_000;

// Animation policy.
pub const ANIMATION_HEARTBEAT_GAP_MS: u64 = 100;
pub const ANIMATION_SLOW_FREEZE_MS: u64 = 150;
pub const ANIMATION_DROP_IF_LAG_MS: u64 = 120;
pub const ANIMATION_MIN_FPS: u32 = 30;
pub const ANIMATION_MAX_FPS: u32 = 60;

// Admission.
pub const SESSION_QUEUE_DEADLINE_MS: u64 = 2_000;
pub const SESSION_QUEUE_MAX_DEPTH: usize = 16;

/// Backpressure sampling cadence.
pub const BACKPRESSURE_SAMPLE_INTERVAL_MS: u64 = 1_000;

/// Consecutive all-clear samples required before stepping one level down.
pub const BACKPRESSURE_CLEAR_SAMPLES: u32 = 2;
