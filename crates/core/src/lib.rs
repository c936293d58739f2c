//! Core types and contracts for the duplex orchestrator
//!
//! This crate provides the foundational types used across all other crates:
//! - Audio packet and blendshape frame schemas
//! - Cancellation token shared by all turn stages
//! - Engine adapter traits (ASR, LLM, TTS, Animation)
//! - Pipeline and control events
//! - Error taxonomy

pub mod audio;
pub mod blendshape;
pub mod cancel;
pub mod error;
pub mod events;
pub mod traits;

pub use audio::{AudioCodec, AudioPacket, PcmChunk, AUDIO_OVERLAP_MS, AUDIO_PACKET_MS};
pub use blendshape::{
    neutral_weights, BlendshapeFrame, BlendshapeFrameWire, BlendshapeWeights, ARKIT_CHANNELS,
    ARKIT_CHANNEL_COUNT,
};
pub use cancel::{CancelEvent, CancelReason, CancellationToken, StageKind};
pub use error::{Error, Result, StageErrorKind, TimeoutKind};
pub use events::{ControlEvent, PipelineEvent};
pub use traits::{
    AnimationEngine, AnimationSession, AsrEngine, AsrEvent, AsrSession, EngineHealth,
    GenerateRequest, LanguageModel, Message, Role, StreamHandle, TokenChunk, TtsEngine,
    TtsRequest, TtsSession,
};
