//! Per-session turn pipeline for duplex
//!
//! Wires VAD → ASR → LLM → TTS → packetizer/animation for one session,
//! with shared-token cancellation fan-out, an audio-clocked packet
//! emitter, the turn state machine, the animation heartbeat policy and
//! the backpressure ladder.

pub mod adapters;
pub mod animation;
pub mod backpressure;
pub mod cancellation;
pub mod clock;
pub mod metrics;
pub mod orchestrator;
pub mod packetizer;
pub mod signals;
pub mod state_machine;
pub mod turn;
pub mod vad;

pub use adapters::{
    canned_unavailable_pcm, HttpStreamingLlm, NeutralAnimation, ScriptedAsr, ScriptedLlm,
    SilenceTts,
};
pub use animation::{AnimationPolicy, AnimationScheduler};
pub use backpressure::{BackpressureController, BackpressureLevel, Effects, MetricsSnapshot};
pub use cancellation::CancellationController;
pub use clock::{AudioClock, SessionEpoch};
pub use metrics::{MetricsAggregator, SessionMetrics, TtfaRecorder};
pub use orchestrator::{EngineSet, PipelineConfig, SessionPipeline};
pub use packetizer::Packetizer;
pub use signals::{ConversationSignals, SignalsTracker, TurnReport};
pub use state_machine::{TurnState, TurnStateMachine};
pub use turn::{Turn, TurnOutcome, TurnTimestamps};
pub use vad::{BargeInDetector, InboundFrame, VadConfig, VadEvent};
