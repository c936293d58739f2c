//! Engine adapter contracts
//!
//! Every external engine (ASR, LLM, TTS, animation) is consumed through the
//! same minimal surface: `start` opens a single-pass finite stream wrapped
//! in a [`StreamHandle`], `StreamHandle::cancel` is non-blocking and must
//! terminate the stream within the stage's cancel deadline, and `health`
//! reports readiness. Adapters never depend on each other and receive all
//! configuration at construction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::audio::PcmChunk;
use crate::blendshape::BlendshapeWeights;
use crate::error::Result;

/// Adapter health as reported by `health()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineHealth {
    Ready,
    Degraded,
    Down,
}

/// A cancellable, single-pass stream of chunks from an engine.
///
/// The receiving half is owned by the pipeline stage; `cancel` flips a
/// watch flag the adapter's internal task selects on between chunks.
#[derive(Debug)]
pub struct StreamHandle<T> {
    rx: mpsc::Receiver<T>,
    cancel_tx: watch::Sender<bool>,
}

impl<T> StreamHandle<T> {
    /// Build a handle plus the adapter-side endpoints: the chunk sender and
    /// a cancel receiver the adapter task must observe at every suspension
    /// point.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, watch::Receiver<bool>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (tx, cancel_rx, Self { rx, cancel_tx })
    }

    /// Receive the next chunk; `None` once the stream terminated.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking, at-most-once effective: the adapter task must observe
    /// this and terminate its stream within the stage deadline.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// Conversation roles on the LLM boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One prompt message, with its authoritative token count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub tokens: u32,
}

impl Message {
    pub fn new(role: Role, text: impl Into<String>, tokens: u32) -> Self {
        Self {
            role,
            text: text.into(),
            tokens,
        }
    }
}

/// Request for one LLM generation.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Verbosity scale applied under backpressure (1.0 = normal).
    pub verbosity: f32,
    /// Non-essential tool calls disabled under TOOL_REFUSE.
    pub tools_enabled: bool,
    /// Cache key for the shared pinned-prefix cache, when enabled.
    pub prefix_cache_key: Option<u64>,
}

impl GenerateRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: 512,
            temperature: 0.7,
            verbosity: 1.0,
            tools_enabled: true,
            prefix_cache_key: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// One streamed token delta.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    pub delta: String,
}

/// Events emitted by a streaming ASR session.
#[derive(Debug, Clone)]
pub enum AsrEvent {
    Partial {
        text: String,
        confidence: f32,
    },
    Final {
        text: String,
        confidence: f32,
        /// Server-monotonic time the utterance endpoint was observed.
        endpoint_ms: u64,
    },
}

/// An open ASR stream: audio is pushed into `feed`; closing `feed`
/// finalizes the utterance and terminates `events` after the final
/// transcript.
pub struct AsrSession {
    pub feed: mpsc::Sender<PcmChunk>,
    pub events: StreamHandle<AsrEvent>,
}

#[async_trait]
pub trait AsrEngine: Send + Sync {
    async fn start(&self, session_id: &str, sample_rate: u32) -> Result<AsrSession>;
    fn health(&self) -> EngineHealth;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Begin streaming generation. The returned stream terminates on
    /// completion, error, or cancel.
    async fn generate(&self, request: GenerateRequest) -> Result<StreamHandle<TokenChunk>>;
    fn health(&self) -> EngineHealth;
}

/// Request for one TTS synthesis stream.
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub session_id: String,
    pub sample_rate: u32,
    pub voice: Option<String>,
}

/// An open TTS stream: text chunks are pushed into `text_in` as the LLM
/// produces them; PCM flows out of `audio_out`. Closing `text_in` lets the
/// synthesis drain and terminate.
pub struct TtsSession {
    pub text_in: mpsc::Sender<String>,
    pub audio_out: StreamHandle<PcmChunk>,
}

#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn start(&self, request: TtsRequest) -> Result<TtsSession>;
    fn health(&self) -> EngineHealth;
}

/// An open animation stream: a time-aligned copy of the outbound PCM is
/// pushed into `pcm_in`; articulation poses flow out of `poses`. The
/// pipeline's scheduler stamps frames with seq and audio-clock time.
pub struct AnimationSession {
    pub pcm_in: mpsc::Sender<PcmChunk>,
    pub poses: StreamHandle<BlendshapeWeights>,
}

#[async_trait]
pub trait AnimationEngine: Send + Sync {
    async fn start(&self, session_id: &str) -> Result<AnimationSession>;
    fn health(&self) -> EngineHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_handle_delivers_then_terminates() {
        let (tx, _cancel_rx, mut handle) = StreamHandle::channel(4);
        tx.send(1u32).await.unwrap();
        tx.send(2u32).await.unwrap();
        drop(tx);
        assert_eq!(handle.recv().await, Some(1));
        assert_eq!(handle.recv().await, Some(2));
        assert_eq!(handle.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_is_visible_to_adapter_side() {
        let (_tx, mut cancel_rx, handle) = StreamHandle::<u32>::channel(1);
        assert!(!*cancel_rx.borrow());
        handle.cancel();
        cancel_rx.changed().await.unwrap();
        assert!(*cancel_rx.borrow());
        assert!(handle.is_cancelled());
    }

    #[test]
    fn generate_request_defaults() {
        let req = GenerateRequest::new(vec![Message::new(Role::User, "hi", 1)]);
        assert!(req.tools_enabled);
        assert_eq!(req.verbosity, 1.0);
        assert_eq!(req.with_max_tokens(256).max_tokens, 256);
    }
}
