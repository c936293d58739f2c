//! Error taxonomy
//!
//! One error type crosses crate boundaries. Stage errors carry the stage
//! and a kind so the orchestrator can apply per-kind recovery (connection
//! errors get one retry inside a turn, the rest degrade).
//! `CancellationObserved` is a control-flow signal, not a failure.

use thiserror::Error;

use crate::cancel::{CancelReason, StageKind};

pub type Result<T> = std::result::Result<T, Error>;

/// How a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageErrorKind {
    Connection,
    Processing,
    Initialization,
}

/// Which deadline fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// No first audio within the hard pre-first-audio turn budget.
    PreFirstAudio,
    /// A stage failed to honor CANCEL within its per-stage deadline.
    StageCancel,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Capacity or backpressure rejection at session admission.
    #[error("admission rejected: {message} (retry after {retry_after_s}s)")]
    Admission {
        message: String,
        retry_after_s: u64,
    },

    /// Invalid or missing configuration; fail-fast at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stage adapter failed.
    #[error("{} stage {kind:?} error: {message}", stage.name())]
    Stage {
        stage: StageKind,
        kind: StageErrorKind,
        message: String,
    },

    /// Context summarization failed or missed its deadline; the new turn
    /// is rejected with a spoken fallback, never a silent overflow.
    #[error("context overflow: {0}")]
    ContextOverflow(String),

    #[error("timeout: {kind:?} after {elapsed_ms}ms")]
    Timeout { kind: TimeoutKind, elapsed_ms: u64 },

    /// Media channel failure; the session returns to IDLE.
    #[error("transport error: {0}")]
    Transport(String),

    /// Not a failure: the shared token fired and the stage stopped.
    #[error("cancelled: {0:?}")]
    CancellationObserved(CancelReason),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

impl Error {
    pub fn stage(stage: StageKind, kind: StageErrorKind, message: impl Into<String>) -> Self {
        Error::Stage {
            stage,
            kind,
            message: message.into(),
        }
    }

    /// Whether the caller may usefully retry (admission and stage
    /// connection errors only).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Admission { .. }
                | Error::Stage {
                    kind: StageErrorKind::Connection,
                    ..
                }
        )
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::CancellationObserved(_))
    }
}
