//! Turn lifetime
//!
//! A turn begins at utterance endpoint detection and ends when the last
//! agent packet is emitted, a CANCEL is fully honored, or the hard
//! pre-first-audio timeout fires. The turn owns its stage handles and the
//! shared cancellation token; it refers to its session only by id.

use std::sync::Arc;

use parking_lot::Mutex;

use duplex_core::{CancelReason, CancellationToken};

/// Per-stage timestamps, session-epoch milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnTimestamps {
    pub endpoint_ms: u64,
    pub first_token_ms: Option<u64>,
    pub first_audio_ms: Option<u64>,
    pub completed_ms: Option<u64>,
}

impl TurnTimestamps {
    pub fn ttfa_ms(&self) -> Option<u64> {
        self.first_audio_ms
            .map(|audio| audio.saturating_sub(self.endpoint_ms))
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Cancelled(CancelReason),
    TimedOut,
    Failed,
}

/// One bounded interaction.
pub struct Turn {
    pub id: u64,
    pub session_id: String,
    pub user_text: Option<String>,
    pub token: CancellationToken,
    timestamps: Mutex<TurnTimestamps>,
    outcome: Mutex<Option<TurnOutcome>>,
}

impl Turn {
    pub fn new(
        id: u64,
        session_id: impl Into<String>,
        user_text: Option<String>,
        endpoint_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            session_id: session_id.into(),
            user_text,
            token: CancellationToken::new(),
            timestamps: Mutex::new(TurnTimestamps {
                endpoint_ms,
                ..TurnTimestamps::default()
            }),
            outcome: Mutex::new(None),
        })
    }

    pub fn timestamps(&self) -> TurnTimestamps {
        *self.timestamps.lock()
    }

    /// Record the first token; first write wins.
    pub fn mark_first_token(&self, t_ms: u64) -> bool {
        let mut ts = self.timestamps.lock();
        if ts.first_token_ms.is_none() {
            ts.first_token_ms = Some(t_ms);
            true
        } else {
            false
        }
    }

    /// Record the first audio packet; first write wins. Returns the TTFA
    /// when this call was the first.
    pub fn mark_first_audio(&self, t_ms: u64) -> Option<u64> {
        let mut ts = self.timestamps.lock();
        if ts.first_audio_ms.is_none() {
            ts.first_audio_ms = Some(t_ms);
            Some(t_ms.saturating_sub(ts.endpoint_ms))
        } else {
            None
        }
    }

    pub fn has_first_audio(&self) -> bool {
        self.timestamps.lock().first_audio_ms.is_some()
    }

    pub fn finish(&self, outcome: TurnOutcome, t_ms: u64) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.timestamps.lock().completed_ms = Some(t_ms);
        }
    }

    pub fn outcome(&self) -> Option<TurnOutcome> {
        *self.outcome.lock()
    }
}
