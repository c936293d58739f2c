//! Turn state machine
//!
//! Five states per session: IDLE, LISTENING, THINKING, SPEAKING and the
//! transient INTERRUPTED. Transitions are serialized by a per-session lock
//! that is never held across an await point; side effects (launching
//! stages, firing CANCEL) belong to the orchestrator, not the FSM.

use parking_lot::Mutex;

use duplex_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Interrupted,
}

impl TurnState {
    pub fn name(&self) -> &'static str {
        match self {
            TurnState::Idle => "IDLE",
            TurnState::Listening => "LISTENING",
            TurnState::Thinking => "THINKING",
            TurnState::Speaking => "SPEAKING",
            TurnState::Interrupted => "INTERRUPTED",
        }
    }
}

fn allowed(from: TurnState, to: TurnState) -> bool {
    use TurnState::*;
    matches!(
        (from, to),
        (Idle, Listening)
            | (Listening, Thinking)
            | (Listening, Idle)
            | (Thinking, Speaking)
            | (Thinking, Listening)
            | (Thinking, Idle)
            | (Speaking, Listening)
            | (Speaking, Interrupted)
            | (Speaking, Idle)
            | (Interrupted, Listening)
            | (Interrupted, Idle)
    )
}

/// Record of one transition, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: TurnState,
    pub to: TurnState,
    pub t_ms: u64,
    pub reason: String,
}

const MAX_HISTORY: usize = 100;

/// Serialized per-session FSM.
pub struct TurnStateMachine {
    state: Mutex<TurnState>,
    history: Mutex<Vec<TransitionRecord>>,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TurnState::Idle),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    /// Attempt a transition. The state lock is held only for the check and
    /// swap; history is appended under its own lock.
    pub fn transition(
        &self,
        to: TurnState,
        t_ms: u64,
        reason: impl Into<String>,
    ) -> Result<TransitionRecord> {
        let from = {
            let mut state = self.state.lock();
            let from = *state;
            if !allowed(from, to) {
                return Err(Error::InvalidTransition {
                    from: from.name().to_string(),
                    to: to.name().to_string(),
                });
            }
            *state = to;
            from
        };

        let record = TransitionRecord {
            from,
            to,
            t_ms,
            reason: reason.into(),
        };
        let mut history = self.history.lock();
        history.push(record.clone());
        if history.len() > MAX_HISTORY {
            history.remove(0);
        }
        tracing::debug!(
            from = from.name(),
            to = to.name(),
            reason = %record.reason,
            "state transition"
        );
        Ok(record)
    }

    /// Transition only if currently in `expected`; `Ok(None)` otherwise.
    /// The compare and the swap are one critical section, so two racing
    /// callers cannot both win.
    pub fn transition_if(
        &self,
        expected: TurnState,
        to: TurnState,
        t_ms: u64,
        reason: impl Into<String>,
    ) -> Result<Option<TransitionRecord>> {
        {
            let mut state = self.state.lock();
            if *state != expected {
                return Ok(None);
            }
            if !allowed(expected, to) {
                return Err(Error::InvalidTransition {
                    from: expected.name().to_string(),
                    to: to.name().to_string(),
                });
            }
            *state = to;
        }
        let record = TransitionRecord {
            from: expected,
            to,
            t_ms,
            reason: reason.into(),
        };
        let mut history = self.history.lock();
        history.push(record.clone());
        if history.len() > MAX_HISTORY {
            history.remove(0);
        }
        Ok(Some(record))
    }

    pub fn history(&self) -> Vec<TransitionRecord> {
        self.history.lock().clone()
    }
}
