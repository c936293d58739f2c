//! Shared cancellation token
//!
//! One token per turn, shared by every stage adapter. The token is
//! write-once: the first `fire` wins and later fires are no-ops. Stages
//! observe cooperatively at suspension points and acknowledge with the
//! timestamp at which they actually stopped, so barge-in latency can be
//! measured end to end.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Why a turn was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelReason {
    UserBargeIn,
    UserStop,
    SystemOverload,
    Timeout,
}

/// Pipeline stages that register as cancellation observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Llm,
    Tts,
    Packetizer,
    Animation,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Llm => "llm",
            StageKind::Tts => "tts",
            StageKind::Packetizer => "packetizer",
            StageKind::Animation => "animation",
        }
    }
}

/// The recorded cancel event. Write-once per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelEvent {
    pub reason: CancelReason,
    /// Server-monotonic timestamp of the triggering observation.
    pub t_event_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct ObserverSlot {
    deadline_ms: u64,
    acked_at_ms: Option<u64>,
}

struct Inner {
    event: Mutex<Option<CancelEvent>>,
    observers: Mutex<HashMap<StageKind, ObserverSlot>>,
    fired_tx: watch::Sender<bool>,
}

/// Fan-out cancellation signal for one turn.
///
/// Cloning is cheap; all clones observe the same state. The token holds no
/// reference back to the turn or session, only identifiers flow the other
/// way.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (fired_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                event: Mutex::new(None),
                observers: Mutex::new(HashMap::new()),
                fired_tx,
            }),
        }
    }

    /// Register a stage observer with its per-stage acknowledge deadline.
    pub fn register(&self, stage: StageKind, deadline_ms: u64) {
        self.inner.observers.lock().insert(
            stage,
            ObserverSlot {
                deadline_ms,
                acked_at_ms: None,
            },
        );
    }

    /// Fire the token. Returns `true` only for the first caller; a second
    /// CANCEL on an already-cancelled turn is coalesced into a no-op.
    pub fn fire(&self, reason: CancelReason, t_event_ms: u64) -> bool {
        let mut event = self.inner.event.lock();
        if event.is_some() {
            return false;
        }
        *event = Some(CancelEvent { reason, t_event_ms });
        drop(event);
        let _ = self.inner.fired_tx.send(true);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.event.lock().is_some()
    }

    pub fn event(&self) -> Option<CancelEvent> {
        *self.inner.event.lock()
    }

    /// Resolve once the token fires. Safe to call from many tasks; resolves
    /// immediately if already fired.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.fired_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // Sender lives inside self, so changed() only errs if self is dropped.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Record that a stage has stopped, with its stop timestamp.
    /// Acknowledgements are a set; order across stages is irrelevant.
    pub fn acknowledge(&self, stage: StageKind, t_stop_ms: u64) {
        let mut observers = self.inner.observers.lock();
        if let Some(slot) = observers.get_mut(&stage) {
            if slot.acked_at_ms.is_none() {
                slot.acked_at_ms = Some(t_stop_ms);
            }
        }
    }

    pub fn acked_at(&self, stage: StageKind) -> Option<u64> {
        self.inner
            .observers
            .lock()
            .get(&stage)
            .and_then(|s| s.acked_at_ms)
    }

    pub fn deadline_ms(&self, stage: StageKind) -> Option<u64> {
        self.inner.observers.lock().get(&stage).map(|s| s.deadline_ms)
    }

    /// Stages that registered but have not yet acknowledged.
    pub fn pending_observers(&self) -> Vec<StageKind> {
        self.inner
            .observers
            .lock()
            .iter()
            .filter(|(_, slot)| slot.acked_at_ms.is_none())
            .map(|(stage, _)| *stage)
            .collect()
    }

    /// A turn is fully cancelled once every registered observer acked.
    pub fn fully_acknowledged(&self) -> bool {
        self.inner
            .observers
            .lock()
            .values()
            .all(|slot| slot.acked_at_ms.is_some())
    }

    /// Largest per-stage deadline among observers still pending.
    pub fn max_pending_deadline_ms(&self) -> u64 {
        self.inner
            .observers
            .lock()
            .values()
            .filter(|slot| slot.acked_at_ms.is_none())
            .map(|slot| slot.deadline_ms)
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("event", &self.event())
            .field("fully_acknowledged", &self.fully_acknowledged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_wins() {
        let token = CancellationToken::new();
        assert!(token.fire(CancelReason::UserBargeIn, 100));
        assert!(!token.fire(CancelReason::UserStop, 200));
        let event = token.event().unwrap();
        assert_eq!(event.reason, CancelReason::UserBargeIn);
        assert_eq!(event.t_event_ms, 100);
    }

    #[test]
    fn acknowledgements_are_a_set() {
        let token = CancellationToken::new();
        token.register(StageKind::Llm, 30);
        token.register(StageKind::Packetizer, 20);
        token.fire(CancelReason::UserBargeIn, 0);

        assert!(!token.fully_acknowledged());
        token.acknowledge(StageKind::Packetizer, 12);
        token.acknowledge(StageKind::Llm, 25);
        assert!(token.fully_acknowledged());
        assert_eq!(token.acked_at(StageKind::Packetizer), Some(12));
    }

    #[test]
    fn second_ack_keeps_first_timestamp() {
        let token = CancellationToken::new();
        token.register(StageKind::Tts, 30);
        token.acknowledge(StageKind::Tts, 10);
        token.acknowledge(StageKind::Tts, 99);
        assert_eq!(token.acked_at(StageKind::Tts), Some(10));
    }

    #[test]
    fn pending_observers_reported() {
        let token = CancellationToken::new();
        token.register(StageKind::Llm, 30);
        token.register(StageKind::Animation, 20);
        token.acknowledge(StageKind::Llm, 5);
        assert_eq!(token.pending_observers(), vec![StageKind::Animation]);
        assert_eq!(token.max_pending_deadline_ms(), 20);
    }

    #[tokio::test]
    async fn cancelled_resolves_after_fire() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        token.fire(CancelReason::Timeout, 500);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_fired() {
        let token = CancellationToken::new();
        token.fire(CancelReason::UserStop, 1);
        token.cancelled().await;
    }
}
