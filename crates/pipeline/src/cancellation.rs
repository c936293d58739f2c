//! Cancellation controller
//!
//! Central to the barge-in contract. Fires the turn's shared token, then
//! waits for every registered stage to acknowledge within its per-stage
//! deadline; stages that miss their deadline are abandoned rather than
//! awaited. The packetizer's stop timestamp is the server-side audible
//! stop, from which barge-in latency is measured.

use std::time::Duration;

use tokio::time::sleep;

use duplex_config::constants::{
    ANIMATION_CANCEL_DEADLINE_MS, LLM_CANCEL_DEADLINE_MS, PACKETIZER_CANCEL_DEADLINE_MS,
    TTS_CANCEL_DEADLINE_MS,
};
use duplex_core::{CancelReason, CancellationToken, StageKind};

use crate::clock::SessionEpoch;

/// Result of driving one cancellation to completion.
#[derive(Debug, Clone)]
pub struct CancelReport {
    pub reason: CancelReason,
    pub t_event_ms: u64,
    /// Packetizer stop − event observation; the audible-stop latency at
    /// the server.
    pub bargein_latency_ms: Option<u64>,
    /// Stages that failed to acknowledge inside their deadline.
    pub deadline_missed: Vec<StageKind>,
}

/// Fans CANCEL out to stage adapters and measures the result.
pub struct CancellationController {
    epoch: SessionEpoch,
}

impl CancellationController {
    pub fn new(epoch: SessionEpoch) -> Self {
        Self { epoch }
    }

    /// Register the standard stage set with their contract deadlines.
    pub fn arm(token: &CancellationToken, with_animation: bool) {
        token.register(StageKind::Llm, LLM_CANCEL_DEADLINE_MS);
        token.register(StageKind::Tts, TTS_CANCEL_DEADLINE_MS);
        token.register(StageKind::Packetizer, PACKETIZER_CANCEL_DEADLINE_MS);
        if with_animation {
            token.register(StageKind::Animation, ANIMATION_CANCEL_DEADLINE_MS);
        }
    }

    /// Fire and settle a cancellation. Returns `None` when the token was
    /// already fired (second CANCEL coalesced).
    pub async fn cancel(
        &self,
        token: &CancellationToken,
        reason: CancelReason,
        t_event_ms: u64,
    ) -> Option<CancelReport> {
        if !token.fire(reason, t_event_ms) {
            tracing::debug!(?reason, "duplicate cancel coalesced");
            return None;
        }
        Some(self.settle(token, reason, t_event_ms).await)
    }

    /// Wait until every observer acked or its deadline elapsed. Signals
    /// were already delivered by the token fire; this only measures.
    pub async fn settle(
        &self,
        token: &CancellationToken,
        reason: CancelReason,
        t_event_ms: u64,
    ) -> CancelReport {
        let wait_budget = token.max_pending_deadline_ms();
        let deadline_at = self.epoch.now_ms() + wait_budget;
        // Poll at a fine grain; acks land in single-digit milliseconds.
        while !token.fully_acknowledged() && self.epoch.now_ms() < deadline_at {
            sleep(Duration::from_millis(2)).await;
        }

        let deadline_missed = token.pending_observers();
        for stage in &deadline_missed {
            tracing::warn!(
                stage = stage.name(),
                deadline_ms = token.deadline_ms(*stage),
                "stage missed cancel deadline, abandoning"
            );
        }

        let bargein_latency_ms = token
            .acked_at(StageKind::Packetizer)
            .map(|stop| stop.saturating_sub(t_event_ms));

        if let Some(latency) = bargein_latency_ms {
            tracing::info!(latency_ms = latency, ?reason, "cancellation settled");
        }

        CancelReport {
            reason,
            t_event_ms,
            bargein_latency_ms,
            deadline_missed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_token() -> CancellationToken {
        let token = CancellationToken::new();
        CancellationController::arm(&token, true);
        token
    }

    #[tokio::test]
    async fn cancel_settles_when_all_stages_ack() {
        let epoch = SessionEpoch::new();
        let controller = CancellationController::new(epoch);
        let token = armed_token();

        let acker = token.clone();
        tokio::spawn(async move {
            acker.cancelled().await;
            acker.acknowledge(StageKind::Llm, 310);
            acker.acknowledge(StageKind::Tts, 312);
            acker.acknowledge(StageKind::Packetizer, 315);
            acker.acknowledge(StageKind::Animation, 316);
        });

        let report = controller
            .cancel(&token, CancelReason::UserBargeIn, 300)
            .await
            .unwrap();
        assert!(report.deadline_missed.is_empty());
        assert_eq!(report.bargein_latency_ms, Some(15));
    }

    #[tokio::test]
    async fn second_cancel_is_coalesced() {
        let epoch = SessionEpoch::new();
        let controller = CancellationController::new(epoch);
        let token = armed_token();

        let acker = token.clone();
        tokio::spawn(async move {
            acker.cancelled().await;
            acker.acknowledge(StageKind::Llm, 1);
            acker.acknowledge(StageKind::Tts, 1);
            acker.acknowledge(StageKind::Packetizer, 1);
            acker.acknowledge(StageKind::Animation, 1);
        });

        let first = controller.cancel(&token, CancelReason::UserBargeIn, 0).await;
        assert!(first.is_some());
        let second = controller.cancel(&token, CancelReason::UserStop, 50).await;
        assert!(second.is_none());
        // Original event preserved.
        assert_eq!(token.event().unwrap().reason, CancelReason::UserBargeIn);
    }

    #[tokio::test]
    async fn silent_stage_is_abandoned_at_deadline() {
        let epoch = SessionEpoch::new();
        let controller = CancellationController::new(epoch);
        let token = armed_token();

        let acker = token.clone();
        tokio::spawn(async move {
            acker.cancelled().await;
            acker.acknowledge(StageKind::Tts, 2);
            acker.acknowledge(StageKind::Packetizer, 3);
            acker.acknowledge(StageKind::Animation, 3);
            // LLM never acks.
        });

        let report = controller
            .cancel(&token, CancelReason::UserStop, 0)
            .await
            .unwrap();
        assert_eq!(report.deadline_missed, vec![StageKind::Llm]);
        assert_eq!(report.bargein_latency_ms, Some(3));
    }
}
