//! Animation cadence, heartbeat and slow-freeze
//!
//! The scheduler emits blendshape frames at a stable cadence, stamped with
//! the session audio clock. Failure handling runs on a monotonic timer,
//! never frame counts:
//!
//! - fresh engine pose at a cadence slot → normal frame
//! - no fresh pose but gap ≤ 100 ms → heartbeat holding the last pose
//! - gap > 100 ms → ease every weight toward neutral over 150 ms, never
//!   snapping
//! - consumer lag past the drop threshold or ANIMATION_YIELD → drop frames
//!   unconditionally; audio is never waited on
//!
//! Neutral means jaw/mouth driven only by audio and every other channel at
//! zero.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use duplex_core::{
    neutral_weights, BlendshapeFrame, BlendshapeWeights, CancellationToken, StageKind,
};

use crate::clock::{AudioClock, SessionEpoch};

/// Cadence and failure thresholds.
#[derive(Debug, Clone)]
pub struct AnimationPolicy {
    pub fps: u32,
    /// Gap beyond which slow-freeze begins.
    pub heartbeat_gap_ms: u64,
    /// Duration of the ease toward neutral.
    pub slow_freeze_ms: u64,
    /// Consumer lag beyond which frames are dropped.
    pub drop_if_lag_ms: u64,
}

impl Default for AnimationPolicy {
    fn default() -> Self {
        Self {
            fps: 30,
            heartbeat_gap_ms: 100,
            slow_freeze_ms: 150,
            drop_if_lag_ms: 120,
        }
    }
}

/// What the policy decides for one cadence slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotDecision {
    /// Fresh articulation from the engine.
    Fresh(BlendshapeWeights),
    /// Hold the last pose; cadence-maintenance heartbeat.
    Hold(BlendshapeWeights),
    /// Easing toward neutral; fraction in [0, 1].
    Freeze(BlendshapeWeights),
}

/// Pure slot policy, separated from the async loop so the timing rules are
/// testable without a runtime.
pub struct FreezePlanner {
    policy: AnimationPolicy,
    last_pose: BlendshapeWeights,
    /// Pose captured when the freeze began, for stable interpolation.
    freeze_from: Option<BlendshapeWeights>,
}

impl FreezePlanner {
    pub fn new(policy: AnimationPolicy) -> Self {
        Self {
            policy,
            last_pose: neutral_weights(),
            freeze_from: None,
        }
    }

    pub fn pose_received(&mut self, pose: BlendshapeWeights) {
        self.last_pose = pose;
        self.freeze_from = None;
    }

    /// Decide the frame for a slot given the gap since the last engine
    /// pose. A 99 ms gap holds the pose; a 101 ms gap begins the freeze.
    pub fn decide(&mut self, gap_ms: u64) -> SlotDecision {
        if gap_ms == 0 {
            return SlotDecision::Fresh(self.last_pose);
        }
        if gap_ms <= self.policy.heartbeat_gap_ms {
            return SlotDecision::Hold(self.last_pose);
        }
        let from = *self.freeze_from.get_or_insert(self.last_pose);
        let into_freeze = gap_ms - self.policy.heartbeat_gap_ms;
        let fraction =
            (into_freeze as f32 / self.policy.slow_freeze_ms as f32).clamp(0.0, 1.0);
        let neutral = neutral_weights();
        let mut eased = neutral;
        for (i, w) in eased.iter_mut().enumerate() {
            *w = from[i] + (neutral[i] - from[i]) * fraction;
        }
        SlotDecision::Freeze(eased)
    }
}

/// Async cadence loop: consumes engine poses, emits stamped frames.
pub struct AnimationScheduler {
    session_id: String,
    policy: AnimationPolicy,
    clock: Arc<AudioClock>,
    epoch: SessionEpoch,
}

impl AnimationScheduler {
    pub fn new(
        session_id: impl Into<String>,
        policy: AnimationPolicy,
        clock: Arc<AudioClock>,
        epoch: SessionEpoch,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            policy,
            clock,
            epoch,
        }
    }

    /// Run until the pose stream ends or the token fires. Emits into
    /// `out` with `try_send`: a slow consumer drops frames rather than
    /// blocking, and sustained lag is reported through `lag_tx`.
    pub async fn run(
        self,
        mut poses: mpsc::Receiver<BlendshapeWeights>,
        out: mpsc::Sender<BlendshapeFrame>,
        token: CancellationToken,
        yield_rx: watch::Receiver<bool>,
        lag_tx: Option<watch::Sender<u64>>,
    ) {
        let slot = Duration::from_millis(1000 / self.policy.fps.max(1) as u64);
        let mut ticker = tokio::time::interval(slot);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut planner = FreezePlanner::new(self.policy.clone());
        let mut last_pose_at = Instant::now();
        let mut fresh: Option<BlendshapeWeights> = None;
        let mut seq: u64 = 0;
        let mut dropped_since: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    token.acknowledge(StageKind::Animation, self.epoch.now_ms());
                    tracing::debug!(session_id = %self.session_id, "animation stopped on cancel");
                    return;
                }
                pose = poses.recv() => {
                    match pose {
                        Some(pose) => {
                            planner.pose_received(pose);
                            fresh = Some(pose);
                            last_pose_at = Instant::now();
                        }
                        None => {
                            // Engine stream ended; keep the cadence alive so
                            // heartbeat/slow-freeze policy plays out.
                            poses.close();
                            self.drain_freeze(&mut planner, last_pose_at, &out, &mut seq).await;
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if *yield_rx.borrow() {
                        // Backpressure yield: drop unconditionally.
                        continue;
                    }
                    let gap_ms = if fresh.is_some() {
                        0
                    } else {
                        last_pose_at.elapsed().as_millis() as u64
                    };
                    let decision = planner.decide(gap_ms);
                    let (weights, heartbeat) = match decision {
                        SlotDecision::Fresh(w) => (w, false),
                        SlotDecision::Hold(w) => (w, true),
                        SlotDecision::Freeze(w) => (w, true),
                    };
                    fresh = None;
                    let frame = BlendshapeFrame {
                        session_id: self.session_id.clone(),
                        seq,
                        t_audio_ms: self.clock.now_ms(),
                        fps: self.policy.fps,
                        heartbeat,
                        weights,
                    };
                    match out.try_send(frame) {
                        Ok(()) => {
                            seq += 1;
                            dropped_since = None;
                            if let Some(tx) = &lag_tx {
                                let _ = tx.send(0);
                            }
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Slow consumer: drop, report lag, audio goes on.
                            let since = dropped_since.get_or_insert_with(Instant::now);
                            let lag = since.elapsed().as_millis() as u64;
                            if let Some(tx) = &lag_tx {
                                let _ = tx.send(lag);
                            }
                            if lag > self.policy.drop_if_lag_ms {
                                tracing::debug!(
                                    session_id = %self.session_id,
                                    lag_ms = lag,
                                    "animation consumer lagging, dropping frames"
                                );
                            }
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }

    /// After the engine stream ends, ease to neutral on cadence and stop.
    async fn drain_freeze(
        &self,
        planner: &mut FreezePlanner,
        last_pose_at: Instant,
        out: &mpsc::Sender<BlendshapeFrame>,
        seq: &mut u64,
    ) {
        let slot = Duration::from_millis(1000 / self.policy.fps.max(1) as u64);
        let deadline = self.policy.heartbeat_gap_ms + self.policy.slow_freeze_ms;
        loop {
            tokio::time::sleep(slot).await;
            let gap_ms = last_pose_at.elapsed().as_millis() as u64;
            let decision = planner.decide(gap_ms);
            let (weights, heartbeat) = match decision {
                SlotDecision::Fresh(w) | SlotDecision::Hold(w) => (w, true),
                SlotDecision::Freeze(w) => (w, true),
            };
            let frame = BlendshapeFrame {
                session_id: self.session_id.clone(),
                seq: *seq,
                t_audio_ms: self.clock.now_ms(),
                fps: self.policy.fps,
                heartbeat,
                weights,
            };
            if out.try_send(frame).is_ok() {
                *seq += 1;
            }
            if gap_ms >= deadline {
                return;
            }
        }
    }
}
