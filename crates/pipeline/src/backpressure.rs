//! Backpressure ladder
//!
//! Six levels recomputed once per second from live metrics. Any-of trigger
//! semantics per level; upward transitions may skip levels, downward
//! transitions step exactly one level per observation window and only
//! after two consecutive samples clear of the current level's triggers,
//! with hysteresis margins so the ladder cannot oscillate. Audio
//! continuity of existing turns is never a degradation target, and there
//! is no manual override downward.

use serde::Serialize;

use duplex_config::constants::BACKPRESSURE_CLEAR_SAMPLES;

/// Ladder levels, in severity order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackpressureLevel {
    Normal,
    AnimationYield,
    VerbosityReduce,
    ToolRefuse,
    SessionQueue,
    SessionReject,
}

impl BackpressureLevel {
    pub fn name(&self) -> &'static str {
        match self {
            BackpressureLevel::Normal => "NORMAL",
            BackpressureLevel::AnimationYield => "ANIMATION_YIELD",
            BackpressureLevel::VerbosityReduce => "VERBOSITY_REDUCE",
            BackpressureLevel::ToolRefuse => "TOOL_REFUSE",
            BackpressureLevel::SessionQueue => "SESSION_QUEUE",
            BackpressureLevel::SessionReject => "SESSION_REJECT",
        }
    }

    fn step_down(&self) -> BackpressureLevel {
        match self {
            BackpressureLevel::Normal | BackpressureLevel::AnimationYield => {
                BackpressureLevel::Normal
            }
            BackpressureLevel::VerbosityReduce => BackpressureLevel::AnimationYield,
            BackpressureLevel::ToolRefuse => BackpressureLevel::VerbosityReduce,
            BackpressureLevel::SessionQueue => BackpressureLevel::ToolRefuse,
            BackpressureLevel::SessionReject => BackpressureLevel::SessionQueue,
        }
    }
}

/// Live metrics sampled once per second.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub ttfa_p95_ms: u64,
    pub vram_pct: f64,
    pub anim_lag_ms: u64,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub error_rate_pct: f64,
}

/// Effects the rest of the system reads off the current level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Effects {
    pub level: BackpressureLevel,
    pub drop_animation: bool,
    pub max_tokens_override: Option<u32>,
    pub verbosity: f32,
    pub tools_disabled: bool,
    pub queue_sessions: bool,
    pub reject_sessions: bool,
}

impl Effects {
    pub fn for_level(level: BackpressureLevel) -> Self {
        use BackpressureLevel::*;
        Self {
            level,
            drop_animation: level >= AnimationYield,
            max_tokens_override: match level {
                Normal | AnimationYield => None,
                VerbosityReduce => Some(384),
                _ => Some(256),
            },
            verbosity: match level {
                Normal | AnimationYield => 1.0,
                VerbosityReduce => 0.7,
                _ => 0.5,
            },
            tools_disabled: level >= ToolRefuse,
            queue_sessions: level == SessionQueue,
            reject_sessions: level >= SessionReject,
        }
    }
}

/// Trigger set for one level; any-of semantics. `None` disables a trigger.
struct Triggers {
    ttfa_p95_ms: Option<u64>,
    vram_pct: Option<f64>,
    anim_lag_ms: Option<u64>,
    /// Active sessions ≥ max − headroom.
    session_headroom: Option<usize>,
    error_rate_pct: Option<f64>,
}

impl Triggers {
    fn for_level(level: BackpressureLevel) -> Option<Triggers> {
        use BackpressureLevel::*;
        match level {
            Normal => None,
            AnimationYield => Some(Triggers {
                ttfa_p95_ms: None,
                vram_pct: Some(85.0),
                anim_lag_ms: Some(120),
                session_headroom: None,
                error_rate_pct: None,
            }),
            VerbosityReduce => Some(Triggers {
                ttfa_p95_ms: Some(200),
                vram_pct: Some(90.0),
                anim_lag_ms: None,
                session_headroom: Some(2),
                error_rate_pct: None,
            }),
            ToolRefuse => Some(Triggers {
                ttfa_p95_ms: Some(225),
                vram_pct: Some(93.0),
                anim_lag_ms: None,
                session_headroom: None,
                error_rate_pct: None,
            }),
            SessionQueue => Some(Triggers {
                ttfa_p95_ms: Some(240),
                vram_pct: Some(95.0),
                anim_lag_ms: None,
                session_headroom: Some(1),
                error_rate_pct: None,
            }),
            SessionReject => Some(Triggers {
                ttfa_p95_ms: Some(250),
                vram_pct: Some(98.0),
                anim_lag_ms: None,
                session_headroom: Some(0),
                error_rate_pct: Some(5.0),
            }),
        }
    }

    /// Whether any trigger fires for `m`. `margin` widens the clear side:
    /// zero when deciding upward moves, positive when testing whether the
    /// current level has cleared (hysteresis).
    fn fires(&self, m: &MetricsSnapshot, ttfa_margin_ms: u64, vram_margin: f64) -> bool {
        if let Some(t) = self.ttfa_p95_ms {
            if m.ttfa_p95_ms + ttfa_margin_ms >= t {
                return true;
            }
        }
        if let Some(t) = self.vram_pct {
            if m.vram_pct + vram_margin > t {
                return true;
            }
        }
        if let Some(t) = self.anim_lag_ms {
            if m.anim_lag_ms > t {
                return true;
            }
        }
        if let Some(headroom) = self.session_headroom {
            if m.active_sessions + headroom >= m.max_sessions {
                return true;
            }
        }
        if let Some(t) = self.error_rate_pct {
            if m.error_rate_pct > t {
                return true;
            }
        }
        false
    }
}

/// Hysteresis margins applied when testing whether a level has cleared:
/// e.g. VERBOSITY_REDUCE (trigger at 200 ms) clears only below 180 ms.
const CLEAR_TTFA_MARGIN_MS: u64 = 20;
const CLEAR_VRAM_MARGIN: f64 = 3.0;

/// The ladder itself. `observe` is the 1 Hz entry point.
pub struct BackpressureController {
    level: BackpressureLevel,
    clear_streak: u32,
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new()
    }
}

impl BackpressureController {
    pub fn new() -> Self {
        Self {
            level: BackpressureLevel::Normal,
            clear_streak: 0,
        }
    }

    pub fn level(&self) -> BackpressureLevel {
        self.level
    }

    pub fn effects(&self) -> Effects {
        Effects::for_level(self.level)
    }

    /// Highest level whose trigger set fires for this snapshot.
    fn target_level(m: &MetricsSnapshot) -> BackpressureLevel {
        use BackpressureLevel::*;
        let mut target = Normal;
        for level in [
            AnimationYield,
            VerbosityReduce,
            ToolRefuse,
            SessionQueue,
            SessionReject,
        ] {
            if let Some(triggers) = Triggers::for_level(level) {
                if triggers.fires(m, 0, 0.0) {
                    target = level;
                }
            }
        }
        target
    }

    /// One observation window. Upward moves apply immediately and may skip
    /// levels; downward moves require `BACKPRESSURE_CLEAR_SAMPLES`
    /// consecutive clear samples and step exactly one level.
    pub fn observe(&mut self, m: &MetricsSnapshot) -> BackpressureLevel {
        let target = Self::target_level(m);

        if target > self.level {
            tracing::warn!(
                from = self.level.name(),
                to = target.name(),
                ttfa_p95_ms = m.ttfa_p95_ms,
                vram_pct = m.vram_pct,
                active = m.active_sessions,
                "backpressure escalated"
            );
            self.level = target;
            self.clear_streak = 0;
            return self.level;
        }

        if self.level == BackpressureLevel::Normal {
            self.clear_streak = 0;
            return self.level;
        }

        // Down-transition test: the CURRENT level's triggers must be clear
        // with hysteresis margins.
        let current_clear = Triggers::for_level(self.level)
            .map(|t| !t.fires(m, CLEAR_TTFA_MARGIN_MS, CLEAR_VRAM_MARGIN))
            .unwrap_or(true);

        if current_clear {
            self.clear_streak += 1;
            if self.clear_streak >= BACKPRESSURE_CLEAR_SAMPLES {
                let next = self.level.step_down();
                tracing::info!(
                    from = self.level.name(),
                    to = next.name(),
                    "backpressure stepped down"
                );
                self.level = next;
                self.clear_streak = 0;
            }
        } else {
            self.clear_streak = 0;
        }
        self.level
    }
}
