//! Conversation signals
//!
//! Objective per-session measurements that inform conversation strategy:
//! interruption patterns, transcription confidence dips, friction phrases
//! and turn cadence. Outputs are behavioral recommendations (reduce
//! verbosity, seek confirmation), never emotion labels or psychological
//! state.

/// Metrics for one completed turn.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    pub user_speech_ms: u64,
    pub asr_confidence: f32,
    pub was_interrupted: bool,
    pub word_count: usize,
}

/// Derived session signals.
#[derive(Debug, Clone, Default)]
pub struct ConversationSignals {
    pub interruption_rate: f64,
    pub consecutive_interruptions: u32,
    pub avg_asr_confidence: f64,
    pub low_confidence_turn_rate: f64,
    pub clarification_requests: u32,
    pub repeat_requests: u32,
    pub consecutive_short_turns: u32,
    pub turns_per_minute: f64,

    pub should_reduce_verbosity: bool,
    pub should_seek_confirmation: bool,
}

const FRICTION_PHRASES: &[&str] = &[
    "what?",
    "huh",
    "pardon",
    "sorry?",
    "say again",
    "didn't catch",
    "didn't hear",
    "come again",
    "one more time",
];

const REPEAT_PHRASES: &[&str] = &["repeat", "again"];

const LOW_CONFIDENCE: f32 = 0.7;

/// Accumulates turn reports and derives signals.
pub struct SignalsTracker {
    turns: u64,
    interruptions: u64,
    consecutive_interruptions: u32,
    confidence_sum: f64,
    low_confidence_turns: u64,
    clarifications: u32,
    repeats: u32,
    consecutive_short: u32,
    session_start_ms: u64,
    last_turn_ms: u64,
}

impl SignalsTracker {
    pub fn new(now_ms: u64) -> Self {
        Self {
            turns: 0,
            interruptions: 0,
            consecutive_interruptions: 0,
            confidence_sum: 0.0,
            low_confidence_turns: 0,
            clarifications: 0,
            repeats: 0,
            consecutive_short: 0,
            session_start_ms: now_ms,
            last_turn_ms: now_ms,
        }
    }

    pub fn record_turn(&mut self, report: &TurnReport, now_ms: u64) {
        self.turns += 1;
        self.confidence_sum += report.asr_confidence as f64;
        if report.asr_confidence < LOW_CONFIDENCE {
            self.low_confidence_turns += 1;
        }
        if report.was_interrupted {
            self.interruptions += 1;
            self.consecutive_interruptions += 1;
        } else {
            self.consecutive_interruptions = 0;
        }
        if report.word_count < 3 {
            self.consecutive_short += 1;
        } else {
            self.consecutive_short = 0;
        }
        self.last_turn_ms = now_ms;
    }

    /// Scan user text for friction phrases.
    pub fn record_user_text(&mut self, text: &str) {
        let lower = text.to_lowercase();
        if REPEAT_PHRASES.iter().any(|p| lower.contains(p)) {
            self.repeats += 1;
        } else if FRICTION_PHRASES.iter().any(|p| lower.contains(p)) {
            self.clarifications += 1;
        }
    }

    pub fn signals(&self, now_ms: u64) -> ConversationSignals {
        if self.turns == 0 {
            return ConversationSignals::default();
        }
        let turns = self.turns as f64;
        let interruption_rate = self.interruptions as f64 / turns;
        let low_confidence_turn_rate = self.low_confidence_turns as f64 / turns;
        let avg_asr_confidence = self.confidence_sum / turns;
        let elapsed_ms = now_ms.saturating_sub(self.session_start_ms).max(1);
        let turns_per_minute = turns * 60_000.0 / elapsed_ms as f64;

        let should_reduce_verbosity = interruption_rate > 0.3
            || self.consecutive_interruptions >= 2
            || self.consecutive_short >= 3;

        let should_seek_confirmation = avg_asr_confidence < LOW_CONFIDENCE as f64
            || self.clarifications >= 2
            || low_confidence_turn_rate > 0.3;

        ConversationSignals {
            interruption_rate,
            consecutive_interruptions: self.consecutive_interruptions,
            avg_asr_confidence,
            low_confidence_turn_rate,
            clarification_requests: self.clarifications,
            repeat_requests: self.repeats,
            consecutive_short_turns: self.consecutive_short,
            turns_per_minute,
            should_reduce_verbosity,
            should_seek_confirmation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(confidence: f32, interrupted: bool, words: usize) -> TurnReport {
        TurnReport {
            user_speech_ms: 1500,
            asr_confidence: confidence,
            was_interrupted: interrupted,
            word_count: words,
        }
    }

    #[test]
    fn no_turns_yields_defaults() {
        let tracker = SignalsTracker::new(0);
        let signals = tracker.signals(1000);
        assert!(!signals.should_reduce_verbosity);
        assert_eq!(signals.interruption_rate, 0.0);
    }

    #[test]
    fn consecutive_interruptions_reduce_verbosity() {
        let mut tracker = SignalsTracker::new(0);
        tracker.record_turn(&turn(0.9, true, 8), 5_000);
        tracker.record_turn(&turn(0.9, true, 8), 10_000);
        let signals = tracker.signals(10_000);
        assert_eq!(signals.consecutive_interruptions, 2);
        assert!(signals.should_reduce_verbosity);
    }

    #[test]
    fn interruption_streak_resets_on_clean_turn() {
        let mut tracker = SignalsTracker::new(0);
        tracker.record_turn(&turn(0.9, true, 8), 5_000);
        tracker.record_turn(&turn(0.9, false, 8), 10_000);
        assert_eq!(tracker.signals(10_000).consecutive_interruptions, 0);
    }

    #[test]
    fn low_confidence_seeks_confirmation() {
        let mut tracker = SignalsTracker::new(0);
        tracker.record_turn(&turn(0.4, false, 8), 5_000);
        tracker.record_turn(&turn(0.5, false, 8), 10_000);
        let signals = tracker.signals(10_000);
        assert!(signals.should_seek_confirmation);
        assert_eq!(signals.low_confidence_turn_rate, 1.0);
    }

    #[test]
    fn friction_phrases_are_classified() {
        let mut tracker = SignalsTracker::new(0);
        tracker.record_user_text("sorry? didn't catch that");
        tracker.record_user_text("can you repeat that");
        tracker.record_turn(&turn(0.9, false, 4), 1_000);
        let signals = tracker.signals(1_000);
        assert_eq!(signals.clarification_requests, 1);
        assert_eq!(signals.repeat_requests, 1);
    }

    #[test]
    fn turns_per_minute_reflects_cadence() {
        let mut tracker = SignalsTracker::new(0);
        for i in 1..=6 {
            tracker.record_turn(&turn(0.9, false, 8), i * 10_000);
        }
        let signals = tracker.signals(60_000);
        assert!((signals.turns_per_minute - 6.0).abs() < 0.01);
    }
}
