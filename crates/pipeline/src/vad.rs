//! Energy-based VAD and barge-in detection
//!
//! Runs on the inbound audio stream throughout LISTENING and SPEAKING.
//! Emits `endpoint_detected` when trailing silence closes an utterance and
//! `barge_in_event` when user speech rises while the agent is speaking.
//! Every event carries the server-monotonic timestamp at which the
//! triggering audio was observed, not the time the event was processed.

use duplex_core::PcmChunk;

/// One inbound audio frame plus its observation timestamp.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub pcm: PcmChunk,
    /// Session-epoch milliseconds when this audio was observed.
    pub t_observed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Frames quieter than this are treated as silence.
    pub energy_floor_db: f32,
    /// Speech must persist this long before onset is reported.
    pub min_speech_ms: u64,
    /// Trailing silence that closes an utterance.
    pub endpoint_silence_ms: u64,
    /// Speech persistence required to call a barge-in while the agent
    /// speaks; slightly longer than onset to resist echo blips.
    pub barge_in_min_speech_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_floor_db: -45.0,
            min_speech_ms: 60,
            endpoint_silence_ms: 400,
            barge_in_min_speech_ms: 100,
        }
    }
}

/// Events emitted by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart { t_event_ms: u64 },
    EndpointDetected { t_event_ms: u64 },
    BargeIn { t_event_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Silence,
    Speech,
}

/// Streaming endpointer + barge-in detector.
pub struct BargeInDetector {
    config: VadConfig,
    phase: Phase,
    speech_ms: u64,
    silence_ms: u64,
    onset_reported: bool,
    /// Timestamp of the first frame of the current speech run.
    speech_started_at: u64,
    /// Timestamp of the first silent frame after speech.
    silence_started_at: u64,
}

impl BargeInDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            phase: Phase::Silence,
            speech_ms: 0,
            silence_ms: 0,
            onset_reported: false,
            speech_started_at: 0,
            silence_started_at: 0,
        }
    }

    /// Process one inbound frame. `agent_speaking` arms the barge-in path.
    pub fn process(&mut self, frame: &InboundFrame, agent_speaking: bool) -> Option<VadEvent> {
        let duration = frame.pcm.duration_ms().max(1);
        let is_speech = frame.pcm.energy_db() > self.config.energy_floor_db;

        if is_speech {
            if self.phase == Phase::Silence {
                self.phase = Phase::Speech;
                self.speech_ms = 0;
                self.speech_started_at = frame.t_observed_ms;
            }
            self.speech_ms += duration;
            self.silence_ms = 0;

            if agent_speaking {
                if self.speech_ms >= self.config.barge_in_min_speech_ms && !self.onset_reported {
                    self.onset_reported = true;
                    return Some(VadEvent::BargeIn {
                        t_event_ms: self.speech_started_at,
                    });
                }
            } else if self.speech_ms >= self.config.min_speech_ms && !self.onset_reported {
                self.onset_reported = true;
                return Some(VadEvent::SpeechStart {
                    t_event_ms: self.speech_started_at,
                });
            }
        } else if self.phase == Phase::Speech {
            if self.silence_ms == 0 {
                self.silence_started_at = frame.t_observed_ms;
            }
            self.silence_ms += duration;
            if self.silence_ms >= self.config.endpoint_silence_ms {
                let had_onset = self.onset_reported;
                self.reset_run();
                if had_onset && !agent_speaking {
                    return Some(VadEvent::EndpointDetected {
                        t_event_ms: self.silence_started_at,
                    });
                }
            }
        }
        None
    }

    fn reset_run(&mut self) {
        self.phase = Phase::Silence;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.onset_reported = false;
    }

    /// Reset all state, e.g. after a turn launches or a barge-in fires.
    pub fn reset(&mut self) {
        self.reset_run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame(t: u64, ms: usize) -> InboundFrame {
        let mut payload = Vec::new();
        for _ in 0..(ms * 16) {
            payload.extend_from_slice(&(i16::MAX / 3).to_le_bytes());
        }
        InboundFrame {
            pcm: PcmChunk::new(payload, 16_000),
            t_observed_ms: t,
        }
    }

    fn silent_frame(t: u64, ms: usize) -> InboundFrame {
        InboundFrame {
            pcm: PcmChunk::new(vec![0u8; ms * 32], 16_000),
            t_observed_ms: t,
        }
    }

    #[test]
    fn speech_onset_after_min_duration() {
        let mut vad = BargeInDetector::new(VadConfig::default());
        assert_eq!(vad.process(&loud_frame(0, 20), false), None);
        assert_eq!(vad.process(&loud_frame(20, 20), false), None);
        // 60 ms accumulated
        let event = vad.process(&loud_frame(40, 20), false);
        assert_eq!(event, Some(VadEvent::SpeechStart { t_event_ms: 0 }));
    }

    #[test]
    fn endpoint_carries_observation_time_of_silence_start() {
        let mut vad = BargeInDetector::new(VadConfig::default());
        for i in 0..5 {
            vad.process(&loud_frame(i * 20, 20), false);
        }
        // 400 ms of trailing silence starting at t=100.
        let mut event = None;
        for i in 0..20 {
            event = vad.process(&silent_frame(100 + i * 20, 20), false);
            if event.is_some() {
                break;
            }
        }
        assert_eq!(event, Some(VadEvent::EndpointDetected { t_event_ms: 100 }));
    }

    #[test]
    fn barge_in_fires_while_agent_speaking() {
        let mut vad = BargeInDetector::new(VadConfig::default());
        assert_eq!(vad.process(&loud_frame(300, 20), true), None);
        assert_eq!(vad.process(&loud_frame(320, 20), true), None);
        assert_eq!(vad.process(&loud_frame(340, 20), true), None);
        assert_eq!(vad.process(&loud_frame(360, 20), true), None);
        // 100 ms of persistent speech observed from t=300.
        let event = vad.process(&loud_frame(380, 20), true);
        assert_eq!(event, Some(VadEvent::BargeIn { t_event_ms: 300 }));
    }

    #[test]
    fn barge_in_reports_once_per_speech_run() {
        let mut vad = BargeInDetector::new(VadConfig::default());
        for i in 0..10 {
            vad.process(&loud_frame(i * 20, 20), true);
        }
        let repeats: Vec<_> = (10..20)
            .filter_map(|i| vad.process(&loud_frame(i * 20, 20), true))
            .collect();
        assert!(repeats.is_empty());
    }

    #[test]
    fn quiet_audio_never_triggers() {
        let mut vad = BargeInDetector::new(VadConfig::default());
        for i in 0..50 {
            assert_eq!(vad.process(&silent_frame(i * 20, 20), false), None);
        }
    }

    #[test]
    fn no_endpoint_without_prior_onset() {
        let mut vad = BargeInDetector::new(VadConfig::default());
        // Single 20 ms blip below onset threshold, then long silence.
        vad.process(&loud_frame(0, 20), false);
        for i in 1..40 {
            assert_eq!(vad.process(&silent_frame(i * 20, 20), false), None);
        }
    }
}
