//! Pipeline and control events
//!
//! `PipelineEvent` is the broadcast stream a session's transport layer
//! subscribes to; `ControlEvent` is the JSON subset forwarded to the client
//! on the reliable control channel.

use serde::{Deserialize, Serialize};

use crate::audio::AudioPacket;
use crate::blendshape::BlendshapeFrame;
use crate::cancel::CancelReason;

/// Events emitted by a session pipeline.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StateChanged {
        from: &'static str,
        to: &'static str,
        reason: String,
    },
    PartialTranscript {
        text: String,
    },
    FinalTranscript {
        text: String,
        endpoint_ms: u64,
    },
    Audio(AudioPacket),
    Blendshapes(BlendshapeFrame),
    TtfaMeasured {
        turn_id: u64,
        ttfa_ms: u64,
    },
    BargeInAck {
        latency_ms: u64,
        reason: CancelReason,
    },
    TurnTimeout {
        turn_id: u64,
    },
    Degraded {
        level: String,
    },
    Error {
        message: String,
    },
}

/// Server→client control events on the reliable channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    StateChange {
        from: String,
        to: String,
        reason: String,
    },
    TtfaMeasured {
        turn_id: u64,
        ttfa_ms: u64,
    },
    BargeinAck {
        latency_ms: u64,
        reason: CancelReason,
    },
    Degraded {
        level: String,
    },
    TurnTimeout {
        turn_id: u64,
    },
}

impl PipelineEvent {
    /// Map to the client-facing control event, if this event is one.
    pub fn to_control_event(&self) -> Option<ControlEvent> {
        match self {
            PipelineEvent::StateChanged { from, to, reason } => Some(ControlEvent::StateChange {
                from: (*from).to_string(),
                to: (*to).to_string(),
                reason: reason.clone(),
            }),
            PipelineEvent::TtfaMeasured { turn_id, ttfa_ms } => Some(ControlEvent::TtfaMeasured {
                turn_id: *turn_id,
                ttfa_ms: *ttfa_ms,
            }),
            PipelineEvent::BargeInAck { latency_ms, reason } => Some(ControlEvent::BargeinAck {
                latency_ms: *latency_ms,
                reason: *reason,
            }),
            PipelineEvent::Degraded { level } => Some(ControlEvent::Degraded {
                level: level.clone(),
            }),
            PipelineEvent::TurnTimeout { turn_id } => {
                Some(ControlEvent::TurnTimeout { turn_id: *turn_id })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_events_have_no_control_mapping() {
        let packet = AudioPacket {
            session_id: "s".into(),
            seq: 0,
            t_audio_ms: 0,
            duration_ms: 20,
            overlap_ms: 5,
            codec: crate::audio::AudioCodec::Pcm16le,
            payload: vec![],
        };
        assert!(PipelineEvent::Audio(packet).to_control_event().is_none());
    }

    #[test]
    fn control_event_serializes_with_snake_case_tag() {
        let event = ControlEvent::Degraded {
            level: "ANIMATION_YIELD".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"degraded\""));
    }

    #[test]
    fn bargein_ack_maps_through() {
        let event = PipelineEvent::BargeInAck {
            latency_ms: 87,
            reason: CancelReason::UserBargeIn,
        };
        match event.to_control_event() {
            Some(ControlEvent::BargeinAck { latency_ms, .. }) => assert_eq!(latency_ms, 87),
            other => panic!("unexpected mapping: {other:?}"),
        }
    }
}
