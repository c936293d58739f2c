//! ARKit-52 blendshape frames
//!
//! Frames reference the session audio clock so the client can align facial
//! animation with audio packets. Heartbeat frames carry no new articulation
//! and may reuse the previous clock value.

use serde::{Deserialize, Serialize};

/// Number of channels in the ARKit blendshape convention.
pub const ARKIT_CHANNEL_COUNT: usize = 52;

/// Canonical ARKit channel names, index-aligned with [`BlendshapeWeights`].
pub const ARKIT_CHANNELS: [&str; ARKIT_CHANNEL_COUNT] = [
    // Brows
    "browDownLeft",
    "browDownRight",
    "browInnerUp",
    "browOuterUpLeft",
    "browOuterUpRight",
    // Eyes
    "eyeBlinkLeft",
    "eyeBlinkRight",
    "eyeLookDownLeft",
    "eyeLookDownRight",
    "eyeLookInLeft",
    "eyeLookInRight",
    "eyeLookOutLeft",
    "eyeLookOutRight",
    "eyeLookUpLeft",
    "eyeLookUpRight",
    "eyeSquintLeft",
    "eyeSquintRight",
    "eyeWideLeft",
    "eyeWideRight",
    // Jaw
    "jawForward",
    "jawLeft",
    "jawOpen",
    "jawRight",
    // Mouth
    "mouthClose",
    "mouthDimpleLeft",
    "mouthDimpleRight",
    "mouthFrownLeft",
    "mouthFrownRight",
    "mouthFunnel",
    "mouthLeft",
    "mouthLowerDownLeft",
    "mouthLowerDownRight",
    "mouthPressLeft",
    "mouthPressRight",
    "mouthPucker",
    "mouthRight",
    "mouthRollLower",
    "mouthRollUpper",
    "mouthShrugLower",
    "mouthShrugUpper",
    "mouthSmileLeft",
    "mouthSmileRight",
    "mouthStretchLeft",
    "mouthStretchRight",
    "mouthUpperUpLeft",
    "mouthUpperUpRight",
    // Nose
    "noseSneerLeft",
    "noseSneerRight",
    // Cheeks
    "cheekPuff",
    "cheekSquintLeft",
    "cheekSquintRight",
    // Tongue
    "tongueOut",
];

/// Index range of the jaw and mouth channel group. These are the only
/// channels the default (neutral) policy allows audio to drive; every other
/// channel stays pinned at zero.
const ARTICULATION_RANGE: std::ops::Range<usize> = 19..46;

/// Fixed-size weight vector, index-aligned with [`ARKIT_CHANNELS`].
pub type BlendshapeWeights = [f32; ARKIT_CHANNEL_COUNT];

/// All channels at rest.
pub fn neutral_weights() -> BlendshapeWeights {
    [0.0; ARKIT_CHANNEL_COUNT]
}

/// Whether a channel index belongs to the jaw/mouth articulation group.
pub fn is_articulation_channel(index: usize) -> bool {
    ARTICULATION_RANGE.contains(&index)
}

/// A single frame of facial animation referencing the audio clock.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendshapeFrame {
    pub session_id: String,
    pub seq: u64,
    pub t_audio_ms: u64,
    pub fps: u32,
    pub heartbeat: bool,
    pub weights: BlendshapeWeights,
}

impl BlendshapeFrame {
    /// A cadence-maintenance frame holding the given pose.
    pub fn heartbeat(
        session_id: impl Into<String>,
        seq: u64,
        t_audio_ms: u64,
        fps: u32,
        weights: BlendshapeWeights,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            seq,
            t_audio_ms,
            fps,
            heartbeat: true,
            weights,
        }
    }

    /// True when every channel outside the jaw/mouth group is at zero.
    pub fn is_neutral_outside_articulation(&self) -> bool {
        self.weights
            .iter()
            .enumerate()
            .all(|(i, w)| is_articulation_channel(i) || *w == 0.0)
    }
}

/// JSON shape on the blendshape side channel: named weights per frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlendshapeFrameWire {
    pub session_id: String,
    pub seq: u64,
    pub t_audio_ms: u64,
    pub fps: u32,
    pub heartbeat: bool,
    pub blendshapes: serde_json::Map<String, serde_json::Value>,
}

impl From<&BlendshapeFrame> for BlendshapeFrameWire {
    fn from(frame: &BlendshapeFrame) -> Self {
        let mut blendshapes = serde_json::Map::with_capacity(ARKIT_CHANNEL_COUNT);
        for (name, weight) in ARKIT_CHANNELS.iter().zip(frame.weights.iter()) {
            blendshapes.insert(name.to_string(), serde_json::json!(weight));
        }
        Self {
            session_id: frame.session_id.clone(),
            seq: frame.seq,
            t_audio_ms: frame.t_audio_ms,
            fps: frame.fps,
            heartbeat: frame.heartbeat,
            blendshapes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_table_is_complete() {
        assert_eq!(ARKIT_CHANNELS.len(), ARKIT_CHANNEL_COUNT);
        let mut seen = std::collections::HashSet::new();
        for name in ARKIT_CHANNELS {
            assert!(seen.insert(name), "duplicate channel {name}");
        }
    }

    #[test]
    fn articulation_group_covers_jaw_and_mouth_only() {
        for (i, name) in ARKIT_CHANNELS.iter().enumerate() {
            let expected = name.starts_with("jaw") || name.starts_with("mouth");
            assert_eq!(
                is_articulation_channel(i),
                expected,
                "channel {name} misclassified"
            );
        }
    }

    #[test]
    fn neutral_frame_passes_neutrality_check() {
        let frame = BlendshapeFrame::heartbeat("s", 0, 0, 30, neutral_weights());
        assert!(frame.is_neutral_outside_articulation());
    }

    #[test]
    fn brow_weight_fails_neutrality_check() {
        let mut weights = neutral_weights();
        weights[0] = 0.4; // browDownLeft
        let frame = BlendshapeFrame::heartbeat("s", 0, 0, 30, weights);
        assert!(!frame.is_neutral_outside_articulation());
    }

    #[test]
    fn jaw_weight_is_allowed() {
        let mut weights = neutral_weights();
        let jaw_open = ARKIT_CHANNELS.iter().position(|c| *c == "jawOpen").unwrap();
        weights[jaw_open] = 0.8;
        let frame = BlendshapeFrame::heartbeat("s", 0, 0, 30, weights);
        assert!(frame.is_neutral_outside_articulation());
    }

    #[test]
    fn wire_frame_has_all_named_channels() {
        let frame = BlendshapeFrame::heartbeat("s", 3, 120, 30, neutral_weights());
        let wire = BlendshapeFrameWire::from(&frame);
        assert_eq!(wire.blendshapes.len(), ARKIT_CHANNEL_COUNT);
        assert!(wire.blendshapes.contains_key("jawOpen"));
        assert!(wire.heartbeat);
    }
}
