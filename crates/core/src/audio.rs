//! Audio packet contract
//!
//! The outbound audio contract: fixed 20 ms packets with a 5 ms overlap
//! head for receiver cross-fade. `t_audio_ms` is the session audio clock
//! and advances only by `duration_ms` per emitted packet; the overlap
//! never advances it.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed packet duration in milliseconds.
pub const AUDIO_PACKET_MS: u32 = 20;

/// Fixed overlap duplicated into the next packet head, in milliseconds.
pub const AUDIO_OVERLAP_MS: u32 = 5;

/// Supported payload codecs on the media channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// 16-bit little-endian PCM, mono.
    #[default]
    Pcm16le,
    /// Opus frames (payload is an encoded frame per packet).
    Opus,
}

impl AudioCodec {
    fn tag(&self) -> &'static [u8] {
        match self {
            AudioCodec::Pcm16le => b"pcm16le\0",
            AudioCodec::Opus => b"opus\0\0\0\0",
        }
    }

    fn from_tag(tag: &[u8]) -> Result<Self> {
        let trimmed: Vec<u8> = tag.iter().copied().take_while(|b| *b != 0).collect();
        match trimmed.as_slice() {
            b"pcm16le" => Ok(AudioCodec::Pcm16le),
            b"opus" => Ok(AudioCodec::Opus),
            other => Err(Error::Transport(format!(
                "unknown codec tag: {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// A chunk of raw PCM produced by a TTS engine, before packetization.
#[derive(Debug, Clone)]
pub struct PcmChunk {
    /// 16-bit little-endian mono samples.
    pub payload: Vec<u8>,
    pub sample_rate: u32,
}

impl PcmChunk {
    pub fn new(payload: Vec<u8>, sample_rate: u32) -> Self {
        Self {
            payload,
            sample_rate,
        }
    }

    /// Duration represented by this chunk in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        let bytes_per_ms = (self.sample_rate as u64 * 2) / 1000;
        if bytes_per_ms == 0 {
            return 0;
        }
        self.payload.len() as u64 / bytes_per_ms
    }

    /// RMS energy in dBFS, used by the neutral animation adapter to drive
    /// the jaw/mouth group and by the VAD energy gate.
    pub fn energy_db(&self) -> f32 {
        let samples: Vec<f32> = self
            .payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect();
        if samples.is_empty() {
            return -96.0;
        }
        let mean_sq = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
        if mean_sq <= f32::EPSILON {
            return -96.0;
        }
        10.0 * mean_sq.log10()
    }
}

/// A single outbound audio packet.
///
/// Invariant: for consecutive packets `p`, `q` of one session,
/// `q.seq == p.seq + 1` and `q.t_audio_ms == p.t_audio_ms + p.duration_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioPacket {
    pub session_id: String,
    pub seq: u64,
    pub t_audio_ms: u64,
    pub duration_ms: u32,
    pub overlap_ms: u32,
    pub codec: AudioCodec,
    #[serde(with = "payload_hex")]
    pub payload: Vec<u8>,
}

/// Binary header layout for the media channel:
/// 36 B session id (NUL padded), u32 seq, u32 t_audio_ms, u16 duration,
/// u16 overlap, 8 B codec tag, u32 payload length. Big-endian throughout.
const WIRE_HEADER_LEN: usize = 36 + 4 + 4 + 2 + 2 + 8 + 4;

impl AudioPacket {
    /// Serialize for the binary media channel.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WIRE_HEADER_LEN + self.payload.len());
        let mut sid = [0u8; 36];
        let sid_bytes = self.session_id.as_bytes();
        let n = sid_bytes.len().min(36);
        sid[..n].copy_from_slice(&sid_bytes[..n]);
        out.extend_from_slice(&sid);
        out.extend_from_slice(&(self.seq as u32).to_be_bytes());
        out.extend_from_slice(&(self.t_audio_ms as u32).to_be_bytes());
        out.extend_from_slice(&(self.duration_ms as u16).to_be_bytes());
        out.extend_from_slice(&(self.overlap_ms as u16).to_be_bytes());
        out.extend_from_slice(self.codec.tag());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Deserialize from the binary media channel.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WIRE_HEADER_LEN {
            return Err(Error::Transport(format!(
                "packet header truncated: {} bytes",
                data.len()
            )));
        }
        let session_id = String::from_utf8_lossy(&data[..36])
            .trim_end_matches('\0')
            .to_string();
        let seq = u32::from_be_bytes(data[36..40].try_into().unwrap_or_default()) as u64;
        let t_audio_ms = u32::from_be_bytes(data[40..44].try_into().unwrap_or_default()) as u64;
        let duration_ms = u16::from_be_bytes(data[44..46].try_into().unwrap_or_default()) as u32;
        let overlap_ms = u16::from_be_bytes(data[46..48].try_into().unwrap_or_default()) as u32;
        let codec = AudioCodec::from_tag(&data[48..56])?;
        let payload_len =
            u32::from_be_bytes(data[56..60].try_into().unwrap_or_default()) as usize;
        if data.len() < WIRE_HEADER_LEN + payload_len {
            return Err(Error::Transport("packet payload truncated".to_string()));
        }
        Ok(Self {
            session_id,
            seq,
            t_audio_ms,
            duration_ms,
            overlap_ms,
            codec,
            payload: data[WIRE_HEADER_LEN..WIRE_HEADER_LEN + payload_len].to_vec(),
        })
    }
}

mod payload_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        let mut s = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            s.push_str(&format!("{:02x}", b));
        }
        ser.serialize_str(&s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        if s.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length hex payload"));
        }
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16)
                    .map_err(|e| serde::de::Error::custom(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> AudioPacket {
        AudioPacket {
            session_id: "session-abc".to_string(),
            seq: 7,
            t_audio_ms: 140,
            duration_ms: AUDIO_PACKET_MS,
            overlap_ms: AUDIO_OVERLAP_MS,
            codec: AudioCodec::Pcm16le,
            payload: vec![1, 2, 3, 4, 5, 6],
        }
    }

    #[test]
    fn wire_round_trip() {
        let packet = sample_packet();
        let bytes = packet.to_bytes();
        let decoded = AudioPacket::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn wire_rejects_truncated_header() {
        let bytes = sample_packet().to_bytes();
        assert!(AudioPacket::from_bytes(&bytes[..20]).is_err());
    }

    #[test]
    fn wire_rejects_truncated_payload() {
        let bytes = sample_packet().to_bytes();
        assert!(AudioPacket::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn pcm_chunk_duration() {
        // 16 kHz mono pcm16 = 32 bytes per ms
        let chunk = PcmChunk::new(vec![0u8; 640], 16_000);
        assert_eq!(chunk.duration_ms(), 20);
    }

    #[test]
    fn silence_has_floor_energy() {
        let chunk = PcmChunk::new(vec![0u8; 640], 16_000);
        assert!(chunk.energy_db() <= -90.0);
    }

    #[test]
    fn loud_chunk_has_higher_energy() {
        let mut payload = Vec::new();
        for _ in 0..320 {
            payload.extend_from_slice(&(i16::MAX / 2).to_le_bytes());
        }
        let chunk = PcmChunk::new(payload, 16_000);
        assert!(chunk.energy_db() > -10.0);
    }
}
