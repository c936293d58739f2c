//! Audio packetizer
//!
//! Rechunks engine-native PCM into exactly-20 ms packets on the session
//! audio clock. The last 5 ms of each packet is duplicated as the head of
//! the next packet for receiver cross-fade; the duplicated bytes never
//! advance the clock. On CANCEL the emitter stops immediately: the
//! in-flight frame is dropped and no flush tail is produced.

use std::sync::Arc;

use duplex_config::settings::TailPolicy;
use duplex_core::{AudioCodec, AudioPacket, PcmChunk};

use crate::clock::AudioClock;

/// Stateful rechunker for one session's outbound audio.
pub struct Packetizer {
    session_id: String,
    clock: Arc<AudioClock>,
    seq: u64,
    buffer: Vec<u8>,
    overlap: Vec<u8>,
    packet_ms: u32,
    overlap_ms: u32,
    bytes_per_packet: usize,
    bytes_per_overlap: usize,
    tail_policy: TailPolicy,
    codec: AudioCodec,
}

impl Packetizer {
    pub fn new(
        session_id: impl Into<String>,
        clock: Arc<AudioClock>,
        sample_rate: u32,
        packet_ms: u32,
        overlap_ms: u32,
        tail_policy: TailPolicy,
    ) -> Self {
        let bytes_per_ms = (sample_rate as usize * 2) / 1000;
        Self {
            session_id: session_id.into(),
            clock,
            seq: 0,
            buffer: Vec::new(),
            overlap: Vec::new(),
            packet_ms,
            overlap_ms,
            bytes_per_packet: bytes_per_ms * packet_ms as usize,
            bytes_per_overlap: bytes_per_ms * overlap_ms as usize,
            tail_policy,
            codec: AudioCodec::Pcm16le,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq
    }

    /// Feed PCM; returns every complete packet it unlocked. Incomplete
    /// remainder stays buffered for the next call.
    pub fn push(&mut self, chunk: &PcmChunk) -> Vec<AudioPacket> {
        self.buffer.extend_from_slice(&chunk.payload);
        let mut packets = Vec::new();
        while self.buffer.len() >= self.bytes_per_packet {
            let body: Vec<u8> = self.buffer.drain(..self.bytes_per_packet).collect();
            packets.push(self.emit(body));
        }
        packets
    }

    /// Stream end: resolve the buffered tail per policy. `Pad` zero-fills
    /// any remaining audio to a full packet; `Drop` discards it.
    pub fn finish(&mut self) -> Option<AudioPacket> {
        if self.buffer.is_empty() {
            return None;
        }
        let remaining = std::mem::take(&mut self.buffer);
        match self.tail_policy {
            TailPolicy::Drop => None,
            TailPolicy::Pad => {
                let mut body = remaining;
                body.resize(self.bytes_per_packet, 0);
                Some(self.emit(body))
            }
        }
    }

    /// CANCEL path: discard everything buffered without emitting.
    pub fn abort(&mut self) {
        self.buffer.clear();
        self.overlap.clear();
    }

    fn emit(&mut self, body: Vec<u8>) -> AudioPacket {
        // Prepend the previous packet's tail; the clock advances by the
        // body duration only.
        let payload = if self.overlap.is_empty() {
            body.clone()
        } else {
            let mut p = Vec::with_capacity(self.overlap.len() + body.len());
            p.extend_from_slice(&self.overlap);
            p.extend_from_slice(&body);
            p
        };
        let overlap_ms = if self.seq == 0 { 0 } else { self.overlap_ms };
        if self.bytes_per_overlap > 0 {
            self.overlap = body[body.len() - self.bytes_per_overlap..].to_vec();
        }

        let t_audio_ms = self.clock.advance(self.packet_ms as u64);
        let packet = AudioPacket {
            session_id: self.session_id.clone(),
            seq: self.seq,
            t_audio_ms,
            duration_ms: self.packet_ms,
            overlap_ms,
            codec: self.codec,
            payload,
        };
        self.seq += 1;
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packetizer(tail: TailPolicy) -> Packetizer {
        Packetizer::new("s", Arc::new(AudioClock::new()), 16_000, 20, 5, tail)
    }

    fn pcm(ms: usize) -> PcmChunk {
        PcmChunk::new(vec![0x11; ms * 32], 16_000)
    }

    #[test]
    fn packets_are_monotonic_in_seq_and_clock() {
        let mut p = packetizer(TailPolicy::Pad);
        let packets = p.push(&pcm(100));
        assert_eq!(packets.len(), 5);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.seq, i as u64);
            assert_eq!(packet.t_audio_ms, i as u64 * 20);
            assert_eq!(packet.duration_ms, 20);
        }
    }

    #[test]
    fn overlap_does_not_advance_clock() {
        let clock = Arc::new(AudioClock::new());
        let mut p = Packetizer::new("s", clock.clone(), 16_000, 20, 5, TailPolicy::Pad);
        let packets = p.push(&pcm(40));
        assert_eq!(packets.len(), 2);
        // Second packet payload includes 5 ms of duplicated audio...
        assert_eq!(packets[1].payload.len(), 640 + 160);
        assert_eq!(packets[1].overlap_ms, 5);
        // ...but the clock advanced by 20 ms per packet only.
        assert_eq!(clock.now_ms(), 40);
        assert_eq!(packets[1].t_audio_ms, 20);
    }

    #[test]
    fn first_packet_has_no_overlap() {
        let mut p = packetizer(TailPolicy::Pad);
        let packets = p.push(&pcm(20));
        assert_eq!(packets[0].overlap_ms, 0);
        assert_eq!(packets[0].payload.len(), 640);
    }

    #[test]
    fn incomplete_chunks_are_buffered_across_pushes() {
        let mut p = packetizer(TailPolicy::Pad);
        assert!(p.push(&pcm(12)).is_empty());
        let packets = p.push(&pcm(12));
        assert_eq!(packets.len(), 1);
        assert_eq!(p.next_seq(), 1);
    }

    #[test]
    fn pad_policy_pads_tail_to_full_packet() {
        let mut p = packetizer(TailPolicy::Pad);
        p.push(&pcm(20));
        p.push(&pcm(12)); // 12 ms tail
        let tail = p.finish().unwrap();
        assert_eq!(tail.payload.len(), 640 + 160);
        assert_eq!(tail.duration_ms, 20);
    }

    #[test]
    fn pad_policy_pads_even_a_short_tail() {
        let mut p = packetizer(TailPolicy::Pad);
        p.push(&pcm(20));
        p.push(&pcm(8)); // 8 ms tail, zero-filled to 20 ms
        let tail = p.finish().unwrap();
        assert_eq!(tail.duration_ms, 20);
        assert_eq!(tail.payload.len(), 640 + 160);
        // The zero fill is real silence, not dropped audio.
        assert!(tail.payload[640 + 160 - 2..] == [0, 0]);
    }

    #[test]
    fn drop_policy_never_pads() {
        let mut p = packetizer(TailPolicy::Drop);
        p.push(&pcm(15));
        assert!(p.finish().is_none());
    }

    #[test]
    fn abort_discards_in_flight_audio() {
        let clock = Arc::new(AudioClock::new());
        let mut p = Packetizer::new("s", clock.clone(), 16_000, 20, 5, TailPolicy::Pad);
        p.push(&pcm(20));
        p.push(&pcm(15));
        p.abort();
        assert!(p.finish().is_none());
        // Only the one emitted packet moved the clock.
        assert_eq!(clock.now_ms(), 20);
    }

    #[test]
    fn finish_on_empty_buffer_is_none() {
        let mut p = packetizer(TailPolicy::Pad);
        assert!(p.finish().is_none());
    }
}
