//! Session clocks
//!
//! Two time sources per session, never mixed:
//!
//! - [`AudioClock`]: the packet timestamp authority. Starts at 0 on session
//!   open and advances ONLY when a packet is emitted, by exactly the packet
//!   duration. Overlap bytes never advance it. Published to the animation
//!   path so blendshape frames can reference the same timeline.
//! - [`SessionEpoch`]: server-monotonic milliseconds since session open,
//!   used for event timestamps (VAD observations, cancel events, latency
//!   accounting). Wall-clock time is never used for either.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// The audio timestamp authority for one session.
#[derive(Debug, Default)]
pub struct AudioClock {
    t_audio_ms: AtomicU64,
}

impl AudioClock {
    pub fn new() -> Self {
        Self {
            t_audio_ms: AtomicU64::new(0),
        }
    }

    /// Current audio time. Changes only through [`AudioClock::advance`].
    pub fn now_ms(&self) -> u64 {
        self.t_audio_ms.load(Ordering::Acquire)
    }

    /// Advance by one emitted packet and return the timestamp that packet
    /// carries (the pre-advance reading, so the first packet is t=0).
    pub fn advance(&self, duration_ms: u64) -> u64 {
        self.t_audio_ms.fetch_add(duration_ms, Ordering::AcqRel)
    }
}

/// Monotonic event-time reference for one session.
#[derive(Debug, Clone, Copy)]
pub struct SessionEpoch {
    started: Instant,
}

impl Default for SessionEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionEpoch {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Milliseconds since session open on the server monotonic clock.
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
