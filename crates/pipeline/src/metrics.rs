//! Latency and load metrics
//!
//! Per-session recorders are write-heavy and lock-light; a central
//! aggregator is flushed once per second by the backpressure sampler.
//! TTFA p95 is computed over a bounded window of recent samples.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Bounded reservoir of recent TTFA samples with percentile readout.
#[derive(Debug)]
pub struct TtfaRecorder {
    samples: Mutex<Vec<u64>>,
    capacity: usize,
}

impl Default for TtfaRecorder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TtfaRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, ttfa_ms: u64) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            samples.remove(0);
        }
        samples.push(ttfa_ms);
    }

    pub fn p95(&self) -> Option<u64> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }
}

/// Per-session counters, finalized into the analytics record at close.
#[derive(Debug, Default, Clone)]
pub struct SessionMetrics {
    pub turns_completed: u64,
    pub total_audio_ms: u64,
    pub ttfa_sum_ms: u64,
    pub ttfa_count: u64,
    pub barge_in_count: u64,
    pub context_rollover_count: u64,
    pub turn_timeouts: u64,
    pub stage_errors: u64,
}

impl SessionMetrics {
    pub fn avg_ttfa_ms(&self) -> f64 {
        if self.ttfa_count == 0 {
            return 0.0;
        }
        self.ttfa_sum_ms as f64 / self.ttfa_count as f64
    }

    pub fn record_ttfa(&mut self, ttfa_ms: u64) {
        self.ttfa_sum_ms += ttfa_ms;
        self.ttfa_count += 1;
    }
}

/// One worker's flushable counter delta.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerDelta {
    pub turns: u64,
    pub errors: u64,
}

/// Central aggregator fed by per-worker flushes and TTFA samples.
/// Read by the backpressure sampler once per second.
pub struct MetricsAggregator {
    ttfa: TtfaRecorder,
    anim_lag_ms: Mutex<u64>,
    workers: Mutex<HashMap<String, WorkerDelta>>,
    window: Mutex<WorkerDelta>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            ttfa: TtfaRecorder::default(),
            anim_lag_ms: Mutex::new(0),
            workers: Mutex::new(HashMap::new()),
            window: Mutex::new(WorkerDelta::default()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn record_ttfa(&self, ttfa_ms: u64) {
        self.ttfa.record(ttfa_ms);
    }

    pub fn ttfa_p95_ms(&self) -> Option<u64> {
        self.ttfa.p95()
    }

    pub fn report_animation_lag(&self, lag_ms: u64) {
        *self.anim_lag_ms.lock() = lag_ms;
    }

    pub fn animation_lag_ms(&self) -> u64 {
        *self.anim_lag_ms.lock()
    }

    /// Per-worker flush: merge this worker's delta since its last flush.
    pub fn flush_worker(&self, worker_id: &str, delta: WorkerDelta) {
        let mut workers = self.workers.lock();
        let slot = workers.entry(worker_id.to_string()).or_default();
        slot.turns += delta.turns;
        slot.errors += delta.errors;
        let mut window = self.window.lock();
        window.turns += delta.turns;
        window.errors += delta.errors;
    }

    /// Error rate over the current observation window, as a percentage,
    /// then reset the window. Called by the 1 Hz sampler.
    pub fn take_error_rate_pct(&self) -> f64 {
        let mut window = self.window.lock();
        let taken = *window;
        *window = WorkerDelta::default();
        if taken.turns == 0 {
            return 0.0;
        }
        (taken.errors as f64 / taken.turns as f64) * 100.0
    }
}
