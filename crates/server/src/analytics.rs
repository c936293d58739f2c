//! Analytics sink
//!
//! Append-only per-session records and event log. Storage is a sink
//! behind a narrow trait; terminal session fields are written exactly once
//! at close.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Per-session summary row. Terminal fields (`ended_at`, final `state`)
/// are set once when the session closes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub state: String,
    pub config_json: String,
    pub turns_completed: u64,
    pub total_audio_ms: u64,
    pub avg_ttfa_ms: f64,
    pub barge_in_count: u64,
    pub context_rollover_count: u64,
}

/// Per-event log row.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub session_id: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub t_audio_ms: u64,
}

/// Append-only analytics boundary.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn record_session(&self, record: SessionRecord);
    async fn record_event(&self, record: EventRecord);
}

/// Default in-process sink; production deployments swap in a durable one.
#[derive(Default)]
pub struct InMemoryAnalytics {
    sessions: Mutex<Vec<SessionRecord>>,
    events: Mutex<Vec<EventRecord>>,
}

impl InMemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.lock().clone()
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl AnalyticsSink for InMemoryAnalytics {
    async fn record_session(&self, record: SessionRecord) {
        let mut sessions = self.sessions.lock();
        // Terminal update replaces the open row for the same session.
        if let Some(existing) = sessions
            .iter_mut()
            .find(|r| r.session_id == record.session_id)
        {
            if existing.ended_at.is_none() {
                *existing = record;
            }
        } else {
            sessions.push(record);
        }
    }

    async fn record_event(&self, record: EventRecord) {
        self.events.lock().push(record);
    }
}
