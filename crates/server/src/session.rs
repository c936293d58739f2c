//! Session management and admission
//!
//! The manager owns the session table under a single writer lock: the
//! capacity check and the insert are one critical section, so the cap can
//! never be exceeded by racing admits. Under SESSION_QUEUE new sessions
//! wait in a bounded FIFO with a hard deadline; under SESSION_REJECT they
//! are refused with a retry hint.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use duplex_config::constants::{SESSION_QUEUE_DEADLINE_MS, SESSION_QUEUE_MAX_DEPTH};
use duplex_core::{Error, Result};
use duplex_pipeline::{Effects, SessionPipeline};

/// One admitted session.
pub struct Session {
    pub id: String,
    pub pipeline: Arc<SessionPipeline>,
    pub created_at: DateTime<Utc>,
    started: Instant,
    last_activity: RwLock<Instant>,
    active: RwLock<bool>,
    pub config_json: String,
}

impl Session {
    pub fn new(id: impl Into<String>, pipeline: Arc<SessionPipeline>, config_json: String) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            pipeline,
            created_at: Utc::now(),
            started: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            active: RwLock::new(true),
            config_json,
        })
    }

    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }

    pub fn is_active(&self) -> bool {
        *self.active.read()
    }

    /// Mark closed; idempotent.
    pub fn mark_closed(&self) {
        *self.active.write() = false;
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Session table plus admission queue.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    idle_timeout: Duration,
    queue: Mutex<VecDeque<oneshot::Sender<()>>>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            idle_timeout,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Atomic capacity check and insert.
    fn try_insert(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return false;
        }
        sessions.insert(session.id.clone(), session.clone());
        true
    }

    /// Admit a built session under the current backpressure effects.
    ///
    /// - SESSION_REJECT (or any level with `reject_sessions`): retryable
    ///   rejection, no queueing.
    /// - SESSION_QUEUE: bounded FIFO wait with a hard deadline, then one
    ///   more insert attempt.
    /// - otherwise: immediate atomic check-and-insert; a full table is a
    ///   rejection.
    pub async fn admit(
        &self,
        session: Arc<Session>,
        effects: &Effects,
    ) -> Result<Arc<Session>> {
        if effects.reject_sessions {
            return Err(Error::Admission {
                message: "system overloaded".to_string(),
                retry_after_s: 2,
            });
        }

        if self.try_insert(&session) {
            return Ok(session);
        }

        if !effects.queue_sessions {
            // At capacity outside queueing mode: sweep once, retry, reject.
            self.sweep_idle(self.idle_timeout).await;
            if self.try_insert(&session) {
                return Ok(session);
            }
            return Err(Error::Admission {
                message: "capacity exhausted".to_string(),
                retry_after_s: 1,
            });
        }

        // Queue path: bounded depth, hard deadline.
        let rx = {
            let mut queue = self.queue.lock();
            if queue.len() >= SESSION_QUEUE_MAX_DEPTH {
                return Err(Error::Admission {
                    message: "admission queue full".to_string(),
                    retry_after_s: 2,
                });
            }
            let (tx, rx) = oneshot::channel();
            queue.push_back(tx);
            rx
        };

        let deadline = Duration::from_millis(SESSION_QUEUE_DEADLINE_MS);
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(())) if self.try_insert(&session) => Ok(session),
            Ok(Ok(())) => Err(Error::Admission {
                message: "capacity exhausted after queue wait".to_string(),
                retry_after_s: 2,
            }),
            _ => Err(Error::Admission {
                message: "admission queue deadline elapsed".to_string(),
                retry_after_s: 2,
            }),
        }
    }

    /// Remove a session from the table; wakes one queued admit. Returns
    /// the removed session for asynchronous teardown. Idempotent.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            session.mark_closed();
            self.wake_one_queued();
            tracing::info!(session_id = %session.id, "session removed");
        }
        removed
    }

    fn wake_one_queued(&self) {
        let waiter = self.queue.lock().pop_front();
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }

    /// Close and drop sessions idle past `timeout`.
    pub async fn sweep_idle(&self, timeout: Duration) -> usize {
        let expired: Vec<Arc<Session>> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|s| s.is_expired(timeout))
                .cloned()
                .collect()
        };
        let mut removed = 0;
        for session in expired {
            if let Some(session) = self.remove(&session.id) {
                session.pipeline.close().await;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, remaining = self.count(), "idle session sweep");
        }
        removed
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_config::Settings;
    use duplex_pipeline::{
        BackpressureLevel, EngineSet, MetricsAggregator, PipelineConfig, ScriptedAsr,
        ScriptedLlm, SilenceTts,
    };
    use tokio::sync::watch;

    fn make_session(id: &str) -> Arc<Session> {
        let settings = Settings::default();
        let config = PipelineConfig::from_settings(&settings, id, "prompt");
        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("hi")),
            llm: Arc::new(ScriptedLlm::new("hello")),
            tts: Arc::new(SilenceTts::default()),
            animation: None,
        };
        let (_tx, effects_rx) = watch::channel(Effects::for_level(BackpressureLevel::Normal));
        let pipeline = SessionPipeline::new(
            config,
            engines,
            effects_rx,
            MetricsAggregator::shared(),
            None,
        )
        .unwrap();
        Session::new(id, pipeline, "{}".to_string())
    }

    fn normal() -> Effects {
        Effects::for_level(BackpressureLevel::Normal)
    }

    #[tokio::test]
    async fn admission_respects_cap() {
        let manager = SessionManager::new(3, Duration::from_secs(300));
        for i in 0..3 {
            manager
                .admit(make_session(&format!("s{i}")), &normal())
                .await
                .unwrap();
        }
        assert_eq!(manager.count(), 3);
        let err = manager.admit(make_session("s3"), &normal()).await;
        assert!(matches!(err, Err(Error::Admission { .. })));
        assert_eq!(manager.count(), 3);
    }

    #[tokio::test]
    async fn reject_effects_refuse_immediately() {
        let manager = SessionManager::new(10, Duration::from_secs(300));
        let effects = Effects::for_level(BackpressureLevel::SessionReject);
        let err = manager.admit(make_session("s0"), &effects).await;
        assert!(matches!(err, Err(Error::Admission { .. })));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn queued_admit_proceeds_when_slot_frees() {
        let manager = Arc::new(SessionManager::new(1, Duration::from_secs(300)));
        manager.admit(make_session("first"), &normal()).await.unwrap();

        let queue_effects = Effects::for_level(BackpressureLevel::SessionQueue);
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.admit(make_session("second"), &queue_effects).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let session = manager.remove("first").unwrap();
        session.pipeline.close().await;

        let admitted = waiter.await.unwrap();
        assert!(admitted.is_ok());
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_admit_times_out_at_deadline() {
        let manager = Arc::new(SessionManager::new(1, Duration::from_secs(300)));
        manager.admit(make_session("first"), &normal()).await.unwrap();

        let queue_effects = Effects::for_level(BackpressureLevel::SessionQueue);
        let result = manager.admit(make_session("second"), &queue_effects).await;
        assert!(matches!(result, Err(Error::Admission { .. })));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let manager = SessionManager::new(4, Duration::from_secs(300));
        manager.admit(make_session("s0"), &normal()).await.unwrap();
        assert!(manager.remove("s0").is_some());
        assert!(manager.remove("s0").is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let manager = SessionManager::new(4, Duration::from_secs(300));
        manager.admit(make_session("s0"), &normal()).await.unwrap();
        manager.admit(make_session("s1"), &normal()).await.unwrap();
        manager.get("s1").unwrap().touch();
        let removed = manager.sweep_idle(Duration::from_millis(0)).await;
        // Zero timeout expires everything not touched this instant.
        assert!(removed >= 1);
    }
}
