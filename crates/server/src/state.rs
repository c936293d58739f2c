//! Application state
//!
//! The composition root: one struct owns the session manager, the
//! backpressure controller, the metrics aggregator, the analytics sink,
//! the shared prefix cache and the engine factories. Everything downstream
//! receives references; there are no process-global singletons.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use duplex_config::constants::BACKPRESSURE_SAMPLE_INTERVAL_MS;
use duplex_config::Settings;
use duplex_core::Result;
use duplex_llm::PrefixCache;
use duplex_pipeline::{
    BackpressureController, BackpressureLevel, Effects, EngineSet, MetricsAggregator,
    MetricsSnapshot, PipelineConfig, SessionPipeline,
};

use crate::analytics::{AnalyticsSink, InMemoryAnalytics, SessionRecord};
use crate::session::{Session, SessionManager};

/// Reports GPU memory pressure; the default probe reports none.
pub trait ResourceProbe: Send + Sync {
    fn vram_pct(&self) -> f64;
}

struct NoopProbe;

impl ResourceProbe for NoopProbe {
    fn vram_pct(&self) -> f64 {
        0.0
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    pub engines: EngineSet,
    pub aggregator: Arc<MetricsAggregator>,
    pub analytics: Arc<dyn AnalyticsSink>,
    pub prefix_cache: Arc<PrefixCache>,
    backpressure: Arc<Mutex<BackpressureController>>,
    effects_tx: Arc<watch::Sender<Effects>>,
    probe: Arc<dyn ResourceProbe>,
}

impl AppState {
    pub fn new(config: Settings, engines: EngineSet) -> Self {
        let (effects_tx, _) =
            watch::channel(Effects::for_level(BackpressureLevel::Normal));
        let idle_timeout = Duration::from_secs(config.session.session_idle_timeout_s);
        Self {
            sessions: Arc::new(SessionManager::new(
                config.session.max_concurrent_sessions,
                idle_timeout,
            )),
            config: Arc::new(config),
            engines,
            aggregator: MetricsAggregator::shared(),
            analytics: Arc::new(InMemoryAnalytics::new()),
            prefix_cache: Arc::new(PrefixCache::new(64)),
            backpressure: Arc::new(Mutex::new(BackpressureController::new())),
            effects_tx: Arc::new(effects_tx),
            probe: Arc::new(NoopProbe),
        }
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn effects(&self) -> Effects {
        *self.effects_tx.borrow()
    }

    pub fn backpressure_level(&self) -> BackpressureLevel {
        self.backpressure.lock().level()
    }

    /// Build a session and its pipeline for admission.
    pub fn build_session(&self, system_prompt: &str) -> Result<Arc<Session>> {
        let id = uuid::Uuid::new_v4().to_string();
        let prefix_key = if self.config.llm.llm_prefix_caching {
            let (key, _) = self.prefix_cache.get_or_insert(system_prompt);
            Some(key)
        } else {
            None
        };
        let pipeline_config = PipelineConfig::from_settings(&self.config, &id, system_prompt);
        let pipeline = SessionPipeline::new(
            pipeline_config,
            self.engines.clone(),
            self.effects_tx.subscribe(),
            self.aggregator.clone(),
            prefix_key,
        )?;
        let config_json = serde_json::to_string(&*self.config).unwrap_or_default();
        Ok(Session::new(id, pipeline, config_json))
    }

    /// Close a session: pipeline teardown plus the terminal analytics row.
    pub async fn close_session(&self, session: Arc<Session>) {
        session.pipeline.close().await;
        let metrics = session.pipeline.metrics();
        self.analytics
            .record_session(SessionRecord {
                session_id: session.id.clone(),
                created_at: session.created_at,
                ended_at: Some(chrono::Utc::now()),
                state: session.pipeline.state().name().to_string(),
                config_json: session.config_json.clone(),
                turns_completed: metrics.turns_completed,
                total_audio_ms: metrics.total_audio_ms,
                avg_ttfa_ms: metrics.avg_ttfa_ms(),
                barge_in_count: metrics.barge_in_count,
                context_rollover_count: metrics.context_rollover_count,
            })
            .await;
    }

    /// One backpressure observation window: snapshot live metrics, run the
    /// ladder, publish effects and notify sessions on level changes.
    pub async fn sample_backpressure(&self) {
        let snapshot = MetricsSnapshot {
            ttfa_p95_ms: self.aggregator.ttfa_p95_ms().unwrap_or(0),
            vram_pct: self.probe.vram_pct(),
            anim_lag_ms: self.aggregator.animation_lag_ms(),
            active_sessions: self.sessions.count(),
            max_sessions: self.sessions.max_sessions(),
            error_rate_pct: self.aggregator.take_error_rate_pct(),
        };
        let (old_level, new_level) = {
            let mut controller = self.backpressure.lock();
            let old = controller.level();
            let new = controller.observe(&snapshot);
            (old, new)
        };
        let effects = Effects::for_level(new_level);
        let _ = self.effects_tx.send(effects);

        if old_level != new_level {
            for id in self.sessions.list() {
                if let Some(session) = self.sessions.get(&id) {
                    session.pipeline.notify_degraded(new_level.name());
                }
            }
        }
    }

    /// Spawn the 1 Hz backpressure sampler and the idle sweeper.
    pub fn spawn_background_tasks(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(
                BACKPRESSURE_SAMPLE_INTERVAL_MS,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                state.sample_backpressure().await;
            }
        });

        let state = self.clone();
        tokio::spawn(async move {
            let timeout = state.sessions.idle_timeout();
            let mut ticker = tokio::time::interval(timeout.max(Duration::from_secs(30)) / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                state.sessions.sweep_idle(timeout).await;
            }
        });
    }
}
