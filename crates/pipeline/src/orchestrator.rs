//! Session pipeline orchestrator
//!
//! Owns one session's turn lifecycle: inbound audio through VAD and ASR,
//! endpoint-triggered LLM generation, streaming TTS, the audio-clocked
//! packetizer and the animation tee. Stages run as independent tasks over
//! bounded channels, coordinated by the turn's shared cancellation token.
//! The FSM lock is never held across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use duplex_config::settings::TailPolicy;
use duplex_config::Settings;
use duplex_core::{
    AsrEvent, AsrSession, CancelReason, CancellationToken, GenerateRequest, Message, PcmChunk,
    PipelineEvent, Result, Role, StageKind, TtsRequest,
};
use duplex_llm::{rollover_if_needed, ContextBuffer, LlmSummarizer, PinnedPrefix, RolloverOutcome};

use crate::adapters::{canned_unavailable_pcm, with_retry_once};
use crate::animation::{AnimationPolicy, AnimationScheduler};
use crate::backpressure::Effects;
use crate::cancellation::CancellationController;
use crate::clock::{AudioClock, SessionEpoch};
use crate::metrics::{MetricsAggregator, SessionMetrics};
use crate::packetizer::Packetizer;
use crate::signals::{SignalsTracker, TurnReport};
use crate::state_machine::{TransitionRecord, TurnState, TurnStateMachine};
use crate::turn::{Turn, TurnOutcome};
use crate::vad::{BargeInDetector, InboundFrame, VadConfig, VadEvent};

/// Capacity of inter-stage channels; small so cancellation surfaces fast.
const STAGE_CHANNEL_CAPACITY: usize = 8;

/// Duration of the canned spoken fallback.
const FALLBACK_AUDIO_MS: u64 = 600;

/// The engine adapters a session runs against. Factories hand these to the
/// pipeline at construction; adapters never reach each other directly.
#[derive(Clone)]
pub struct EngineSet {
    pub asr: Arc<dyn duplex_core::AsrEngine>,
    pub llm: Arc<dyn duplex_core::LanguageModel>,
    pub tts: Arc<dyn duplex_core::TtsEngine>,
    pub animation: Option<Arc<dyn duplex_core::AnimationEngine>>,
}

/// Per-session pipeline configuration, derived from settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub session_id: String,
    pub system_prompt: String,
    pub sample_rate: u32,
    pub packet_ms: u32,
    pub overlap_ms: u32,
    pub tail_policy: TailPolicy,
    pub animation_enabled: bool,
    pub animation: AnimationPolicy,
    pub pre_first_audio_timeout_ms: u64,
    pub max_context_tokens: u32,
    pub llm_max_tokens: u32,
    pub temperature: f32,
    pub prefix_caching: bool,
    pub vad: VadConfig,
}

impl PipelineConfig {
    pub fn from_settings(
        settings: &Settings,
        session_id: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            system_prompt: system_prompt.into(),
            sample_rate: settings.audio.sample_rate,
            packet_ms: settings.audio.audio_packet_ms,
            overlap_ms: settings.audio.audio_overlap_ms,
            tail_policy: settings.audio.tail_policy,
            animation_enabled: settings.animation.animation_enabled,
            animation: AnimationPolicy {
                fps: settings.animation.fps,
                heartbeat_gap_ms: duplex_config::constants::ANIMATION_HEARTBEAT_GAP_MS,
                slow_freeze_ms: settings.animation.animation_slow_freeze_ms,
                drop_if_lag_ms: settings.animation.animation_drop_if_lag_ms,
            },
            pre_first_audio_timeout_ms: settings.latency.turn_pre_first_audio_timeout_ms,
            max_context_tokens: settings.llm.llm_max_context_tokens,
            llm_max_tokens: settings.llm.max_tokens,
            temperature: settings.llm.temperature,
            prefix_caching: settings.llm.llm_prefix_caching,
            vad: VadConfig::default(),
        }
    }
}

/// An open listening ASR stream: audio is pushed into `feed`; the final
/// transcript arrives on `final_rx` once the feed is closed.
struct ListeningAsr {
    feed: mpsc::Sender<PcmChunk>,
    final_rx: oneshot::Receiver<(String, f32)>,
}

/// One session's end-to-end pipeline.
pub struct SessionPipeline {
    config: PipelineConfig,
    engines: EngineSet,
    fsm: TurnStateMachine,
    clock: Arc<AudioClock>,
    epoch: SessionEpoch,
    cancel_ctrl: CancellationController,
    context: tokio::sync::Mutex<ContextBuffer>,
    vad: Mutex<BargeInDetector>,
    events: broadcast::Sender<PipelineEvent>,
    effects_rx: watch::Receiver<Effects>,
    yield_tx: watch::Sender<bool>,
    metrics: Mutex<SessionMetrics>,
    aggregator: Arc<MetricsAggregator>,
    signals: Mutex<SignalsTracker>,
    turn_counter: AtomicU64,
    current_turn: Mutex<Option<Arc<Turn>>>,
    listening: tokio::sync::Mutex<Option<ListeningAsr>>,
    prefix_cache_key: Option<u64>,
    /// Weak self-handle so stage tasks can be spawned from `&self`
    /// without a reference cycle.
    self_ref: Weak<SessionPipeline>,
}

impl SessionPipeline {
    pub fn new(
        config: PipelineConfig,
        engines: EngineSet,
        effects_rx: watch::Receiver<Effects>,
        aggregator: Arc<MetricsAggregator>,
        prefix_cache_key: Option<u64>,
    ) -> Result<Arc<Self>> {
        let context = ContextBuffer::new(
            PinnedPrefix::new(&config.system_prompt),
            config.max_context_tokens,
        )?;
        let epoch = SessionEpoch::new();
        let (events, _) = broadcast::channel(1000);
        let (yield_tx, _) = watch::channel(false);
        let vad = BargeInDetector::new(config.vad.clone());
        Ok(Arc::new_cyclic(|self_ref| Self {
            cancel_ctrl: CancellationController::new(epoch),
            context: tokio::sync::Mutex::new(context),
            vad: Mutex::new(vad),
            events,
            effects_rx,
            yield_tx,
            metrics: Mutex::new(SessionMetrics::default()),
            aggregator,
            signals: Mutex::new(SignalsTracker::new(0)),
            turn_counter: AtomicU64::new(0),
            current_turn: Mutex::new(None),
            listening: tokio::sync::Mutex::new(None),
            prefix_cache_key,
            fsm: TurnStateMachine::new(),
            clock: Arc::new(AudioClock::new()),
            epoch,
            config,
            engines,
            self_ref: self_ref.clone(),
        }))
    }

    /// Strong handle for task spawning. Always succeeds while any caller
    /// holds the pipeline, which is the only way to be inside a method.
    fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> TurnState {
        self.fsm.state()
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn metrics(&self) -> SessionMetrics {
        self.metrics.lock().clone()
    }

    pub fn audio_clock_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn epoch_now_ms(&self) -> u64 {
        self.epoch.now_ms()
    }

    /// Session open: IDLE → LISTENING, VAD armed, ASR stream started.
    pub async fn open(&self) -> Result<()> {
        let record = self
            .fsm
            .transition(TurnState::Listening, self.epoch.now_ms(), "session open")?;
        self.emit_transition(&record);
        self.start_listening().await?;
        Ok(())
    }

    /// Session close: cancel anything in flight, release streams, → IDLE.
    /// Idempotent.
    pub async fn close(&self) {
        if self.fsm.state() == TurnState::Idle {
            return;
        }
        let turn = self.current_turn.lock().clone();
        if let Some(turn) = turn {
            let now = self.epoch.now_ms();
            self.cancel_ctrl
                .cancel(&turn.token, CancelReason::UserStop, now)
                .await;
            turn.finish(TurnOutcome::Cancelled(CancelReason::UserStop), now);
            *self.current_turn.lock() = None;
        }
        *self.listening.lock().await = None;
        if let Ok(record) = self
            .fsm
            .transition(TurnState::Idle, self.epoch.now_ms(), "session close")
        {
            self.emit_transition(&record);
        }
    }

    /// Explicit user STOP on the control channel.
    pub async fn user_stop(&self) {
        let t_event_ms = self.epoch.now_ms();
        self.cancel_current(CancelReason::UserStop, t_event_ms).await;
    }

    /// Server-level degradation notice, forwarded to the client; also
    /// flips the animation yield gate.
    pub fn notify_degraded(&self, level: &str) {
        let _ = self.events.send(PipelineEvent::Degraded {
            level: level.to_string(),
        });
        let drop_animation = self.effects_rx.borrow().drop_animation;
        let _ = self.yield_tx.send(drop_animation);
    }

    /// Inbound audio entry point. Runs VAD every frame and feeds ASR while
    /// listening. The stricter barge-in persistence threshold applies
    /// whenever a turn is in flight, but a barge-in event only interrupts
    /// the agent while it is SPEAKING.
    pub async fn process_audio(&self, frame: InboundFrame) -> Result<()> {
        let state = self.fsm.state();
        let agent_busy = matches!(state, TurnState::Thinking | TurnState::Speaking);
        let event = self.vad.lock().process(&frame, agent_busy);

        if state == TurnState::Listening {
            let feed = {
                let guard = self.listening.lock().await;
                guard.as_ref().map(|l| l.feed.clone())
            };
            if let Some(feed) = feed {
                // Bounded send: ASR backpressure slows intake, never drops.
                let _ = feed.send(frame.pcm.clone()).await;
            }
        }

        match event {
            Some(VadEvent::SpeechStart { t_event_ms }) => {
                if state == TurnState::Idle {
                    if let Ok(record) =
                        self.fsm
                            .transition(TurnState::Listening, t_event_ms, "user audio start")
                    {
                        self.emit_transition(&record);
                        self.start_listening().await?;
                    }
                }
            }
            Some(VadEvent::EndpointDetected { t_event_ms }) => {
                if state == TurnState::Listening {
                    self.handle_endpoint(t_event_ms).await;
                }
            }
            Some(VadEvent::BargeIn { t_event_ms }) => {
                // Barge-in only interrupts SPEAKING; user speech during
                // THINKING is not a cancel event. Reset the detector so a
                // continued utterance can re-trigger once speech starts.
                if state == TurnState::Speaking {
                    self.cancel_current(CancelReason::UserBargeIn, t_event_ms)
                        .await;
                } else {
                    self.vad.lock().reset();
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Open a fresh ASR stream and forward its partials to subscribers.
    async fn start_listening(&self) -> Result<()> {
        let AsrSession { feed, mut events } = self
            .engines
            .asr
            .start(&self.config.session_id, self.config.sample_rate)
            .await?;
        let (final_tx, final_rx) = oneshot::channel();
        let broadcast_tx = self.events.clone();
        tokio::spawn(async move {
            let mut final_tx = Some(final_tx);
            while let Some(event) = events.recv().await {
                match event {
                    AsrEvent::Partial { text, .. } => {
                        let _ = broadcast_tx.send(PipelineEvent::PartialTranscript { text });
                    }
                    AsrEvent::Final {
                        text, confidence, ..
                    } => {
                        if let Some(tx) = final_tx.take() {
                            let _ = tx.send((text, confidence));
                        }
                    }
                }
            }
        });
        *self.listening.lock().await = Some(ListeningAsr { feed, final_rx });
        Ok(())
    }

    /// Endpoint detected: finalize ASR, transition to THINKING, launch the
    /// turn on its own task so inbound audio keeps flowing.
    async fn handle_endpoint(&self, endpoint_ms: u64) {
        let listening = self.listening.lock().await.take();
        let Some(listening) = listening else {
            return;
        };
        drop(listening.feed); // closing the feed finalizes the utterance
        let (user_text, confidence) =
            match tokio::time::timeout(Duration::from_secs(1), listening.final_rx).await {
                Ok(Ok(result)) => result,
                _ => (String::new(), 0.0),
            };

        if user_text.trim().is_empty() {
            tracing::debug!(
                session_id = %self.config.session_id,
                "empty transcript, staying in LISTENING"
            );
            let _ = self.start_listening().await;
            return;
        }

        let _ = self.events.send(PipelineEvent::FinalTranscript {
            text: user_text.clone(),
            endpoint_ms,
        });

        let record = match self.fsm.transition_if(
            TurnState::Listening,
            TurnState::Thinking,
            endpoint_ms,
            "endpoint detected",
        ) {
            Ok(Some(record)) => record,
            _ => return, // another transition won the race
        };
        self.emit_transition(&record);

        let Some(pipeline) = self.strong() else {
            return;
        };
        tokio::spawn(async move {
            pipeline.run_turn(user_text, confidence, endpoint_ms).await;
        });
    }

    /// Fire the current turn's token and drive the FSM through
    /// INTERRUPTED back to LISTENING. Coalesces duplicate cancels.
    async fn cancel_current(&self, reason: CancelReason, t_event_ms: u64) {
        let turn = self.current_turn.lock().clone();
        let Some(turn) = turn else {
            return;
        };
        let Some(report) = self
            .cancel_ctrl
            .cancel(&turn.token, reason, t_event_ms)
            .await
        else {
            return; // already cancelled, coalesced
        };

        if reason == CancelReason::UserBargeIn {
            self.metrics.lock().barge_in_count += 1;
        }
        if let Some(latency_ms) = report.bargein_latency_ms {
            let _ = self
                .events
                .send(PipelineEvent::BargeInAck { latency_ms, reason });
        }

        let now = self.epoch.now_ms();
        if let Ok(Some(record)) =
            self.fsm
                .transition_if(TurnState::Speaking, TurnState::Interrupted, now, "cancel")
        {
            self.emit_transition(&record);
            if let Ok(record) = self.fsm.transition(
                TurnState::Listening,
                self.epoch.now_ms(),
                "cancel complete",
            ) {
                self.emit_transition(&record);
            }
        } else if let Ok(Some(record)) = self.fsm.transition_if(
            TurnState::Thinking,
            TurnState::Listening,
            now,
            "cancel before speech",
        ) {
            // Reached only for explicit USER_STOP during THINKING;
            // barge-in is gated on SPEAKING at the dispatch site.
            self.emit_transition(&record);
        }

        turn.finish(TurnOutcome::Cancelled(reason), self.epoch.now_ms());
        self.record_turn_signals(&turn, 1.0, true);
        *self.current_turn.lock() = None;
        self.vad.lock().reset();
        if self.fsm.state() == TurnState::Listening {
            let _ = self.start_listening().await;
        }
    }

    fn emit_transition(&self, record: &TransitionRecord) {
        let _ = self.events.send(PipelineEvent::StateChanged {
            from: record.from.name(),
            to: record.to.name(),
            reason: record.reason.clone(),
        });
    }

    fn effects(&self) -> Effects {
        *self.effects_rx.borrow()
    }

    /// Drive one turn end to end. Entered in THINKING.
    async fn run_turn(
        &self,
        user_text: String,
        asr_confidence: f32,
        endpoint_ms: u64,
    ) {
        let turn_id = self.turn_counter.fetch_add(1, Ordering::SeqCst);
        let turn = Turn::new(
            turn_id,
            self.config.session_id.clone(),
            Some(user_text.clone()),
            endpoint_ms,
        );
        let effects = self.effects();
        let animate = self.config.animation_enabled
            && self.engines.animation.is_some()
            && !effects.drop_animation;
        CancellationController::arm(&turn.token, animate);
        *self.current_turn.lock() = Some(turn.clone());
        self.signals.lock().record_user_text(&user_text);

        // Context admission: append the user turn and roll over if needed.
        let request = match self.prepare_request(&user_text, &effects).await {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "turn rejected at context admission");
                self.metrics.lock().stage_errors += 1;
                let _ = self.events.send(PipelineEvent::Error {
                    message: e.to_string(),
                });
                self.speak_fallback(&turn).await;
                self.finish_turn(&turn, TurnOutcome::Failed, asr_confidence, false)
                    .await;
                return;
            }
        };

        // Pre-first-audio watchdog: a scheduled cancellation with reason
        // TIMEOUT, disarmed by the first emitted packet.
        let watchdog = {
            let turn = turn.clone();
            let timeout_ms = self.config.pre_first_audio_timeout_ms;
            let epoch = self.epoch;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                if !turn.has_first_audio() {
                    turn.token.fire(CancelReason::Timeout, epoch.now_ms());
                }
            })
        };

        let outcome = self.drive_stages(&turn, request, animate).await;
        watchdog.abort();

        match (outcome, turn.token.event()) {
            (Ok(response), None) if !response.is_empty() || turn.has_first_audio() => {
                {
                    let mut context = self.context.lock().await;
                    if let Err(e) = context.push_assistant(&response) {
                        tracing::warn!(error = %e, "assistant turn dropped from context");
                    }
                }
                self.finish_turn(&turn, TurnOutcome::Completed, asr_confidence, false)
                    .await;
            }
            (Ok(_), None) => {
                // Stream died silently before any output: spoken fallback.
                tracing::warn!(turn_id, "empty generation, speaking fallback");
                self.metrics.lock().stage_errors += 1;
                self.speak_fallback(&turn).await;
                self.finish_turn(&turn, TurnOutcome::Failed, asr_confidence, false)
                    .await;
            }
            (_, Some(event)) if event.reason == CancelReason::Timeout => {
                self.cancel_ctrl
                    .settle(&turn.token, CancelReason::Timeout, event.t_event_ms)
                    .await;
                self.metrics.lock().turn_timeouts += 1;
                let _ = self.events.send(PipelineEvent::TurnTimeout { turn_id });
                tracing::warn!(turn_id, "turn_timeout: no first audio within budget");
                let now = self.epoch.now_ms();
                let settled = self
                    .fsm
                    .transition_if(TurnState::Thinking, TurnState::Listening, now, "turn_timeout")
                    .ok()
                    .flatten()
                    .or_else(|| {
                        self.fsm
                            .transition_if(
                                TurnState::Speaking,
                                TurnState::Listening,
                                now,
                                "turn_timeout",
                            )
                            .ok()
                            .flatten()
                    });
                if let Some(record) = settled {
                    self.emit_transition(&record);
                }
                self.finish_turn(&turn, TurnOutcome::TimedOut, asr_confidence, true)
                    .await;
            }
            (_, Some(event)) => {
                // Barge-in or user stop: cancel_current drives the FSM,
                // signals and listening restart.
                turn.finish(TurnOutcome::Cancelled(event.reason), self.epoch.now_ms());
            }
            (Err(e), None) => {
                tracing::error!(error = %e, "turn failed before completion");
                self.metrics.lock().stage_errors += 1;
                let _ = self.events.send(PipelineEvent::Error {
                    message: e.to_string(),
                });
                if !turn.has_first_audio() {
                    self.speak_fallback(&turn).await;
                }
                self.finish_turn(&turn, TurnOutcome::Failed, asr_confidence, false)
                    .await;
            }
        }
    }

    /// Compose the LLM request under current backpressure effects.
    async fn prepare_request(
        &self,
        user_text: &str,
        effects: &Effects,
    ) -> Result<GenerateRequest> {
        let mut context = self.context.lock().await;
        // Roll over before the append if earlier turns already crossed the
        // threshold, and again after it; both paths hold the 5 s deadline.
        if context.needs_rollover() {
            let summarizer = LlmSummarizer::new(self.engines.llm.clone());
            if rollover_if_needed(&mut context, &summarizer).await? == RolloverOutcome::Summarized
            {
                self.metrics.lock().context_rollover_count += 1;
            }
        }
        context.push_user(user_text)?;
        if context.needs_rollover() {
            let summarizer = LlmSummarizer::new(self.engines.llm.clone());
            if rollover_if_needed(&mut context, &summarizer).await? == RolloverOutcome::Summarized
            {
                self.metrics.lock().context_rollover_count += 1;
            }
        }

        let mut messages = context.to_messages();
        drop(context);

        let signals = self.signals.lock().signals(self.epoch.now_ms());
        if effects.max_tokens_override.is_some() || signals.should_reduce_verbosity {
            messages.push(Message::new(Role::System, "Keep this reply brief.", 6));
        }

        let max_tokens = effects
            .max_tokens_override
            .unwrap_or(self.config.llm_max_tokens)
            .min(self.config.llm_max_tokens);

        let mut request = GenerateRequest::new(messages).with_max_tokens(max_tokens);
        request.temperature = self.config.temperature;
        request.verbosity = effects.verbosity;
        request.tools_enabled = !effects.tools_disabled;
        request.prefix_cache_key = if self.config.prefix_caching {
            self.prefix_cache_key
        } else {
            None
        };
        Ok(request)
    }

    /// Launch LLM → TTS → packetizer (+ animation tee) and wait for the
    /// stage tasks to settle. Returns the full response text on a clean run.
    async fn drive_stages(
        &self,
        turn: &Arc<Turn>,
        request: GenerateRequest,
        animate: bool,
    ) -> Result<String> {
        let token = turn.token.clone();
        let Some(pipeline_handle) = self.strong() else {
            return Ok(String::new());
        };

        // LLM stream, one retry for connection errors inside the turn.
        let llm = self.engines.llm.clone();
        let llm_stream = with_retry_once(
            || {
                let llm = llm.clone();
                let request = request.clone();
                async move { llm.generate(request).await }
            },
            Duration::from_millis(100),
        )
        .await;
        let mut llm_stream = match llm_stream {
            Ok(stream) => stream,
            Err(e) => {
                token.acknowledge(StageKind::Llm, self.epoch.now_ms());
                self.ack_unused_stages(&token, animate, true);
                return Err(e);
            }
        };

        let tts_session = match self
            .engines
            .tts
            .start(TtsRequest {
                session_id: self.config.session_id.clone(),
                sample_rate: self.config.sample_rate,
                voice: None,
            })
            .await
        {
            Ok(session) => session,
            Err(e) => {
                llm_stream.cancel();
                token.acknowledge(StageKind::Llm, self.epoch.now_ms());
                self.ack_unused_stages(&token, animate, true);
                return Err(e);
            }
        };

        let (pcm_tx, pcm_rx) = mpsc::channel::<PcmChunk>(STAGE_CHANNEL_CAPACITY);
        let anim_pcm_tx = if animate {
            Some(self.spawn_animation(turn).await)
        } else {
            None
        };

        // Stage task: LLM tokens → TTS text; first token flips the FSM.
        let llm_task = {
            let pipeline = pipeline_handle.clone();
            let token = token.clone();
            let turn = turn.clone();
            let text_in = tts_session.text_in;
            tokio::spawn(async move {
                let mut response = String::new();
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            llm_stream.cancel();
                            token.acknowledge(StageKind::Llm, pipeline.epoch.now_ms());
                            return response;
                        }
                        chunk = llm_stream.recv() => {
                            match chunk {
                                Some(chunk) => {
                                    let now = pipeline.epoch.now_ms();
                                    if turn.mark_first_token(now) {
                                        if let Ok(Some(record)) = pipeline.fsm.transition_if(
                                            TurnState::Thinking,
                                            TurnState::Speaking,
                                            now,
                                            "first token",
                                        ) {
                                            pipeline.emit_transition(&record);
                                        }
                                    }
                                    let delta = chunk.delta;
                                    response.push_str(&delta);
                                    if text_in.send(delta).await.is_err() {
                                        return response;
                                    }
                                }
                                None => {
                                    token.acknowledge(StageKind::Llm, pipeline.epoch.now_ms());
                                    return response;
                                }
                            }
                        }
                    }
                }
            })
        };

        // Stage task: TTS PCM → packetizer feed + animation tee. The audio
        // path blocks on its bounded channel; the animation tee drops.
        let tts_task = {
            let pipeline = pipeline_handle.clone();
            let token = token.clone();
            let mut audio_out = tts_session.audio_out;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            audio_out.cancel();
                            token.acknowledge(StageKind::Tts, pipeline.epoch.now_ms());
                            return;
                        }
                        chunk = audio_out.recv() => {
                            match chunk {
                                Some(chunk) => {
                                    if let Some(anim) = &anim_pcm_tx {
                                        // Slow animation never blocks audio.
                                        let _ = anim.try_send(chunk.clone());
                                    }
                                    if pcm_tx.send(chunk).await.is_err() {
                                        return;
                                    }
                                }
                                None => {
                                    token.acknowledge(StageKind::Tts, pipeline.epoch.now_ms());
                                    return;
                                }
                            }
                        }
                    }
                }
            })
        };

        // Stage task: packetizer, owner of the audio clock advance.
        let packetizer_task = {
            let pipeline = pipeline_handle.clone();
            let token = token.clone();
            let turn = turn.clone();
            tokio::spawn(async move {
                pipeline.run_packetizer(pcm_rx, token, turn).await;
            })
        };

        let response = llm_task.await.unwrap_or_default();
        let _ = tts_task.await;
        let _ = packetizer_task.await;

        Ok(response)
    }

    /// The audio-clocked emitter: suspends on the next PCM chunk or the
    /// 20 ms cadence tick, emitting at most one packet per tick. Emission
    /// stops within one packet boundary of CANCEL: the in-flight frame is
    /// dropped and no tail is flushed.
    async fn run_packetizer(
        &self,
        mut pcm_rx: mpsc::Receiver<PcmChunk>,
        token: CancellationToken,
        turn: Arc<Turn>,
    ) {
        let mut packetizer = Packetizer::new(
            &self.config.session_id,
            self.clock.clone(),
            self.config.sample_rate,
            self.config.packet_ms,
            self.config.overlap_ms,
            self.config.tail_policy,
        );
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.packet_ms as u64));
        let mut ready: std::collections::VecDeque<duplex_core::AudioPacket> =
            std::collections::VecDeque::new();
        let mut input_done = false;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    packetizer.abort();
                    ready.clear();
                    token.acknowledge(StageKind::Packetizer, self.epoch.now_ms());
                    return;
                }
                _ = ticker.tick() => {
                    if let Some(packet) = ready.pop_front() {
                        self.emit_packet(&turn, packet);
                    } else if input_done {
                        token.acknowledge(StageKind::Packetizer, self.epoch.now_ms());
                        return;
                    }
                }
                chunk = pcm_rx.recv(), if !input_done => {
                    match chunk {
                        Some(chunk) => {
                            ready.extend(packetizer.push(&chunk));
                        }
                        None => {
                            input_done = true;
                            if let Some(tail) = packetizer.finish() {
                                ready.push_back(tail);
                            }
                        }
                    }
                }
            }
        }
    }

    fn emit_packet(&self, turn: &Arc<Turn>, packet: duplex_core::AudioPacket) {
        if let Some(ttfa_ms) = turn.mark_first_audio(self.epoch.now_ms()) {
            self.aggregator.record_ttfa(ttfa_ms);
            self.metrics.lock().record_ttfa(ttfa_ms);
            let _ = self.events.send(PipelineEvent::TtfaMeasured {
                turn_id: turn.id,
                ttfa_ms,
            });
        }
        self.metrics.lock().total_audio_ms += packet.duration_ms as u64;
        let _ = self.events.send(PipelineEvent::Audio(packet));
    }

    /// Spawn the animation engine and scheduler for this turn; returns the
    /// PCM tee input. Animation failure never touches the audio path.
    async fn spawn_animation(&self, turn: &Arc<Turn>) -> mpsc::Sender<PcmChunk> {
        let (tee_tx, mut tee_rx) = mpsc::channel::<PcmChunk>(STAGE_CHANNEL_CAPACITY);
        let engine = match &self.engines.animation {
            Some(engine) => engine.clone(),
            None => return tee_tx,
        };

        let session = match engine.start(&self.config.session_id).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(error = %e, "animation engine failed to start; audio continues");
                turn.token
                    .acknowledge(StageKind::Animation, self.epoch.now_ms());
                return tee_tx;
            }
        };

        // Tee → engine.
        let pcm_in = session.pcm_in;
        tokio::spawn(async move {
            while let Some(chunk) = tee_rx.recv().await {
                if pcm_in.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        // Engine poses → scheduler input, with cancel observation between
        // chunks.
        let mut poses = session.poses;
        let (pose_tx, pose_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let pose_token = turn.token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pose_token.cancelled() => {
                        poses.cancel();
                        return;
                    }
                    pose = poses.recv() => {
                        match pose {
                            Some(pose) => {
                                if pose_tx.send(pose).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        // Scheduler → blendshape events; lag readings feed the aggregator.
        let scheduler = AnimationScheduler::new(
            &self.config.session_id,
            self.config.animation.clone(),
            self.clock.clone(),
            self.epoch,
        );
        let (frame_tx, mut frame_rx) = mpsc::channel(64);
        let (lag_tx, mut lag_rx) = watch::channel(0u64);
        let aggregator = self.aggregator.clone();
        tokio::spawn(async move {
            while lag_rx.changed().await.is_ok() {
                aggregator.report_animation_lag(*lag_rx.borrow());
            }
        });
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let _ = events.send(PipelineEvent::Blendshapes(frame));
            }
        });
        let yield_rx = self.yield_tx.subscribe();
        let token = turn.token.clone();
        tokio::spawn(scheduler.run(pose_rx, frame_tx, token, yield_rx, Some(lag_tx)));

        tee_tx
    }

    fn ack_unused_stages(&self, token: &CancellationToken, animate: bool, include_tts: bool) {
        let now = self.epoch.now_ms();
        if include_tts {
            token.acknowledge(StageKind::Tts, now);
        }
        token.acknowledge(StageKind::Packetizer, now);
        if animate {
            token.acknowledge(StageKind::Animation, now);
        }
    }

    /// Canned spoken fallback: pre-rendered PCM through the packetizer,
    /// bypassing the LLM entirely.
    async fn speak_fallback(&self, turn: &Arc<Turn>) {
        if turn.token.is_cancelled() {
            return;
        }
        let now = self.epoch.now_ms();
        if let Ok(Some(record)) = self.fsm.transition_if(
            TurnState::Thinking,
            TurnState::Speaking,
            now,
            "fallback audio",
        ) {
            self.emit_transition(&record);
        }
        let (pcm_tx, pcm_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let pcm = canned_unavailable_pcm(self.config.sample_rate, FALLBACK_AUDIO_MS);
        let feeder = tokio::spawn(async move {
            let _ = pcm_tx.send(pcm).await;
        });
        self.run_packetizer(pcm_rx, turn.token.clone(), turn.clone())
            .await;
        let _ = feeder.await;
    }

    /// Common turn teardown: metrics, signals, FSM back to LISTENING, and
    /// a fresh ASR stream.
    async fn finish_turn(
        &self,
        turn: &Arc<Turn>,
        outcome: TurnOutcome,
        asr_confidence: f32,
        fsm_already_settled: bool,
    ) {
        let now = self.epoch.now_ms();
        turn.finish(outcome, now);
        if outcome == TurnOutcome::Completed {
            self.metrics.lock().turns_completed += 1;
        }
        self.record_turn_signals(turn, asr_confidence, false);

        if !fsm_already_settled {
            let settled = self
                .fsm
                .transition_if(TurnState::Speaking, TurnState::Listening, now, "playout drained")
                .ok()
                .flatten()
                .or_else(|| {
                    self.fsm
                        .transition_if(TurnState::Thinking, TurnState::Listening, now, "turn aborted")
                        .ok()
                        .flatten()
                });
            if let Some(record) = settled {
                self.emit_transition(&record);
            }
        }

        *self.current_turn.lock() = None;
        self.vad.lock().reset();
        if self.fsm.state() == TurnState::Listening {
            let _ = self.start_listening().await;
        }
    }

    fn record_turn_signals(&self, turn: &Arc<Turn>, asr_confidence: f32, was_interrupted: bool) {
        let now = self.epoch.now_ms();
        let word_count = turn
            .user_text
            .as_ref()
            .map(|s| s.split_whitespace().count())
            .unwrap_or(0);
        self.signals.lock().record_turn(
            &TurnReport {
                user_speech_ms: 0,
                asr_confidence,
                was_interrupted,
                word_count,
            },
            now,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NeutralAnimation, ScriptedAsr, ScriptedLlm, SilenceTts};
    use crate::backpressure::BackpressureLevel;

    fn test_engines(transcript: &str, response: &str) -> EngineSet {
        EngineSet {
            asr: Arc::new(ScriptedAsr::new(transcript)),
            llm: Arc::new(ScriptedLlm::new(response)),
            tts: Arc::new(SilenceTts::new(4)),
            animation: Some(Arc::new(NeutralAnimation)),
        }
    }

    fn test_pipeline(engines: EngineSet) -> Arc<SessionPipeline> {
        let settings = Settings::default();
        let config = PipelineConfig::from_settings(&settings, "test-session", "be helpful");
        let (_tx, effects_rx) = watch::channel(Effects::for_level(BackpressureLevel::Normal));
        SessionPipeline::new(
            config,
            engines,
            effects_rx,
            MetricsAggregator::shared(),
            None,
        )
        .unwrap()
    }

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

    async fn speak_and_endpoint(pipeline: &Arc<SessionPipeline>) {
        // ~1 s of speech, then enough silence to close the utterance.
        for i in 0..50 {
            pipeline
                .process_audio(loud_frame(i * 20, 20))
                .await
                .unwrap();
        }
        for i in 50..75 {
            pipeline
                .process_audio(silent_frame(i * 20, 20))
                .await
                .unwrap();
        }
    }

    async fn wait_for_state(
        pipeline: &Arc<SessionPipeline>,
        state: TurnState,
        budget: Duration,
    ) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < budget {
            if pipeline.state() == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn open_enters_listening() {
        let pipeline = test_pipeline(test_engines("hi", "hello"));
        pipeline.open().await.unwrap();
        assert_eq!(pipeline.state(), TurnState::Listening);
    }

    #[tokio::test]
    async fn clean_turn_emits_monotonic_packets_and_returns_to_listening() {
        let pipeline = test_pipeline(test_engines("what is the time", "it is noon right now"));
        let mut events = pipeline.subscribe();
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        let mut packets = Vec::new();
        let mut ttfa = None;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let event = tokio::select! {
                e = events.recv() => e,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match event {
                Ok(PipelineEvent::Audio(p)) => packets.push(p),
                Ok(PipelineEvent::TtfaMeasured { ttfa_ms, .. }) => ttfa = Some(ttfa_ms),
                Ok(PipelineEvent::StateChanged { to, reason, .. })
                    if to == "LISTENING" && reason == "playout drained" =>
                {
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }

        assert!(!packets.is_empty(), "no audio emitted");
        assert_eq!(packets[0].seq, 0);
        assert_eq!(packets[0].t_audio_ms, 0);
        for pair in packets.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert_eq!(pair[1].t_audio_ms, pair[0].t_audio_ms + 20);
        }
        assert!(ttfa.is_some(), "ttfa not measured");
        assert!(wait_for_state(&pipeline, TurnState::Listening, Duration::from_secs(1)).await);
        assert_eq!(pipeline.metrics().turns_completed, 1);
    }

    #[tokio::test]
    async fn barge_in_stops_packets_and_counts_once() {
        let slow_llm = ScriptedLlm::new(
            "this is a deliberately long agent reply with many words to keep speaking for a while \
             so the user has time to interrupt the playback midway through the stream",
        )
        .with_token_delay(Duration::from_millis(20));
        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("tell me a story")),
            llm: Arc::new(slow_llm),
            tts: Arc::new(SilenceTts::new(6)),
            animation: None,
        };
        let pipeline = test_pipeline(engines);
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        assert!(
            wait_for_state(&pipeline, TurnState::Speaking, Duration::from_secs(2)).await,
            "never started speaking"
        );

        // User speech during SPEAKING: barge-in after ~100 ms persistence.
        let base = pipeline.epoch_now_ms();
        for i in 0..8 {
            pipeline
                .process_audio(loud_frame(base + i * 20, 20))
                .await
                .unwrap();
        }

        assert!(
            wait_for_state(&pipeline, TurnState::Listening, Duration::from_secs(1)).await,
            "did not return to LISTENING after barge-in"
        );
        assert_eq!(pipeline.metrics().barge_in_count, 1);
    }

    #[tokio::test]
    async fn speech_during_thinking_does_not_cancel_the_turn() {
        // First token held back long enough to observe THINKING, while
        // keeping first audio comfortably inside the turn budget.
        let slow_first_token = ScriptedLlm::new("a short spoken reply")
            .with_token_delay(Duration::from_millis(150));
        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("one quick question")),
            llm: Arc::new(slow_first_token),
            tts: Arc::new(SilenceTts::new(4)),
            animation: None,
        };
        let pipeline = test_pipeline(engines);
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        assert!(
            wait_for_state(&pipeline, TurnState::Thinking, Duration::from_secs(1)).await,
            "never entered THINKING"
        );

        // Persistent user speech during THINKING is not a barge-in.
        let base = pipeline.epoch_now_ms();
        for i in 0..8 {
            pipeline
                .process_audio(loud_frame(base + i * 20, 20))
                .await
                .unwrap();
        }
        assert_eq!(pipeline.metrics().barge_in_count, 0);

        // The turn still proceeds to SPEAKING untouched.
        assert!(
            wait_for_state(&pipeline, TurnState::Speaking, Duration::from_secs(2)).await,
            "turn was cancelled by speech during THINKING"
        );
        assert_eq!(pipeline.metrics().barge_in_count, 0);
    }

    #[tokio::test]
    async fn user_stop_during_thinking_aborts_without_counting_barge_in() {
        let slow_first_token = ScriptedLlm::new("a reply that never gets spoken")
            .with_token_delay(Duration::from_millis(300));
        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("cancel this one")),
            llm: Arc::new(slow_first_token),
            tts: Arc::new(SilenceTts::new(4)),
            animation: None,
        };
        let pipeline = test_pipeline(engines);
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        assert!(
            wait_for_state(&pipeline, TurnState::Thinking, Duration::from_secs(1)).await,
            "never entered THINKING"
        );
        pipeline.user_stop().await;

        assert!(
            wait_for_state(&pipeline, TurnState::Listening, Duration::from_secs(1)).await,
            "stop during THINKING did not return to LISTENING"
        );
        assert_eq!(pipeline.metrics().barge_in_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_llm_times_out_at_budget_with_no_audio() {
        struct StalledLlm;
        #[async_trait::async_trait]
        impl duplex_core::LanguageModel for StalledLlm {
            async fn generate(
                &self,
                _request: GenerateRequest,
            ) -> Result<duplex_core::StreamHandle<duplex_core::TokenChunk>> {
                let (_tx, _cancel_rx, handle) = duplex_core::StreamHandle::channel(1);
                // Leak the sender so the stream never produces or closes.
                std::mem::forget(_tx);
                Ok(handle)
            }
            fn health(&self) -> duplex_core::EngineHealth {
                duplex_core::EngineHealth::Ready
            }
        }

        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("hello agent")),
            llm: Arc::new(StalledLlm),
            tts: Arc::new(SilenceTts::new(4)),
            animation: None,
        };
        let pipeline = test_pipeline(engines);
        let mut events = pipeline.subscribe();
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        // Drive paused time past the 500 ms watchdog, then let the
        // timeout path settle.
        tokio::time::sleep(Duration::from_millis(700)).await;
        for _ in 0..100 {
            if pipeline.state() == TurnState::Listening {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut saw_timeout = false;
        let mut saw_audio = false;
        while let Ok(event) = events.try_recv() {
            match event {
                PipelineEvent::TurnTimeout { .. } => saw_timeout = true,
                PipelineEvent::Audio(_) => saw_audio = true,
                _ => {}
            }
        }
        assert!(saw_timeout, "turn_timeout not logged");
        assert!(!saw_audio, "partial audio emitted on timeout");
        assert_eq!(pipeline.state(), TurnState::Listening);
        assert_eq!(pipeline.metrics().turn_timeouts, 1);
    }

    #[tokio::test]
    async fn animation_failure_does_not_stop_audio() {
        struct DeadAnimation;
        #[async_trait::async_trait]
        impl duplex_core::AnimationEngine for DeadAnimation {
            async fn start(&self, _session_id: &str) -> Result<duplex_core::AnimationSession> {
                Err(duplex_core::Error::stage(
                    StageKind::Animation,
                    duplex_core::StageErrorKind::Initialization,
                    "engine crashed",
                ))
            }
            fn health(&self) -> duplex_core::EngineHealth {
                duplex_core::EngineHealth::Down
            }
        }

        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("hello")),
            llm: Arc::new(ScriptedLlm::new("short reply here")),
            tts: Arc::new(SilenceTts::new(4)),
            animation: Some(Arc::new(DeadAnimation)),
        };
        let pipeline = test_pipeline(engines);
        let mut events = pipeline.subscribe();
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        let mut packets = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let event = tokio::select! {
                e = events.recv() => e,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match event {
                Ok(PipelineEvent::Audio(_)) => packets += 1,
                Ok(PipelineEvent::StateChanged { to, reason, .. })
                    if to == "LISTENING" && reason == "playout drained" =>
                {
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        assert!(packets > 0, "audio stalled when animation died");
    }

    #[tokio::test]
    async fn llm_start_failure_speaks_canned_fallback() {
        struct DownLlm;
        #[async_trait::async_trait]
        impl duplex_core::LanguageModel for DownLlm {
            async fn generate(
                &self,
                _request: GenerateRequest,
            ) -> Result<duplex_core::StreamHandle<duplex_core::TokenChunk>> {
                Err(duplex_core::Error::stage(
                    StageKind::Llm,
                    duplex_core::StageErrorKind::Processing,
                    "backend down",
                ))
            }
            fn health(&self) -> duplex_core::EngineHealth {
                duplex_core::EngineHealth::Down
            }
        }

        let engines = EngineSet {
            asr: Arc::new(ScriptedAsr::new("hello")),
            llm: Arc::new(DownLlm),
            tts: Arc::new(SilenceTts::new(4)),
            animation: None,
        };
        let pipeline = test_pipeline(engines);
        let mut events = pipeline.subscribe();
        pipeline.open().await.unwrap();
        speak_and_endpoint(&pipeline).await;

        let mut packets = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let event = tokio::select! {
                e = events.recv() => e,
                _ = tokio::time::sleep_until(deadline) => break,
            };
            match event {
                Ok(PipelineEvent::Audio(_)) => packets += 1,
                Ok(PipelineEvent::StateChanged { to, reason, .. })
                    if to == "LISTENING" && reason == "playout drained" =>
                {
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        // 600 ms fallback = 30 packets of 20 ms.
        assert_eq!(packets, 30, "canned fallback not fully emitted");
        assert!(wait_for_state(&pipeline, TurnState::Listening, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pipeline = test_pipeline(test_engines("hi", "hello"));
        pipeline.open().await.unwrap();
        pipeline.close().await;
        assert_eq!(pipeline.state(), TurnState::Idle);
        pipeline.close().await;
        assert_eq!(pipeline.state(), TurnState::Idle);
    }
}
