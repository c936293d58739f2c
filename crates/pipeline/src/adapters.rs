//! Built-in engine adapters
//!
//! Every adapter honors the same contract: `start` opens a single-pass
//! stream, the handle's `cancel` terminates it within the stage deadline,
//! `health` reports readiness. Production engines live behind the same
//! traits; the scripted and silence adapters here back the test suite and
//! the canned fallback path, and [`HttpStreamingLlm`] streams from an
//! HTTP backend with newline-delimited JSON chunks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use duplex_core::{
    neutral_weights, AnimationEngine, AnimationSession, AsrEngine, AsrEvent, AsrSession,
    BlendshapeWeights, EngineHealth, Error, GenerateRequest, LanguageModel, PcmChunk, Result,
    StageErrorKind, StageKind, StreamHandle, TokenChunk, TtsEngine, TtsRequest, TtsSession,
    ARKIT_CHANNELS,
};

/// Retry a connect-style operation once with backoff, per the in-turn
/// recovery policy for connection errors.
pub async fn with_retry_once<T, F, Fut>(op: F, backoff: Duration) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match op().await {
        Err(e) if e.is_retryable() => {
            tracing::warn!(error = %e, "connection error, retrying once");
            tokio::time::sleep(backoff).await;
            op().await
        }
        other => other,
    }
}

/// Pre-rendered spoken fallback used when a turn fails before first audio.
/// Short fixed-length PCM at the given rate; requires no LLM.
pub fn canned_unavailable_pcm(sample_rate: u32, duration_ms: u64) -> PcmChunk {
    let samples = (sample_rate as u64 * duration_ms / 1000) as usize;
    let mut payload = Vec::with_capacity(samples * 2);
    // Low-amplitude 220 Hz tone standing in for the pre-rendered prompt.
    for n in 0..samples {
        let t = n as f32 / sample_rate as f32;
        let value = ((t * 220.0 * std::f32::consts::TAU).sin() * 1200.0) as i16;
        payload.extend_from_slice(&value.to_le_bytes());
    }
    PcmChunk::new(payload, sample_rate)
}

/// ASR adapter that transcribes to a fixed script: emits partials while
/// audio is fed, then the final transcript when the feed closes.
pub struct ScriptedAsr {
    transcript: String,
    confidence: f32,
}

impl ScriptedAsr {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            confidence: 0.92,
        }
    }
}

#[async_trait]
impl AsrEngine for ScriptedAsr {
    async fn start(&self, _session_id: &str, _sample_rate: u32) -> Result<AsrSession> {
        let (feed_tx, mut feed_rx) = mpsc::channel::<PcmChunk>(8);
        let (event_tx, mut cancel_rx, events) = StreamHandle::channel(8);
        let transcript = self.transcript.clone();
        let confidence = self.confidence;

        tokio::spawn(async move {
            let mut observed_ms: u64 = 0;
            let words: Vec<&str> = transcript.split_whitespace().collect();
            let mut spoken = 0usize;
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    chunk = feed_rx.recv() => {
                        match chunk {
                            Some(chunk) => {
                                observed_ms += chunk.duration_ms();
                                // One partial roughly every 300 ms of audio.
                                let due = (observed_ms / 300) as usize;
                                if due > spoken && spoken < words.len() {
                                    spoken = due.min(words.len());
                                    let _ = event_tx
                                        .send(AsrEvent::Partial {
                                            text: words[..spoken].join(" "),
                                            confidence,
                                        })
                                        .await;
                                }
                            }
                            None => {
                                let _ = event_tx
                                    .send(AsrEvent::Final {
                                        text: transcript.clone(),
                                        confidence,
                                        endpoint_ms: observed_ms,
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(AsrSession {
            feed: feed_tx,
            events,
        })
    }

    fn health(&self) -> EngineHealth {
        EngineHealth::Ready
    }
}

/// LLM adapter that streams a fixed response word by word with a
/// configurable inter-token delay.
pub struct ScriptedLlm {
    response: String,
    token_delay: Duration,
}

impl ScriptedLlm {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            token_delay: Duration::from_millis(5),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate(&self, request: GenerateRequest) -> Result<StreamHandle<TokenChunk>> {
        let (tx, mut cancel_rx, handle) = StreamHandle::channel(8);
        let response = self.response.clone();
        let delay = self.token_delay;
        let max_tokens = request.max_tokens as usize;

        tokio::spawn(async move {
            for (i, word) in response.split_whitespace().enumerate() {
                if i >= max_tokens {
                    break;
                }
                if *cancel_rx.borrow() {
                    return;
                }
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                let delta = if i == 0 {
                    word.to_string()
                } else {
                    format!(" {word}")
                };
                if tx.send(TokenChunk { delta }).await.is_err() {
                    return;
                }
            }
        });

        Ok(handle)
    }

    fn health(&self) -> EngineHealth {
        EngineHealth::Ready
    }
}

/// LLM adapter streaming from an HTTP backend that emits newline-delimited
/// JSON objects with a `response` field per chunk.
pub struct HttpStreamingLlm {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl HttpStreamingLlm {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                Error::stage(
                    StageKind::Llm,
                    StageErrorKind::Initialization,
                    format!("http client: {e}"),
                )
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
        })
    }

    fn compose_prompt(request: &GenerateRequest) -> String {
        request
            .messages
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl LanguageModel for HttpStreamingLlm {
    async fn generate(&self, request: GenerateRequest) -> Result<StreamHandle<TokenChunk>> {
        let url = format!("{}/api/generate", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "prompt": Self::compose_prompt(&request),
            "stream": true,
            "options": {
                "num_predict": request.max_tokens,
                "temperature": request.temperature,
            },
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                Error::stage(StageKind::Llm, StageErrorKind::Connection, e.to_string())
            })?;
        if !response.status().is_success() {
            return Err(Error::stage(
                StageKind::Llm,
                StageErrorKind::Processing,
                format!("backend returned {}", response.status()),
            ));
        }

        let (tx, mut cancel_rx, handle) = StreamHandle::channel(8);
        tokio::spawn(async move {
            let mut response = response;
            let mut pending = Vec::new();
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    chunk = response.chunk() => {
                        match chunk {
                            Ok(Some(bytes)) => {
                                pending.extend_from_slice(&bytes);
                                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                                    let line: Vec<u8> = pending.drain(..=pos).collect();
                                    if let Ok(value) =
                                        serde_json::from_slice::<serde_json::Value>(&line)
                                    {
                                        if let Some(delta) =
                                            value.get("response").and_then(|v| v.as_str())
                                        {
                                            if !delta.is_empty()
                                                && tx
                                                    .send(TokenChunk {
                                                        delta: delta.to_string(),
                                                    })
                                                    .await
                                                    .is_err()
                                            {
                                                return;
                                            }
                                        }
                                        if value.get("done").and_then(|v| v.as_bool())
                                            == Some(true)
                                        {
                                            return;
                                        }
                                    }
                                }
                            }
                            Ok(None) => return,
                            Err(e) => {
                                tracing::warn!(error = %e, "llm stream read failed");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    fn health(&self) -> EngineHealth {
        EngineHealth::Ready
    }
}

/// TTS adapter producing silence PCM sized to the text: a fixed
/// per-character speaking rate at the requested sample rate. Streams audio
/// in 20 ms chunks as text arrives.
pub struct SilenceTts {
    ms_per_char: u64,
}

impl Default for SilenceTts {
    fn default() -> Self {
        Self { ms_per_char: 8 }
    }
}

impl SilenceTts {
    pub fn new(ms_per_char: u64) -> Self {
        Self { ms_per_char }
    }
}

#[async_trait]
impl TtsEngine for SilenceTts {
    async fn start(&self, request: TtsRequest) -> Result<TtsSession> {
        let (text_tx, mut text_rx) = mpsc::channel::<String>(8);
        let (audio_tx, mut cancel_rx, audio_out) = StreamHandle::channel(8);
        let ms_per_char = self.ms_per_char;
        let sample_rate = request.sample_rate;
        let chunk_bytes = (sample_rate as usize * 2 * 20) / 1000;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    text = text_rx.recv() => {
                        match text {
                            Some(text) => {
                                let duration_ms = text.chars().count() as u64 * ms_per_char;
                                let total =
                                    (sample_rate as u64 * 2 * duration_ms / 1000) as usize;
                                let mut sent = 0usize;
                                while sent < total {
                                    if *cancel_rx.borrow() {
                                        return;
                                    }
                                    let len = chunk_bytes.min(total - sent);
                                    let chunk = PcmChunk::new(vec![0u8; len], sample_rate);
                                    if audio_tx.send(chunk).await.is_err() {
                                        return;
                                    }
                                    sent += len;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        Ok(TtsSession {
            text_in: text_tx,
            audio_out,
        })
    }

    fn health(&self) -> EngineHealth {
        EngineHealth::Ready
    }
}

/// Animation adapter implementing the neutral policy directly: jawOpen and
/// mouthClose track audio energy, every other channel stays at zero.
pub struct NeutralAnimation;

#[async_trait]
impl AnimationEngine for NeutralAnimation {
    async fn start(&self, _session_id: &str) -> Result<AnimationSession> {
        let (pcm_tx, mut pcm_rx) = mpsc::channel::<PcmChunk>(8);
        let (pose_tx, mut cancel_rx, poses) = StreamHandle::channel(8);
        let jaw_open = ARKIT_CHANNELS
            .iter()
            .position(|c| *c == "jawOpen")
            .unwrap_or(0);
        let mouth_close = ARKIT_CHANNELS
            .iter()
            .position(|c| *c == "mouthClose")
            .unwrap_or(0);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                    chunk = pcm_rx.recv() => {
                        match chunk {
                            Some(chunk) => {
                                let energy = chunk.energy_db();
                                // Map [-60, 0] dB onto [0, 1] jaw openness.
                                let openness =
                                    ((energy + 60.0) / 60.0).clamp(0.0, 1.0);
                                let mut pose: BlendshapeWeights = neutral_weights();
                                pose[jaw_open] = openness;
                                pose[mouth_close] = 1.0 - openness;
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

        Ok(AnimationSession {
            pcm_in: pcm_tx,
            poses,
        })
    }

    fn health(&self) -> EngineHealth {
        EngineHealth::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex_core::{Message, Role};

    #[tokio::test]
    async fn scripted_asr_finalizes_on_feed_close() {
        let asr = ScriptedAsr::new("book a table for two");
        let mut session = asr.start("s", 16_000).await.unwrap();
        for _ in 0..50 {
            session
                .feed
                .send(PcmChunk::new(vec![0u8; 640], 16_000))
                .await
                .unwrap();
        }
        drop(session.feed);
        let mut final_text = None;
        while let Some(event) = session.events.recv().await {
            if let AsrEvent::Final { text, .. } = event {
                final_text = Some(text);
            }
        }
        assert_eq!(final_text.as_deref(), Some("book a table for two"));
    }

    #[tokio::test]
    async fn scripted_llm_streams_words() {
        let llm = ScriptedLlm::new("hello there friend");
        let request = GenerateRequest::new(vec![Message::new(Role::User, "hi", 1)]);
        let mut stream = llm.generate(request).await.unwrap();
        let mut text = String::new();
        while let Some(chunk) = stream.recv().await {
            text.push_str(&chunk.delta);
        }
        assert_eq!(text, "hello there friend");
    }

    #[tokio::test]
    async fn scripted_llm_honors_max_tokens() {
        let llm = ScriptedLlm::new("one two three four five");
        let request =
            GenerateRequest::new(vec![Message::new(Role::User, "hi", 1)]).with_max_tokens(2);
        let mut stream = llm.generate(request).await.unwrap();
        let mut words = 0;
        while stream.recv().await.is_some() {
            words += 1;
        }
        assert_eq!(words, 2);
    }

    #[tokio::test]
    async fn scripted_llm_cancel_terminates_stream() {
        let llm = ScriptedLlm::new("a b c d e f g h")
            .with_token_delay(Duration::from_millis(50));
        let request = GenerateRequest::new(vec![Message::new(Role::User, "hi", 1)]);
        let mut stream = llm.generate(request).await.unwrap();
        let _ = stream.recv().await;
        stream.cancel();
        // Stream must terminate promptly rather than produce the full script.
        let mut remaining = 0;
        while tokio::time::timeout(Duration::from_millis(200), stream.recv())
            .await
            .ok()
            .flatten()
            .is_some()
        {
            remaining += 1;
        }
        assert!(remaining < 7);
    }

    #[tokio::test]
    async fn silence_tts_sizes_audio_to_text() {
        let tts = SilenceTts::new(10);
        let session = tts
            .start(TtsRequest {
                session_id: "s".into(),
                sample_rate: 16_000,
                voice: None,
            })
            .await
            .unwrap();
        let TtsSession {
            text_in,
            mut audio_out,
        } = session;
        text_in.send("hello".to_string()).await.unwrap();
        drop(text_in);
        let mut total_bytes = 0;
        while let Some(chunk) = audio_out.recv().await {
            total_bytes += chunk.payload.len();
        }
        // 5 chars * 10 ms/char = 50 ms = 1600 bytes at 16 kHz.
        assert_eq!(total_bytes, 1600);
    }

    #[tokio::test]
    async fn neutral_animation_only_drives_articulation() {
        let engine = NeutralAnimation;
        let mut session = engine.start("s").await.unwrap();
        let mut loud = Vec::new();
        for _ in 0..320 {
            loud.extend_from_slice(&(i16::MAX / 2).to_le_bytes());
        }
        session
            .pcm_in
            .send(PcmChunk::new(loud, 16_000))
            .await
            .unwrap();
        drop(session.pcm_in);
        let pose = session.poses.recv().await.unwrap();
        let jaw_open = ARKIT_CHANNELS.iter().position(|c| *c == "jawOpen").unwrap();
        assert!(pose[jaw_open] > 0.5);
        for (i, w) in pose.iter().enumerate() {
            if !duplex_core::blendshape::is_articulation_channel(i) {
                assert_eq!(*w, 0.0, "non-articulation channel {i} driven");
            }
        }
    }

    #[tokio::test]
    async fn canned_fallback_has_expected_duration() {
        let pcm = canned_unavailable_pcm(16_000, 400);
        assert_eq!(pcm.duration_ms(), 400);
        assert!(pcm.energy_db() > -60.0);
    }

    #[tokio::test]
    async fn retry_once_recovers_from_connection_error() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = AtomicU32::new(0);
        let result = with_retry_once(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::stage(
                            StageKind::Tts,
                            StageErrorKind::Connection,
                            "refused",
                        ))
                    } else {
                        Ok(42)
                    }
                }
            },
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_once_gives_up_on_processing_errors() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let attempts = AtomicU32::new(0);
        let result: Result<u32> = with_retry_once(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::stage(
                        StageKind::Tts,
                        StageErrorKind::Processing,
                        "bad input",
                    ))
                }
            },
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
