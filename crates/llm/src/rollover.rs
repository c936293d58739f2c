//! Summarization rollover
//!
//! When the context total reaches the rollover threshold, the oldest half
//! of the rolling window is summarized into the session state block under a
//! hard deadline. Failure or a missed deadline rejects the new turn with a
//! context-overflow error; the buffer is never silently overflowed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use duplex_config::constants::CONTEXT_SUMMARIZATION_TIMEOUT_MS;
use duplex_core::{
    Error, GenerateRequest, LanguageModel, Message, Result, Role, StageErrorKind, StageKind,
};

use crate::context::{estimate_tokens, ContextBuffer, WindowEntry};

/// Outcome of a rollover attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloverOutcome {
    /// Below threshold, or the same window state was already summarized.
    NotNeeded,
    /// Oldest half replaced by a summary block.
    Summarized,
}

/// Produces the compact summary for evicted window entries.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, entries: &[WindowEntry]) -> Result<String>;
}

/// Summarizer backed by an LLM adapter. Whether this is the session's own
/// adapter or a dedicated one is the caller's choice; the deadline applies
/// either way.
pub struct LlmSummarizer {
    llm: Arc<dyn LanguageModel>,
    max_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm,
            max_tokens: 200,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, entries: &[WindowEntry]) -> Result<String> {
        let transcript = entries
            .iter()
            .map(|e| {
                let role = match e.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                format!("{role}: {}", e.text)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let instruction = "Summarize the following conversation excerpt concisely. \
                           Preserve key facts, decisions, and action items.";
        let request = GenerateRequest::new(vec![
            Message::new(Role::System, instruction, estimate_tokens(instruction)),
            Message::new(Role::User, &transcript, estimate_tokens(&transcript)),
        ])
        .with_max_tokens(self.max_tokens);

        let mut stream = self.llm.generate(request).await?;
        let mut summary = String::new();
        while let Some(chunk) = stream.recv().await {
            summary.push_str(&chunk.delta);
        }
        if summary.is_empty() {
            return Err(Error::stage(
                StageKind::Llm,
                StageErrorKind::Processing,
                "summarizer produced no output",
            ));
        }
        Ok(summary)
    }
}

/// Run rollover if the buffer is at or past its threshold.
///
/// Idempotent: a second trigger against the same window generation is a
/// no-op, and a successful rollover drops the total back under threshold so
/// repeated calls without new turns do no work.
pub async fn rollover_if_needed(
    ctx: &mut ContextBuffer,
    summarizer: &dyn Summarizer,
) -> Result<RolloverOutcome> {
    if !ctx.needs_rollover() || ctx.already_rolled() {
        return Ok(RolloverOutcome::NotNeeded);
    }
    let candidates = ctx.eviction_candidates().to_vec();
    if candidates.is_empty() {
        return Err(Error::ContextOverflow(
            "window too small to summarize".to_string(),
        ));
    }

    let deadline = Duration::from_millis(CONTEXT_SUMMARIZATION_TIMEOUT_MS);
    let summary = match timeout(deadline, summarizer.summarize(&candidates)).await {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            return Err(Error::ContextOverflow(format!("summarization failed: {e}")));
        }
        Err(_) => {
            return Err(Error::ContextOverflow(format!(
                "summarization exceeded {} ms deadline",
                deadline.as_millis()
            )));
        }
    };

    ctx.apply_summary(summary);
    ctx.mark_rolled();
    tracing::info!(
        total_tokens = ctx.total_tokens(),
        "context rollover complete"
    );
    Ok(RolloverOutcome::Summarized)
}
