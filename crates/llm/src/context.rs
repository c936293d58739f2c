//! Context buffer: pinned prefix + rolling window + session state block
//!
//! Token accounting is authoritative: every entry carries the count it was
//! admitted with and the running total is maintained on every mutation.
//! The total never exceeds the hard cap; rollover triggers at the
//! configured threshold and is handled in [`crate::rollover`].

use duplex_core::{Message, Role};
use duplex_config::constants::{
    CONTEXT_ROLLOVER_THRESHOLD, LLM_MAX_CONTEXT_TOKENS, PINNED_PREFIX_MAX_FRACTION,
};

use duplex_core::{Error, Result};

/// Rough token estimate for text without a tokenizer in the path:
/// about four characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32 / 4).max(1)
}

/// Immutable context head: system rules, persona, tenant grounding.
/// Never edited after session open, never evicted by rollover.
#[derive(Debug, Clone, PartialEq)]
pub struct PinnedPrefix {
    text: String,
    tokens: u32,
}

impl PinnedPrefix {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let tokens = estimate_tokens(&text);
        Self { text, tokens }
    }

    pub fn with_tokens(text: impl Into<String>, tokens: u32) -> Self {
        Self {
            text: text.into(),
            tokens,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}

/// One rolling-window entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub role: Role,
    pub text: String,
    pub tokens: u32,
}

/// The managed context window.
#[derive(Debug)]
pub struct ContextBuffer {
    pinned: PinnedPrefix,
    window: Vec<WindowEntry>,
    state_block: Option<WindowEntry>,
    max_tokens: u32,
    rollover_threshold: u32,
    /// Bumped on every append; rollover records the generation it ran
    /// against so repeated triggers on an unchanged window do no work.
    generation: u64,
    rolled_generation: Option<u64>,
}

impl ContextBuffer {
    /// Build a buffer for a session. Fails if the pinned prefix exceeds its
    /// share of the cap.
    pub fn new(pinned: PinnedPrefix, max_tokens: u32) -> Result<Self> {
        let max_tokens = max_tokens.min(LLM_MAX_CONTEXT_TOKENS);
        let prefix_budget = (max_tokens as f32 * PINNED_PREFIX_MAX_FRACTION) as u32;
        if pinned.tokens() > prefix_budget {
            return Err(Error::Config(format!(
                "pinned prefix is {} tokens, budget is {}",
                pinned.tokens(),
                prefix_budget
            )));
        }
        Ok(Self {
            pinned,
            window: Vec::new(),
            state_block: None,
            max_tokens,
            rollover_threshold: CONTEXT_ROLLOVER_THRESHOLD.min(max_tokens),
            generation: 0,
            rolled_generation: None,
        })
    }

    pub fn pinned(&self) -> &PinnedPrefix {
        &self.pinned
    }

    pub fn window(&self) -> &[WindowEntry] {
        &self.window
    }

    pub fn state_block(&self) -> Option<&WindowEntry> {
        self.state_block.as_ref()
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Authoritative running total across all three regions.
    pub fn total_tokens(&self) -> u32 {
        self.pinned.tokens()
            + self.state_block.as_ref().map_or(0, |b| b.tokens)
            + self.window.iter().map(|e| e.tokens).sum::<u32>()
    }

    /// Rollover triggers at the threshold exactly: `>= 7500`, not above it.
    pub fn needs_rollover(&self) -> bool {
        self.total_tokens() >= self.rollover_threshold
    }

    /// Whether this window state has already been summarized.
    pub(crate) fn already_rolled(&self) -> bool {
        self.rolled_generation == Some(self.generation)
    }

    pub(crate) fn mark_rolled(&mut self) {
        self.rolled_generation = Some(self.generation);
    }

    /// Append a user turn. Rejects any entry that would push the total
    /// past the hard cap; the caller rolls over first to make room.
    pub fn push_user(&mut self, text: impl Into<String>) -> Result<()> {
        self.push(Role::User, text.into())
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) -> Result<()> {
        self.push(Role::Assistant, text.into())
    }

    fn push(&mut self, role: Role, text: String) -> Result<()> {
        let tokens = estimate_tokens(&text);
        if self.total_tokens() + tokens > self.max_tokens {
            return Err(Error::ContextOverflow(format!(
                "entry of {tokens} tokens would exceed the {} cap (current {})",
                self.max_tokens,
                self.total_tokens()
            )));
        }
        self.window.push(WindowEntry { role, text, tokens });
        self.generation += 1;
        Ok(())
    }

    /// Replace the oldest half of the rolling window with a summary block.
    /// Called by the rollover driver once a summary is in hand.
    pub(crate) fn apply_summary(&mut self, summary: String) {
        let split = self.window.len() / 2;
        if split == 0 {
            return;
        }
        let merged = match &self.state_block {
            Some(existing) => format!("{}\n\n{}", existing.text, summary),
            None => summary,
        };
        let tokens = estimate_tokens(&merged);
        self.state_block = Some(WindowEntry {
            role: Role::System,
            text: merged,
            tokens,
        });
        self.window.drain(..split);
    }

    /// Entries eligible for eviction: the oldest half of the window.
    pub(crate) fn eviction_candidates(&self) -> &[WindowEntry] {
        let split = self.window.len() / 2;
        &self.window[..split]
    }

    /// Compose the prompt: pinned prefix, then the state block if present,
    /// then the rolling window in order.
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2 + self.window.len());
        messages.push(Message::new(
            Role::System,
            self.pinned.text(),
            self.pinned.tokens(),
        ));
        if let Some(block) = &self.state_block {
            messages.push(Message::new(
                Role::System,
                format!("[Session context summary]\n{}", block.text),
                block.tokens,
            ));
        }
        for entry in &self.window {
            messages.push(Message::new(entry.role, entry.text.clone(), entry.tokens));
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> ContextBuffer {
        ContextBuffer::new(PinnedPrefix::with_tokens("system rules", 100), 8192).unwrap()
    }

    #[test]
    fn rejects_oversized_pinned_prefix() {
        // 25% of 8192 = 2048
        let prefix = PinnedPrefix::with_tokens("big", 2049);
        assert!(ContextBuffer::new(prefix, 8192).is_err());
        let prefix = PinnedPrefix::with_tokens("ok", 2048);
        assert!(ContextBuffer::new(prefix, 8192).is_ok());
    }

    #[test]
    fn token_accounting_tracks_appends() {
        let mut ctx = buffer();
        let before = ctx.total_tokens();
        ctx.push_user("hello there, how are you?").unwrap();
        assert!(ctx.total_tokens() > before);
        let expected = before + estimate_tokens("hello there, how are you?");
        assert_eq!(ctx.total_tokens(), expected);
    }

    #[test]
    fn rollover_boundary_is_exact() {
        let mut ctx = buffer();
        // Fill to exactly 7499 tokens: 100 pinned + window entries.
        let filler = "x".repeat(4 * 100); // 100 tokens per entry
        for _ in 0..73 {
            ctx.push_user(filler.clone()).unwrap();
        }
        // 100 + 7300 = 7400
        let tail = "x".repeat(4 * 99); // 99 tokens
        ctx.push_user(tail).unwrap();
        assert_eq!(ctx.total_tokens(), 7499);
        assert!(!ctx.needs_rollover());

        ctx.push_user("xxxx").unwrap(); // one more token
        assert_eq!(ctx.total_tokens(), 7500);
        assert!(ctx.needs_rollover());
    }

    #[test]
    fn summary_replaces_oldest_half() {
        let mut ctx = buffer();
        for i in 0..6 {
            ctx.push_user(format!("turn number {i} with some words")).unwrap();
        }
        let before_len = ctx.window().len();
        ctx.apply_summary("summary of early turns".to_string());
        assert_eq!(ctx.window().len(), before_len - before_len / 2);
        assert!(ctx.state_block().is_some());
        // Oldest surviving entry is the first of the second half.
        assert!(ctx.window()[0].text.contains("turn number 3"));
    }

    #[test]
    fn pinned_prefix_unchanged_by_summary() {
        let mut ctx = buffer();
        let before = ctx.pinned().clone();
        for _ in 0..8 {
            ctx.push_user("some user text here").unwrap();
        }
        ctx.apply_summary("s".to_string());
        assert_eq!(ctx.pinned(), &before);
    }

    #[test]
    fn prompt_orders_prefix_block_window() {
        let mut ctx = buffer();
        ctx.push_user("first").unwrap();
        ctx.push_user("second").unwrap();
        ctx.apply_summary("older context".to_string());
        let messages = ctx.to_messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].text, "system rules");
        assert!(messages[1].text.contains("older context"));
        assert_eq!(messages.last().unwrap().text, "second");
    }

    #[test]
    fn oversized_entry_is_rejected_not_overflowed() {
        let mut ctx = buffer();
        let huge = "x".repeat(4 * 9000);
        assert!(matches!(
            ctx.push_user(huge),
            Err(Error::ContextOverflow(_))
        ));
    }
}
