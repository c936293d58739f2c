//! LLM context management for duplex
//!
//! Three regions in token units: an immutable pinned prefix, an append-only
//! rolling window, and a nullable session-state block that replaces evicted
//! window entries after summarization rollover. Plus a shared LRU cache for
//! pinned-prefix reuse across sessions.

pub mod context;
pub mod prefix_cache;
pub mod rollover;

pub use context::{estimate_tokens, ContextBuffer, PinnedPrefix, WindowEntry};
pub use prefix_cache::PrefixCache;
pub use rollover::{rollover_if_needed, LlmSummarizer, RolloverOutcome, Summarizer};
