//! Context compaction.
//!
//! Once a session's prompt window grows past the token threshold, the
//! older part of the window is folded into a rolling summary and the window
//! start moves forward. The full history is never rewritten.

pub mod compact;
mod scheduler;
mod summarizer;
pub mod tokens;

pub use compact::{
    can_compact, extractive_summary, plan_boundary, FALLBACK_HEADER, MIN_COMPACT_MESSAGES,
    MIN_KEEP_MESSAGES, SUMMARY_SEPARATOR,
};
pub use scheduler::{
    CompactionConfig, CompactionEvent, CompactionOutcome, CompactionScheduler, JobState,
};
pub use summarizer::{
    transcript, ExtractiveOnly, HttpSummarizer, Summarizer, SummarizerConfig, CONDENSE_PROMPT,
    SUMMARIZE_PROMPT,
};
pub use tokens::{estimate_tokens, message_tokens, window_tokens};
