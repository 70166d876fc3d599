//! Compaction planning: where to cut, and how to build the summary when
//! the summarizer cannot help.
//!
//! Everything here is pure so the scheduler's decisions are reproducible.

use super::tokens::{estimate_tokens, APPROX_CHARS_PER_TOKEN};
use crate::session::text::truncate_chars;
use crate::session::Message;

/// Minimum window length before compaction is considered at all, and the
/// minimum number of messages a compaction must fold into the summary.
pub const MIN_COMPACT_MESSAGES: usize = 10;

/// Messages always left verbatim at the end of the window
pub const MIN_KEEP_MESSAGES: usize = 5;

/// First line of every extractive summary
pub const FALLBACK_HEADER: &str = "Summary of earlier conversation (extractive):";

/// Placed between a prior summary and the next one
pub const SUMMARY_SEPARATOR: &str = "\n\n---\n\n";

/// Prefix of a summary that was cut to fit its budget
pub const TRUNCATION_MARKER: &str = "[earlier summary truncated]\n";

const FALLBACK_MAX_BULLETS: usize = 10;
const FALLBACK_SENTENCE_MAX_CHARS: usize = 100;

/// Whether the window holds enough messages to be worth compacting.
pub fn can_compact(history_len: usize, window_start: usize) -> bool {
    history_len.saturating_sub(window_start) >= MIN_COMPACT_MESSAGES
}

/// New prompt window start for a history of `history_len` messages whose
/// window currently starts at `window_start`.
///
/// Keeps `max(5, window_len / 4)` messages. Returns `None` when fewer than
/// [`MIN_COMPACT_MESSAGES`] messages would be summarized.
pub fn plan_boundary(history_len: usize, window_start: usize) -> Option<usize> {
    let start = window_start.min(history_len);
    let window_len = history_len - start;
    let keep = MIN_KEEP_MESSAGES.max(window_len / 4);
    let new_start = history_len.saturating_sub(keep);
    if new_start < start || new_start - start < MIN_COMPACT_MESSAGES {
        return None;
    }
    Some(new_start)
}

/// First sentence of `text`: up to the first `.`, `!` or `?` that ends a
/// word, or the first line break, whichever comes first.
pub fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\n' | '\r' => return text[..i].trim_end(),
            '.' | '!' | '?' => {
                let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
                if at_boundary {
                    return &text[..i + c.len_utf8()];
                }
            }
            _ => {}
        }
    }
    text
}

/// Deterministic summary built from the user turns in `messages`: one
/// bullet per user message holding its first sentence, at most ten.
pub fn extractive_summary(messages: &[Message]) -> String {
    let bullets: Vec<String> = messages
        .iter()
        .filter(|m| m.is_user())
        .map(|m| first_sentence(&m.content))
        .filter(|s| !s.is_empty())
        .take(FALLBACK_MAX_BULLETS)
        .map(|s| format!("- {}", truncate_chars(s, FALLBACK_SENTENCE_MAX_CHARS)))
        .collect();

    let mut summary = String::from(FALLBACK_HEADER);
    if bullets.is_empty() {
        summary.push_str("\n- (no user requests in this part of the conversation)");
    }
    for bullet in bullets {
        summary.push('\n');
        summary.push_str(&bullet);
    }
    summary
}

/// Append `fresh` to an existing rolling summary.
pub fn merge_summary(prior: Option<&str>, fresh: &str) -> String {
    match prior.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prior) => format!("{prior}{SUMMARY_SEPARATOR}{fresh}"),
        None => fresh.to_string(),
    }
}

/// Hard-cut `text` to `budget_tokens`, keeping the most recent characters
/// behind [`TRUNCATION_MARKER`]. Budgets too small for the marker get the
/// bare tail.
pub fn truncate_to_budget(text: &str, budget_tokens: usize) -> String {
    if estimate_tokens(text) <= budget_tokens {
        return text.to_string();
    }
    let max_chars = budget_tokens.saturating_mul(APPROX_CHARS_PER_TOKEN);
    let marker_chars = TRUNCATION_MARKER.chars().count();
    let total = text.chars().count();
    if max_chars <= marker_chars {
        return text.chars().skip(total - max_chars.min(total)).collect();
    }
    let keep = max_chars - marker_chars;
    let tail: String = text.chars().skip(total - keep.min(total)).collect();
    format!("{TRUNCATION_MARKER}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_can_compact_threshold() {
        assert!(!can_compact(9, 0));
        assert!(can_compact(10, 0));
        assert!(!can_compact(15, 6));
        assert!(!can_compact(3, 10));
    }

    #[test]
    fn test_boundary_keeps_quarter_or_five() {
        // 40 messages: keep 10, summarize 30.
        assert_eq!(plan_boundary(40, 0), Some(30));
        // 20 messages: keep 5, summarize 15.
        assert_eq!(plan_boundary(20, 0), Some(15));
        // 15 messages: keep 5, summarize exactly 10.
        assert_eq!(plan_boundary(15, 0), Some(10));
        // Second pass over a previously compacted history.
        assert_eq!(plan_boundary(60, 30), Some(53));
    }

    #[test]
    fn test_boundary_noop_when_too_few_would_fold() {
        assert_eq!(plan_boundary(14, 0), None);
        assert_eq!(plan_boundary(10, 0), None);
        assert_eq!(plan_boundary(40, 30), None);
        assert_eq!(plan_boundary(5, 9), None);
    }

    #[test]
    fn test_boundary_rule_holds_for_all_small_windows() {
        for len in 0..200 {
            for start in 0..=len {
                let window = len - start;
                let keep = 5.max(window / 4);
                match plan_boundary(len, start) {
                    Some(new_start) => {
                        assert_eq!(new_start, len - keep);
                        assert!(new_start - start >= 10);
                        assert!(new_start <= len);
                    }
                    None => assert!(len < keep + start + 10),
                }
            }
        }
    }

    #[test]
    fn test_first_sentence() {
        assert_eq!(first_sentence("Hello there. More text."), "Hello there.");
        assert_eq!(first_sentence("Price is 3.50 today! ok"), "Price is 3.50 today!");
        assert_eq!(first_sentence("line one\nline two"), "line one");
        assert_eq!(first_sentence("  no punctuation  "), "no punctuation");
        assert_eq!(first_sentence("Why?"), "Why?");
    }

    #[test]
    fn test_extractive_summary_caps_bullets_and_length() {
        let mut messages = Vec::new();
        for i in 0..14 {
            messages.push(Message::user(format!(
                "Request {i} {}. Second sentence.",
                "word ".repeat(40)
            )));
            messages.push(Message::assistant("Sure."));
        }
        let summary = extractive_summary(&messages);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines[0], FALLBACK_HEADER);
        assert_eq!(lines.len(), 11);
        for line in &lines[1..] {
            let body = line.strip_prefix("- ").unwrap();
            assert!(body.chars().count() <= 100);
            assert!(!body.contains("Second sentence"));
        }
        assert!(lines[1].starts_with("- Request 0 "));
    }

    #[test]
    fn test_extractive_summary_without_user_turns() {
        let summary = extractive_summary(&[Message::assistant("only me")]);
        assert!(summary.starts_with(FALLBACK_HEADER));
        assert_eq!(summary.lines().count(), 2);
    }

    #[test]
    fn test_merge_summary() {
        assert_eq!(merge_summary(None, "B"), "B");
        assert_eq!(merge_summary(Some("  "), "B"), "B");
        assert_eq!(merge_summary(Some("A"), "B"), format!("A{SUMMARY_SEPARATOR}B"));
    }

    #[test]
    fn test_truncate_to_budget_keeps_tail() {
        let text = format!("{}{}", "old ".repeat(1000), "newest fact");
        let cut = truncate_to_budget(&text, 100);
        assert!(cut.starts_with(TRUNCATION_MARKER));
        assert!(cut.ends_with("newest fact"));
        assert!(estimate_tokens(&cut) <= 100);
        assert_eq!(truncate_to_budget("short", 100), "short");
    }

    #[test]
    fn test_truncate_to_tiny_budget_drops_marker() {
        let text = "a fairly long rolling summary that ends here";
        for budget in 1..=7 {
            let cut = truncate_to_budget(text, budget);
            assert!(estimate_tokens(&cut) <= budget, "budget {budget}: {cut:?}");
            assert!(text.ends_with(&cut));
        }
        let cut = truncate_to_budget(text, 8);
        assert!(cut.starts_with(TRUNCATION_MARKER));
        assert!(estimate_tokens(&cut) <= 8);
    }
}
