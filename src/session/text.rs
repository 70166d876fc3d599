//! Title inference and preview text.

const TITLE_MAX_CHARS: usize = 50;
const PREVIEW_MAX_CHARS: usize = 100;
const ELLIPSIS: &str = "...";

/// Derive a session title from the first line of a user message.
///
/// Long lines are cut at the last word boundary that fits, with an
/// ellipsis, so the result never exceeds 50 characters.
pub fn derive_title(content: &str) -> Option<String> {
    let line = content.lines().map(str::trim).find(|l| !l.is_empty())?;
    if line.chars().count() <= TITLE_MAX_CHARS {
        return Some(line.to_string());
    }

    let budget = TITLE_MAX_CHARS - ELLIPSIS.len();
    let head: String = line.chars().take(budget).collect();
    let cut = match head.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => &head[..pos],
        _ => head.as_str(),
    };
    Some(format!("{}{}", cut.trim_end(), ELLIPSIS))
}

/// Single-line preview of a message for the session list.
pub fn preview(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&flat, PREVIEW_MAX_CHARS)
}

/// Cut `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(ELLIPSIS.len());
    let head: String = text.chars().take(keep).collect();
    format!("{}{}", head.trim_end(), ELLIPSIS)
}
