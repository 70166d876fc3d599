//! Approximate token accounting.
//!
//! Four characters per token, independent of any model tokenizer, so the
//! same history always produces the same estimate.

use crate::session::{Message, ToolCall};

/// Approximate characters per token for context estimation
pub const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Fixed cost of a message envelope (role, separators)
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Fixed cost of a tool call envelope (id, name)
pub const TOOL_CALL_OVERHEAD_TOKENS: usize = 10;

/// Estimate token count for a string
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / APPROX_CHARS_PER_TOKEN
}

pub fn tool_call_tokens(call: &ToolCall) -> usize {
    let args = serde_json::to_string(&call.arguments).unwrap_or_default();
    estimate_tokens(&args) + TOOL_CALL_OVERHEAD_TOKENS
}

pub fn message_tokens(msg: &Message) -> usize {
    let calls: usize = msg
        .tool_calls
        .iter()
        .flatten()
        .map(tool_call_tokens)
        .sum();
    estimate_tokens(&msg.content) + MESSAGE_OVERHEAD_TOKENS + calls
}

/// Cost of everything sent to the model: system prompt, rolling summary,
/// and the messages still in the prompt window.
pub fn window_tokens(system_prompt: &str, summary: Option<&str>, window: &[Message]) -> usize {
    estimate_tokens(system_prompt)
        + summary.map(estimate_tokens).unwrap_or(0)
        + window.iter().map(message_tokens).sum::<usize>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depends_only_on_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcdefg"), 1);
        assert_eq!(estimate_tokens("zzzz"), estimate_tokens("    "));
        assert_eq!(estimate_tokens(&"q".repeat(4000)), 1000);
        // Counted in characters, not bytes.
        assert_eq!(estimate_tokens("éééé"), 1);
    }

    #[test]
    fn test_message_overhead() {
        let msg = Message::user("12345678");
        assert_eq!(message_tokens(&msg), 2 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn test_tool_call_cost() {
        let call = ToolCall {
            id: "c1".to_string(),
            name: "lookup".to_string(),
            arguments: serde_json::json!({"sku": "A1"}),
        };
        // {"sku":"A1"} is 12 characters.
        assert_eq!(tool_call_tokens(&call), 3 + TOOL_CALL_OVERHEAD_TOKENS);

        let msg = Message::assistant("").with_tool_calls(vec![call.clone(), call]);
        assert_eq!(message_tokens(&msg), MESSAGE_OVERHEAD_TOKENS + 2 * 13);
    }

    #[test]
    fn test_window_tokens() {
        let window = vec![Message::user("abcd"), Message::assistant("efgh")];
        let total = window_tokens("system!!", Some("sum."), &window);
        assert_eq!(total, 2 + 1 + 2 * (1 + MESSAGE_OVERHEAD_TOKENS));
        assert_eq!(window_tokens("", None, &[]), 0);
    }
}
