//! Summarizer seam and the bundled HTTP implementation.
//!
//! The scheduler only ever sees the [`Summarizer`] trait. A summarizer may
//! fail or return nothing; the caller degrades to an extractive summary in
//! both cases.

use crate::session::Message;
use crate::{Result, StoreError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Prompt used to summarize a slice of conversation
pub const SUMMARIZE_PROMPT: &str = r#"You are compacting an older part of a conversation so it can be dropped from the context window.
Write a short summary another assistant can rely on to continue the conversation.

Include:
- What the user asked for and any decisions or preferences they stated
- Facts, names, numbers and results that later turns may depend on
- Work that was finished and work that is still open

Be concise. Do not invent details that are not in the transcript."#;

/// Prompt used to shrink an oversized rolling summary
pub const CONDENSE_PROMPT: &str = r#"The following running summary of a conversation has grown too long.
Rewrite it as a single shorter summary that keeps every decision, preference, fact and open item, dropping repetition."#;

/// Turns conversation into short text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize `messages`. `Ok(None)` means there was nothing useful to say.
    async fn summarize(&self, messages: &[Message]) -> Result<Option<String>>;

    /// Rewrite `text` into something shorter.
    async fn condense(&self, text: &str) -> Result<Option<String>>;
}

/// Summarizer that never produces text, so compaction always uses the
/// extractive fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveOnly;

#[async_trait]
impl Summarizer for ExtractiveOnly {
    async fn summarize(&self, _messages: &[Message]) -> Result<Option<String>> {
        Ok(None)
    }

    async fn condense(&self, _text: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Render messages as a plain transcript for a summarization prompt.
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let mut line = format!("[{}] {}", m.role, m.content);
            for call in m.tool_calls.iter().flatten() {
                line.push_str(&format!("\n  (tool call {}: {})", call.name, call.arguments));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── HTTP summarizer ─────────────────────────────────────────────────

/// Settings for [`HttpSummarizer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    /// Base delay after a 429; larger than the generic one
    pub rate_limit_base_delay_ms: u64,
    pub max_output_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 30,
            max_attempts: 4,
            retry_base_delay_ms: 200,
            rate_limit_base_delay_ms: 2_000,
            max_output_tokens: 1024,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Why one request attempt failed
#[derive(Debug)]
enum AttemptError {
    /// HTTP 429
    RateLimited(Option<Duration>),
    /// Timeouts, connection errors, 5xx
    Retryable(String),
    /// Anything a retry will not fix
    Fatal(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited(_) => write!(f, "rate limited"),
            Self::Retryable(msg) | Self::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

/// Summarizer backed by a Chat Completions endpoint.
pub struct HttpSummarizer {
    client: Client,
    config: SummarizerConfig,
    api_key: Option<String>,
}

impl HttpSummarizer {
    /// Build a summarizer, reading the API key from `config.api_key_env`.
    pub fn new(config: SummarizerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: SummarizerConfig, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("chatkeep/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Summarizer(e.to_string()))?;

        info!(
            "HTTP summarizer: model={}, base_url={}, key={}",
            config.model,
            config.base_url,
            if api_key.is_some() { "set" } else { "unset" }
        );
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    /// Exponential backoff with a little deterministic jitter.
    fn retry_backoff(base_ms: u64, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay_ms = base_ms.saturating_mul(exp);
        let jitter = 1.0 + ((attempt as f64 * 0.37).sin() * 0.1);
        Duration::from_millis((delay_ms as f64 * jitter) as u64)
    }

    /// Delay after a 429: the server's `Retry-After` if it sent one, capped
    /// at the next backoff step, else the rate-limit backoff.
    fn rate_limit_delay(base_ms: u64, retry_after: Option<Duration>, attempt: u32) -> Duration {
        match retry_after {
            Some(after) => after.min(Self::retry_backoff(base_ms, attempt.saturating_add(1))),
            None => Self::retry_backoff(base_ms, attempt),
        }
    }

    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<Option<String>> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            match self.send_once(system_prompt, user_prompt).await {
                Ok(text) => return Ok(text),
                Err(AttemptError::Fatal(msg)) => return Err(StoreError::Summarizer(msg)),
                Err(e) => {
                    if attempt == max_attempts {
                        last_err = Some(e.to_string());
                        break;
                    }
                    let delay = match &e {
                        AttemptError::RateLimited(after) => Self::rate_limit_delay(
                            self.config.rate_limit_base_delay_ms,
                            *after,
                            attempt,
                        ),
                        _ => Self::retry_backoff(self.config.retry_base_delay_ms, attempt),
                    };
                    warn!(
                        "Summarizer request failed: {} (attempt {}/{}), retrying in {:?}",
                        e, attempt, max_attempts, delay
                    );
                    last_err = Some(e.to_string());
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(StoreError::Summarizer(
            last_err.unwrap_or_else(|| "all retry attempts exhausted".to_string()),
        ))
    }

    async fn send_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> std::result::Result<Option<String>, AttemptError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt,
                },
            ],
            max_tokens: self.config.max_output_tokens,
            temperature: 0.2,
            stream: false,
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                AttemptError::Retryable(e.to_string())
            } else {
                AttemptError::Fatal(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AttemptError::RateLimited(retry_after));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(300).collect();
            let msg = format!("API error {status}: {detail}");
            return Err(if status.is_server_error() {
                AttemptError::Retryable(msg)
            } else {
                AttemptError::Fatal(msg)
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::Fatal(format!("invalid response body: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        debug!("Summarizer returned {} chars", text.as_ref().map_or(0, String::len));
        Ok(text)
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<Option<String>> {
        if messages.is_empty() {
            return Ok(None);
        }
        let prompt = format!(
            "=== TRANSCRIPT TO SUMMARIZE ===\n{}\n\n=== YOUR SUMMARY ===",
            transcript(messages)
        );
        self.complete(SUMMARIZE_PROMPT, &prompt).await
    }

    async fn condense(&self, text: &str) -> Result<Option<String>> {
        let prompt = format!("=== SUMMARY TO CONDENSE ===\n{text}\n\n=== SHORTER SUMMARY ===");
        self.complete(CONDENSE_PROMPT, &prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ToolCall;

    #[test]
    fn test_backoff_grows() {
        let first = HttpSummarizer::retry_backoff(200, 1);
        let second = HttpSummarizer::retry_backoff(200, 2);
        let third = HttpSummarizer::retry_backoff(200, 3);
        assert!(first < second && second < third);
        assert!(HttpSummarizer::retry_backoff(2_000, 1) > third);
    }

    #[test]
    fn test_retry_after_is_capped() {
        let capped = HttpSummarizer::rate_limit_delay(2_000, Some(Duration::from_secs(3600)), 1);
        assert!(capped <= Duration::from_millis(4_400));
        assert_eq!(capped, HttpSummarizer::retry_backoff(2_000, 2));

        let short = Duration::from_millis(50);
        assert_eq!(HttpSummarizer::rate_limit_delay(2_000, Some(short), 1), short);
        assert_eq!(
            HttpSummarizer::rate_limit_delay(2_000, None, 1),
            HttpSummarizer::retry_backoff(2_000, 1)
        );
    }

    #[test]
    fn test_transcript_includes_tool_calls() {
        let messages = vec![
            Message::user("find the blue sku"),
            Message::assistant("").with_tool_calls(vec![ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                arguments: serde_json::json!({"color": "blue"}),
            }]),
        ];
        let text = transcript(&messages);
        assert!(text.starts_with("[user] find the blue sku"));
        assert!(text.contains("tool call search"));
        assert!(text.contains("\"color\":\"blue\""));
    }

    #[tokio::test]
    async fn test_extractive_only_returns_none() {
        let s = ExtractiveOnly;
        assert_eq!(s.summarize(&[Message::user("x")]).await.unwrap(), None);
        assert_eq!(s.condense("x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let config = SummarizerConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            max_attempts: 2,
            retry_base_delay_ms: 1,
            request_timeout_secs: 2,
            ..Default::default()
        };
        let s = HttpSummarizer::with_api_key(config, None).unwrap();
        assert!(s.summarize(&[Message::user("hello")]).await.is_err());
    }
}
