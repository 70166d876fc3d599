//! Persisted session and message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version written into `index.json` and `messages.json`
pub const SCHEMA_VERSION: u32 = 1;

/// Title a session carries until one is inferred or set
pub const PLACEHOLDER_TITLE: &str = "New Chat";

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A tool invocation requested by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON arguments, kept structured
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Something attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Attachment {
    File {
        path: String,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Image {
        url: String,
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Link {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
}

/// One conversation turn. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_call_id: None,
            attachments: None,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Result of the tool call `call_id`
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(call_id.into());
        msg
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = Some(attachments);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// Per-session generation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Index entry describing one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub preview: String,
    #[serde(default)]
    pub archived: bool,
}

impl SessionMeta {
    pub fn has_placeholder_title(&self) -> bool {
        self.title == PLACEHOLDER_TITLE
    }
}

/// Contents of `index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub sessions: Vec<SessionMeta>,
    #[serde(default)]
    pub active_session_id: Option<String>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            sessions: Vec::new(),
            active_session_id: None,
        }
    }
}

impl SessionIndex {
    pub fn find(&self, id: &str) -> Option<&SessionMeta> {
        self.sessions.iter().find(|s| s.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut SessionMeta> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    /// Drop duplicate ids (first wins) and a dangling active pointer.
    pub(crate) fn normalize(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.sessions.retain(|s| seen.insert(s.id.clone()));
        if let Some(active) = &self.active_session_id {
            if self.find(active).is_none() {
                self.active_session_id = None;
            }
        }
    }
}

/// Contents of `messages.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLogData {
    pub schema_version: u32,
    pub session_id: String,
    #[serde(default)]
    pub settings: SessionSettings,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub summary_token_count: usize,
    #[serde(default)]
    pub full_history: Vec<Message>,
    #[serde(default)]
    pub prompt_window_start: usize,
}

impl MessageLogData {
    pub fn empty(session_id: &str, settings: SessionSettings) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_id: session_id.to_string(),
            settings,
            summary: None,
            summary_token_count: 0,
            full_history: Vec::new(),
            prompt_window_start: 0,
        }
    }

    pub fn prompt_window(&self) -> &[Message] {
        let start = self.prompt_window_start.min(self.full_history.len());
        &self.full_history[start..]
    }

    pub fn clamp_window(&mut self) {
        self.prompt_window_start = self.prompt_window_start.min(self.full_history.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_message_wire_shape() {
        let msg = Message::assistant("calling")
            .with_tool_calls(vec![ToolCall {
                id: "c1".to_string(),
                name: "search".to_string(),
                arguments: serde_json::json!({"q": "shoes"}),
            }])
            .with_attachments(vec![Attachment::Image {
                url: "https://x/y.png".to_string(),
                mime_type: Some("image/png".to_string()),
            }]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["toolCalls"][0]["name"], "search");
        assert_eq!(value["attachments"][0]["type"], "image");
        assert_eq!(value["attachments"][0]["mimeType"], "image/png");
        assert!(value.get("toolCallId").is_none());
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_unknown_attachment_type_is_rejected() {
        let json = r#"{"type": "video", "url": "x"}"#;
        assert!(serde_json::from_str::<Attachment>(json).is_err());
    }

    #[test]
    fn test_log_defaults_for_missing_fields() {
        let json = r#"{"schemaVersion": 1, "sessionId": "s1"}"#;
        let data: MessageLogData = serde_json::from_str(json).unwrap();
        assert_eq!(data, MessageLogData::empty("s1", SessionSettings::default()));
    }

    #[test]
    fn test_normalize_index() {
        let now = Utc::now();
        let meta = |id: &str| SessionMeta {
            id: id.to_string(),
            tenant_id: "t".to_string(),
            title: PLACEHOLDER_TITLE.to_string(),
            created_at: now,
            last_active_at: now,
            updated_at: now,
            message_count: 0,
            preview: String::new(),
            archived: false,
        };
        let mut index = SessionIndex {
            schema_version: SCHEMA_VERSION,
            sessions: vec![meta("a"), meta("b"), meta("a")],
            active_session_id: Some("gone".to_string()),
        };
        index.normalize();
        assert_eq!(index.sessions.len(), 2);
        assert_eq!(index.active_session_id, None);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("User".parse::<Role>().unwrap(), Role::User);
        assert!("robot".parse::<Role>().is_err());
    }
}
