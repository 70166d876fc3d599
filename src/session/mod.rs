//! Sessions: the tenant index and per-session message logs.

mod message_log;
mod registry;
pub(crate) mod text;
mod types;

pub use message_log::MessageLog;
pub use registry::{SessionMetaUpdate, SessionRegistry};
pub use text::derive_title;
pub use types::{
    Attachment, Message, MessageLogData, Role, SessionIndex, SessionMeta, SessionSettings,
    ToolCall, PLACEHOLDER_TITLE, SCHEMA_VERSION,
};
