//! Chatkeep - conversation store
//!
//! Persists per-session message history for a tenant and keeps it bounded:
//! - Crash-safe JSON persistence with backup recovery
//! - Advisory file locks per tenant index and per session log
//! - Background compaction of old turns into a rolling summary

pub mod compaction;
pub mod session;
pub mod storage;
pub mod store;

pub use compaction::{
    CompactionConfig, CompactionEvent, CompactionOutcome, CompactionScheduler, HttpSummarizer,
    Summarizer, SummarizerConfig,
};
pub use session::{
    Attachment, Message, MessageLog, Role, SessionMeta, SessionMetaUpdate, SessionRegistry,
    SessionSettings, ToolCall,
};
pub use storage::{AtomicFileStore, LockKey, LockManager, StoreLayout};
pub use store::SessionStore;

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the optional config file inside the store root
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration for Chatkeep
#[derive(Debug, Clone)]
pub struct ChatkeepConfig {
    /// Root directory holding one subdirectory per tenant
    pub root: PathBuf,

    /// When and how sessions are compacted
    pub compaction: CompactionConfig,

    /// Settings for the bundled HTTP summarizer
    pub summarizer: SummarizerConfig,
}

/// On-disk shape of `config.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    compaction: CompactionConfig,
    summarizer: SummarizerConfig,
}

impl ChatkeepConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            compaction: CompactionConfig::default(),
            summarizer: SummarizerConfig::default(),
        }
    }

    /// Load `{root}/config.toml` if it exists, falling back to defaults
    /// for anything it leaves out.
    pub fn load(root: PathBuf) -> Result<Self> {
        let path = root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(Self::new(root));
        }
        let text = std::fs::read_to_string(&path)?;
        Self::from_toml_str(root, &text)
    }

    pub fn from_toml_str(root: PathBuf, text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        let config = Self {
            root,
            compaction: file.compaction,
            summarizer: file.summarizer,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_root(mut self, root: PathBuf) -> Self {
        self.root = root;
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_summarizer(mut self, summarizer: SummarizerConfig) -> Self {
        self.summarizer = summarizer;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.compaction.summary_budget_tokens == 0 {
            return Err(StoreError::Config(
                "compaction.summary_budget_tokens must be positive".to_string(),
            ));
        }
        if self.summarizer.max_attempts == 0 {
            return Err(StoreError::Config(
                "summarizer.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the store root: `CHATKEEP_HOME`, else `~/.chatkeep`.
pub fn default_root() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("CHATKEEP_HOME") {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| StoreError::Config("could not find home directory".to_string()))?;
    Ok(home.join(".chatkeep"))
}

/// Result type for Chatkeep operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in Chatkeep
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to acquire lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to persist {0}")]
    Persist(PathBuf),

    #[error("Invalid identifier: {0:?}")]
    InvalidId(String),

    #[error("Summarizer error: {0}")]
    Summarizer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl StoreError {
    pub(crate) fn persist(path: &Path) -> Self {
        Self::Persist(path.to_path_buf())
    }
}
