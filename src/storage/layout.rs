//! Directory layout of a store root.
//!
//! ```text
//! {root}/{tenant}/sessions/index.json
//! {root}/{tenant}/sessions/.index.lock
//! {root}/{tenant}/sessions/{id}/messages.json
//! {root}/{tenant}/sessions/{id}/.session.lock
//! ```

use std::path::{Path, PathBuf};

const SESSIONS_DIR: &str = "sessions";
const INDEX_FILE: &str = "index.json";
const INDEX_LOCK_FILE: &str = ".index.lock";
const MESSAGES_FILE: &str = "messages.json";
const SESSION_LOCK_FILE: &str = ".session.lock";

/// Maps tenant and session ids to paths under one root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(sanitize_id(tenant)).join(SESSIONS_DIR)
    }

    pub fn index_path(&self, tenant: &str) -> PathBuf {
        self.sessions_dir(tenant).join(INDEX_FILE)
    }

    pub fn index_lock_path(&self, tenant: &str) -> PathBuf {
        self.sessions_dir(tenant).join(INDEX_LOCK_FILE)
    }

    pub fn session_dir(&self, tenant: &str, session_id: &str) -> PathBuf {
        self.sessions_dir(tenant).join(sanitize_id(session_id))
    }

    pub fn messages_path(&self, tenant: &str, session_id: &str) -> PathBuf {
        self.session_dir(tenant, session_id).join(MESSAGES_FILE)
    }

    pub fn session_lock_path(&self, tenant: &str, session_id: &str) -> PathBuf {
        self.session_dir(tenant, session_id).join(SESSION_LOCK_FILE)
    }
}

/// Make an id safe for use as a single path component.
///
/// Anything outside `[A-Za-z0-9_-]` becomes `_`, so `..` and separators can
/// never escape the tenant directory.
pub fn sanitize_id(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "_".to_string()
    } else {
        safe
    }
}
