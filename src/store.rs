//! Entry point tying registries, message logs and the compaction scheduler
//! to one store root.

use crate::compaction::{CompactionEvent, CompactionScheduler, Summarizer};
use crate::session::{MessageLog, SessionMeta, SessionRegistry, SessionSettings};
use crate::storage::StoreLayout;
use crate::{ChatkeepConfig, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::info;

type LogKey = (String, String);

/// Conversation store rooted at one directory.
///
/// Message logs are cached so every caller in this process shares one
/// [`MessageLog`] per session.
pub struct SessionStore {
    config: ChatkeepConfig,
    layout: StoreLayout,
    scheduler: Arc<CompactionScheduler>,
    logs: Mutex<HashMap<LogKey, Arc<MessageLog>>>,
}

impl SessionStore {
    pub fn open(config: ChatkeepConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        info!("Opening conversation store at {}", config.root.display());
        let scheduler = Arc::new(CompactionScheduler::new(
            config.compaction.clone(),
            summarizer,
        ));
        Self {
            layout: StoreLayout::new(&config.root),
            config,
            scheduler,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ChatkeepConfig {
        &self.config
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn scheduler(&self) -> &Arc<CompactionScheduler> {
        &self.scheduler
    }

    fn logs(&self) -> MutexGuard<'_, HashMap<LogKey, Arc<MessageLog>>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a hook called after every successful compaction.
    pub fn on_compacted(&self, hook: impl Fn(&CompactionEvent) + Send + Sync + 'static) {
        self.scheduler.on_compacted(hook);
    }

    pub fn registry(&self, tenant: &str) -> Result<SessionRegistry> {
        SessionRegistry::new(tenant, self.layout.clone())
    }

    pub async fn create_session(
        &self,
        tenant: &str,
        settings: SessionSettings,
        title: Option<&str>,
    ) -> Result<SessionMeta> {
        self.registry(tenant)?.create(settings, title).await
    }

    /// Message log of a registered session. `None` for unknown sessions.
    pub async fn log(&self, tenant: &str, session_id: &str) -> Option<Arc<MessageLog>> {
        let key = (tenant.to_string(), session_id.to_string());
        if let Some(log) = self.logs().get(&key) {
            return Some(Arc::clone(log));
        }

        let registry = self.registry(tenant).ok()?;
        registry.get(session_id).await?;

        let mut logs = self.logs();
        let log = logs.entry(key).or_insert_with(|| {
            Arc::new(MessageLog::new(
                registry,
                session_id,
                Arc::clone(&self.scheduler),
            ))
        });
        Some(Arc::clone(log))
    }

    /// Delete a session, cancelling any compaction that has not yet
    /// started. The directory is removed under the session lock, so a job
    /// already holding it finishes first. Handles to the log obtained
    /// earlier stop persisting anything once this returns.
    pub async fn delete_session(&self, tenant: &str, session_id: &str) -> bool {
        self.scheduler.cancel(session_id);
        self.logs()
            .remove(&(tenant.to_string(), session_id.to_string()));
        let Ok(registry) = self.registry(tenant) else {
            return false;
        };
        registry.delete(session_id).await
    }

    /// Remove unregistered session directories older than `min_age`.
    pub async fn sweep_orphans(&self, tenant: &str, min_age: Duration) -> Result<Vec<String>> {
        Ok(self.registry(tenant)?.sweep_orphans(min_age).await)
    }
}
