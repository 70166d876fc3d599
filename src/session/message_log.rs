//! Per-session message history with a prompt window and rolling summary.
//!
//! The log is loaded lazily on first access, under the session lock, and
//! cached. Every mutation
//! takes the session lock, reloads the file, applies the change and writes
//! it straight back. Registry updates and the compaction check happen
//! after the session lock is released.

use super::registry::{SessionMetaUpdate, SessionRegistry};
use super::text::{derive_title, preview};
use super::types::{Message, MessageLogData, SessionSettings, SCHEMA_VERSION};
use crate::compaction::{can_compact, window_tokens, CompactionOutcome, CompactionScheduler};
use crate::storage::{AtomicFileStore, LockGuard, LockKey, LockManager};
use crate::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Ordered history of one session.
pub struct MessageLog {
    tenant: String,
    session_id: String,
    path: PathBuf,
    lock_key: LockKey,
    locks: LockManager,
    files: AtomicFileStore,
    registry: SessionRegistry,
    scheduler: Arc<CompactionScheduler>,
    cache: Mutex<Option<MessageLogData>>,
}

impl MessageLog {
    pub fn new(
        registry: SessionRegistry,
        session_id: &str,
        scheduler: Arc<CompactionScheduler>,
    ) -> Self {
        let tenant = registry.tenant().to_string();
        let layout = registry.layout().clone();
        Self {
            path: layout.messages_path(&tenant, session_id),
            lock_key: LockKey::session(&tenant, session_id),
            locks: LockManager::new(layout),
            files: AtomicFileStore::new(),
            tenant,
            session_id: session_id.to_string(),
            registry,
            scheduler,
            cache: Mutex::new(None),
        }
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ─── Storage plumbing, shared with the compaction job ───

    /// Take this session's lock. Not re-entrant.
    pub(crate) async fn lock(&self) -> Result<LockGuard> {
        self.locks.acquire(&self.lock_key).await
    }

    /// Read the log file, repairing what can be repaired.
    pub(crate) async fn load_from_disk(&self) -> MessageLogData {
        let Some(mut data) = self.files.read::<MessageLogData>(&self.path).await else {
            return MessageLogData::empty(&self.session_id, SessionSettings::default());
        };
        if data.schema_version > SCHEMA_VERSION {
            warn!(
                "Log for session {} has unsupported schema version {}, starting empty",
                self.session_id, data.schema_version
            );
            return MessageLogData::empty(&self.session_id, SessionSettings::default());
        }
        if data.session_id != self.session_id {
            warn!(
                "Log at {} names session {}, expected {}",
                self.path.display(),
                data.session_id,
                self.session_id
            );
            data.session_id = self.session_id.clone();
        }
        if data.prompt_window_start > data.full_history.len() {
            warn!(
                "Prompt window start {} beyond history of {} for session {}, clamping",
                data.prompt_window_start,
                data.full_history.len(),
                self.session_id
            );
            data.clamp_window();
        }
        data
    }

    /// Persist `data` and refresh the cache. Caller holds the session lock.
    pub(crate) async fn store_locked(&self, data: MessageLogData) -> bool {
        let ok = self.files.write(&self.path, &data).await;
        let mut cache = self.cache.lock().await;
        // On failure the disk still has the old state; reload it next time.
        *cache = if ok { Some(data) } else { None };
        ok
    }

    /// Whether the log file is still on disk. `false` once the session has
    /// been deleted.
    pub(crate) async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    async fn read<R>(&self, f: impl FnOnce(&MessageLogData) -> R) -> R {
        {
            let cache = self.cache.lock().await;
            if let Some(data) = cache.as_ref() {
                return f(data);
            }
        }

        // A cold load may restore the file from its backup, which is a
        // write, so it runs under the session lock like any other.
        let loaded = match self.lock().await {
            Ok(_guard) => self.load_from_disk().await,
            Err(e) => {
                warn!("Could not lock session {} for loading: {}", self.session_id, e);
                MessageLogData::empty(&self.session_id, SessionSettings::default())
            }
        };
        let mut cache = self.cache.lock().await;
        f(cache.get_or_insert(loaded))
    }

    async fn mutate<R>(&self, f: impl FnOnce(&mut MessageLogData) -> R) -> Option<R> {
        let _guard = match self.lock().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Could not lock session {}: {}", self.session_id, e);
                return None;
            }
        };
        if !self.exists().await {
            warn!("Session {} no longer exists, dropping update", self.session_id);
            return None;
        }
        let mut data = self.load_from_disk().await;
        let result = f(&mut data);
        data.clamp_window();
        if self.store_locked(data).await {
            Some(result)
        } else {
            None
        }
    }

    // ─── Reads ──────────────────────────────────────────────────────────

    pub async fn full_history(&self) -> Vec<Message> {
        self.read(|d| d.full_history.clone()).await
    }

    /// Messages still sent verbatim: `history[prompt_window_start..]`.
    pub async fn prompt_window(&self) -> Vec<Message> {
        self.read(|d| d.prompt_window().to_vec()).await
    }

    pub async fn summary(&self) -> Option<String> {
        self.read(|d| d.summary.clone()).await
    }

    pub async fn summary_token_count(&self) -> usize {
        self.read(|d| d.summary_token_count).await
    }

    pub async fn prompt_window_start(&self) -> usize {
        self.read(|d| d.prompt_window_start).await
    }

    pub async fn len(&self) -> usize {
        self.read(|d| d.full_history.len()).await
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn settings(&self) -> SessionSettings {
        self.read(|d| d.settings.clone()).await
    }

    /// At least ten messages in the prompt window.
    pub async fn can_compact(&self) -> bool {
        self.read(|d| can_compact(d.full_history.len(), d.prompt_window_start))
            .await
    }

    /// Estimated cost of `system_prompt`, the summary and the prompt window.
    pub async fn estimate_total_tokens(&self, system_prompt: &str) -> usize {
        self.read(|d| window_tokens(system_prompt, d.summary.as_deref(), d.prompt_window()))
            .await
    }

    // ─── Mutations ──────────────────────────────────────────────────────

    pub async fn append(self: &Arc<Self>, msg: Message) -> bool {
        self.append_batch(vec![msg]).await
    }

    /// Append `msgs` in order. Returns `false` if nothing was persisted.
    pub async fn append_batch(self: &Arc<Self>, msgs: Vec<Message>) -> bool {
        if msgs.is_empty() {
            return true;
        }

        let applied = self
            .mutate(|data| {
                let first_user_turn = !data.full_history.iter().any(Message::is_user);
                let title = if first_user_turn {
                    msgs.iter()
                        .find(|m| m.is_user())
                        .and_then(|m| derive_title(&m.content))
                } else {
                    None
                };
                data.full_history.extend(msgs);
                let last_preview = data
                    .full_history
                    .iter()
                    .rev()
                    .find(|m| !m.content.trim().is_empty())
                    .map(|m| preview(&m.content))
                    .unwrap_or_default();
                (data.full_history.len(), last_preview, title)
            })
            .await;
        let Some((count, last_preview, title)) = applied else {
            return false;
        };
        debug!("Session {} now has {} messages", self.session_id, count);

        self.registry
            .update_meta(
                &self.session_id,
                SessionMetaUpdate {
                    title_if_placeholder: title,
                    message_count: Some(count),
                    preview: Some(last_preview),
                    ..Default::default()
                },
            )
            .await;
        self.check_compaction().await;
        true
    }

    pub async fn update_settings(self: &Arc<Self>, settings: SessionSettings) -> bool {
        let ok = self.mutate(|d| d.settings = settings).await.is_some();
        self.check_compaction().await;
        ok
    }

    /// Move the window start to `start`, clamped into `[0, len]`.
    pub async fn set_prompt_window_start(self: &Arc<Self>, start: usize) -> bool {
        let ok = self
            .mutate(|d| d.prompt_window_start = start.min(d.full_history.len()))
            .await
            .is_some();
        self.check_compaction().await;
        ok
    }

    /// Move the window start forward by `n`, clamped to the history length.
    pub async fn advance_prompt_window(self: &Arc<Self>, n: usize) -> bool {
        let ok = self
            .mutate(|d| {
                d.prompt_window_start = d
                    .prompt_window_start
                    .saturating_add(n)
                    .min(d.full_history.len());
            })
            .await
            .is_some();
        self.check_compaction().await;
        ok
    }

    /// Drop all history and the summary.
    pub async fn clear(self: &Arc<Self>) -> bool {
        let ok = self
            .mutate(|d| {
                d.full_history.clear();
                d.summary = None;
                d.summary_token_count = 0;
                d.prompt_window_start = 0;
            })
            .await
            .is_some();
        if ok {
            self.registry
                .update_meta(
                    &self.session_id,
                    SessionMetaUpdate {
                        message_count: Some(0),
                        preview: Some(String::new()),
                        ..Default::default()
                    },
                )
                .await;
        }
        self.check_compaction().await;
        ok
    }

    /// Compact now regardless of the token threshold.
    pub async fn force_compact(self: &Arc<Self>) -> CompactionOutcome {
        self.scheduler.force_compact(Arc::clone(self)).await
    }

    /// Schedule compaction if the window is over the threshold and long
    /// enough. Returns whether a job was started.
    pub async fn check_compaction(self: &Arc<Self>) -> bool {
        let (tokens, compactable) = self
            .read(|d| {
                let system_prompt = d.settings.system_prompt.as_deref().unwrap_or("");
                (
                    window_tokens(system_prompt, d.summary.as_deref(), d.prompt_window()),
                    can_compact(d.full_history.len(), d.prompt_window_start),
                )
            })
            .await;
        if !compactable || !self.scheduler.over_threshold(tokens) {
            return false;
        }
        debug!(
            "Session {} window at {} tokens, scheduling compaction",
            self.session_id, tokens
        );
        self.scheduler.schedule(Arc::clone(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::{CompactionConfig, ExtractiveOnly};
    use crate::session::PLACEHOLDER_TITLE;
    use crate::storage::StoreLayout;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, threshold_tokens: usize) -> (SessionRegistry, Arc<MessageLog>) {
        let registry = SessionRegistry::new("acme", StoreLayout::new(dir.path())).unwrap();
        let meta = registry
            .create(SessionSettings::default(), None)
            .await
            .unwrap();
        let scheduler = Arc::new(CompactionScheduler::new(
            CompactionConfig {
                threshold_tokens,
                ..Default::default()
            },
            Arc::new(ExtractiveOnly),
        ));
        let log = Arc::new(MessageLog::new(registry.clone(), &meta.id, scheduler));
        (registry, log)
    }

    #[tokio::test]
    async fn test_can_compact_after_ten_messages() {
        let dir = TempDir::new().unwrap();
        let (_, log) = open(&dir, usize::MAX).await;

        for i in 0..9 {
            assert!(log.append(Message::user(format!("message {i}"))).await);
        }
        assert!(!log.can_compact().await);
        assert!(log.append(Message::assistant("tenth")).await);
        assert!(log.can_compact().await);
    }

    #[tokio::test]
    async fn test_window_start_is_clamped() {
        let dir = TempDir::new().unwrap();
        let (_, log) = open(&dir, usize::MAX).await;
        let batch: Vec<Message> = (0..6).map(|i| Message::user(format!("m{i}"))).collect();
        assert!(log.append_batch(batch).await);

        assert!(log.set_prompt_window_start(100).await);
        assert_eq!(log.prompt_window_start().await, 6);
        assert!(log.prompt_window().await.is_empty());

        assert!(log.set_prompt_window_start(2).await);
        assert!(log.advance_prompt_window(3).await);
        assert_eq!(log.prompt_window_start().await, 5);
        assert!(log.advance_prompt_window(usize::MAX).await);
        assert_eq!(log.prompt_window_start().await, 6);

        assert!(log.set_prompt_window_start(1).await);
        let window = log.prompt_window().await;
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].content, "m1");
    }

    #[tokio::test]
    async fn test_append_updates_registry_and_infers_title() {
        let dir = TempDir::new().unwrap();
        let (registry, log) = open(&dir, usize::MAX).await;

        assert!(log.append(Message::assistant("Welcome!")).await);
        let meta = registry.get(log.session_id()).await.unwrap();
        assert_eq!(meta.title, PLACEHOLDER_TITLE);
        assert_eq!(meta.message_count, 1);

        assert!(log.append(Message::user("Draft a launch email\nfor Friday")).await);
        assert!(log.append(Message::user("Something else entirely")).await);
        let meta = registry.get(log.session_id()).await.unwrap();
        assert_eq!(meta.title, "Draft a launch email");
        assert_eq!(meta.message_count, 3);
        assert_eq!(meta.preview, "Something else entirely");
    }

    #[tokio::test]
    async fn test_explicit_title_is_not_replaced() {
        let dir = TempDir::new().unwrap();
        let (registry, log) = open(&dir, usize::MAX).await;
        registry
            .update_meta(
                log.session_id(),
                SessionMetaUpdate {
                    title: Some("Q3 planning".to_string()),
                    ..Default::default()
                },
            )
            .await;

        assert!(log.append(Message::user("hello")).await);
        assert_eq!(registry.get(log.session_id()).await.unwrap().title, "Q3 planning");
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let dir = TempDir::new().unwrap();
        let (registry, log) = open(&dir, usize::MAX).await;
        let batch: Vec<Message> = (0..20).map(|i| Message::user(format!("m{i}"))).collect();
        assert!(log.append_batch(batch).await);
        assert!(matches!(
            log.force_compact().await,
            CompactionOutcome::Compacted { .. }
        ));

        assert!(log.clear().await);
        assert!(log.is_empty().await);
        assert_eq!(log.summary().await, None);
        assert_eq!(log.prompt_window_start().await, 0);
        assert_eq!(registry.get(log.session_id()).await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (registry, log) = open(&dir, usize::MAX).await;
        let settings = SessionSettings {
            system_prompt: Some("You write copy.".to_string()),
            ..Default::default()
        };
        assert!(log.update_settings(settings.clone()).await);
        assert!(log.append(Message::user("one")).await);

        let reopened = MessageLog::new(
            registry,
            log.session_id(),
            Arc::new(CompactionScheduler::new(
                CompactionConfig::default(),
                Arc::new(ExtractiveOnly),
            )),
        );
        assert_eq!(reopened.settings().await, settings);
        assert_eq!(reopened.full_history().await, log.full_history().await);
    }

    #[tokio::test]
    async fn test_out_of_range_window_is_repaired_on_load() {
        let dir = TempDir::new().unwrap();
        let (registry, log) = open(&dir, usize::MAX).await;
        let path = registry.layout().messages_path("acme", log.session_id());
        let mut data = MessageLogData::empty("someone-else", SessionSettings::default());
        data.full_history.push(Message::user("only"));
        data.prompt_window_start = 9;
        std::fs::write(&path, serde_json::to_vec(&data).unwrap()).unwrap();

        let fresh = MessageLog::new(
            registry,
            log.session_id(),
            Arc::new(CompactionScheduler::new(
                CompactionConfig::default(),
                Arc::new(ExtractiveOnly),
            )),
        );
        assert_eq!(fresh.prompt_window_start().await, 1);
        assert_eq!(fresh.len().await, 1);
    }

    #[tokio::test]
    async fn test_estimate_total_tokens() {
        let dir = TempDir::new().unwrap();
        let (_, log) = open(&dir, usize::MAX).await;
        assert!(log.append(Message::user("a".repeat(40))).await);
        assert!(log.append(Message::assistant("b".repeat(80))).await);

        assert_eq!(log.estimate_total_tokens("").await, 10 + 4 + 20 + 4);
        assert_eq!(log.estimate_total_tokens(&"s".repeat(8)).await, 2 + 38);
        assert!(log.set_prompt_window_start(1).await);
        assert_eq!(log.estimate_total_tokens("").await, 24);
    }

    #[tokio::test]
    async fn test_threshold_breach_schedules_compaction() {
        let dir = TempDir::new().unwrap();
        let (_, log) = open(&dir, 50).await;
        let batch: Vec<Message> = (0..19)
            .map(|i| Message::user(format!("Request number {i}. {}", "x".repeat(20))))
            .collect();
        assert!(log.append_batch(batch).await);
        // The batch alone crosses the threshold and schedules a job.
        log.scheduler.wait(log.session_id()).await;
        assert!(log.append(Message::user("and one more")).await);
        log.scheduler.wait(log.session_id()).await;

        assert!(log.summary().await.is_some());
        assert!(log.prompt_window_start().await > 0);
    }
}
