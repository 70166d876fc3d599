//! Tenant-scoped session index.
//!
//! Every operation runs under the tenant's index lock as
//! load → mutate → atomic write, so concurrent callers never lose updates.

use super::types::{
    MessageLogData, SessionIndex, SessionMeta, SessionSettings, PLACEHOLDER_TITLE, SCHEMA_VERSION,
};
use crate::storage::{sanitize_id, AtomicFileStore, LockKey, LockManager, StoreLayout};
use crate::{Result, StoreError};
use chrono::Utc;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

/// Fields to change on an existing session. `None` leaves a field as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionMetaUpdate {
    pub title: Option<String>,
    /// Applied only while the session still has the placeholder title
    pub title_if_placeholder: Option<String>,
    pub archived: Option<bool>,
    pub message_count: Option<usize>,
    pub preview: Option<String>,
}

impl SessionMetaUpdate {
    fn is_activity(&self) -> bool {
        self.message_count.is_some() || self.preview.is_some()
    }
}

/// Session index for one tenant.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    tenant: String,
    layout: StoreLayout,
    locks: LockManager,
    files: AtomicFileStore,
}

impl SessionRegistry {
    pub fn new(tenant: &str, layout: StoreLayout) -> Result<Self> {
        if tenant.trim().is_empty() {
            return Err(StoreError::InvalidId(tenant.to_string()));
        }
        Ok(Self {
            tenant: tenant.to_string(),
            locks: LockManager::new(layout.clone()),
            layout,
            files: AtomicFileStore::new(),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn index_path(&self) -> PathBuf {
        self.layout.index_path(&self.tenant)
    }

    fn lock_key(&self) -> LockKey {
        LockKey::tenant(&self.tenant)
    }

    /// Caller must hold the tenant lock.
    async fn load_index(&self) -> SessionIndex {
        let Some(mut index) = self.files.read::<SessionIndex>(&self.index_path()).await else {
            return SessionIndex::default();
        };
        if index.schema_version > SCHEMA_VERSION {
            warn!(
                "Index for tenant {} has unsupported schema version {}, ignoring it",
                self.tenant, index.schema_version
            );
            return SessionIndex::default();
        }
        index.normalize();
        index
    }

    async fn store_index(&self, index: &SessionIndex) -> bool {
        self.files.write(&self.index_path(), index).await
    }

    /// Create a session and make it active.
    ///
    /// The directory and an empty message log are written before the index
    /// entry is committed, so a crash in between leaves an orphaned
    /// directory rather than an index entry without a log.
    pub async fn create(
        &self,
        settings: SessionSettings,
        title: Option<&str>,
    ) -> Result<SessionMeta> {
        let id = uuid::Uuid::now_v7().to_string();
        let dir = self.layout.session_dir(&self.tenant, &id);
        fs::create_dir_all(&dir).await?;

        let log_path = self.layout.messages_path(&self.tenant, &id);
        if !self.files.write(&log_path, &MessageLogData::empty(&id, settings)).await {
            return Err(StoreError::persist(&log_path));
        }

        let now = Utc::now();
        let meta = SessionMeta {
            id: id.clone(),
            tenant_id: self.tenant.clone(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(PLACEHOLDER_TITLE)
                .to_string(),
            created_at: now,
            last_active_at: now,
            updated_at: now,
            message_count: 0,
            preview: String::new(),
            archived: false,
        };

        let committed = self
            .locks
            .with_lock(&self.lock_key(), || async {
                let mut index = self.load_index().await;
                index.sessions.push(meta.clone());
                index.active_session_id = Some(id.clone());
                self.store_index(&index).await
            })
            .await?;
        if !committed {
            return Err(StoreError::persist(&self.index_path()));
        }

        info!("Created session {} for tenant {}", id, self.tenant);
        Ok(meta)
    }

    pub async fn get(&self, id: &str) -> Option<SessionMeta> {
        self.locks
            .with_lock(&self.lock_key(), || async {
                self.load_index().await.find(id).cloned()
            })
            .await
            .ok()
            .flatten()
    }

    /// Sessions ordered by most recent activity first.
    pub async fn list(&self, include_archived: bool) -> Vec<SessionMeta> {
        let index = self
            .locks
            .with_lock(&self.lock_key(), || self.load_index())
            .await
            .unwrap_or_default();
        let mut sessions: Vec<SessionMeta> = index
            .sessions
            .into_iter()
            .filter(|s| include_archived || !s.archived)
            .collect();
        sessions.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        sessions
    }

    /// Point the active session at `id`. `false` if `id` is unknown.
    pub async fn set_active(&self, id: &str) -> bool {
        self.locks
            .with_lock(&self.lock_key(), || async {
                let mut index = self.load_index().await;
                if index.find(id).is_none() {
                    return false;
                }
                index.active_session_id = Some(id.to_string());
                self.store_index(&index).await
            })
            .await
            .unwrap_or(false)
    }

    pub async fn active(&self) -> Option<SessionMeta> {
        self.locks
            .with_lock(&self.lock_key(), || async {
                let index = self.load_index().await;
                index
                    .active_session_id
                    .as_deref()
                    .and_then(|id| index.find(id))
                    .cloned()
            })
            .await
            .ok()
            .flatten()
    }

    /// Apply `update` to session `id`. `false` if `id` is unknown or the
    /// index could not be written.
    pub async fn update_meta(&self, id: &str, update: SessionMetaUpdate) -> bool {
        self.locks
            .with_lock(&self.lock_key(), || async {
                let mut index = self.load_index().await;
                let Some(meta) = index.find_mut(id) else {
                    return false;
                };

                let now = Utc::now();
                if let Some(title) = &update.title {
                    meta.title = title.clone();
                } else if let Some(title) = &update.title_if_placeholder {
                    if meta.has_placeholder_title() {
                        debug!("Inferred title for session {}: {}", id, title);
                        meta.title = title.clone();
                    }
                }
                if let Some(archived) = update.archived {
                    meta.archived = archived;
                }
                if let Some(count) = update.message_count {
                    meta.message_count = count;
                }
                if let Some(preview) = &update.preview {
                    meta.preview = preview.clone();
                }
                if update.is_activity() {
                    meta.last_active_at = now;
                }
                meta.updated_at = now;

                self.store_index(&index).await
            })
            .await
            .unwrap_or(false)
    }

    /// Remove session `id`.
    ///
    /// The index entry goes first, under the tenant lock. The directory is
    /// removed afterwards under the session lock. A crash in between only
    /// leaks the directory.
    pub async fn delete(&self, id: &str) -> bool {
        let removed = self
            .locks
            .with_lock(&self.lock_key(), || async {
                let mut index = self.load_index().await;
                let Some(pos) = index.sessions.iter().position(|s| s.id == id) else {
                    return false;
                };
                index.sessions.remove(pos);
                if index.active_session_id.as_deref() == Some(id) {
                    index.active_session_id = None;
                }
                self.store_index(&index).await
            })
            .await
            .unwrap_or(false);

        if !removed {
            return false;
        }

        // Wait out any writer still holding the session lock, then remove
        // the directory with the lock held so nothing can write into it.
        let dir = self.layout.session_dir(&self.tenant, id);
        let guard = match self.locks.acquire(&LockKey::session(&self.tenant, id)).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                debug!("No session lock for {}: {}", id, e);
                None
            }
        };
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove session directory {}: {}", dir.display(), e),
        }
        drop(guard);
        info!("Deleted session {} for tenant {}", id, self.tenant);
        true
    }

    /// Remove session directories that have no index entry and have not
    /// been modified for at least `min_age`.
    ///
    /// The age check keeps a sweep from racing a `create` that has written
    /// its directory but not yet registered it. Returns the removed
    /// directory names.
    pub async fn sweep_orphans(&self, min_age: Duration) -> Vec<String> {
        let orphans = self
            .locks
            .with_lock(&self.lock_key(), || async {
                let index = self.load_index().await;
                let known: std::collections::HashSet<String> =
                    index.sessions.iter().map(|s| sanitize_id(&s.id)).collect();
                self.unregistered_dirs(&known, min_age).await
            })
            .await
            .unwrap_or_default();

        let mut removed = Vec::new();
        for (name, path) in orphans {
            match fs::remove_dir_all(&path).await {
                Ok(()) => removed.push(name),
                Err(e) => warn!("Failed to remove orphan {}: {}", path.display(), e),
            }
        }
        if !removed.is_empty() {
            info!(
                "Swept {} orphaned session directories for tenant {}",
                removed.len(),
                self.tenant
            );
        }
        removed
    }

    async fn unregistered_dirs(
        &self,
        known: &std::collections::HashSet<String>,
        min_age: Duration,
    ) -> Vec<(String, PathBuf)> {
        let mut found = Vec::new();
        let Ok(mut entries) = fs::read_dir(self.layout.sessions_dir(&self.tenant)).await else {
            return found;
        };
        let now = SystemTime::now();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if known.contains(&name) {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= min_age {
                found.push((name, entry.path()));
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> SessionRegistry {
        SessionRegistry::new("acme", StoreLayout::new(dir.path())).unwrap()
    }

    #[tokio::test]
    async fn test_create_writes_log_and_index() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        let meta = reg.create(SessionSettings::default(), None).await.unwrap();
        assert_eq!(meta.title, PLACEHOLDER_TITLE);
        assert_eq!(meta.tenant_id, "acme");
        assert!(reg.layout().messages_path("acme", &meta.id).exists());
        assert_eq!(reg.get(&meta.id).await, Some(meta.clone()));
        assert_eq!(reg.active().await.map(|m| m.id), Some(meta.id));
    }

    #[tokio::test]
    async fn test_empty_tenant_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(SessionRegistry::new(" ", StoreLayout::new(dir.path())).is_err());
    }

    #[tokio::test]
    async fn test_list_orders_by_activity_and_hides_archived() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);

        let a = reg.create(SessionSettings::default(), Some("a")).await.unwrap();
        let b = reg.create(SessionSettings::default(), Some("b")).await.unwrap();
        let c = reg.create(SessionSettings::default(), Some("c")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(
            reg.update_meta(
                &a.id,
                SessionMetaUpdate {
                    message_count: Some(1),
                    ..Default::default()
                }
            )
            .await
        );
        assert!(
            reg.update_meta(
                &b.id,
                SessionMetaUpdate {
                    archived: Some(true),
                    ..Default::default()
                }
            )
            .await
        );

        let ids: Vec<String> = reg.list(false).await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id.clone(), c.id.clone()]);
        assert_eq!(reg.list(true).await.len(), 3);
    }

    #[tokio::test]
    async fn test_set_active_unknown_id() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let a = reg.create(SessionSettings::default(), None).await.unwrap();
        let b = reg.create(SessionSettings::default(), None).await.unwrap();

        assert!(!reg.set_active("nope").await);
        assert_eq!(reg.active().await.map(|m| m.id), Some(b.id));
        assert!(reg.set_active(&a.id).await);
        assert_eq!(reg.active().await.map(|m| m.id), Some(a.id));
    }

    #[tokio::test]
    async fn test_title_if_placeholder_only_once() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let meta = reg.create(SessionSettings::default(), None).await.unwrap();

        let infer = |t: &str| SessionMetaUpdate {
            title_if_placeholder: Some(t.to_string()),
            ..Default::default()
        };
        assert!(reg.update_meta(&meta.id, infer("First")).await);
        assert!(reg.update_meta(&meta.id, infer("Second")).await);
        assert_eq!(reg.get(&meta.id).await.unwrap().title, "First");
        assert!(!reg.update_meta("missing", infer("x")).await);
    }

    #[tokio::test]
    async fn test_delete_removes_entry_and_directory() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let meta = reg.create(SessionSettings::default(), None).await.unwrap();
        let session_dir = reg.layout().session_dir("acme", &meta.id);

        assert!(reg.delete(&meta.id).await);
        assert!(!session_dir.exists());
        assert_eq!(reg.get(&meta.id).await, None);
        assert!(reg.active().await.is_none());
        assert!(!reg.delete(&meta.id).await);
    }

    #[tokio::test]
    async fn test_sweep_orphans() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let kept = reg.create(SessionSettings::default(), None).await.unwrap();
        let orphan = reg.layout().session_dir("acme", "orphan-1");
        std::fs::create_dir_all(&orphan).unwrap();

        assert!(reg.sweep_orphans(Duration::from_secs(3600)).await.is_empty());
        assert_eq!(reg.sweep_orphans(Duration::ZERO).await, vec!["orphan-1".to_string()]);
        assert!(!orphan.exists());
        assert!(reg.layout().session_dir("acme", &kept.id).exists());
    }

    #[tokio::test]
    async fn test_corrupt_index_falls_back_to_empty() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let path = reg.layout().index_path("acme");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{{{").unwrap();

        assert!(reg.list(true).await.is_empty());
        let meta = reg.create(SessionSettings::default(), None).await.unwrap();
        assert_eq!(reg.list(true).await.len(), 1);
        assert_eq!(reg.get(&meta.id).await.map(|m| m.id), Some(meta.id));
    }
}
