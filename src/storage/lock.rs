//! Advisory file locks.
//!
//! Each lockable resource has a zero-byte lock file next to the data it
//! guards. Holding a [`LockGuard`] means holding an exclusive `flock` on that
//! file; dropping it releases the lock on every exit path.
//!
//! A session lock file lives inside the session directory and is never
//! created along with it: locking a deleted session fails instead of
//! bringing the directory back.
//!
//! Locks are NOT re-entrant. Acquiring a key that the same logical
//! operation already holds blocks forever, because the second open gets its
//! own file description.

use super::layout::StoreLayout;
use crate::{Result, StoreError};
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A resource that can be locked.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// The session index of one tenant
    TenantIndex(String),
    /// One session's message log
    Session { tenant: String, session_id: String },
}

impl LockKey {
    pub fn tenant(tenant: &str) -> Self {
        Self::TenantIndex(tenant.to_string())
    }

    pub fn session(tenant: &str, session_id: &str) -> Self {
        Self::Session {
            tenant: tenant.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// Exclusive lock held until drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Hands out exclusive advisory locks for [`LockKey`]s.
#[derive(Debug, Clone)]
pub struct LockManager {
    layout: StoreLayout,
}

impl LockManager {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn lock_path(&self, key: &LockKey) -> PathBuf {
        match key {
            LockKey::TenantIndex(tenant) => self.layout.index_lock_path(tenant),
            LockKey::Session { tenant, session_id } => {
                self.layout.session_lock_path(tenant, session_id)
            }
        }
    }

    /// Block until the lock for `key` is held.
    pub async fn acquire(&self, key: &LockKey) -> Result<LockGuard> {
        let path = self.lock_path(key);
        let create_parent = matches!(key, LockKey::TenantIndex(_));
        let guard = tokio::task::spawn_blocking(move || lock_file(path, create_parent))
            .await
            .map_err(|e| StoreError::Lock {
                path: self.lock_path(key),
                source: std::io::Error::other(e),
            })??;
        debug!("Acquired lock {}", guard.path.display());
        Ok(guard)
    }

    /// Run `f` while holding the lock for `key`.
    pub async fn with_lock<F, Fut, T>(&self, key: &LockKey, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(key).await?;
        Ok(f().await)
    }
}

fn lock_file(path: PathBuf, create_parent: bool) -> Result<LockGuard> {
    let lock_err = |path: &Path, source| StoreError::Lock {
        path: path.to_path_buf(),
        source,
    };

    if create_parent {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| lock_err(&path, e))?;
        }
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| lock_err(&path, e))?;
    file.lock_exclusive().map_err(|e| lock_err(&path, e))?;
    Ok(LockGuard { file, path })
}
