//! Crash-safe JSON persistence.
//!
//! A write copies the current file to `{path}.backup`, writes the new
//! payload to `{path}.tmp`, fsyncs it and renames it over `{path}`. A read
//! that finds a corrupt primary tries the backup once and, if that parses,
//! puts it back in place.
//!
//! Nothing here returns an error: failures are logged and surface as
//! `None` or `false`.

use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// `{path}.backup`
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".backup")
}

/// `{path}.tmp`
pub fn tmp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Reads and writes JSON documents with backup-before-overwrite.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicFileStore;

impl AtomicFileStore {
    pub fn new() -> Self {
        Self
    }

    /// Persist `value` at `path`. Returns `false` (after logging) on any
    /// failure; the previous primary is untouched in that case.
    pub async fn write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> bool {
        match self.try_write(path, value).await {
            Ok(()) => {
                debug!("Persisted {}", path.display());
                true
            }
            Err(e) => {
                warn!("Failed to persist {}: {}", path.display(), e);
                let _ = fs::remove_file(tmp_path(path)).await;
                false
            }
        }
    }

    /// Load the document at `path`. `None` if it is absent, or if both the
    /// primary and its backup are unreadable.
    pub async fn read<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return self.recover(path).await;
            }
        };

        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Corrupt file {}: {}", path.display(), e);
                self.recover(path).await
            }
        }
    }

    async fn try_write<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        let payload = serde_json::to_vec_pretty(value)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if fs::try_exists(path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(path, backup_path(path)).await {
                warn!("Could not back up {}: {}", path.display(), e);
            }
        }

        Self::replace(path, &payload).await
    }

    /// Write `payload` to the tmp sibling, fsync, and rename over `path`.
    async fn replace(path: &Path, payload: &[u8]) -> Result<()> {
        let tmp = tmp_path(path);
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .await?;
            file.write_all(payload).await?;
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, path).await?;

        #[cfg(unix)]
        if let Some(parent) = path.parent() {
            if let Ok(dir) = fs::File::open(parent).await {
                let _ = dir.sync_all().await;
            }
        }

        Ok(())
    }

    async fn recover<T: DeserializeOwned>(&self, path: &Path) -> Option<T> {
        let backup = backup_path(path);
        let bytes = match fs::read(&backup).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read backup {}: {}", backup.display(), e);
                }
                return None;
            }
        };

        let value = match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!("Backup {} is also corrupt: {}", backup.display(), e);
                return None;
            }
        };

        // The backup stays as-is; only the primary is replaced.
        match Self::replace(path, &bytes).await {
            Ok(()) => info!("Restored {} from backup", path.display()),
            Err(e) => warn!("Recovered {} but could not restore it: {}", path.display(), e),
        }
        Some(value)
    }
}
