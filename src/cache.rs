//! On-disk cache of whole downloaded archives.
//!
//! Files are keyed by the remote object's basename. A cached copy is reused
//! when its size equals the remote length and it is not older than the remote
//! `Last-Modified`. There is no content digest and no locking: two processes
//! filling the same key race on the final rename.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{Error, Result};
use crate::io::RemoteFileHandle;
use crate::types::{ProgressCallback, SourceLocator};

#[derive(Debug, Clone)]
pub struct ArchiveCache {
    dir: PathBuf,
}

impl ArchiveCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key for a remote locator: its basename
    pub fn key_for(locator: &SourceLocator) -> Result<String> {
        locator.basename().ok_or_else(|| {
            Error::Config(format!("cannot derive a cache key from {locator:?}"))
        })
    }

    /// Path the cached copy of `url` lives at
    pub fn path_for(&self, url: &str) -> Result<PathBuf> {
        let key = Self::key_for(&SourceLocator::Remote(url.to_string()))?;
        Ok(self.dir.join(key))
    }

    /// Whether `path` can stand in for a remote object of `remote_len` bytes
    /// last modified at `remote_modified`.
    ///
    /// An unknown remote length never matches. A missing `Last-Modified`
    /// leaves the size as the only check.
    pub async fn is_fresh(
        path: &Path,
        remote_len: Option<u64>,
        remote_modified: Option<DateTime<Utc>>,
    ) -> bool {
        let Some(remote_len) = remote_len else {
            return false;
        };
        let Ok(meta) = fs::metadata(path).await else {
            return false;
        };
        if !meta.is_file() || meta.len() != remote_len {
            return false;
        }

        match (remote_modified, meta.modified()) {
            (None, _) => true,
            (Some(remote), Ok(local)) => DateTime::<Utc>::from(local) >= remote,
            (Some(_), Err(_)) => false,
        }
    }

    /// Return a local copy of the object behind `handle`, downloading it
    /// only when the cached copy is missing or stale.
    ///
    /// The handle must be initialized. Downloads land in `<key>.part` and are
    /// renamed into place once complete.
    pub async fn fetch(
        &self,
        handle: &RemoteFileHandle,
        on_progress: Option<&ProgressCallback<'_>>,
    ) -> Result<PathBuf> {
        if !handle.is_initialized() {
            return Err(Error::NotInitialized);
        }

        let path = self.path_for(handle.url())?;
        if Self::is_fresh(&path, handle.content_length(), handle.last_modified()).await {
            tracing::info!(url = %handle.url(), path = %path.display(), "Using cached archive");
            return Ok(path);
        }

        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::write(&self.dir, e))?;

        let mut partial = path.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        tracing::info!(url = %handle.url(), path = %path.display(), "Caching archive");
        if let Err(e) = handle.download(&partial, on_progress).await {
            if let Err(rm) = fs::remove_file(&partial).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(error = %rm, path = %partial.display(), "Failed to remove partial download");
            }
            return Err(e);
        }

        fs::rename(&partial, &path)
            .await
            .map_err(|e| Error::write(&path, e))?;
        Ok(path)
    }
}
