//! Disk-based image tier for persistence across sessions.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::ports::{CacheError, CacheResult};

const ENTRY_EXTENSION: &str = "img";

/// Files and bytes currently held by the disk tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    /// Number of cache entries.
    pub files: usize,
    /// Total size of the entries in bytes.
    pub bytes: u64,
}

/// Disk-based tier that persists raw image bytes, one `<key>.img` file per entry.
///
/// The directory is created on first write and recreated by [`Self::clear`]. Without a
/// quota the directory grows until something outside the cache reclaims it.
///
/// An entry's modification time records its last use: it is refreshed on every hit,
/// drives TTL expiry and orders quota trimming.
#[derive(Debug)]
pub struct DiskImageCache {
    cache_dir: PathBuf,
    max_size: Option<u64>,
    ttl: Option<Duration>,
}

impl DiskImageCache {
    /// Creates a tier rooted at `cache_dir`. Nothing is touched on disk yet.
    #[must_use]
    pub const fn new(cache_dir: PathBuf, max_size: Option<u64>) -> Self {
        Self {
            cache_dir,
            max_size,
            ttl: None,
        }
    }

    /// Expires entries unused for longer than `ttl`. `None` keeps them forever.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Returns the cache directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the path for a cached entry.
    #[must_use]
    pub fn cache_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.file_name())
    }

    /// Checks if an entry is cached.
    pub async fn exists(&self, key: &CacheKey) -> bool {
        fs::try_exists(self.cache_path(key)).await.unwrap_or(false)
    }

    /// Reads the raw bytes for `key`.
    ///
    /// A file that exists but cannot be read, or that outlived the TTL, is deleted and
    /// reported as absent. A hit refreshes the entry's timestamp.
    pub async fn read(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let path = self.cache_path(key);
        if self.is_expired(&path).await {
            debug!(key = %key, "Disk cache entry expired");
            self.remove(key).await;
            return None;
        }

        let bytes = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => {
                warn!(key = %key, "Empty cache file, discarding");
                self.remove(key).await;
                return None;
            }
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(key = %key, "Disk cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Unreadable cache file, discarding");
                self.remove(key).await;
                return None;
            }
        };

        trace!(key = %key, path = %path.display(), "Disk cache hit");
        touch(path).await;
        Some(bytes)
    }

    /// Stores raw bytes for `key`, replacing any previous entry atomically.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be created or written.
    pub async fn write(&self, key: &CacheKey, bytes: &[u8]) -> CacheResult<()> {
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to create cache dir: {e}")))?;

        let path = self.cache_path(key);
        let tmp_path = self
            .cache_dir
            .join(format!("{}.{}.tmp", key.as_str(), uuid::Uuid::new_v4().simple()));

        if let Err(e) = write_file(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(CacheError::IoError(format!(
                "Failed to move cache file into place: {e}"
            )));
        }

        debug!(key = %key, path = %path.display(), size = bytes.len(), "Stored image in disk cache");

        self.cleanup_if_needed().await;

        Ok(())
    }

    /// Removes an entry. Missing entries are ignored.
    pub async fn remove(&self, key: &CacheKey) {
        let path = self.cache_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(key = %key, "Removed from disk cache"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to remove from disk cache"),
        }
    }

    /// Removes the whole cache directory and recreates it empty.
    ///
    /// # Errors
    /// Returns error if the directory cannot be removed or recreated.
    pub async fn clear(&self) -> CacheResult<()> {
        match fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CacheError::IoError(format!(
                    "Failed to remove cache dir: {e}"
                )));
            }
        }
        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| CacheError::IoError(format!("Failed to recreate cache dir: {e}")))?;
        debug!(path = %self.cache_dir.display(), "Cleared disk cache");
        Ok(())
    }

    /// Scans the directory and reports how many entries and bytes it holds.
    pub async fn usage(&self) -> DiskUsage {
        let mut usage = DiskUsage::default();
        for (_, _, size) in self.entries().await {
            usage.files += 1;
            usage.bytes += size;
        }
        usage
    }

    async fn is_expired(&self, path: &Path) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let Ok(modified) = fs::metadata(path).await.and_then(|meta| meta.modified()) else {
            return false;
        };
        modified.elapsed().is_ok_and(|age| age > ttl)
    }

    /// Lists cache entries with their last use time and size.
    async fn entries(&self) -> Vec<(PathBuf, SystemTime, u64)> {
        let mut files = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.cache_dir).await else {
            return files;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != ENTRY_EXTENSION) {
                continue;
            }

            if let Ok(meta) = entry.metadata().await {
                let last_used = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((path, last_used, meta.len()));
            }
        }

        files
    }

    /// Trims the least recently used entries once usage exceeds the quota, down to 90% of it.
    async fn cleanup_if_needed(&self) {
        let Some(max_size) = self.max_size else {
            return;
        };

        let mut files = self.entries().await;
        let current_size: u64 = files.iter().map(|(_, _, size)| size).sum();
        if current_size <= max_size {
            return;
        }

        debug!(current_size, max_size, "Disk cache over limit, cleaning up");

        files.sort_by_key(|(_, time, _)| *time);

        let target = current_size - max_size + (max_size / 10);
        let mut freed_size = 0u64;
        let mut freed_count = 0usize;

        for (path, _, size) in files {
            if freed_size >= target {
                break;
            }

            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove old cache file");
            } else {
                trace!(path = %path.display(), "Removed old cache file");
                freed_size += size;
                freed_count += 1;
            }
        }

        debug!(freed_size, freed_count, "Disk cache cleanup complete");
    }
}

/// Marks an entry as just used. Failures only cost recency.
async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await;
    if let Ok(Err(e)) = result {
        trace!(error = %e, "Failed to refresh cache entry timestamp");
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to create cache file: {e}")))?;

    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to write cache file: {e}")))?;

    file.flush()
        .await
        .map_err(|e| CacheError::IoError(format!("Failed to flush cache file: {e}")))
}

/// Returns the default cache directory path.
#[must_use]
pub fn default_cache_dir() -> PathBuf {
    directories::ProjectDirs::from("app", "softcover", "covercache").map_or_else(
        || std::env::temp_dir().join("covercache").join("images"),
        |dirs| dirs.cache_dir().join("images"),
    )
}
