//! Two-tier image cache orchestrator.
//!
//! Resolves images memory -> disk -> network. One lock guards all tier state per
//! instance; it is released across network and decode awaits, so by default two
//! callers racing on the same uncached image both download it. Enable
//! [`ImageCacheConfig::coalesce_in_flight`] to share one request instead.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::domain::entities::{CacheKey, ImageSource, LoadedImage, TierPresence};
use crate::domain::ports::{CacheResult, ImageCachePort, ImageFetcherPort};

use super::disk_cache::{DiskImageCache, DiskUsage, default_cache_dir};
use super::disk_writer::{DiskWriter, WritePayload};
use super::downsampler;
use super::http_fetcher::{HttpFetcherConfig, HttpImageFetcher};
use super::memory_cache::{DEFAULT_MAX_BYTES, DEFAULT_MAX_ENTRIES, MemoryImageCache};

/// Default disk entry lifetime: seven days.
pub const DEFAULT_DISK_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration for the image cache, the `[cache]` table of the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCacheConfig {
    /// Directory for persisted entries. Defaults to the platform cache directory.
    pub cache_dir: Option<PathBuf>,
    /// Maximum decoded images kept in memory.
    pub memory_max_entries: usize,
    /// Maximum decoded bytes kept in memory.
    pub memory_max_bytes: u64,
    /// Disk quota in bytes. Unset means unbounded.
    pub disk_max_bytes: Option<u64>,
    /// Seconds a disk entry may go unread before it expires. `0` keeps entries forever.
    pub disk_ttl_secs: u64,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
    /// Transport-level retries for failed downloads.
    pub retry_count: u32,
    /// Initial retry delay in milliseconds.
    pub retry_delay_ms: u64,
    /// Maximum concurrent downloads during prefetch.
    pub max_concurrent_prefetch: usize,
    /// Share one network request between concurrent fetches of the same key.
    pub coalesce_in_flight: bool,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            memory_max_entries: DEFAULT_MAX_ENTRIES,
            memory_max_bytes: DEFAULT_MAX_BYTES,
            disk_max_bytes: None,
            disk_ttl_secs: DEFAULT_DISK_TTL_SECS,
            timeout_secs: 30,
            retry_count: 1,
            retry_delay_ms: 500,
            max_concurrent_prefetch: 4,
            coalesce_in_flight: false,
        }
    }
}

impl ImageCacheConfig {
    /// Returns the configured directory or the platform default.
    #[must_use]
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }

    /// Disk entry lifetime, `None` when expiry is disabled.
    #[must_use]
    pub fn disk_ttl(&self) -> Option<Duration> {
        (self.disk_ttl_secs > 0).then(|| Duration::from_secs(self.disk_ttl_secs))
    }

    /// Transport settings derived from this configuration.
    #[must_use]
    pub fn fetcher_config(&self) -> HttpFetcherConfig {
        HttpFetcherConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..HttpFetcherConfig::default()
        }
    }
}

/// Counters describing cache behaviour since creation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Memory tier hits.
    pub memory_hits: u64,
    /// Memory tier misses.
    pub memory_misses: u64,
    /// Requests satisfied by decoding a disk entry.
    pub disk_hits: u64,
    /// Network downloads started.
    pub network_fetches: u64,
    /// Disk entries written successfully.
    pub disk_writes: u64,
    /// Images resident in memory.
    pub memory_entries: usize,
    /// Estimated decoded bytes resident in memory.
    pub memory_bytes: u64,
}

impl CacheStats {
    /// Share of lookups answered from memory, as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.memory_hits + self.memory_misses;
        if total > 0 {
            (self.memory_hits as f64 / total as f64) * 100.0
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache: {} images, {:.1}% hit rate ({} hits, {} misses), {} from disk, {} downloads, {} written",
            self.memory_entries,
            self.hit_rate(),
            self.memory_hits,
            self.memory_misses,
            self.disk_hits,
            self.network_fetches,
            self.disk_writes
        )
    }
}

type SharedLoad = Shared<BoxFuture<'static, CacheResult<LoadedImage>>>;

/// State mutated only while holding the tier lock.
struct TierState {
    memory: MemoryImageCache,
    in_flight: HashMap<CacheKey, SharedLoad>,
}

struct CacheInner {
    tiers: Mutex<TierState>,
    disk: Arc<DiskImageCache>,
    writer: DiskWriter,
    fetcher: Arc<dyn ImageFetcherPort>,
    config: ImageCacheConfig,
    disk_hits: AtomicU64,
    network_fetches: AtomicU64,
}

/// Memory + disk image cache backed by an [`ImageFetcherPort`].
///
/// Cheap to clone; clones share the same tiers.
#[derive(Clone)]
pub struct ImageCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ImageCache {
    /// Creates a cache using `fetcher` for misses.
    ///
    /// Spawns the disk writer task, so it must be called within a Tokio runtime.
    #[must_use]
    pub fn new(config: ImageCacheConfig, fetcher: Arc<dyn ImageFetcherPort>) -> Self {
        let disk = Arc::new(
            DiskImageCache::new(config.effective_cache_dir(), config.disk_max_bytes)
                .with_ttl(config.disk_ttl()),
        );
        let writer = DiskWriter::spawn(disk.clone());
        let memory = MemoryImageCache::new(config.memory_max_entries, config.memory_max_bytes);

        Self {
            inner: Arc::new(CacheInner {
                tiers: Mutex::new(TierState {
                    memory,
                    in_flight: HashMap::new(),
                }),
                disk,
                writer,
                fetcher,
                config,
                disk_hits: AtomicU64::new(0),
                network_fetches: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a cache that downloads over HTTP.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn with_http(config: ImageCacheConfig) -> CacheResult<Self> {
        let fetcher = Arc::new(HttpImageFetcher::new(config.fetcher_config())?);
        Ok(Self::new(config, fetcher))
    }

    /// Derives the key used for a request. A size hint of `0` means none.
    #[must_use]
    pub fn key_for(locator: &str, max_dimension: Option<u32>, variant: Option<&str>) -> CacheKey {
        CacheKey::derive(locator, normalize_hint(max_dimension), variant)
    }

    /// Returns the disk directory.
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        self.inner.disk.cache_dir()
    }

    /// Returns the file that holds (or would hold) `key` on disk.
    #[must_use]
    pub fn disk_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.disk.cache_path(key)
    }

    /// Loads an image, checking memory then disk before the network.
    ///
    /// # Errors
    /// Returns `NetworkError` if the download fails and `DecodeError` if the downloaded
    /// bytes are not an image. Failures are not cached.
    pub async fn fetch(
        &self,
        locator: &str,
        max_dimension: Option<u32>,
        variant: Option<&str>,
    ) -> CacheResult<LoadedImage> {
        let max_dimension = normalize_hint(max_dimension);
        let key = CacheKey::derive(locator, max_dimension, variant);

        if let Some(loaded) = self.lookup(&key, max_dimension).await {
            return Ok(loaded);
        }

        let source = original_key(locator, &key);
        if let Some(source) = &source
            && let Some(loaded) = self.lookup_original(&key, source, max_dimension).await
        {
            return Ok(loaded);
        }

        if self.inner.config.coalesce_in_flight {
            self.fetch_coalesced(key, source, locator, max_dimension)
                .await
        } else {
            Arc::clone(&self.inner)
                .load_from_network(key, source, locator.to_owned(), max_dimension)
                .await
        }
    }

    /// Inserts an already decoded image under the given request parameters.
    ///
    /// The image is persisted in re-encoded form in the background.
    pub async fn store(
        &self,
        image: impl Into<Arc<image::DynamicImage>>,
        locator: &str,
        max_dimension: Option<u32>,
        variant: Option<&str>,
    ) -> CacheKey {
        let key = Self::key_for(locator, max_dimension, variant);
        let image = image.into();

        let mut tiers = self.inner.tiers.lock().await;
        tiers.memory.set(key.clone(), image.clone());
        self.inner
            .writer
            .enqueue_write(key.clone(), WritePayload::Encoded(image));
        key
    }

    /// Removes one entry from both tiers. Missing entries are ignored.
    ///
    /// The original bytes shared by every size of `locator` are dropped from disk too,
    /// so the next fetch of a sized entry downloads again.
    pub async fn remove(&self, locator: &str, max_dimension: Option<u32>, variant: Option<&str>) {
        let key = Self::key_for(locator, max_dimension, variant);
        let source = original_key(locator, &key);

        let mut tiers = self.inner.tiers.lock().await;
        tiers.memory.remove(&key);
        self.inner.writer.remove(key).await;
        if let Some(source) = source {
            self.inner.writer.remove(source).await;
        }
    }

    /// Empties both tiers. The disk directory is recreated empty.
    pub async fn clear_all(&self) {
        let mut tiers = self.inner.tiers.lock().await;
        tiers.memory.clear();
        self.inner.writer.clear().await;
        info!("Cleared all image caches");
    }

    /// Warms the cache for `locators` in the background with bounded concurrency.
    ///
    /// Failures are logged and skipped. The handle resolves to the number of images
    /// that loaded.
    pub fn prefetch<I, S>(&self, locators: I, max_dimension: Option<u32>) -> JoinHandle<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let locators: Vec<String> = locators.into_iter().map(Into::into).collect();
        let limit = self.inner.config.max_concurrent_prefetch.max(1);
        let cache = self.clone();

        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(limit));
            let mut tasks = JoinSet::new();

            for locator in locators {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                let cache = cache.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    match cache.fetch(&locator, max_dimension, None).await {
                        Ok(_) => true,
                        Err(e) => {
                            debug!(url = %locator, error = %e, "Prefetch failed");
                            false
                        }
                    }
                });
            }

            let mut loaded = 0;
            while let Some(result) = tasks.join_next().await {
                if matches!(result, Ok(true)) {
                    loaded += 1;
                }
            }
            debug!(loaded, "Prefetch finished");
            loaded
        })
    }

    /// Waits until every disk write queued so far has completed.
    pub async fn flush(&self) {
        self.inner.writer.flush().await;
    }

    /// Reports which tiers hold an entry, without loading or promoting it.
    pub async fn tiers(
        &self,
        locator: &str,
        max_dimension: Option<u32>,
        variant: Option<&str>,
    ) -> TierPresence {
        let key = Self::key_for(locator, max_dimension, variant);
        let tiers = self.inner.tiers.lock().await;
        TierPresence {
            memory: tiers.memory.contains(&key),
            disk: self.inner.disk.exists(&key).await,
        }
    }

    /// Returns cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let tiers = self.inner.tiers.lock().await;
        let (memory_hits, memory_misses) = tiers.memory.counters();
        CacheStats {
            memory_hits,
            memory_misses,
            disk_hits: self.inner.disk_hits.load(Ordering::Relaxed),
            network_fetches: self.inner.network_fetches.load(Ordering::Relaxed),
            disk_writes: self.inner.writer.completed_writes(),
            memory_entries: tiers.memory.len(),
            memory_bytes: tiers.memory.current_bytes(),
        }
    }

    /// Scans the disk tier.
    pub async fn disk_usage(&self) -> DiskUsage {
        self.inner.disk.usage().await
    }

    /// Memory then disk. A disk entry that fails to decode is deleted and treated as a miss.
    async fn lookup(&self, key: &CacheKey, max_dimension: Option<u32>) -> Option<LoadedImage> {
        let bytes = {
            let mut tiers = self.inner.tiers.lock().await;
            if let Some(image) = tiers.memory.get(key) {
                return Some(LoadedImage {
                    key: key.clone(),
                    image,
                    source: ImageSource::MemoryCache,
                });
            }
            self.inner.disk.read(key).await?
        };

        self.promote(key, key, Bytes::from(bytes), max_dimension)
            .await
    }

    /// Decodes the original bytes stored for another size of the same image.
    ///
    /// A hit is also persisted under `key` so the next cold start skips this step.
    async fn lookup_original(
        &self,
        key: &CacheKey,
        source: &CacheKey,
        max_dimension: Option<u32>,
    ) -> Option<LoadedImage> {
        let bytes = {
            let _tiers = self.inner.tiers.lock().await;
            self.inner.disk.read(source).await?
        };

        self.promote(key, source, Bytes::from(bytes), max_dimension)
            .await
    }

    /// Decodes disk bytes read from `file` and installs the result in memory under `key`.
    async fn promote(
        &self,
        key: &CacheKey,
        file: &CacheKey,
        bytes: Bytes,
        max_dimension: Option<u32>,
    ) -> Option<LoadedImage> {
        match downsampler::decode_async(bytes.clone(), max_dimension).await {
            Ok(decoded) => {
                let image = Arc::new(decoded);
                {
                    let mut tiers = self.inner.tiers.lock().await;
                    tiers.memory.set(key.clone(), image.clone());
                    if file != key {
                        self.inner.writer.enqueue_write(
                            key.clone(),
                            WritePayload::Original {
                                bytes,
                                decoded: image.clone(),
                                source_key: None,
                            },
                        );
                    }
                }
                self.inner.disk_hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, file = %file, "Decoded image from disk cache");
                Some(LoadedImage {
                    key: key.clone(),
                    image,
                    source: ImageSource::DiskCache,
                })
            }
            Err(e) => {
                warn!(key = %file, error = %e, "Corrupt disk cache entry, discarding");
                self.inner.writer.remove(file.clone()).await;
                None
            }
        }
    }

    async fn fetch_coalesced(
        &self,
        key: CacheKey,
        source: Option<CacheKey>,
        locator: &str,
        max_dimension: Option<u32>,
    ) -> CacheResult<LoadedImage> {
        let shared = {
            let mut tiers = self.inner.tiers.lock().await;
            // Another caller may have completed while this one read the disk.
            if let Some(image) = tiers.memory.peek(&key) {
                return Ok(LoadedImage {
                    key,
                    image,
                    source: ImageSource::MemoryCache,
                });
            }
            tiers
                .in_flight
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::clone(&self.inner)
                        .load_from_network(
                            key.clone(),
                            source,
                            locator.to_owned(),
                            max_dimension,
                        )
                        .boxed()
                        .shared()
                })
                .clone()
        };

        let result = shared.clone().await;

        let mut tiers = self.inner.tiers.lock().await;
        if tiers
            .in_flight
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&shared))
        {
            tiers.in_flight.remove(&key);
        }
        result
    }
}

impl CacheInner {
    /// Downloads, decodes, populates memory and queues persistence.
    ///
    /// Nothing touches the tiers until the image has decoded, so a dropped future
    /// leaves no partial state behind. With `source` set, the downloaded bytes are
    /// also kept under that key for other sizes of the same image.
    async fn load_from_network(
        self: Arc<Self>,
        key: CacheKey,
        source: Option<CacheKey>,
        locator: String,
        max_dimension: Option<u32>,
    ) -> CacheResult<LoadedImage> {
        self.network_fetches.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, url = %locator, "Downloading image from network");

        let bytes = self.fetcher.get_bytes(&locator).await.map_err(|e| {
            warn!(url = %locator, error = %e, "Image download failed");
            e
        })?;

        let decoded = downsampler::decode_async(bytes.clone(), max_dimension)
            .await
            .map_err(|e| {
                warn!(url = %locator, error = %e, "Downloaded bytes are not an image");
                e
            })?;
        let image = Arc::new(decoded);

        {
            let mut tiers = self.tiers.lock().await;
            tiers.memory.set(key.clone(), image.clone());
            self.writer.enqueue_write(
                key.clone(),
                WritePayload::Original {
                    bytes,
                    decoded: image.clone(),
                    source_key: source,
                },
            );
        }

        debug!(key = %key, source = "network", "Image loaded successfully");

        Ok(LoadedImage {
            key,
            image,
            source: ImageSource::Network,
        })
    }
}

#[async_trait]
impl ImageCachePort for ImageCache {
    async fn fetch(
        &self,
        locator: &str,
        max_dimension: Option<u32>,
        variant: Option<&str>,
    ) -> CacheResult<LoadedImage> {
        Self::fetch(self, locator, max_dimension, variant).await
    }
}

/// Key of the unsized entry for `locator`, or `None` when `key` already is that entry.
fn original_key(locator: &str, key: &CacheKey) -> Option<CacheKey> {
    let source = CacheKey::derive(locator, None, None);
    (source != *key).then_some(source)
}

fn normalize_hint(max_dimension: Option<u32>) -> Option<u32> {
    max_dimension.filter(|&d| d > 0)
}
