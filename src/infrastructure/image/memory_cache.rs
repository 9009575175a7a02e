//! In-memory LRU image tier.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, trace};

use crate::domain::entities::CacheKey;

/// Default maximum number of decoded images kept in memory.
pub const DEFAULT_MAX_ENTRIES: usize = 500;

/// Default decoded byte budget (128 MiB).
pub const DEFAULT_MAX_BYTES: u64 = 128 * 1024 * 1024;

/// In-memory LRU tier for decoded images.
///
/// Bounded both by entry count and by an estimate of decoded pixel memory
/// (`width * height * 4`). Not internally synchronized: the orchestrator owns it
/// behind its tier lock.
pub struct MemoryImageCache {
    cache: LruCache<CacheKey, Arc<image::DynamicImage>>,
    max_bytes: u64,
    current_bytes: u64,
    hits: u64,
    misses: u64,
}

impl MemoryImageCache {
    /// Creates a tier holding at most `max_entries` images and `max_bytes` of pixels.
    #[must_use]
    pub fn new(max_entries: usize, max_bytes: u64) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            max_bytes,
            current_bytes: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Returns the image for `key`, promoting it to most recently used.
    pub fn get(&mut self, key: &CacheKey) -> Option<Arc<image::DynamicImage>> {
        if let Some(img) = self.cache.get(key) {
            self.hits += 1;
            trace!(key = %key, "Memory cache hit");
            Some(img.clone())
        } else {
            self.misses += 1;
            trace!(key = %key, "Memory cache miss");
            None
        }
    }

    /// Returns the image for `key` without touching recency or statistics.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<image::DynamicImage>> {
        self.cache.peek(key).cloned()
    }

    /// Returns true if `key` is resident.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.cache.contains(key)
    }

    /// Stores an image, evicting least recently used entries over budget.
    ///
    /// An image larger than the whole byte budget is not retained.
    pub fn set(&mut self, key: CacheKey, image: Arc<image::DynamicImage>) {
        let cost = decoded_cost(&image);
        if cost > self.max_bytes {
            debug!(key = %key, cost, max_bytes = self.max_bytes, "Image exceeds memory budget, not cached");
            self.remove(&key);
            return;
        }

        debug!(key = %key, cost, "Storing image in memory cache");
        if let Some((_, displaced)) = self.cache.push(key, image) {
            self.current_bytes = self.current_bytes.saturating_sub(decoded_cost(&displaced));
        }
        self.current_bytes += cost;

        while self.current_bytes > self.max_bytes {
            let Some((evicted, img)) = self.cache.pop_lru() else {
                break;
            };
            self.current_bytes = self.current_bytes.saturating_sub(decoded_cost(&img));
            debug!(key = %evicted, "Evicted image from memory cache");
        }
    }

    /// Removes `key` if present.
    pub fn remove(&mut self, key: &CacheKey) {
        if let Some(img) = self.cache.pop(key) {
            self.current_bytes = self.current_bytes.saturating_sub(decoded_cost(&img));
            debug!(key = %key, "Removed image from memory cache");
        }
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.current_bytes = 0;
        debug!("Cleared memory image cache");
    }

    /// Returns the number of resident images.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if nothing is resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Returns the estimated decoded bytes held.
    #[must_use]
    pub const fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    /// Returns `(hits, misses)` counted by [`Self::get`].
    #[must_use]
    pub const fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_BYTES)
    }
}

/// Estimated memory footprint of a decoded image as RGBA8.
fn decoded_cost(image: &image::DynamicImage) -> u64 {
    u64::from(image.width()) * u64::from(image.height()) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(name, None, None)
    }

    fn solid(edge: u32) -> Arc<image::DynamicImage> {
        Arc::new(image::DynamicImage::new_rgb8(edge, edge))
    }

    #[test]
    fn test_cache_set_and_get() {
        let mut cache = MemoryImageCache::default();
        let id = key("test1");

        cache.set(id.clone(), solid(100));
        let retrieved = cache.get(&id);

        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().width(), 100);
    }

    #[test]
    fn test_cache_miss() {
        let mut cache = MemoryImageCache::default();
        assert!(cache.get(&key("nonexistent")).is_none());
        assert_eq!(cache.counters(), (0, 1));
    }

    #[test]
    fn test_eviction_by_entry_count() {
        let mut cache = MemoryImageCache::new(2, DEFAULT_MAX_BYTES);

        cache.set(key("test1"), solid(10));
        cache.set(key("test2"), solid(10));
        cache.set(key("test3"), solid(10));

        // test1 is least recently used
        assert!(cache.get(&key("test1")).is_none());
        assert!(cache.get(&key("test2")).is_some());
        assert!(cache.get(&key("test3")).is_some());
    }

    #[test]
    fn test_eviction_by_byte_budget() {
        // 10x10 RGBA = 400 bytes; budget fits two.
        let mut cache = MemoryImageCache::new(100, 800);

        cache.set(key("a"), solid(10));
        cache.set(key("b"), solid(10));
        assert_eq!(cache.current_bytes(), 800);

        let _ = cache.get(&key("a"));
        cache.set(key("c"), solid(10));

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.current_bytes(), 800);
    }

    #[test]
    fn test_oversized_image_is_not_retained() {
        let mut cache = MemoryImageCache::new(10, 100);
        cache.set(key("big"), solid(10));
        assert!(cache.is_empty());
        assert_eq!(cache.current_bytes(), 0);
    }

    #[test]
    fn test_replacing_entry_updates_cost() {
        let mut cache = MemoryImageCache::new(10, DEFAULT_MAX_BYTES);
        cache.set(key("a"), solid(10));
        cache.set(key("a"), solid(20));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.current_bytes(), 20 * 20 * 4);
    }

    #[test]
    fn test_peek_does_not_promote() {
        let mut cache = MemoryImageCache::new(2, DEFAULT_MAX_BYTES);

        cache.set(key("test1"), solid(10));
        cache.set(key("test2"), solid(10));

        let _ = cache.peek(&key("test1"));
        cache.set(key("test3"), solid(10));

        assert!(cache.peek(&key("test1")).is_none());
        assert_eq!(cache.counters(), (0, 0));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = MemoryImageCache::default();
        cache.set(key("a"), solid(10));
        cache.set(key("b"), solid(10));

        cache.remove(&key("a"));
        cache.remove(&key("missing"));
        assert!(!cache.contains(&key("a")));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.current_bytes(), 0);
    }
}
