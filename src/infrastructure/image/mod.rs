//! Image handling infrastructure.
//!
//! This module provides:
//! - Memory caching with LRU eviction
//! - Disk caching for persistence
//! - Downsampling decode
//! - HTTP download with retries
//! - The cache orchestrator tying the tiers together

pub mod cache;
pub mod disk_cache;
pub mod disk_writer;
pub mod downsampler;
pub mod http_fetcher;
pub mod memory_cache;

pub use cache::{CacheStats, ImageCache, ImageCacheConfig};
pub use disk_cache::{DiskImageCache, DiskUsage, default_cache_dir};
pub use disk_writer::{DiskWriter, WritePayload};
pub use http_fetcher::{HttpFetcherConfig, HttpImageFetcher};
pub use memory_cache::MemoryImageCache;
