//! Infrastructure layer with external service adapters.

/// Application configuration.
pub mod config;
/// Image handling (tiers, decoding, transport).
pub mod image;

pub use config::{AppConfig, CliArgs, Command, ConfigError, LogLevel, ConfigStore};
pub use image::{
    CacheStats, DiskImageCache, DiskUsage, HttpFetcherConfig, HttpImageFetcher, ImageCache,
    ImageCacheConfig, MemoryImageCache,
};
