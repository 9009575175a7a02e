mod image_cache_port;
mod image_fetcher_port;

pub use image_cache_port::{CacheError, CacheResult, ImageCachePort};
pub use image_fetcher_port::ImageFetcherPort;

#[cfg(test)]
pub use image_fetcher_port::MockImageFetcherPort;
