//! Port definition for image caching.

use async_trait::async_trait;

use crate::domain::entities::LoadedImage;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
///
/// `Clone` so that coalesced waiters can share one outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// Transport failure, non-success status or timeout.
    #[error("Network error: {0}")]
    NetworkError(String),
    /// Bytes could not be interpreted as an image.
    #[error("Decode error: {0}")]
    DecodeError(String),
    /// I/O error during a cache operation.
    #[error("IO error: {0}")]
    IoError(String),
}

impl CacheError {
    /// Returns true for transport failures.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(self, Self::NetworkError(_))
    }

    /// Returns true for decode failures.
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::DecodeError(_))
    }
}

/// Port through which presentation code resolves images.
/// Implementations must be thread-safe.
#[async_trait]
pub trait ImageCachePort: Send + Sync {
    /// Resolves an image through the memory, disk and network tiers.
    async fn fetch(
        &self,
        locator: &str,
        max_dimension: Option<u32>,
        variant: Option<&str>,
    ) -> CacheResult<LoadedImage>;
}
