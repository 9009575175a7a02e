//! Domain types for cached images.

use std::sync::Arc;

use super::CacheKey;

/// Status of an image in the loading pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ImageStatus {
    /// Image loading has not started.
    #[default]
    NotStarted,
    /// Image is being resolved through the cache.
    Loading,
    /// Image is fully loaded and ready for display.
    Ready,
    /// Image loading failed with an error message.
    Failed(String),
}

impl ImageStatus {
    /// Returns true if the image is ready for rendering.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Returns true if the image is currently being loaded.
    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    /// Returns true if loading failed.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Returns true if loading hasn't started yet.
    #[must_use]
    pub const fn is_not_started(&self) -> bool {
        matches!(self, Self::NotStarted)
    }
}

/// Where an image was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Loaded from the in-memory LRU tier.
    MemoryCache,
    /// Decoded from the disk tier.
    DiskCache,
    /// Downloaded from the network.
    Network,
}

impl std::fmt::Display for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MemoryCache => write!(f, "memory"),
            Self::DiskCache => write!(f, "disk"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// A decoded image together with the key and tier it came from.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Key the image is cached under.
    pub key: CacheKey,
    /// Decoded pixels, shared with the memory tier.
    pub image: Arc<image::DynamicImage>,
    /// Tier that satisfied the request.
    pub source: ImageSource,
}

impl LoadedImage {
    /// Returns `(width, height)` of the decoded image.
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    /// Returns the longest edge in pixels.
    #[must_use]
    pub fn longest_edge(&self) -> u32 {
        self.image.width().max(self.image.height())
    }
}

/// Which tiers currently hold an entry for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TierPresence {
    /// Decoded image is resident in memory.
    pub memory: bool,
    /// Bytes are persisted on disk.
    pub disk: bool,
}

impl TierPresence {
    /// Returns true if neither tier holds the entry.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        !self.memory && !self.disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(ImageStatus::default().is_not_started());
        assert!(ImageStatus::Loading.is_loading());
        assert!(ImageStatus::Ready.is_ready());
        assert!(ImageStatus::Failed("HTTP 404".to_string()).is_failed());
    }

    #[test]
    fn test_loaded_image_longest_edge() {
        let loaded = LoadedImage {
            key: CacheKey::derive("https://example/cover.jpg", None, None),
            image: Arc::new(image::DynamicImage::new_rgb8(120, 180)),
            source: ImageSource::Network,
        };
        assert_eq!(loaded.dimensions(), (120, 180));
        assert_eq!(loaded.longest_edge(), 180);
        assert_eq!(loaded.source.to_string(), "network");
    }
}
