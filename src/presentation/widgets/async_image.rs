//! Per-element image state for UI code.
//!
//! An [`AsyncLoader`] owns at most one background fetch. It shows the resolved image
//! when there is one, the caller's fallback otherwise, and a placeholder last.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::domain::entities::{ImageStatus, LoadedImage};
use crate::domain::ports::ImageCachePort;
use crate::infrastructure::image::downsampler;

/// Sent when a load finishes so the UI can schedule a redraw.
#[derive(Debug, Clone)]
pub struct ImageLoadedEvent {
    /// Locator that was loaded.
    pub locator: String,
    /// The loaded image, or the error message.
    pub result: Result<LoadedImage, String>,
}

/// What an element should draw right now.
#[derive(Debug, Clone)]
pub enum ImageDisplay {
    /// Image resolved through the cache.
    Resolved(Arc<image::DynamicImage>),
    /// Caller-supplied fallback, decoded.
    Fallback(Arc<image::DynamicImage>),
    /// Nothing to show yet.
    Placeholder,
}

impl ImageDisplay {
    /// True when there is nothing to draw.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder)
    }

    /// The image to draw, resolved or fallback.
    #[must_use]
    pub fn image(&self) -> Option<&Arc<image::DynamicImage>> {
        match self {
            Self::Resolved(image) | Self::Fallback(image) => Some(image),
            Self::Placeholder => None,
        }
    }
}

/// State shared with the background task. A task only writes while its generation is current.
#[derive(Debug, Default)]
struct LoadSlot {
    generation: u64,
    status: ImageStatus,
    image: Option<Arc<image::DynamicImage>>,
}

/// Loads one element's image through an [`ImageCachePort`] while it is on screen.
///
/// Shows the resolved image once available, the decoded fallback until then, and a
/// placeholder when neither exists. Dropping the loader cancels its fetch.
pub struct AsyncLoader {
    locator: Option<String>,
    max_dimension: Option<u32>,
    fallback: Option<Arc<image::DynamicImage>>,
    slot: Arc<Mutex<LoadSlot>>,
    task: Option<JoinHandle<()>>,
    events: Option<mpsc::UnboundedSender<ImageLoadedEvent>>,
    visible: bool,
}

impl AsyncLoader {
    /// Creates a loader. Fallback bytes are decoded immediately; undecodable ones are ignored.
    #[must_use]
    pub fn new(
        locator: Option<String>,
        max_dimension: Option<u32>,
        fallback: Option<&[u8]>,
    ) -> Self {
        Self {
            fallback: decode_fallback(fallback, max_dimension),
            locator,
            max_dimension,
            slot: Arc::new(Mutex::new(LoadSlot::default())),
            task: None,
            events: None,
            visible: false,
        }
    }

    /// Sends an [`ImageLoadedEvent`] on `tx` whenever a load completes.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ImageLoadedEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Starts the background fetch, replacing any outstanding one.
    ///
    /// The fetch starts even when a fallback is being shown. Does nothing without a
    /// locator. Must be called within a Tokio runtime.
    pub fn on_appear(&mut self, cache: Arc<dyn ImageCachePort>) {
        self.visible = true;
        self.cancel();

        let Some(locator) = self.locator.clone() else {
            return;
        };

        let generation = {
            let mut slot = self.slot.lock();
            slot.status = ImageStatus::Loading;
            slot.generation
        };
        let slot = self.slot.clone();
        let events = self.events.clone();
        let max_dimension = self.max_dimension;

        self.task = Some(tokio::spawn(async move {
            let result = cache.fetch(&locator, max_dimension, None).await;

            let result = {
                let mut slot = slot.lock();
                if slot.generation != generation {
                    trace!(url = %locator, "Discarding stale image load");
                    return;
                }
                match result {
                    Ok(loaded) => {
                        slot.image = Some(loaded.image.clone());
                        slot.status = ImageStatus::Ready;
                        Ok(loaded)
                    }
                    Err(e) => {
                        slot.status = ImageStatus::Failed(e.to_string());
                        Err(e.to_string())
                    }
                }
            };

            if let Some(tx) = events {
                let _ = tx.send(ImageLoadedEvent { locator, result });
            }
        }));
    }

    /// Cancels the outstanding fetch. Nothing it produces will reach this loader.
    pub fn on_disappear(&mut self) {
        self.visible = false;
        self.cancel();
    }

    /// Points the loader at new inputs.
    ///
    /// The fallback is always replaced, so passing `None` clears the previous one. Loading restarts only when the locator or size hint changed and the element is
    /// visible. Returns true if it restarted.
    pub fn update(
        &mut self,
        locator: Option<&str>,
        max_dimension: Option<u32>,
        fallback: Option<&[u8]>,
        cache: Arc<dyn ImageCachePort>,
    ) -> bool {
        self.fallback = decode_fallback(fallback, max_dimension);

        if self.locator.as_deref() == locator && self.max_dimension == max_dimension {
            return false;
        }

        self.cancel();
        self.locator = locator.map(str::to_owned);
        self.max_dimension = max_dimension;
        self.slot.lock().image = None;

        if self.visible {
            self.on_appear(cache);
            return true;
        }
        false
    }

    /// What to draw: resolved image, then fallback, then placeholder.
    #[must_use]
    pub fn display(&self) -> ImageDisplay {
        if let Some(image) = &self.slot.lock().image {
            return ImageDisplay::Resolved(image.clone());
        }
        self.fallback
            .clone()
            .map_or(ImageDisplay::Placeholder, ImageDisplay::Fallback)
    }

    /// Progress of the current load.
    #[must_use]
    pub fn status(&self) -> ImageStatus {
        self.slot.lock().status.clone()
    }

    /// Locator currently being shown, if any.
    #[must_use]
    pub fn locator(&self) -> Option<&str> {
        self.locator.as_deref()
    }

    /// Longest-edge bound requested from the cache.
    #[must_use]
    pub const fn max_dimension(&self) -> Option<u32> {
        self.max_dimension
    }

    /// Invalidates the current generation and aborts the task.
    fn cancel(&mut self) {
        {
            let mut slot = self.slot.lock();
            slot.generation = slot.generation.wrapping_add(1);
            if slot.status.is_loading() {
                slot.status = ImageStatus::NotStarted;
            }
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for AsyncLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLoader")
            .field("locator", &self.locator)
            .field("max_dimension", &self.max_dimension)
            .field("has_fallback", &self.fallback.is_some())
            .field("status", &self.status())
            .field("visible", &self.visible)
            .finish_non_exhaustive()
    }
}

fn decode_fallback(
    bytes: Option<&[u8]>,
    max_dimension: Option<u32>,
) -> Option<Arc<image::DynamicImage>> {
    let bytes = bytes?;
    match downsampler::decode(bytes, max_dimension) {
        Ok(image) => Some(Arc::new(image)),
        Err(e) => {
            warn!(error = %e, "Ignoring undecodable fallback image");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::mocks::MockImageCache;
    use crate::infrastructure::image::downsampler::fixtures::png;
    use std::time::Duration;

    const COVER: &str = "https://example/cover.jpg";

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_placeholder_without_locator_or_fallback() {
        let cache = Arc::new(MockImageCache::new(Duration::ZERO));
        let mut loader = AsyncLoader::new(None, Some(100), None);

        loader.on_appear(cache.clone());
        settle().await;

        assert!(loader.display().is_placeholder());
        assert!(loader.status().is_not_started());
        assert_eq!(cache.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_shown_while_fetch_runs() {
        let cache = Arc::new(MockImageCache::new(Duration::from_millis(50)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fallback = png(10, 10);
        let mut loader =
            AsyncLoader::new(Some(COVER.to_string()), Some(120), Some(&fallback)).with_events(tx);

        loader.on_appear(cache.clone());
        settle().await;

        assert!(matches!(loader.display(), ImageDisplay::Fallback(_)));
        assert!(loader.status().is_loading());
        assert_eq!(cache.calls(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.locator, COVER);
        assert!(event.result.is_ok());

        let ImageDisplay::Resolved(image) = loader.display() else {
            panic!("expected resolved image");
        };
        assert_eq!((image.width(), image.height()), (120, 120));
        assert!(loader.status().is_ready());
    }

    #[tokio::test]
    async fn test_failure_keeps_fallback() {
        let cache = Arc::new(MockImageCache::failing(Duration::ZERO));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fallback = png(8, 8);
        let mut loader =
            AsyncLoader::new(Some(COVER.to_string()), None, Some(&fallback)).with_events(tx);

        loader.on_appear(cache);

        let event = rx.recv().await.unwrap();
        assert!(event.result.is_err());
        assert!(loader.status().is_failed());
        assert!(matches!(loader.display(), ImageDisplay::Fallback(_)));
    }

    #[tokio::test]
    async fn test_undecodable_fallback_is_ignored() {
        let loader = AsyncLoader::new(Some(COVER.to_string()), None, Some(b"not an image"));
        assert!(loader.display().is_placeholder());
    }

    #[tokio::test]
    async fn test_disappear_cancels_without_mutation() {
        let cache = Arc::new(MockImageCache::new(Duration::from_millis(50)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = AsyncLoader::new(Some(COVER.to_string()), None, None).with_events(tx);

        loader.on_appear(cache.clone());
        settle().await;
        loader.on_disappear();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(cache.calls(), 1);
        assert!(loader.display().is_placeholder());
        assert!(loader.status().is_not_started());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reappear_replaces_outstanding_task() {
        let cache = Arc::new(MockImageCache::new(Duration::from_millis(30)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader = AsyncLoader::new(Some(COVER.to_string()), None, None).with_events(tx);

        loader.on_appear(cache.clone());
        settle().await;
        loader.on_appear(cache.clone());

        assert!(rx.recv().await.is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.calls(), 2);
        assert!(rx.try_recv().is_err());
        assert!(loader.status().is_ready());
    }

    #[tokio::test]
    async fn test_update_restarts_only_on_change() {
        let cache = Arc::new(MockImageCache::new(Duration::ZERO));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut loader =
            AsyncLoader::new(Some(COVER.to_string()), Some(64), None).with_events(tx);

        loader.on_appear(cache.clone());
        rx.recv().await.unwrap();

        assert!(!loader.update(Some(COVER), Some(64), None, cache.clone()));
        assert_eq!(cache.calls(), 1);

        assert!(loader.update(Some(COVER), Some(32), None, cache.clone()));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.result.unwrap().dimensions(), (32, 32));
        assert_eq!(cache.calls(), 2);

        assert!(loader.update(Some("https://example/back.jpg"), Some(32), None, cache.clone()));
        rx.recv().await.unwrap();
        assert_eq!(loader.locator(), Some("https://example/back.jpg"));
        assert_eq!(cache.calls(), 3);
    }

    #[tokio::test]
    async fn test_update_to_new_locator_drops_old_fallback() {
        let cache = Arc::new(MockImageCache::new(Duration::from_millis(200)));
        let fallback = png(10, 10);
        let mut loader = AsyncLoader::new(Some(COVER.to_string()), Some(64), Some(&fallback));

        loader.on_appear(cache.clone());
        assert!(matches!(loader.display(), ImageDisplay::Fallback(_)));

        assert!(loader.update(Some("https://example/back.jpg"), Some(64), None, cache.clone()));

        assert!(loader.display().is_placeholder());
        assert!(loader.display().image().is_none());
    }

    #[tokio::test]
    async fn test_update_while_hidden_defers_load() {
        let cache = Arc::new(MockImageCache::new(Duration::ZERO));
        let mut loader = AsyncLoader::new(Some(COVER.to_string()), None, None);

        assert!(!loader.update(Some("https://example/other.jpg"), None, None, cache.clone()));
        settle().await;

        assert_eq!(cache.calls(), 0);
        assert_eq!(loader.locator(), Some("https://example/other.jpg"));
    }
}
