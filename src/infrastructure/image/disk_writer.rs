//! Background task that owns every mutation of the disk tier.
//!
//! Writes are fire-and-forget. Removals and clears travel through the same queue so
//! they always land after the writes queued before them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::domain::entities::CacheKey;

use super::disk_cache::DiskImageCache;
use super::downsampler;

/// What to persist for a key.
#[derive(Debug)]
pub enum WritePayload {
    /// Downloaded bytes, with the decoded image to re-encode if they cannot be written.
    Original {
        /// Bytes as received from the network.
        bytes: Bytes,
        /// Decoded image used for the fallback encoding.
        decoded: Arc<image::DynamicImage>,
        /// Unsized entry for the same locator that should also receive the bytes, so
        /// later requests at other sizes can decode them without the network.
        source_key: Option<CacheKey>,
    },
    /// An image supplied by the caller, stored in re-encoded form.
    Encoded(Arc<image::DynamicImage>),
}

#[derive(Debug)]
enum DiskCommand {
    Write { key: CacheKey, payload: WritePayload },
    Remove { key: CacheKey, done: oneshot::Sender<()> },
    Clear { done: oneshot::Sender<()> },
    Flush { done: oneshot::Sender<()> },
}

/// Handle to the writer task. Dropping every handle stops the task.
#[derive(Debug, Clone)]
pub struct DiskWriter {
    tx: mpsc::UnboundedSender<DiskCommand>,
    writes: Arc<AtomicU64>,
}

impl DiskWriter {
    /// Spawns the writer task for `disk`. Must be called within a Tokio runtime.
    #[must_use]
    pub fn spawn(disk: Arc<DiskImageCache>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writes = Arc::new(AtomicU64::new(0));
        tokio::spawn(run_writer_loop(disk, rx, writes.clone()));
        Self { tx, writes }
    }

    /// Queues a write without waiting for it.
    pub fn enqueue_write(&self, key: CacheKey, payload: WritePayload) {
        if let Err(e) = self.tx.send(DiskCommand::Write { key, payload }) {
            error!("Failed to queue disk write: {}", e);
        }
    }

    /// Removes `key` after all previously queued writes.
    pub async fn remove(&self, key: CacheKey) {
        let (done, wait) = oneshot::channel();
        self.send_and_wait(DiskCommand::Remove { key, done }, wait)
            .await;
    }

    /// Clears the directory after all previously queued writes.
    pub async fn clear(&self) {
        let (done, wait) = oneshot::channel();
        self.send_and_wait(DiskCommand::Clear { done }, wait).await;
    }

    /// Waits until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send_and_wait(DiskCommand::Flush { done }, wait).await;
    }

    /// Number of requested entries written successfully since the task started.
    ///
    /// Copies made under a payload's `source_key` are not counted.
    #[must_use]
    pub fn completed_writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    async fn send_and_wait(&self, cmd: DiskCommand, wait: oneshot::Receiver<()>) {
        if let Err(e) = self.tx.send(cmd) {
            error!("Disk writer is gone: {}", e);
            return;
        }
        let _ = wait.await;
    }
}

async fn run_writer_loop(
    disk: Arc<DiskImageCache>,
    mut rx: mpsc::UnboundedReceiver<DiskCommand>,
    writes: Arc<AtomicU64>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            DiskCommand::Write { key, payload } => {
                if persist(&disk, &key, payload).await {
                    writes.fetch_add(1, Ordering::Relaxed);
                }
            }
            DiskCommand::Remove { key, done } => {
                disk.remove(&key).await;
                let _ = done.send(());
            }
            DiskCommand::Clear { done } => {
                if let Err(e) = disk.clear().await {
                    warn!(error = %e, "Failed to clear disk cache");
                }
                let _ = done.send(());
            }
            DiskCommand::Flush { done } => {
                let _ = done.send(());
            }
        }
    }
    debug!("Disk writer stopped");
}

/// Writes the payload, falling back to a re-encoded image. Failures are only logged.
async fn persist(disk: &DiskImageCache, key: &CacheKey, payload: WritePayload) -> bool {
    let decoded = match payload {
        WritePayload::Original {
            bytes,
            decoded,
            source_key,
        } => match disk.write(key, &bytes).await {
            Ok(()) => {
                if let Some(source) = source_key {
                    persist_source(disk, &source, &bytes).await;
                }
                return true;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist original bytes, re-encoding");
                decoded
            }
        },
        WritePayload::Encoded(decoded) => decoded,
    };

    let encoded = tokio::task::spawn_blocking(move || downsampler::encode_fallback(&decoded)).await;
    let bytes = match encoded {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!(key = %key, error = %e, "Failed to re-encode image for disk cache");
            return false;
        }
        Err(e) => {
            error!(key = %key, error = %e, "Encode task panicked");
            return false;
        }
    };

    match disk.write(key, &bytes).await {
        Ok(()) => true,
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to cache to disk");
            false
        }
    }
}

/// Keeps the first copy of a locator's original bytes; later downloads do not rewrite it.
async fn persist_source(disk: &DiskImageCache, source: &CacheKey, bytes: &[u8]) {
    if disk.exists(source).await {
        return;
    }
    match disk.write(source, bytes).await {
        Ok(()) => debug!(key = %source, "Stored original bytes"),
        Err(e) => warn!(key = %source, error = %e, "Failed to store original bytes"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::image::downsampler::fixtures::png;
    use tempfile::TempDir;

    fn setup() -> (DiskWriter, Arc<DiskImageCache>, TempDir) {
        let temp = TempDir::new().unwrap();
        let disk = Arc::new(DiskImageCache::new(temp.path().join("images"), None));
        (DiskWriter::spawn(disk.clone()), disk, temp)
    }

    #[tokio::test]
    async fn test_write_then_flush() {
        let (writer, disk, _temp) = setup();
        let key = CacheKey::derive("https://example/a.png", None, None);
        let bytes = Bytes::from(png(8, 8));

        writer.enqueue_write(
            key.clone(),
            WritePayload::Original {
                bytes: bytes.clone(),
                decoded: Arc::new(image::DynamicImage::new_rgb8(8, 8)),
                source_key: None,
            },
        );
        writer.flush().await;

        assert_eq!(disk.read(&key).await.unwrap(), bytes.to_vec());
        assert_eq!(writer.completed_writes(), 1);
    }

    #[tokio::test]
    async fn test_original_bytes_copied_to_source_entry() {
        let (writer, disk, _temp) = setup();
        let key = CacheKey::derive("https://example/e.png", Some(50), None);
        let source = CacheKey::derive("https://example/e.png", None, None);
        let bytes = Bytes::from(png(120, 80));

        writer.enqueue_write(
            key.clone(),
            WritePayload::Original {
                bytes: bytes.clone(),
                decoded: Arc::new(image::DynamicImage::new_rgb8(50, 33)),
                source_key: Some(source.clone()),
            },
        );
        writer.flush().await;

        assert_eq!(disk.read(&key).await.unwrap(), bytes.to_vec());
        assert_eq!(disk.read(&source).await.unwrap(), bytes.to_vec());
        assert_eq!(writer.completed_writes(), 1);
    }

    #[tokio::test]
    async fn test_encoded_payload_is_decodable() {
        let (writer, disk, _temp) = setup();
        let key = CacheKey::derive("https://example/b.png", Some(32), None);

        writer.enqueue_write(
            key.clone(),
            WritePayload::Encoded(Arc::new(image::DynamicImage::new_rgba8(16, 12))),
        );
        writer.flush().await;

        let stored = disk.read(&key).await.unwrap();
        let img = downsampler::decode(&stored, None).unwrap();
        assert_eq!((img.width(), img.height()), (16, 12));
    }

    #[tokio::test]
    async fn test_remove_is_ordered_after_pending_write() {
        let (writer, disk, _temp) = setup();
        let key = CacheKey::derive("https://example/c.png", None, None);

        writer.enqueue_write(
            key.clone(),
            WritePayload::Encoded(Arc::new(image::DynamicImage::new_rgb8(4, 4))),
        );
        writer.remove(key.clone()).await;

        assert!(!disk.exists(&key).await);
    }

    #[tokio::test]
    async fn test_clear_is_ordered_after_pending_write() {
        let (writer, disk, _temp) = setup();
        let key = CacheKey::derive("https://example/d.png", None, None);

        writer.enqueue_write(
            key.clone(),
            WritePayload::Encoded(Arc::new(image::DynamicImage::new_rgb8(4, 4))),
        );
        writer.clear().await;

        assert!(!disk.exists(&key).await);
        assert!(disk.cache_dir().is_dir());
    }
}
