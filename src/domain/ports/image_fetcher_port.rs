//! Port definition for retrieving image bytes from the network.

use async_trait::async_trait;
use bytes::Bytes;

use super::CacheResult;

/// Opaque byte transport consulted on a full cache miss.
///
/// No retry contract is imposed by the cache; transports may retry on their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcherPort: Send + Sync {
    /// Downloads the bytes behind `url`.
    async fn get_bytes(&self, url: &str) -> CacheResult<Bytes>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::domain::ports::CacheError;

    /// Serves canned bodies per URL and counts requests.
    #[derive(Default)]
    pub struct StaticFetcher {
        bodies: HashMap<String, Bytes>,
        delay: Option<Duration>,
        calls: Arc<AtomicUsize>,
    }

    impl StaticFetcher {
        /// Creates a fetcher with no routes.
        pub fn new() -> Self {
            Self::default()
        }

        /// Serves `body` for `url`.
        pub fn with_body(mut self, url: impl Into<String>, body: impl Into<Bytes>) -> Self {
            self.bodies.insert(url.into(), body.into());
            self
        }

        /// Sleeps for `delay` before answering each request.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Number of requests served so far, including failures.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ImageFetcherPort for StaticFetcher {
        async fn get_bytes(&self, url: &str) -> CacheResult<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.bodies
                .get(url)
                .cloned()
                .ok_or_else(|| CacheError::NetworkError("HTTP 404 Not Found".to_string()))
        }
    }
}
