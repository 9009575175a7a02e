//! HTTP transport for image bytes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::domain::ports::{CacheError, CacheResult, ImageFetcherPort};

const USER_AGENT: &str = concat!("covercache/", env!("CARGO_PKG_VERSION"));

/// Transport settings for [`HttpImageFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// Extra attempts after a transport failure or 5xx response.
    pub retry_count: u32,
    /// Delay before the first retry; doubled for each further attempt.
    pub retry_delay: Duration,
    /// Honour proxy settings from the environment.
    pub use_system_proxy: bool,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_count: 1,
            retry_delay: Duration::from_millis(500),
            use_system_proxy: true,
        }
    }
}

/// Downloads image bytes with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
    config: HttpFetcherConfig,
}

/// Outcome of a single attempt.
enum Attempt {
    Done(Bytes),
    Retryable(CacheError),
    Fatal(CacheError),
}

impl HttpImageFetcher {
    /// Creates a fetcher with the given transport settings.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created.
    pub fn new(config: HttpFetcherConfig) -> CacheResult<Self> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout);
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| CacheError::NetworkError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    async fn attempt(&self, url: &reqwest::Url) -> Attempt {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    "request timed out".to_string()
                } else if e.is_connect() {
                    format!("failed to connect: {e}")
                } else {
                    format!("Request failed: {e}")
                };
                return Attempt::Retryable(CacheError::NetworkError(message));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = CacheError::NetworkError(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ));
            return if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                Attempt::Retryable(err)
            } else {
                Attempt::Fatal(err)
            };
        }

        match response.bytes().await {
            Ok(bytes) => Attempt::Done(bytes),
            Err(e) => Attempt::Retryable(CacheError::NetworkError(format!(
                "Failed to read body: {e}"
            ))),
        }
    }
}

#[async_trait]
impl ImageFetcherPort for HttpImageFetcher {
    async fn get_bytes(&self, url: &str) -> CacheResult<Bytes> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| CacheError::NetworkError(format!("Invalid URL {url:?}: {e}")))?;

        let mut delay = self.config.retry_delay;
        let mut attempt = 0u32;
        loop {
            match self.attempt(&parsed).await {
                Attempt::Done(bytes) => {
                    debug!(url = %parsed, size = bytes.len(), "Downloaded image");
                    return Ok(bytes);
                }
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) if attempt >= self.config.retry_count => return Err(e),
                Attempt::Retryable(e) => {
                    attempt += 1;
                    warn!(url = %parsed, error = %e, attempt, "Image download failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection, in order.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = vec![0u8; 8192];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {status} Status\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{addr}/cover.jpg"), hits)
    }

    fn fetcher(retry_count: u32) -> HttpImageFetcher {
        HttpImageFetcher::new(HttpFetcherConfig {
            timeout: Duration::from_secs(5),
            retry_count,
            retry_delay: Duration::from_millis(10),
            use_system_proxy: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_successful_download() {
        let (url, hits) = serve(vec![(200, "cover-bytes")]).await;

        let bytes = fetcher(0).get_bytes(&url).await.unwrap();

        assert_eq!(&bytes[..], b"cover-bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, hits) = serve(vec![(404, ""), (200, "late")]).await;

        let err = fetcher(3).get_bytes(&url).await.unwrap_err();

        assert!(err.is_network());
        assert!(err.to_string().contains("404"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let (url, hits) = serve(vec![(503, ""), (200, "second-try")]).await;

        let bytes = fetcher(1).get_bytes(&url).await.unwrap();

        assert_eq!(&bytes[..], b"second-try");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (url, hits) = serve(vec![(500, ""), (500, ""), (500, "")]).await;

        let err = fetcher(1).get_bytes(&url).await.unwrap_err();

        assert!(err.to_string().contains("500"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = fetcher(0).get_bytes("not a url").await.unwrap_err();
        assert!(err.is_network());
    }
}
