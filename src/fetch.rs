// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote model download.
//!
//! The loader only cares whether a download succeeded and what the body was.
//! [`HttpFetcher`] is the production transport: one loader attempt is one
//! call to [`ModelFetcher::fetch`], inside which 5xx responses are retried a
//! few times with exponential backoff before the attempt is reported failed.
//!
//! # Example
//!
//! ```no_run
//! use ranker_loader::fetch::{HttpFetcher, ModelFetcher};
//! use reqwest::Url;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let fetcher = HttpFetcher::new(std::time::Duration::from_secs(60))?;
//! let url = Url::parse("https://example.com/models/translate.model")?;
//! let response = fetcher.fetch(&url).await;
//! println!("success={} bytes={}", response.success, response.body.len());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use reqwest::{Client, Url};
use tokio::time::sleep;

/// Default timeout for a single HTTP request (in seconds).
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Retries on HTTP 5xx within a single fetch.
const MAX_RETRIES_ON_5XX: u32 = 2;

/// Base delay for exponential backoff between 5xx retries (milliseconds).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Maximum delay for exponential backoff between 5xx retries (milliseconds).
const RETRY_MAX_DELAY_MS: u64 = 10000;

/// Outcome of one download attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    /// True if the server returned 2xx and the body was read completely.
    pub success: bool,
    /// Response body. Empty on failure.
    pub body: Vec<u8>,
    /// Why the attempt failed, if the transport knows.
    pub error: Option<String>,
}

impl FetchResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            body: body.into(),
            error: None,
        }
    }

    pub fn failed() -> Self {
        Self::default()
    }

    pub fn failed_with(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Transport used by the loader to download a model.
pub trait ModelFetcher: Send + Sync {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, FetchResponse>;
}

/// Error types specific to model downloads. Logged, never surfaced.
#[derive(Debug, Clone)]
pub enum FetchError {
    /// Connection failed or timed out.
    Network(String),
    /// Server answered with a non-success status.
    Http { status: u16 },
    /// The response body could not be read.
    Body(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Http { status } => write!(f, "Server returned HTTP {}", status),
            Self::Body(msg) => write!(f, "Failed to read response body: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

/// reqwest-backed [`ModelFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_retries_on_5xx: u32,
}

impl HttpFetcher {
    /// Create a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ranker-loader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            max_retries_on_5xx: MAX_RETRIES_ON_5XX,
        })
    }

    /// Override how many times a 5xx response is retried within one fetch.
    pub fn with_max_retries_on_5xx(mut self, retries: u32) -> Self {
        self.max_retries_on_5xx = retries;
        self
    }

    async fn download(
        client: Client,
        url: Url,
        max_retries_on_5xx: u32,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                // 1000ms, 2000ms, ... capped at 10s
                let delay = std::cmp::min(
                    RETRY_BASE_DELAY_MS.saturating_mul(1 << attempt.min(16)),
                    RETRY_MAX_DELAY_MS,
                );
                tracing::debug!("Retrying model download (attempt {}) after {}ms", attempt + 1, delay);
                sleep(Duration::from_millis(delay)).await;
            }

            let response = client.get(url.clone()).send().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Network("request timed out".to_string())
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

            let status = response.status();
            if status.is_server_error() && attempt < max_retries_on_5xx {
                tracing::debug!("Model server returned HTTP {}", status.as_u16());
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                return Err(FetchError::Http {
                    status: status.as_u16(),
                });
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::Body(e.to_string()))?;
            return Ok(body.to_vec());
        }
    }
}

impl ModelFetcher for HttpFetcher {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, FetchResponse> {
        let client = self.client.clone();
        let url = url.clone();
        let retries = self.max_retries_on_5xx;
        Box::pin(async move {
            match Self::download(client, url.clone(), retries).await {
                Ok(body) => FetchResponse::ok(body),
                Err(e) => FetchResponse::failed_with(format!("{} ({})", e, url)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `responses` in order, one per connection, then stop accepting.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);

        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        let url = Url::parse(&format!("http://{}/model", addr)).unwrap();
        (url, hits)
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let (url, hits) = serve(vec![(200, "model-bytes")]).await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();

        let response = fetcher.fetch(&url).await;
        assert!(response.success);
        assert_eq!(response.body, b"model-bytes");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let (url, hits) = serve(vec![(503, "busy"), (200, "fresh")]).await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_max_retries_on_5xx(1);

        let response = fetcher.fetch(&url).await;
        assert!(response.success);
        assert_eq!(response.body, b"fresh");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_client_error_is_not_retried() {
        let (url, hits) = serve(vec![(404, "missing"), (200, "unused")]).await;
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();

        let response = fetcher.fetch(&url).await;
        assert!(!response.success);
        assert!(response.body.is_empty());
        let reason = response.error.expect("failure reason is reported");
        assert!(reason.contains("HTTP 404"), "unexpected reason: {}", reason);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = HttpFetcher::new(Duration::from_secs(2)).unwrap();
        let url = Url::parse(&format!("http://{}/model", addr)).unwrap();
        let response = fetcher.fetch(&url).await;
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Network error"));
    }
}
