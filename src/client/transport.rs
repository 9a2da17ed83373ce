//! Cache transport client
//!
//! Thin HTTP client bound to a cache server base address. `GET {base}/cache/{hash}`
//! fetches an artifact, `POST {base}/cache/{hash}` uploads one. Bodies are
//! streamed in both directions.

use std::io;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, Response, Url};
use tracing::{debug, warn};

use super::errors::ClientError;
use crate::protocol::{
    CacheResponse, ARCHIVE_CONTENT_TYPE, PROJECT_NAME_HEADER, START_TIME_HEADER, TARGET_HEADER,
};
use crate::types::Provenance;

/// Time allowed to establish a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries for retryable fetch errors
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Delay before each retry, in milliseconds
const BACKOFF_MS: [u64; 3] = [500, 1000, 2000];

/// HTTP client for one cache endpoint
#[derive(Clone)]
pub struct CacheTransport {
    /// HTTP client for making requests
    http_client: Client,
    /// Base address without trailing slash, e.g. `http://host/projects/p1`
    base_url: String,
    /// Retries for retryable fetch errors
    max_retries: u32,
    /// Total time allowed per fetch attempt, body included
    fetch_timeout: Duration,
}

impl CacheTransport {
    /// Create a transport for the cache server at `host`
    ///
    /// # Arguments
    /// * `host` - Base address; `/cache/{hash}` is appended to it
    /// * `timeout` - Total time allowed per fetch attempt, body included.
    ///   Uploads stream for as long as the archive takes and are only bounded
    ///   by the connect timeout.
    pub fn new(host: &str, timeout: Duration) -> Result<Self, ClientError> {
        let url = Url::parse(host).map_err(|e| ClientError::InvalidHost(format!("{host}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidHost(format!(
                "{host}: unsupported scheme {}",
                url.scheme()
            )));
        }

        let http_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http_client,
            base_url: host.trim_end_matches('/').to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            fetch_timeout: timeout,
        })
    }

    /// Override how often retryable fetch errors are retried
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Base address requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn cache_url(&self, hash: &str) -> String {
        format!("{}/cache/{}", self.base_url, urlencoding::encode(hash))
    }

    /// Execute an operation, retrying retryable errors with backoff
    async fn with_retry<F, Fut, T>(&self, operation: &str, hash: &str, f: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ClientError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() || attempt >= self.max_retries => return Err(e),
                Err(e) => {
                    let delay = BACKOFF_MS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(2000);
                    attempt += 1;
                    warn!(
                        operation = operation,
                        hash = hash,
                        attempt = attempt,
                        max = self.max_retries,
                        delay_ms = delay,
                        error = %e,
                        "Retrying cache request"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    /// Request an artifact
    ///
    /// Returns the response once the status line says success; the body is
    /// left unread for the caller to stream. A 404 is a cache miss.
    pub async fn fetch(&self, hash: &str) -> Result<Response, ClientError> {
        let url = self.cache_url(hash);
        debug!(hash = hash, url = %url, "Fetching artifact");

        let client = &self.http_client;
        let url = url.as_str();
        let timeout = self.fetch_timeout;
        self.with_retry("fetch", hash, || async move {
            let response = client.get(url).timeout(timeout).send().await?;
            check_status(response).await
        })
        .await
    }

    /// Upload an archive body for `hash`
    ///
    /// Provenance fields that are absent are simply not sent. Succeeds only
    /// if the server answers 200 with `ok: true`.
    pub async fn upload(
        &self,
        hash: &str,
        body: Body,
        provenance: &Provenance,
    ) -> Result<(), ClientError> {
        let url = self.cache_url(hash);
        debug!(hash = hash, url = %url, "Uploading artifact");

        let mut request = self
            .http_client
            .post(&url)
            .header(CONTENT_TYPE, ARCHIVE_CONTENT_TYPE);
        if let Some(project) = &provenance.project_name {
            request = request.header(PROJECT_NAME_HEADER, project.as_str());
        }
        if let Some(target) = &provenance.target {
            request = request.header(TARGET_HEADER, target.as_str());
        }
        if let Some(start_time) = provenance.start_time {
            request = request.header(START_TIME_HEADER, start_time.to_string());
        }

        let response = check_status(request.body(body).send().await?).await?;
        let reply: CacheResponse = response.json().await?;
        if !reply.ok {
            return Err(ClientError::Rejected(hash.to_string()));
        }
        Ok(())
    }
}

/// Turn a response body into a stream of byte chunks
pub fn body_stream(response: Response) -> impl Stream<Item = io::Result<Bytes>> + Send + Unpin {
    Box::pin(response.bytes_stream().map_err(io::Error::other))
}

async fn check_status(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::from_status(status.as_u16(), &body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_url() {
        let transport =
            CacheTransport::new("http://localhost:3000/projects/p1/", Duration::from_secs(5))
                .unwrap();
        assert_eq!(transport.base_url(), "http://localhost:3000/projects/p1");
        assert_eq!(
            transport.cache_url("abc123"),
            "http://localhost:3000/projects/p1/cache/abc123"
        );
    }

    #[test]
    fn test_rejects_bad_host() {
        assert!(matches!(
            CacheTransport::new("not a url", Duration::from_secs(5)),
            Err(ClientError::InvalidHost(_))
        ));
        assert!(matches!(
            CacheTransport::new("ftp://example.com", Duration::from_secs(5)),
            Err(ClientError::InvalidHost(_))
        ));
    }

    async fn slow_server() -> String {
        use axum::routing::get;

        async fn slow_fetch() -> &'static str {
            tokio::time::sleep(Duration::from_millis(500)).await;
            "late"
        }

        async fn slow_store(
            axum::extract::Path(hash): axum::extract::Path<String>,
            body: axum::body::Body,
        ) -> axum::Json<CacheResponse> {
            let _ = axum::body::to_bytes(body, usize::MAX).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
            axum::Json(CacheResponse::ok(hash))
        }

        let app = axum::Router::new().route("/cache/{hash}", get(slow_fetch).post(slow_store));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_timeout_bounds_fetch_only() {
        let host = slow_server().await;
        let transport = CacheTransport::new(&host, Duration::from_millis(200))
            .unwrap()
            .with_max_retries(0);

        let fetched = transport.fetch("abc123").await;
        assert!(matches!(fetched, Err(ClientError::Timeout)));

        let uploaded = transport
            .upload("abc123", Body::from(vec![0u8; 1024]), &Provenance::default())
            .await;
        assert!(uploaded.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let host = format!("http://127.0.0.1:{port}");
        let transport = CacheTransport::new(&host, Duration::from_secs(5))
            .unwrap()
            .with_max_retries(0);
        let result = transport.fetch("abc123").await;
        assert!(matches!(result, Err(e) if e.is_retryable()));
    }
}
