//! # Range Fetcher
//!
//! The HTTP side of the cache: a single ranged GET per download attempt.
//! [`RangeFetcher`] is the seam the downloader talks to, [`HttpFetcher`]
//! is the reqwest implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{CACHE_CONTROL, CONTENT_RANGE, HeaderMap, HeaderValue, PRAGMA, RANGE};
use reqwest::{Client, StatusCode, Url};
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::{debug, info};

use crate::config::HttpConfig;
use crate::error::{CacheError, CacheResult};

/// Response to a ranged request, before its body is consumed
pub struct RangeResponse {
    /// HTTP status of the response
    pub status: StatusCode,
    /// Length of the body, if the server sent one
    pub content_length: Option<u64>,
    /// Full resource length taken from `Content-Range`, if present
    pub content_range_total: Option<u64>,
    /// The response body as a chunk stream
    pub body: BoxStream<'static, CacheResult<Bytes>>,
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range_total", &self.content_range_total)
            .finish_non_exhaustive()
    }
}

/// Performs `Range: bytes=<offset>-` requests for the cache.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Request the resource starting at `offset`, bypassing any transport cache.
    ///
    /// Implementations return the response for any status code; judging the
    /// status is up to the caller.
    async fn fetch_from(&self, uri: &str, offset: u64) -> CacheResult<RangeResponse>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpConfig) -> CacheResult<Client> {
    let provider = Arc::new(ring::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| CacheError::Config(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| CacheError::Config(format!("TLS platform verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(proxy_url) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| CacheError::Config(format!("Invalid proxy URL: {e}")))?;
        client_builder = client_builder.proxy(proxy);
        info!(proxy_url = %proxy_url, "Using explicitly configured proxy for downloads");
    }

    client_builder.build().map_err(CacheError::from)
}

/// Parse the total length out of a `Content-Range: bytes a-b/total` header.
pub fn parse_content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// reqwest-backed [`RangeFetcher`]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn with_config(config: &HttpConfig) -> CacheResult<Self> {
        Ok(Self::new(create_client(config)?))
    }
}

#[async_trait]
impl RangeFetcher for HttpFetcher {
    async fn fetch_from(&self, uri: &str, offset: u64) -> CacheResult<RangeResponse> {
        let url = uri
            .parse::<Url>()
            .map_err(|e| CacheError::Url(format!("{uri}: {e}")))?;

        debug!(url = %url, offset, "Starting ranged request");

        let response = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={offset}-"))
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .header(PRAGMA, HeaderValue::from_static("no-cache"))
            .send()
            .await?;

        let status = response.status();
        let content_length = response.content_length();
        let content_range_total = parse_content_range_total(response.headers());

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CacheError::from))
            .boxed();

        Ok(RangeResponse {
            status,
            content_length,
            content_range_total,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range_total() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 500-999/1000"));
        assert_eq!(parse_content_range_total(&headers), Some(1000));

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-99/*"));
        assert_eq!(parse_content_range_total(&headers), None);

        headers.remove(CONTENT_RANGE);
        assert_eq!(parse_content_range_total(&headers), None);
    }

    #[test]
    fn test_create_client_rejects_bad_proxy() {
        let config = HttpConfig {
            proxy: Some("not a url".to_string()),
            ..HttpConfig::default()
        };
        assert!(matches!(create_client(&config), Err(CacheError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let fetcher = HttpFetcher::with_config(&HttpConfig::default()).unwrap();
        let result = fetcher.fetch_from("::not-a-url::", 0).await;
        assert!(matches!(result, Err(CacheError::Url(_))));
    }
}
