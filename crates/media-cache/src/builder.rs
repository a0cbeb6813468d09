//! # Builder for CacheConfig
//!
//! Fluent construction of [`CacheConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use media_cache::CacheConfig;
//!
//! let config = CacheConfig::builder()
//!     .with_cache_dir("/tmp/my-media-cache")
//!     .with_max_cache_size(64 * 1024 * 1024)
//!     .with_connect_timeout(Duration::from_secs(5))
//!     .with_user_agent("MyPlayer/1.0")
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .build();
//!
//! assert_eq!(config.max_cache_size, Some(64 * 1024 * 1024));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::{CacheConfig, HttpConfig};

/// Builder for creating CacheConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    /// Set the directory holding the cached files
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    /// Use a fixed size budget instead of deriving it from free space
    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.config.max_cache_size = Some(bytes);
        self
    }

    /// Set the two budgets and the free space threshold choosing between them
    pub fn with_budgets(mut self, threshold: u64, large: u64, small: u64) -> Self {
        self.config.free_space_threshold = threshold;
        self.config.large_budget = large;
        self.config.small_budget = small;
        self
    }

    /// Set how often blocked readers re-check the download
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the period and the initial delay of the eviction sweep
    pub fn with_sweep_schedule(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.config.sweep_initial_delay = initial_delay;
        self.config.sweep_interval = interval;
        self
    }

    /// Replace the HTTP configuration
    pub fn with_http_config(mut self, http: HttpConfig) -> Self {
        self.config.http = http;
        self
    }

    /// Set the overall timeout for a request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.timeout = timeout;
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.connect_timeout = timeout;
        self
    }

    /// Set the read timeout (maximum time between receiving data chunks)
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.http.read_timeout = timeout;
        self
    }

    /// Set whether to follow redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.http.follow_redirects = follow;
        self
    }

    /// Set the user agent string
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.http.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header, invalid names or values are ignored
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.http.headers.insert(name, value);
        }
        self
    }

    /// Merge headers into the defaults, later values win
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.config.http.headers.insert(name.clone(), value.clone());
        }
        self
    }

    /// Route all downloads through the given proxy
    pub fn with_proxy(mut self, proxy_url: impl Into<String>) -> Self {
        self.config.http.proxy = Some(proxy_url.into());
        self
    }

    /// Build the CacheConfig instance
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = CacheConfigBuilder::new().build();
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.sweep_initial_delay, Duration::from_secs(10));
        assert!(config.max_cache_size.is_none());
        assert!(config.http.follow_redirects);
        assert!(config.http.proxy.is_none());
    }

    #[test]
    fn test_builder_customization() {
        let config = CacheConfigBuilder::new()
            .with_cache_dir("/var/cache/media")
            .with_max_cache_size(1000)
            .with_poll_interval(Duration::from_millis(10))
            .with_sweep_schedule(Duration::ZERO, Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(20))
            .with_follow_redirects(false)
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_proxy("socks5://127.0.0.1:1080")
            .build();

        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/media"));
        assert_eq!(config.max_cache_size, Some(1000));
        assert_eq!(config.poll_interval, Duration::from_millis(10));
        assert_eq!(config.sweep_initial_delay, Duration::ZERO);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.http.connect_timeout, Duration::from_secs(20));
        assert!(!config.http.follow_redirects);
        assert_eq!(config.http.user_agent, "CustomUserAgent/1.0");
        assert_eq!(config.http.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));

        let header_value = config.http.headers.get("X-Custom-Header").unwrap();
        assert_eq!(header_value.to_str().unwrap(), "CustomValue");
    }

    #[test]
    fn test_invalid_header_is_ignored() {
        let config = CacheConfigBuilder::new()
            .with_header("Bad Header", "value")
            .build();
        assert!(config.http.headers.get("Bad Header").is_none());
    }

    #[test]
    fn test_with_headers_keeps_defaults() {
        let mut extra = HeaderMap::new();
        extra.insert("x-token", HeaderValue::from_static("abc"));
        let config = CacheConfigBuilder::new().with_headers(extra).build();

        assert!(config.http.headers.contains_key("x-token"));
        assert!(config.http.headers.contains_key(reqwest::header::ACCEPT));
    }
}
