use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

const MIB: u64 = 1024 * 1024;

/// HTTP options used for the ranged downloads
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a request, zero disables it.
    ///
    /// Media bodies can take minutes to stream, so this is off by default
    /// and `read_timeout` guards against stalled connections instead.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy URL applied to all schemes (e.g. "socks5://127.0.0.1:1080")
    pub proxy: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            proxy: None,
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        // Range offsets refer to the raw representation, so never ask for
        // a compressed one.
        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }
}

/// Configuration of the media cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Flat directory holding one file per cached resource
    pub cache_dir: PathBuf,

    /// Fixed size budget. If `None`, the budget is derived from the free
    /// space on the cache volume when the registry is created.
    pub max_cache_size: Option<u64>,

    /// Free space above which the large budget is used
    pub free_space_threshold: u64,

    /// Budget used when free space exceeds the threshold
    pub large_budget: u64,

    /// Budget used otherwise
    pub small_budget: u64,

    /// How long a blocked reader sleeps before re-checking the download
    pub poll_interval: Duration,

    /// Period of the eviction sweep
    pub sweep_interval: Duration,

    /// Delay before the first eviction sweep
    pub sweep_initial_delay: Duration,

    /// HTTP settings for the downloads
    pub http: HttpConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("media-cache"),
            max_cache_size: None,
            free_space_threshold: 1024 * MIB,
            large_budget: 256 * MIB,
            small_budget: 128 * MIB,
            poll_interval: Duration::from_millis(250),
            sweep_interval: Duration::from_secs(60),
            sweep_initial_delay: Duration::from_secs(10),
            http: HttpConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> crate::builder::CacheConfigBuilder {
        crate::builder::CacheConfigBuilder::new()
    }

    /// Pick the size budget for the given amount of free space.
    pub fn budget_for_free_space(&self, free_space: u64) -> u64 {
        if let Some(max) = self.max_cache_size {
            return max;
        }

        if free_space > self.free_space_threshold {
            self.large_budget
        } else {
            self.small_budget
        }
    }
}
