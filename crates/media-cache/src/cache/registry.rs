//! # Cache Registry
//!
//! Maps request URIs to entries. There is exactly one entry per normalized
//! key for the lifetime of the registry (until the sweep deletes its file),
//! so concurrent callers asking for the same resource share one download.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::Disks;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::entry::{CacheEntry, EntryContext};
use crate::cache::local::LocalResourceEntry;
use crate::cache::types::{Entry, cache_key_of, filename_for};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::fetcher::{HttpFetcher, RangeFetcher};

pub struct CacheRegistry {
    pub(crate) config: CacheConfig,
    pub(crate) cache_dir: PathBuf,
    pub(crate) max_cache_size: u64,
    pub(crate) entries: Mutex<HashMap<String, Arc<dyn Entry>>>,
    pub(crate) context: Arc<EntryContext>,
}

impl CacheRegistry {
    /// Create a registry whose downloads run on `runtime` through `fetcher`.
    ///
    /// Reads block on the calling thread while downloads progress on the
    /// runtime, so a current-thread runtime is rejected.
    pub fn new(
        config: CacheConfig,
        fetcher: Arc<dyn RangeFetcher>,
        runtime: Handle,
    ) -> CacheResult<Self> {
        if runtime.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(CacheError::Config(
                "the media cache requires a multi-threaded tokio runtime".to_string(),
            ));
        }

        fs::create_dir_all(&config.cache_dir)?;
        let cache_dir = fs::canonicalize(&config.cache_dir)?;

        let free_space = available_space(&cache_dir);
        let max_cache_size = config.budget_for_free_space(free_space.unwrap_or(0));

        info!(
            cache_dir = ?cache_dir,
            free_space = ?free_space,
            max_cache_size,
            "Initialized media cache"
        );

        let context = Arc::new(EntryContext {
            runtime,
            fetcher,
            poll_interval: config.poll_interval,
        });

        Ok(Self {
            config,
            cache_dir,
            max_cache_size,
            entries: Mutex::new(HashMap::new()),
            context,
        })
    }

    /// Create a registry downloading over HTTP on the current tokio runtime.
    pub fn with_http(config: CacheConfig) -> CacheResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| CacheError::Config(format!("no tokio runtime available: {e}")))?;
        let fetcher = Arc::new(HttpFetcher::with_config(&config.http)?);
        Self::new(config, fetcher, runtime)
    }

    /// Return the entry for `uri`, creating it on first access. The entry
    /// holds one reference for the returned handle until it is closed.
    pub fn get(&self, uri: &str) -> CacheResult<EntryHandle> {
        let key = cache_key_of(uri);

        let mut entries = self.entries.lock();
        let entry = match entries.get(&key) {
            Some(entry) => entry.clone(),
            None => {
                let entry = self.create_entry(&key);
                debug!(key = %key, path = ?entry.file_path(), "Created new cache entry");
                entries.insert(key, entry.clone());
                entry
            }
        };
        entry.acquire();
        drop(entries);

        Ok(EntryHandle::new(entry))
    }

    fn create_entry(&self, key: &str) -> Arc<dyn Entry> {
        if let Some(path) = local_path(key) {
            let entry: Arc<dyn Entry> = Arc::new(LocalResourceEntry::new(path));
            return entry;
        }

        let file_path = self.cache_dir.join(filename_for(key));
        let entry: Arc<dyn Entry> = CacheEntry::new(key, file_path, self.context.clone());
        entry
    }

    /// Size budget enforced by the eviction sweep
    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    /// Canonical path of the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of known entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("cache_dir", &self.cache_dir)
            .field("max_cache_size", &self.max_cache_size)
            .field("entries", &self.len())
            .finish()
    }
}

/// Filesystem path for `file://` URLs and bare paths, `None` for anything
/// that has to be downloaded.
fn local_path(key: &str) -> Option<PathBuf> {
    match Url::parse(key) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok(),
        Ok(_) => None,
        Err(url::ParseError::RelativeUrlWithoutBase) => Some(PathBuf::from(key)),
        Err(e) => {
            warn!(uri = %key, error = %e, "Could not parse URI, treating it as remote");
            None
        }
    }
}

/// Available space on the disk holding `path`, if it can be determined.
fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

/// A borrowed entry. Closes its reference exactly once, on [`close`](Self::close)
/// or on drop.
pub struct EntryHandle {
    entry: Arc<dyn Entry>,
    closed: bool,
}

impl EntryHandle {
    fn new(entry: Arc<dyn Entry>) -> Self {
        Self {
            entry,
            closed: false,
        }
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.entry.close();
        }
    }
}

impl Deref for EntryHandle {
    type Target = dyn Entry;

    fn deref(&self) -> &Self::Target {
        self.entry.as_ref()
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.entry.as_ref(), f)
    }
}
