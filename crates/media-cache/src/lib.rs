//! # Media Cache
//!
//! A streaming, disk-backed cache for media players. Resources are fetched
//! with HTTP range requests into one file each, and readers can consume
//! the data while it is still downloading.
//!
//! ## Features
//!
//! - One shared download per resource, however many readers
//! - Resumption from whatever is already on disk
//! - Blocking `Read`/`Seek` streams for decoder threads
//! - Size-bounded eviction by modification time

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;

pub use builder::CacheConfigBuilder;
pub use cache::{
    CacheEntry, CacheRegistry, Entry, EntryHandle, EntryStream, LocalResourceEntry, SweepReport,
};
pub use config::{CacheConfig, HttpConfig};
pub use error::{CacheError, CacheResult};
pub use fetcher::{HttpFetcher, RangeFetcher, RangeResponse, create_client};
