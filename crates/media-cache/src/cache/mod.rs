//! # Cache System
//!
//! Disk-backed cache for progressively downloaded media. Each remote
//! resource maps to one file in a flat cache directory; readers block until
//! the bytes they need are written by a background download.

mod downloader;
mod entry;
mod eviction;
mod local;
mod registry;
mod stream;
mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use entry::CacheEntry;
pub use eviction::SweepReport;
pub use local::LocalResourceEntry;
pub use registry::{CacheRegistry, EntryHandle};
pub use stream::EntryStream;
pub use types::{Entry, EntryHeader, PAYLOAD_OFFSET, cache_key_of, filename_checksum, filename_for};
