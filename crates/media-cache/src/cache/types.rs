//! # Cache Types
//!
//! The [`Entry`] capability shared by cached and local resources, plus the
//! naming and on-disk header rules for cache files.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::cache::stream::EntryStream;
use crate::error::CacheResult;

/// Offset of the first payload byte in a cache file.
///
/// Only the first 8 bytes carry the header fields; the rest of the region
/// is reserved, written as zeros and never interpreted.
pub const PAYLOAD_OFFSET: u64 = 16;

/// Number of header bytes that carry meaning (checksum + total size).
pub const HEADER_LEN: usize = 8;

const MAX_FILENAME_LEN: usize = 200;

static SCHEME_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^https?://").unwrap());
static UNSAFE_CHARS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9.]+").unwrap());

/// A resource handed out by the registry.
pub trait Entry: Send + Sync + fmt::Debug {
    /// Total size of the resource in bytes. May block to negotiate it.
    fn total_size(&self) -> CacheResult<u64>;

    /// Fraction of the resource on disk, between 0 and 1, or -1 if unknown.
    fn fraction_cached(&self) -> f32;

    /// The file backing this entry
    fn file_path(&self) -> &Path;

    /// Open a new reading cursor starting at `offset`.
    fn open_stream(&self, offset: u64) -> CacheResult<EntryStream>;

    /// Release one reference taken by the registry or a stream.
    fn close(&self);

    /// Take one reference on behalf of a registry caller.
    fn acquire(&self);

    /// Whether a download is currently writing into the backing file.
    fn is_downloading(&self) -> bool {
        false
    }

    /// Whether a handle or stream still holds a reference on the entry.
    fn is_in_use(&self) -> bool {
        false
    }
}

/// Registry key for a request URI. Plain `http://` is folded into
/// `https://`, both map to the same cache file anyway.
pub fn cache_key_of(uri: &str) -> String {
    match uri.strip_prefix("http://") {
        Some(rest) => format!("https://{rest}"),
        None => uri.to_string(),
    }
}

/// Derive the cache file name from a key: the scheme is dropped and every
/// run of characters outside `[A-Za-z0-9.]` becomes a single `_`.
pub fn filename_for(key: &str) -> String {
    let stripped = SCHEME_REGEX.replace(key, "");
    let name = UNSAFE_CHARS_REGEX.replace_all(&stripped, "_").into_owned();

    if name.len() <= MAX_FILENAME_LEN {
        return name;
    }

    // Keep long names unique after truncation; the name is ASCII only.
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    format!("{}_{}", &name[..MAX_FILENAME_LEN - 17], &digest[..16])
}

/// Checksum stored in the header, derived from the cache file name so a
/// file copied or renamed into another entry's place is rejected.
pub fn filename_checksum(filename: &str) -> u32 {
    let digest = Sha256::digest(filename.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// The meaningful part of a cache file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub checksum: u32,
    pub total_size: u32,
}

impl EntryHeader {
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&self.checksum.to_be_bytes());
        buf[4..].copy_from_slice(&self.total_size.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            checksum: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            total_size: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_folds_http() {
        assert_eq!(
            cache_key_of("http://img.example.com/a.jpg"),
            "https://img.example.com/a.jpg"
        );
        assert_eq!(
            cache_key_of("https://img.example.com/a.jpg"),
            "https://img.example.com/a.jpg"
        );
        assert_eq!(cache_key_of("file:///tmp/a.mp4"), "file:///tmp/a.mp4");
    }

    #[test]
    fn test_filename_sanitization() {
        assert_eq!(
            filename_for("https://vid.example.com/2024/01/clip.mp4"),
            "vid.example.com_2024_01_clip.mp4"
        );
        assert_eq!(
            filename_for("http://a.b/x?y=1&z=%20"),
            "a.b_x_y_1_z_20"
        );
    }

    #[test]
    fn test_long_filenames_stay_unique() {
        let base = format!("https://example.com/{}", "a".repeat(300));
        let a = filename_for(&format!("{base}1"));
        let b = filename_for(&format!("{base}2"));
        assert_eq!(a.len(), MAX_FILENAME_LEN);
        assert_eq!(b.len(), MAX_FILENAME_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_checksum_depends_on_name() {
        assert_eq!(filename_checksum("a.mp4"), filename_checksum("a.mp4"));
        assert_ne!(filename_checksum("a.mp4"), filename_checksum("b.mp4"));
    }

    #[test]
    fn test_header_layout() {
        let header = EntryHeader {
            checksum: 0x0102_0304,
            total_size: 1000,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(EntryHeader::from_bytes(&bytes), header);
    }
}
