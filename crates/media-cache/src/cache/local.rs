//! # Local Resources
//!
//! `file://` URLs and bare paths are served straight from the filesystem.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::cache::stream::EntryStream;
use crate::cache::types::Entry;
use crate::error::CacheResult;

/// An entry for a file that already lives on the local filesystem.
/// Nothing is downloaded and nothing is reference counted.
#[derive(Debug, Clone)]
pub struct LocalResourceEntry {
    path: PathBuf,
}

impl LocalResourceEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Entry for LocalResourceEntry {
    fn total_size(&self) -> CacheResult<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn fraction_cached(&self) -> f32 {
        1.0
    }

    fn file_path(&self) -> &Path {
        &self.path
    }

    fn open_stream(&self, offset: u64) -> CacheResult<EntryStream> {
        let file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        Ok(EntryStream::local(file, len, offset))
    }

    fn close(&self) {}

    fn acquire(&self) {}
}
