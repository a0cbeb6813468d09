//! # Entry Stream
//!
//! A forward-reading cursor over an [`Entry`](crate::Entry). Reads on a
//! cached entry block until the requested bytes are on disk.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::debug;

use crate::cache::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};

enum Source {
    Cached(Arc<CacheEntry>),
    Local { file: File, len: u64 },
}

pub struct EntryStream {
    source: Source,
    position: u64,
    mark: u64,
    closed: bool,
}

impl EntryStream {
    /// The stream holds one reference on `entry`, released on close.
    pub(crate) fn cached(entry: Arc<CacheEntry>, offset: u64) -> Self {
        Self {
            source: Source::Cached(entry),
            position: offset,
            mark: offset,
            closed: false,
        }
    }

    pub(crate) fn local(file: File, len: u64, offset: u64) -> Self {
        Self {
            source: Source::Local { file, len },
            position: offset,
            mark: offset,
            closed: false,
        }
    }

    /// Current absolute position in the resource
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read into `buf`, returning 0 at the end of the resource.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> CacheResult<usize> {
        self.ensure_open()?;

        let count = match &mut self.source {
            Source::Cached(entry) => entry.read_at(self.position, buf)?,
            Source::Local { file, len } => {
                if self.position >= *len {
                    return Ok(0);
                }
                file.seek(SeekFrom::Start(self.position))?;
                let limit = (*len - self.position).min(buf.len() as u64) as usize;
                file.read(&mut buf[..limit])?
            }
        };

        self.position += count as u64;
        Ok(count)
    }

    /// Advance the position by up to `n` bytes without waiting for them.
    /// Returns how far the position moved.
    pub fn skip(&mut self, n: u64) -> CacheResult<u64> {
        let total_size = self.total_size()?;
        let target = self.position.saturating_add(n).min(total_size);
        let skipped = target.saturating_sub(self.position);
        self.position = self.position.max(target);
        Ok(skipped)
    }

    /// Bytes readable at the current position without blocking.
    pub fn available(&self) -> u64 {
        match &self.source {
            Source::Cached(entry) => entry.available_from(self.position),
            Source::Local { len, .. } => len.saturating_sub(self.position),
        }
    }

    /// Remember the current position for a later [`reset`](Self::reset).
    pub fn mark(&mut self) {
        self.mark = self.position;
    }

    /// Jump back to the last marked position, or the start offset if none.
    pub fn reset(&mut self) {
        self.position = self.mark;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the reference on the entry. Calling it twice is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Source::Cached(entry) = &self.source {
            debug!(uri = %entry.uri(), position = self.position, "Closing entry stream");
            entry.decrement_ref_count();
        }
    }

    fn ensure_open(&self) -> CacheResult<()> {
        if self.closed {
            return Err(CacheError::Interrupted("stream is closed".to_string()));
        }
        Ok(())
    }

    /// Fails once closed, the stream no longer holds a reference on the entry.
    fn total_size(&self) -> CacheResult<u64> {
        self.ensure_open()?;
        match &self.source {
            Source::Cached(entry) => crate::Entry::total_size(entry.as_ref()),
            Source::Local { len, .. } => Ok(*len),
        }
    }
}

impl Drop for EntryStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EntryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            Source::Cached(entry) => entry.uri().to_string(),
            Source::Local { len, .. } => format!("local ({len} bytes)"),
        };
        f.debug_struct("EntryStream")
            .field("source", &source)
            .field("position", &self.position)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Read for EntryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // `Interrupted` would make `read_to_end` spin on a closed stream
        if self.closed {
            return Err(io::Error::other("stream is closed"));
        }
        self.read_bytes(buf).map_err(io::Error::from)
    }
}

impl Seek for EntryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self
                .total_size()
                .map_err(io::Error::from)?
                .checked_add_signed(delta),
        };

        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative position")
        })?;

        self.position = target;
        Ok(target)
    }
}
