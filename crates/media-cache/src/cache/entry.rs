//! # Cache Entry
//!
//! One remote resource backed by one file in the cache directory. Readers
//! block until the bytes they ask for are on disk; a single [`Downloader`]
//! fills the file in the background. All transient state sits behind one
//! mutex, and the condition variable next to it is the only hand-off
//! between the downloader and waiting readers.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::cache::downloader::Downloader;
use crate::cache::stream::EntryStream;
use crate::cache::types::{Entry, EntryHeader, HEADER_LEN, PAYLOAD_OFFSET, filename_checksum};
use crate::error::{CacheError, CacheResult};
use crate::fetcher::RangeFetcher;

/// Shared collaborators of all entries of one registry
pub(crate) struct EntryContext {
    pub(crate) runtime: Handle,
    pub(crate) fetcher: Arc<dyn RangeFetcher>,
    pub(crate) poll_interval: Duration,
}

/// Transient state, torn down whenever the last reference is released.
#[derive(Default)]
struct EntryState {
    file: Option<File>,
    written: u64,
    total_size: u64,
    downloader: Option<Arc<Downloader>>,
    /// Downloader whose size future decides the pending initialization
    negotiating: Option<Arc<Downloader>>,
}

impl EntryState {
    fn fully_cached(&self) -> bool {
        self.written >= self.total_size
    }

    fn is_current(&self, downloader: &Arc<Downloader>) -> bool {
        self.downloader
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, downloader))
    }

    fn is_negotiating(&self, downloader: &Arc<Downloader>) -> bool {
        self.negotiating
            .as_ref()
            .is_some_and(|pending| Arc::ptr_eq(pending, downloader))
    }
}

pub struct CacheEntry {
    me: Weak<CacheEntry>,
    uri: String,
    file_path: PathBuf,
    checksum: u32,
    ref_count: AtomicI64,
    state: Mutex<EntryState>,
    written_updated: Condvar,
    // lock-free copies of written/total_size for progress queries
    written_hint: AtomicU64,
    total_hint: AtomicU64,
    context: Arc<EntryContext>,
}

impl CacheEntry {
    pub(crate) fn new(
        uri: impl Into<String>,
        file_path: PathBuf,
        context: Arc<EntryContext>,
    ) -> Arc<Self> {
        let checksum = file_path
            .file_name()
            .map(|name| filename_checksum(&name.to_string_lossy()))
            .unwrap_or_default();

        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            uri: uri.into(),
            file_path,
            checksum,
            ref_count: AtomicI64::new(0),
            state: Mutex::new(EntryState::default()),
            written_updated: Condvar::new(),
            written_hint: AtomicU64::new(0),
            total_hint: AtomicU64::new(0),
            context,
        })
    }

    pub(crate) fn uri(&self) -> &str {
        &self.uri
    }

    /// Current number of references (open handles, streams and a running download)
    pub(crate) fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the backing file is currently open
    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Read up to `buf.len()` bytes at `pos`, blocking until they are
    /// downloaded. Returns `Ok(0)` at the end of the resource.
    pub(crate) fn read_at(&self, pos: u64, buf: &mut [u8]) -> CacheResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;

        if pos >= state.total_size {
            return Ok(0);
        }

        let amount = (state.total_size - pos).min(buf.len() as u64) as usize;
        self.expect_cached(&mut state, pos + amount as u64)?;

        let file = state.file.as_mut().ok_or_else(|| {
            CacheError::Interrupted("cache entry was reset while reading".to_string())
        })?;

        file.seek(SeekFrom::Start(PAYLOAD_OFFSET + pos))?;
        let count = read_fully(file, &mut buf[..amount])?;

        if count != amount {
            warn!(
                uri = %self.uri,
                pos,
                expected = amount,
                actual = count,
                "Short read from cache file"
            );
        }

        Ok(count)
    }

    /// Bytes that can be read at `pos` without waiting for the network.
    pub(crate) fn available_from(&self, pos: u64) -> u64 {
        self.written_hint.load(Ordering::Acquire).saturating_sub(pos)
    }

    pub(crate) fn increment_ref_count(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one reference. The last one closes the file and resets the
    /// transient state; the bytes on disk stay for the next access.
    pub(crate) fn decrement_ref_count(&self) {
        self.ref_count.fetch_sub(1, Ordering::AcqRel);

        let mut state = self.state.lock();

        let mut count = self.ref_count.load(Ordering::Acquire);
        while count < 0 {
            warn!(uri = %self.uri, ref_count = count, "Ref count dropped below zero");
            match self
                .ref_count
                .compare_exchange(count, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => count = 0,
                Err(actual) => count = actual,
            }
        }

        if count == 0 && state.file.is_some() {
            debug!(uri = %self.uri, "Closing cache file now");
            self.reset(&mut state);
        }
    }

    /// Append a chunk on behalf of `downloader`. Returns false if the
    /// downloader was replaced or the file went away.
    pub(crate) fn write_chunk(&self, downloader: &Arc<Downloader>, data: &[u8]) -> CacheResult<bool> {
        let mut state = self.state.lock();

        if !state.is_current(downloader) {
            return Ok(false);
        }

        if downloader.take_restart() && state.written > 0 {
            debug!(uri = %self.uri, written = state.written, "Discarding progress, body starts at 0");
            state.written = 0;
        }

        let remaining = downloader.negotiated_size().saturating_sub(state.written);
        if remaining == 0 {
            warn!(uri = %self.uri, "Server sent more data than announced");
            return Ok(false);
        }
        let data = &data[..data.len().min(remaining as usize)];

        let offset = PAYLOAD_OFFSET + state.written;
        let Some(file) = state.file.as_mut() else {
            warn!(uri = %self.uri, "File handle went away during caching");
            return Ok(false);
        };

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        state.written += data.len() as u64;
        self.publish(&state);
        self.written_updated.notify_all();

        Ok(true)
    }

    /// Called by a downloader once it stopped for whatever reason.
    pub(crate) fn caching_stopped(&self, downloader: &Arc<Downloader>) {
        let mut state = self.state.lock();
        debug!(uri = %self.uri, written = state.written, total_size = state.total_size, "Caching stopped");

        if state.is_current(downloader) {
            state.downloader = None;
        }

        // readers re-evaluate and restart caching if the download stopped short
        self.written_updated.notify_all();
    }

    fn ensure_initialized(&self, state: &mut MutexGuard<'_, EntryState>) -> CacheResult<()> {
        loop {
            if let Some(pending) = state.negotiating.clone() {
                let outcome = MutexGuard::unlocked(state, || pending.wait_for_size());
                self.finish_negotiation(state, &pending, outcome)?;
                continue;
            }

            if state.file.is_some() {
                return Ok(());
            }

            debug!(uri = %self.uri, "Entry needs to be initialized");
            self.initialize(state)?;
        }
    }

    /// Open the backing file and either load its header or start the
    /// negotiating download. The negotiation itself is awaited by
    /// [`Self::ensure_initialized`].
    fn initialize(&self, state: &mut MutexGuard<'_, EntryState>) -> CacheResult<()> {
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(path = ?parent, error = %e, "Could not create parent directory");
            }
        }

        loop {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.file_path)?;

            let length = file.metadata()?.len();
            let header = self.read_header(&mut file, length)?;

            if let Some(header) = header {
                let total_size = u64::from(header.total_size);
                let written = length - PAYLOAD_OFFSET;

                if written > total_size {
                    warn!(
                        uri = %self.uri,
                        written,
                        total_size,
                        "Cache file holds more than the resource size, discarding it"
                    );
                    file.set_len(0)?;
                    continue;
                }

                debug!(uri = %self.uri, written, total_size, "Found already cached file");
                state.file = Some(file);
                state.written = written;
                state.total_size = total_size;
                self.publish(state);
                return Ok(());
            }

            debug!(uri = %self.uri, "Entry is new, no data is previously cached");
            file.set_len(0)?;
            state.file = Some(file);
            state.written = 0;
            state.total_size = 0;
            self.publish(state);

            let downloader = self.start_downloader(state);
            state.negotiating = Some(downloader);
            return Ok(());
        }
    }

    fn read_header(&self, file: &mut File, length: u64) -> CacheResult<Option<EntryHeader>> {
        if length < PAYLOAD_OFFSET {
            return Ok(None);
        }

        let mut buf = [0u8; HEADER_LEN];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;

        let header = EntryHeader::from_bytes(&buf);
        if header.checksum != self.checksum {
            warn!(uri = %self.uri, path = ?self.file_path, "Checksum mismatch in cache file header");
            return Ok(None);
        }

        Ok(Some(header))
    }

    fn finish_negotiation(
        &self,
        state: &mut MutexGuard<'_, EntryState>,
        pending: &Arc<Downloader>,
        outcome: CacheResult<u64>,
    ) -> CacheResult<()> {
        let current = state.is_negotiating(pending);

        let total_size = match outcome {
            Ok(total_size) => total_size,
            Err(e) => {
                if current {
                    warn!(uri = %self.uri, error = %e, "Could not negotiate the resource size");
                    self.reset(state);
                }
                return Err(e);
            }
        };

        if !current {
            return Ok(());
        }

        state.negotiating = None;
        if let Err(e) = self.write_header(state, total_size) {
            self.reset(state);
            return Err(e);
        }

        state.total_size = total_size;
        self.publish(state);
        info!(uri = %self.uri, total_size, "Initialized cache entry");

        Ok(())
    }

    fn write_header(&self, state: &mut EntryState, total_size: u64) -> CacheResult<()> {
        let file = state.file.as_mut().ok_or_else(|| {
            CacheError::Interrupted("cache entry was reset during initialization".to_string())
        })?;

        let header = EntryHeader {
            checksum: self.checksum,
            total_size: u32::try_from(total_size).map_err(|_| CacheError::TooLarge(total_size))?,
        };

        let mut region = [0u8; PAYLOAD_OFFSET as usize];
        region[..HEADER_LEN].copy_from_slice(&header.to_bytes());

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&region)?;
        Ok(())
    }

    /// Wait until at least `required` payload bytes are on disk.
    fn expect_cached(&self, state: &mut MutexGuard<'_, EntryState>, required: u64) -> CacheResult<()> {
        while state.written < required {
            if state.file.is_none() || state.negotiating.is_some() {
                return Err(CacheError::Interrupted(
                    "cache entry was reset while waiting for data".to_string(),
                ));
            }

            if state.downloader.is_none() && !state.fully_cached() {
                debug!(uri = %self.uri, written = state.written, "Caching will start");
                self.resume_caching(state)?;
            }

            self.written_updated
                .wait_for(state, self.context.poll_interval);
        }

        Ok(())
    }

    /// Make sure a downloader is running and return the size it negotiated.
    ///
    /// The check and the creation happen under the entry lock, so concurrent
    /// callers end up sharing one downloader.
    fn resume_caching(&self, state: &mut MutexGuard<'_, EntryState>) -> CacheResult<u64> {
        let downloader = match state.downloader.clone() {
            Some(downloader) => downloader,
            None => self.start_downloader(state),
        };

        let total_size = MutexGuard::unlocked(state, || downloader.wait_for_size())?;

        if state.file.is_some() && state.total_size > 0 && total_size != state.total_size {
            warn!(
                uri = %self.uri,
                expected = state.total_size,
                actual = total_size,
                "Resource size changed upstream, discarding cached data"
            );

            let expected = state.total_size;
            if let Some(file) = state.file.as_mut() {
                file.set_len(0)?;
            }
            self.reset(state);
            self.written_updated.notify_all();

            return Err(CacheError::ResourceChanged {
                expected,
                actual: total_size,
            });
        }

        Ok(total_size)
    }

    fn start_downloader(&self, state: &mut EntryState) -> Arc<Downloader> {
        let downloader = Downloader::new(self.me.clone(), state.written);
        state.downloader = Some(downloader.clone());

        debug!(uri = %self.uri, offset = downloader.from_offset(), "Starting downloader");
        downloader.spawn(&self.context.runtime, self.context.fetcher.clone());
        downloader
    }

    fn reset(&self, state: &mut EntryState) {
        debug!(uri = %self.uri, "Resetting entry");
        *state = EntryState::default();
        self.publish(state);
    }

    fn publish(&self, state: &EntryState) {
        self.written_hint.store(state.written, Ordering::Release);
        self.total_hint.store(state.total_size, Ordering::Release);
    }

    /// Mark the file as recently used for the eviction sweep.
    fn touch(&self) {
        if !self.file_path.exists() {
            return;
        }

        let result = OpenOptions::new()
            .write(true)
            .open(&self.file_path)
            .and_then(|file| file.set_modified(SystemTime::now()));

        if let Err(e) = result {
            warn!(path = ?self.file_path, error = %e, "Could not update timestamp");
        }
    }
}

impl Entry for CacheEntry {
    fn total_size(&self) -> CacheResult<u64> {
        let mut state = self.state.lock();
        self.ensure_initialized(&mut state)?;
        Ok(state.total_size)
    }

    fn fraction_cached(&self) -> f32 {
        let total_size = self.total_hint.load(Ordering::Acquire);
        if total_size == 0 {
            return -1.0;
        }

        let written = self.written_hint.load(Ordering::Acquire);
        (written as f64 / total_size as f64) as f32
    }

    fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_stream(&self, offset: u64) -> CacheResult<EntryStream> {
        let entry = self
            .me
            .upgrade()
            .ok_or_else(|| CacheError::Interrupted("cache entry was dropped".to_string()))?;

        self.touch();
        self.increment_ref_count();
        Ok(EntryStream::cached(entry, offset))
    }

    fn close(&self) {
        self.decrement_ref_count();
    }

    fn acquire(&self) {
        self.increment_ref_count();
    }

    fn is_downloading(&self) -> bool {
        self.state.lock().downloader.is_some()
    }

    fn is_in_use(&self) -> bool {
        self.ref_count() > 0
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CacheEntry");
        match self.state.try_lock() {
            Some(state) => debug
                .field("written", &state.written)
                .field("total_size", &state.total_size)
                .field("caching", &state.downloader.is_some())
                .field("fully_cached", &(state.file.is_some() && state.fully_cached())),
            None => debug
                .field("written", &self.written_hint.load(Ordering::Relaxed))
                .field("total_size", &self.total_hint.load(Ordering::Relaxed)),
        };
        debug
            .field("ref_count", &self.ref_count())
            .field("uri", &self.uri)
            .finish()
    }
}

/// Read until `buf` is full or the file ends.
fn read_fully(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(count) => total += count,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_util::{Behavior, ScriptedFetcher, payload, test_runtime};
    use crate::cache::types::filename_for;
    use tokio::runtime::Runtime;

    const URI: &str = "https://media.example.com/videos/entry.mp4";

    fn cache_entry(dir: &Path, content: &[u8], runtime: &Runtime) -> Arc<CacheEntry> {
        let context = Arc::new(EntryContext {
            runtime: runtime.handle().clone(),
            fetcher: Arc::new(ScriptedFetcher::new(content.to_vec(), Behavior::Partial)),
            poll_interval: Duration::from_millis(10),
        });
        CacheEntry::new(URI, dir.join(filename_for(URI)), context)
    }

    fn seed(entry: &CacheEntry, content: &[u8]) {
        let name = entry.file_path.file_name().unwrap().to_string_lossy();
        let header = EntryHeader {
            checksum: filename_checksum(&name),
            total_size: content.len() as u32,
        };
        let mut data = header.to_bytes().to_vec();
        data.resize(PAYLOAD_OFFSET as usize, 0);
        data.extend_from_slice(content);
        fs::write(&entry.file_path, data).unwrap();
    }

    fn read_to_end(entry: &CacheEntry, offset: u64) -> Vec<u8> {
        let mut stream = entry.open_stream(offset).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_last_close_releases_file() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let content = payload(100);
        let entry = cache_entry(dir.path(), &content, &runtime);
        seed(&entry, &content);

        entry.acquire();
        let mut first = entry.open_stream(0).unwrap();
        let mut second = entry.open_stream(10).unwrap();
        assert_eq!(entry.ref_count(), 3);

        let mut buf = Vec::new();
        first.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, content);
        assert!(entry.is_open());

        first.close();
        entry.close();
        let mut byte = [0u8; 1];
        second.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], content[10]);
        assert!(entry.is_open());

        drop(second);
        assert_eq!(entry.ref_count(), 0);
        assert!(!entry.is_open());
    }

    #[test]
    fn test_closed_stream_does_not_reopen_file() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let content = payload(100);
        let entry = cache_entry(dir.path(), &content, &runtime);
        seed(&entry, &content);

        let mut stream = entry.open_stream(0).unwrap();
        assert_eq!(entry.total_size().unwrap(), 100);
        assert!(entry.is_open());

        stream.close();
        assert_eq!(entry.ref_count(), 0);
        assert!(!entry.is_open());

        assert!(matches!(stream.skip(5), Err(CacheError::Interrupted(_))));
        assert!(stream.seek(SeekFrom::End(-1)).is_err());
        assert_eq!(entry.ref_count(), 0);
        assert!(!entry.is_open());
    }

    #[test]
    fn test_ref_count_never_goes_negative() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let content = payload(300);
        let entry = cache_entry(dir.path(), &content, &runtime);
        seed(&entry, &content);

        assert_eq!(entry.ref_count(), 0);
        entry.decrement_ref_count();
        entry.decrement_ref_count();
        assert_eq!(entry.ref_count(), 0);
        assert!(!entry.is_in_use());

        entry.acquire();
        assert_eq!(entry.ref_count(), 1);
        assert_eq!(read_to_end(&entry, 0), content);
        assert!(entry.is_open());

        entry.close();
        assert_eq!(entry.ref_count(), 0);
        assert!(!entry.is_open());
    }
}
