//! # Downloader
//!
//! A background task bound to one [`CacheEntry`]. It performs a single
//! ranged request, publishes the negotiated size through a one-shot
//! [`SizeFuture`] and streams the body into the entry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use futures::StreamExt;
use parking_lot::{Condvar, Mutex};
use reqwest::StatusCode;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument};

use crate::cache::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::fetcher::{RangeFetcher, RangeResponse};

/// Single-assignment cell for the negotiated total size. The first
/// resolution wins, every waiter observes the same outcome.
pub(crate) struct SizeFuture {
    slot: Mutex<Option<CacheResult<u64>>>,
    ready: Condvar,
}

impl SizeFuture {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Returns false if the future was already resolved.
    pub(crate) fn resolve(&self, result: CacheResult<u64>) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }

        *slot = Some(result);
        self.ready.notify_all();
        true
    }

    /// Blocks until the future is resolved.
    pub(crate) fn wait(&self) -> CacheResult<u64> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// How a transfer ended without error
enum Outcome {
    Finished(u64),
    Canceled(u64),
}

pub(crate) struct Downloader {
    entry: Weak<CacheEntry>,
    from_offset: u64,
    size: SizeFuture,
    negotiated_size: AtomicU64,
    /// Set when the server answered a ranged request with the full body.
    restart_from_zero: AtomicBool,
}

impl Downloader {
    pub(crate) fn new(entry: Weak<CacheEntry>, from_offset: u64) -> Arc<Self> {
        Arc::new(Self {
            entry,
            from_offset,
            size: SizeFuture::new(),
            negotiated_size: AtomicU64::new(0),
            restart_from_zero: AtomicBool::new(false),
        })
    }

    pub(crate) fn from_offset(&self) -> u64 {
        self.from_offset
    }

    /// Total size reported by the server, 0 before negotiation.
    pub(crate) fn negotiated_size(&self) -> u64 {
        self.negotiated_size.load(Ordering::Acquire)
    }

    /// Blocks until the size is negotiated or negotiation failed.
    pub(crate) fn wait_for_size(&self) -> CacheResult<u64> {
        self.size.wait()
    }

    /// Returns true exactly once if the body restarts at byte 0.
    pub(crate) fn take_restart(&self) -> bool {
        self.restart_from_zero.swap(false, Ordering::AcqRel)
    }

    /// Launch the transfer on the runtime. If the task is dropped before it
    /// negotiated (runtime shutdown), waiters receive an interrupted error.
    pub(crate) fn spawn(self: &Arc<Self>, runtime: &Handle, fetcher: Arc<dyn RangeFetcher>) {
        let guard = NegotiationGuard(self.clone());
        let downloader = self.clone();
        runtime.spawn(async move {
            let _guard = guard;
            downloader.run(fetcher).await;
        });
    }

    async fn run(self: Arc<Self>, fetcher: Arc<dyn RangeFetcher>) {
        let Some(entry) = self.entry.upgrade() else {
            self.size.resolve(Err(CacheError::Interrupted(
                "cache entry was dropped".to_string(),
            )));
            return;
        };

        // keeps the file handle open even if every reader goes away
        entry.increment_ref_count();

        let started = Instant::now();
        match self.transfer(&entry, fetcher.as_ref()).await {
            Ok(Outcome::Finished(bytes)) => {
                info!(
                    uri = %entry.uri(),
                    offset = self.from_offset,
                    bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Caching finished"
                );
            }
            Ok(Outcome::Canceled(bytes)) => {
                info!(uri = %entry.uri(), bytes, "Caching canceled, stopping now");
            }
            Err(e) => {
                error!(uri = %entry.uri(), offset = self.from_offset, error = %e, "Error in caching task");
                self.size.resolve(Err(e));
            }
        }

        entry.caching_stopped(&self);
        entry.decrement_ref_count();
    }

    #[instrument(skip_all, fields(uri = %entry.uri(), offset = self.from_offset), level = "debug")]
    async fn transfer(
        self: &Arc<Self>,
        entry: &Arc<CacheEntry>,
        fetcher: &dyn RangeFetcher,
    ) -> CacheResult<Outcome> {
        debug!("Resume caching");
        let response = fetcher.fetch_from(entry.uri(), self.from_offset).await?;

        let total_size = self.negotiate(&response)?;
        self.negotiated_size.store(total_size, Ordering::Release);
        self.size.resolve(Ok(total_size));

        let mut body = response.body;
        let mut transferred = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            if chunk.is_empty() {
                continue;
            }

            if !entry.write_chunk(self, &chunk)? {
                return Ok(Outcome::Canceled(transferred));
            }
            transferred += chunk.len() as u64;
        }

        Ok(Outcome::Finished(transferred))
    }

    /// Derive the total size of the resource from the response head.
    fn negotiate(&self, response: &RangeResponse) -> CacheResult<u64> {
        let total_size = match response.status {
            StatusCode::OK => {
                let length = response
                    .content_length
                    .ok_or(CacheError::MissingContentLength)?;
                if self.from_offset > 0 {
                    debug!(offset = self.from_offset, "Server ignored the range, restarting at 0");
                    self.restart_from_zero.store(true, Ordering::Release);
                }
                length
            }
            StatusCode::PARTIAL_CONTENT => {
                let length = response
                    .content_length
                    .ok_or(CacheError::MissingContentLength)?;
                response
                    .content_range_total
                    .unwrap_or(self.from_offset + length)
            }
            status => return Err(CacheError::Status(status)),
        };

        if total_size > u64::from(u32::MAX) {
            return Err(CacheError::TooLarge(total_size));
        }

        Ok(total_size)
    }
}

struct NegotiationGuard(Arc<Downloader>);

impl Drop for NegotiationGuard {
    fn drop(&mut self) {
        self.0.size.resolve(Err(CacheError::Interrupted(
            "download task ended before the size was known".to_string(),
        )));
    }
}
