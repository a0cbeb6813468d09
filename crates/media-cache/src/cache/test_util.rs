//! In-memory [`RangeFetcher`] used by the cache tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, stream};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::runtime::Runtime;

use crate::error::{CacheError, CacheResult};
use crate::fetcher::{RangeFetcher, RangeResponse};

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    /// 206 with `Content-Range`
    Partial,
    /// 200 with the whole body, range ignored
    IgnoreRange,
    /// Fixed status without body
    Status(StatusCode),
    /// 200 without a content length
    NoLength,
    /// Like `Partial`, but the first response body ends after n bytes
    DropAfter(usize),
}

pub(crate) struct ScriptedFetcher {
    content: Bytes,
    behavior: Mutex<Behavior>,
    requests: Mutex<Vec<u64>>,
    chunk_size: usize,
    chunk_delay: Duration,
    negotiation_delay: Duration,
}

impl ScriptedFetcher {
    pub(crate) fn new(content: impl Into<Bytes>, behavior: Behavior) -> Self {
        Self {
            content: content.into(),
            behavior: Mutex::new(behavior),
            requests: Mutex::new(Vec::new()),
            chunk_size: 64,
            chunk_delay: Duration::ZERO,
            negotiation_delay: Duration::ZERO,
        }
    }

    pub(crate) fn with_chunks(mut self, size: usize, delay: Duration) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_delay = delay;
        self
    }

    pub(crate) fn with_negotiation_delay(mut self, delay: Duration) -> Self {
        self.negotiation_delay = delay;
        self
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    /// Offsets of all requests so far, in order
    pub(crate) fn requests(&self) -> Vec<u64> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl RangeFetcher for ScriptedFetcher {
    async fn fetch_from(&self, _uri: &str, offset: u64) -> CacheResult<RangeResponse> {
        let index = {
            let mut requests = self.requests.lock();
            requests.push(offset);
            requests.len()
        };

        if !self.negotiation_delay.is_zero() {
            tokio::time::sleep(self.negotiation_delay).await;
        }

        let content = self.content.clone();
        let total = content.len() as u64;
        let behavior = *self.behavior.lock();

        let (status, start, content_length, content_range_total) = match behavior {
            Behavior::Status(status) => {
                return Ok(RangeResponse {
                    status,
                    content_length: Some(0),
                    content_range_total: None,
                    body: stream::empty().boxed(),
                });
            }
            Behavior::IgnoreRange => (StatusCode::OK, 0, Some(total), None),
            Behavior::NoLength => (StatusCode::OK, 0, None, None),
            Behavior::Partial | Behavior::DropAfter(_) => {
                let start = offset.min(total);
                (StatusCode::PARTIAL_CONTENT, start, Some(total - start), Some(total))
            }
        };

        let mut body = content.slice(start as usize..);
        if let Behavior::DropAfter(n) = behavior {
            if index == 1 {
                body.truncate(n);
            }
        }

        let chunk_size = self.chunk_size;
        let chunks: Vec<Bytes> = (0..body.len())
            .step_by(chunk_size)
            .map(|at| body.slice(at..(at + chunk_size).min(body.len())))
            .collect();

        let delay = self.chunk_delay;
        let body = stream::iter(chunks)
            .then(move |chunk| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<_, CacheError>(chunk)
            })
            .boxed();

        Ok(RangeResponse {
            status,
            content_length,
            content_range_total,
            body,
        })
    }
}

/// Deterministic test payload
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub(crate) fn test_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}
