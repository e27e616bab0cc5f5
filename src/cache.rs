//! The consumer's fragment cache: a small LRU of decoded index fragments
//! plus a pending-fetch table guaranteeing at most one in-flight range
//! request per fragment.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use anyhow::Result;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ComtilesError;
use crate::fetch::{ByteRange, RangeReader};
use crate::geometry::FragmentRange;

/// Number of fragments the LRU keeps around.
const FRAGMENT_CACHE_ENTRIES: usize = 28;

type SharedFetch = Shared<BoxFuture<'static, Result<Bytes, Arc<anyhow::Error>>>>;

/// One in-flight fragment fetch and the callers waiting on it.
struct PendingFetch {
    fetch: SharedFetch,
    waiters: usize,
    abort: CancellationToken,
}

pub(crate) struct FragmentCache<S> {
    source: Arc<S>,
    fragments: Mutex<LruCache<u64, Bytes>>,
    pending: Mutex<HashMap<u64, PendingFetch, RandomState>>,
}

impl<S: RangeReader> FragmentCache<S> {
    pub(crate) fn new(source: Arc<S>) -> Self {
        Self {
            source,
            fragments: Mutex::new(LruCache::new(
                NonZeroUsize::new(FRAGMENT_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            )),
            pending: Mutex::new(HashMap::default()),
        }
    }

    /// Returns the bytes of the fragment, fetching them at most once no
    /// matter how many callers ask concurrently.
    ///
    /// Cancellation drops this caller; the underlying request is aborted
    /// only when no other waiter remains registered.
    pub(crate) async fn fragment(
        &self,
        range: &FragmentRange,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let key = range.start;
        if let Some(bytes) = self
            .fragments
            .lock()
            .expect("fragment cache poisoned")
            .get(&key)
        {
            trace!(fragment = range.fragment_index, "fragment cache hit");
            return Ok(bytes.clone());
        }

        let fetch = self.register_waiter(range);
        let result = tokio::select! {
            result = fetch => result,
            () = cancel.cancelled() => {
                self.unregister_waiter(key);
                return Err(ComtilesError::Cancelled.into());
            }
        };

        // settled: clear the pending entry for whoever gets here first
        self.pending
            .lock()
            .expect("pending fetch table poisoned")
            .remove(&key);

        match result {
            Ok(bytes) => {
                self.fragments
                    .lock()
                    .expect("fragment cache poisoned")
                    .put(key, bytes.clone());
                Ok(bytes)
            }
            Err(err) => Err(anyhow::anyhow!("fragment fetch failed: {err:#}")),
        }
    }

    fn register_waiter(&self, range: &FragmentRange) -> SharedFetch {
        let key = range.start;
        let mut pending = self
            .pending
            .lock()
            .expect("pending fetch table poisoned");
        if let Some(entry) = pending.get_mut(&key) {
            entry.waiters += 1;
            trace!(fragment = range.fragment_index, waiters = entry.waiters, "joining in-flight fragment fetch");
            return entry.fetch.clone();
        }

        let abort = CancellationToken::new();
        let fetch_abort = abort.clone();
        let source = Arc::clone(&self.source);
        let byte_range = ByteRange {
            start: range.start,
            end: range.end,
        };
        let fetch: SharedFetch = async move {
            let bytes = source
                .read_range(byte_range, &fetch_abort)
                .await
                .map_err(Arc::new)?;
            if bytes.len() as u64 != byte_range.len() {
                return Err(Arc::new(
                    ComtilesError::ShortRead {
                        expected: byte_range.len(),
                        got: bytes.len() as u64,
                    }
                    .into(),
                ));
            }
            Ok(bytes)
        }
        .boxed()
        .shared();

        pending.insert(
            key,
            PendingFetch {
                fetch: fetch.clone(),
                waiters: 1,
                abort,
            },
        );
        fetch
    }

    fn unregister_waiter(&self, key: u64) {
        let mut pending = self
            .pending
            .lock()
            .expect("pending fetch table poisoned");
        if let Some(entry) = pending.get_mut(&key) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entry.abort.cancel();
                pending.remove(&key);
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending fetch table poisoned").len()
    }
}
