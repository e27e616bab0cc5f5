//! Coalesces tile data reads arriving close together into merged range
//! requests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ComtilesError;
use crate::fetch::{ByteRange, RangeReader};

/// Neighbouring requests further apart than this are not merged; fetching
/// the gap would cost more than the extra round trip.
const MAX_MERGE_GAP: u64 = 8 * 1024;

/// Upper bound on one merged request's total span.
const MAX_MERGE_SPAN: u64 = 1024 * 1024;

struct BatchEntry {
    range: ByteRange,
    reply: oneshot::Sender<Result<Bytes, Arc<anyhow::Error>>>,
    cancel: CancellationToken,
}

/// Collects data reads for one throttle window, merges close ranges into
/// single requests, and hands every caller its slice of the result.
///
/// The first request of a window starts the flush timer, so no caller
/// waits longer than the window plus one fetch. Cancelling one caller
/// drops only that caller; the merged fetch is abandoned only once every
/// caller of its group has cancelled.
pub struct BatchDispatcher<S> {
    source: Arc<S>,
    throttle: Duration,
    queue: Arc<Mutex<Vec<BatchEntry>>>,
}

impl<S: RangeReader> BatchDispatcher<S> {
    pub(crate) fn new(source: Arc<S>, throttle: Duration) -> Self {
        Self {
            source,
            throttle,
            queue: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues one data read and waits for its bytes.
    ///
    /// # Errors
    /// Will return [`ComtilesError::Cancelled`] when `cancel` fires before
    /// the merged fetch resolves, or the store's error when it fails.
    pub async fn submit(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
        let (reply, response) = oneshot::channel();
        let opens_window = {
            let mut queue = self.queue.lock().expect("batch queue poisoned");
            queue.push(BatchEntry {
                range,
                reply,
                cancel: cancel.clone(),
            });
            queue.len() == 1
        };
        if opens_window {
            let queue = Arc::clone(&self.queue);
            let source = Arc::clone(&self.source);
            let throttle = self.throttle;
            tokio::spawn(async move {
                tokio::time::sleep(throttle).await;
                let entries: Vec<BatchEntry> = {
                    let mut queue = queue.lock().expect("batch queue poisoned");
                    queue.drain(..).collect()
                };
                flush(source, entries).await;
            });
        }

        tokio::select! {
            outcome = response => match outcome {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(err)) => Err(anyhow::anyhow!("batched fetch failed: {err:#}")),
                // the dispatcher dropped this entry, which only happens
                // once its token fired
                Err(_) => Err(ComtilesError::Cancelled.into()),
            },
            () = cancel.cancelled() => Err(ComtilesError::Cancelled.into()),
        }
    }
}

async fn flush<S: RangeReader>(source: Arc<S>, mut entries: Vec<BatchEntry>) {
    entries.retain(|entry| !entry.cancel.is_cancelled());
    if entries.is_empty() {
        return;
    }
    entries.sort_by_key(|entry| entry.range.start);

    let mut groups: Vec<(ByteRange, Vec<BatchEntry>)> = Vec::new();
    for entry in entries {
        if let Some((merged, group)) = groups.last_mut() {
            let gap_ok = entry.range.start <= merged.end + MAX_MERGE_GAP;
            let span_ok = entry.range.end.max(merged.end) - merged.start <= MAX_MERGE_SPAN;
            if gap_ok && span_ok {
                merged.end = merged.end.max(entry.range.end);
                group.push(entry);
                continue;
            }
        }
        groups.push((entry.range, vec![entry]));
    }
    trace!(groups = groups.len(), "flushing batch window");

    join_all(
        groups
            .into_iter()
            .map(|(merged, group)| fetch_group(Arc::clone(&source), merged, group)),
    )
    .await;
}

async fn fetch_group<S: RangeReader>(source: Arc<S>, merged: ByteRange, group: Vec<BatchEntry>) {
    let all_cancelled = join_all(group.iter().map(|entry| entry.cancel.cancelled()));
    let merge_cancel = CancellationToken::new();
    let result = tokio::select! {
        result = source.read_range(merged, &merge_cancel) => result,
        _ = all_cancelled => {
            trace!(?merged, "every caller cancelled, dropping merged fetch");
            return;
        }
    };

    match result {
        Ok(bytes) => {
            for entry in group {
                let start = usize::try_from(entry.range.start - merged.start).unwrap_or(usize::MAX);
                let end = usize::try_from(entry.range.end - merged.start).unwrap_or(usize::MAX);
                let reply = if end <= bytes.len() {
                    Ok(bytes.slice(start..end))
                } else {
                    Err(Arc::new(
                        ComtilesError::ShortRead {
                            expected: entry.range.len(),
                            got: bytes.len().saturating_sub(start) as u64,
                        }
                        .into(),
                    ))
                };
                let _ = entry.reply.send(reply);
            }
        }
        Err(err) => {
            let shared = Arc::new(err);
            for entry in group {
                let _ = entry.reply.send(Err(Arc::clone(&shared)));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fetch::MemoryRangeReader;
    use async_trait::async_trait;

    fn archive_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn dispatcher(len: usize, throttle_ms: u64) -> (Arc<MemoryRangeReader>, BatchDispatcher<MemoryRangeReader>) {
        let source = Arc::new(MemoryRangeReader::new(archive_bytes(len)));
        let batch = BatchDispatcher::new(Arc::clone(&source), Duration::from_millis(throttle_ms));
        (source, batch)
    }

    #[tokio::test]
    async fn test_close_ranges_merge_into_one_request() -> Result<()> {
        let (source, batch) = dispatcher(2048, 20);
        let batch = Arc::new(batch);

        let first = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                batch
                    .submit(ByteRange { start: 1000, end: 1051 }, &CancellationToken::new())
                    .await
            })
        };
        let second = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                batch
                    .submit(ByteRange { start: 1100, end: 1181 }, &CancellationToken::new())
                    .await
            })
        };

        let bytes_a = first.await??;
        let bytes_b = second.await??;
        assert_eq!(bytes_a.len(), 51);
        assert_eq!(bytes_b.len(), 81);
        // each caller got the right slice of the merged buffer
        assert_eq!(&bytes_a[..], &archive_bytes(2048)[1000..1051]);
        assert_eq!(&bytes_b[..], &archive_bytes(2048)[1100..1181]);

        let requests = source.requests();
        assert_eq!(requests, vec![ByteRange { start: 1000, end: 1181 }]);
        assert_eq!(
            ByteRange { start: 1000, end: 1181 }.http_header_value(),
            "bytes=1000-1180"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_distant_ranges_stay_separate() -> Result<()> {
        let (source, batch) = dispatcher(64 * 1024, 20);
        let batch = Arc::new(batch);

        let first = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                batch
                    .submit(ByteRange { start: 1000, end: 1051 }, &CancellationToken::new())
                    .await
            })
        };
        let second = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                batch
                    .submit(ByteRange { start: 50_000, end: 50_101 }, &CancellationToken::new())
                    .await
            })
        };

        first.await??;
        second.await??;
        assert_eq!(
            source.requests(),
            vec![
                ByteRange { start: 1000, end: 1051 },
                ByteRange { start: 50_000, end: 50_101 },
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_sequential_windows_fetch_separately() -> Result<()> {
        let (source, batch) = dispatcher(4096, 1);

        batch
            .submit(ByteRange { start: 0, end: 16 }, &CancellationToken::new())
            .await?;
        batch
            .submit(ByteRange { start: 16, end: 32 }, &CancellationToken::new())
            .await?;
        assert_eq!(source.request_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelling_one_caller_keeps_the_batch() -> Result<()> {
        let (source, batch) = dispatcher(4096, 30);
        let batch = Arc::new(batch);

        let doomed_token = CancellationToken::new();
        let doomed = {
            let batch = Arc::clone(&batch);
            let cancel = doomed_token.clone();
            tokio::spawn(async move {
                batch.submit(ByteRange { start: 0, end: 64 }, &cancel).await
            })
        };
        let survivor = {
            let batch = Arc::clone(&batch);
            tokio::spawn(async move {
                batch
                    .submit(ByteRange { start: 100, end: 164 }, &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        doomed_token.cancel();

        let err = doomed.await?.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ComtilesError>(),
            Some(ComtilesError::Cancelled)
        ));
        let bytes = survivor.await??;
        assert_eq!(&bytes[..], &archive_bytes(4096)[100..164]);
        assert_eq!(source.request_count(), 1);
        // the cancelled caller's range was dropped before dispatch
        assert_eq!(source.requests(), vec![ByteRange { start: 100, end: 164 }]);
        Ok(())
    }

    /// Delays every read so a flush can be observed mid-flight.
    struct SlowReader {
        inner: MemoryRangeReader,
        delay: Duration,
    }

    #[async_trait]
    impl RangeReader for SlowReader {
        async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
            tokio::time::sleep(self.delay).await;
            self.inner.read_range(range, cancel).await
        }
    }

    #[tokio::test]
    async fn test_cancelling_every_caller_aborts_merged_fetch() -> Result<()> {
        let source = Arc::new(SlowReader {
            inner: MemoryRangeReader::new(archive_bytes(4096)),
            delay: Duration::from_secs(30),
        });
        let batch = Arc::new(BatchDispatcher::new(
            Arc::clone(&source),
            Duration::from_millis(1),
        ));

        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();
        let task_a = {
            let batch = Arc::clone(&batch);
            let cancel = token_a.clone();
            tokio::spawn(async move {
                batch.submit(ByteRange { start: 0, end: 64 }, &cancel).await
            })
        };
        let task_b = {
            let batch = Arc::clone(&batch);
            let cancel = token_b.clone();
            tokio::spawn(async move {
                batch.submit(ByteRange { start: 64, end: 128 }, &cancel).await
            })
        };

        // let the window close and the merged fetch start
        tokio::time::sleep(Duration::from_millis(10)).await;
        token_a.cancel();
        token_b.cancel();

        for task in [task_a, task_b] {
            let err = task.await?.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ComtilesError>(),
                Some(ComtilesError::Cancelled)
            ));
        }
        // the store was never reached
        assert_eq!(source.inner.request_count(), 0);
        Ok(())
    }
}
