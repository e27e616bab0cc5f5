//! Ranged access to the object store holding an archive.
//!
//! The reader only ever issues bounded range reads, so the store is a
//! single-method trait: HTTP in production, in-memory buffers in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header::RANGE, Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ComtilesError;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

/// A half-open byte range `[start, end)` within the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Builds the range covering `len` bytes from `start`.
    #[must_use]
    pub const fn with_length(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    /// Number of bytes covered.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The inclusive `bytes=a-b` value for an HTTP `Range` header.
    #[must_use]
    pub fn http_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end - 1)
    }
}

/// A range-capable object store holding one archive.
///
/// Implementations return the bytes the store produced for the range; a
/// range reaching past the end of the archive yields the available prefix,
/// and callers that need the exact length check it themselves.
#[async_trait]
pub trait RangeReader: Send + Sync + 'static {
    /// Reads one byte range, aborting when `cancel` fires.
    ///
    /// # Errors
    /// Will return [`ComtilesError::Cancelled`] on cancellation, or the
    /// store's own error when the read fails.
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes>;
}

/// [`RangeReader`] over HTTP, issuing `Range: bytes=a-b` GETs.
#[derive(Debug, Clone)]
pub struct HttpRangeReader {
    client: Client,
    url: String,
}

impl HttpRangeReader {
    /// Builds a reader for the archive at `url`.
    ///
    /// # Errors
    /// Will return an error if the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// The archive URL this reader points at.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, range: ByteRange) -> Result<Bytes> {
        let header = range.http_header_value();
        debug!(url = %self.url, range = %header, "range request");

        let response = self
            .client
            .get(&self.url)
            .header(RANGE, header)
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(response.bytes().await?),
            StatusCode::OK => {
                // server ignored the range and sent the whole archive
                warn!(url = %self.url, "server returned full content (200), range requests not supported");
                let body = response.bytes().await?;
                let start = usize::try_from(range.start)?;
                if start >= body.len() {
                    return Err(ComtilesError::ShortRead {
                        expected: range.len(),
                        got: 0,
                    }
                    .into());
                }
                let end = usize::try_from(range.end)?.min(body.len());
                Ok(body.slice(start..end))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(ComtilesError::ShortRead {
                expected: range.len(),
                got: 0,
            }
            .into()),
            status => Err(anyhow::anyhow!(
                "range request for {} failed with status {status}",
                self.url
            )),
        }
    }
}

#[async_trait]
impl RangeReader for HttpRangeReader {
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
        tokio::select! {
            bytes = self.fetch(range) => bytes,
            () = cancel.cancelled() => Err(ComtilesError::Cancelled.into()),
        }
    }
}

/// [`RangeReader`] over an in-memory buffer, with request accounting so
/// tests can assert how many fetches a code path issued.
#[derive(Debug)]
pub struct MemoryRangeReader {
    bytes: Bytes,
    requests: Mutex<Vec<ByteRange>>,
    request_count: AtomicUsize,
}

impl MemoryRangeReader {
    /// Wraps an archive already in memory.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            requests: Mutex::new(Vec::new()),
            request_count: AtomicUsize::new(0),
        }
    }

    /// Number of range reads issued so far.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Every range requested so far, in arrival order.
    ///
    /// # Panics
    /// Panics if the internal log mutex is poisoned.
    #[must_use]
    pub fn requests(&self) -> Vec<ByteRange> {
        self.requests.lock().expect("request log poisoned").clone()
    }
}

#[async_trait]
impl RangeReader for MemoryRangeReader {
    async fn read_range(&self, range: ByteRange, cancel: &CancellationToken) -> Result<Bytes> {
        if cancel.is_cancelled() {
            return Err(ComtilesError::Cancelled.into());
        }
        self.request_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.requests.lock() {
            log.push(range);
        }

        let start = usize::try_from(range.start)?;
        if start >= self.bytes.len() {
            return Err(ComtilesError::ShortRead {
                expected: range.len(),
                got: 0,
            }
            .into());
        }
        let end = usize::try_from(range.end)?.min(self.bytes.len());
        Ok(self.bytes.slice(start..end))
    }
}
