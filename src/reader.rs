use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::batch::BatchDispatcher;
use crate::cache::FragmentCache;
use crate::codec::{read_u24_le, read_u40_le};
use crate::error::ComtilesError;
use crate::fetch::{ByteRange, HttpRangeReader, RangeReader};
use crate::geometry::IndexGeometry;
use crate::header::{Header, HEADER_BYTES};
use crate::metadata::Metadata;
use crate::util::{gunzip_if_gzip, xyz_to_tms_row, zlib_decompress};

/// Bytes of the archive fetched up front: header, metadata, and the whole
/// pyramid index must fit inside this chunk.
pub const INITIAL_CHUNK_SIZE: u64 = 512 * 1024;

/// Default batching window for [`ArchiveReader::get_tile_batched`].
pub const DEFAULT_THROTTLE_MS: u64 = 15;

/// An XYZ tile address (y-axis origin north). The reader converts to the
/// archive's TMS rows internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileAddress {
    pub zoom: u8,
    pub col: u64,
    pub row: u64,
}

impl TileAddress {
    /// Builds an address from `z/x/y`.
    #[must_use]
    pub const fn new(zoom: u8, col: u64, row: u64) -> Self {
        Self { zoom, col, row }
    }
}

/// A resolved tile: its offset within the data section and payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    /// Byte offset relative to the start of the data section
    pub offset: u64,
    /// Payload size in bytes; 0 marks a missing tile
    pub size: u32,
}

/// Everything the first ranged read of the archive yields: parsed header,
/// validated metadata, the derived geometry, and the decompressed pyramid
/// index, which stays alive for the reader's lifetime.
struct Bootstrap {
    header: Header,
    metadata: Metadata,
    geometry: IndexGeometry,
    pyramid: Bytes,
}

/// Resolves tiles out of a remote COMTiles archive.
///
/// One reader serves any number of concurrent lookups: the bootstrap is
/// shared by the first callers, fragment fetches are deduplicated and
/// cached in a small LRU, and the decompressed pyramid index answers the
/// low zooms without further index reads.
#[allow(clippy::module_name_repetitions)]
pub struct ArchiveReader<S: RangeReader> {
    source: Arc<S>,
    boot: OnceCell<Bootstrap>,
    fragments: FragmentCache<S>,
    batch: BatchDispatcher<S>,
}

impl ArchiveReader<HttpRangeReader> {
    /// Opens the archive at `url` and eagerly fetches the header,
    /// metadata, and pyramid index. `throttle_ms` falls back to
    /// [`DEFAULT_THROTTLE_MS`].
    ///
    /// # Errors
    /// Will return an error if the initial fetch fails or the archive is
    /// invalid.
    pub async fn create(url: &str, throttle_ms: Option<u64>) -> Result<Self> {
        let reader = Self::create_lazy(url, throttle_ms)?;
        reader.bootstrap(&CancellationToken::new()).await?;
        Ok(reader)
    }

    /// Opens the archive at `url` without touching the network; the first
    /// tile request performs the bootstrap.
    ///
    /// # Errors
    /// Will return an error if the HTTP client cannot be constructed.
    pub fn create_lazy(url: &str, throttle_ms: Option<u64>) -> Result<Self> {
        Ok(Self::with_source(
            HttpRangeReader::new(url)?,
            throttle_ms.unwrap_or(DEFAULT_THROTTLE_MS),
        ))
    }
}

impl<S: RangeReader> ArchiveReader<S> {
    /// Builds a lazy reader over any range-capable source.
    #[must_use]
    pub fn with_source(source: S, throttle_ms: u64) -> Self {
        let source = Arc::new(source);
        Self {
            fragments: FragmentCache::new(Arc::clone(&source)),
            batch: BatchDispatcher::new(Arc::clone(&source), Duration::from_millis(throttle_ms)),
            source,
            boot: OnceCell::new(),
        }
    }

    /// The archive's metadata document, bootstrapping if necessary.
    ///
    /// # Errors
    /// Same failure cases as the bootstrap itself.
    pub async fn metadata(&self) -> Result<&Metadata> {
        Ok(&self.bootstrap(&CancellationToken::new()).await?.metadata)
    }

    /// The parsed archive header, bootstrapping if necessary.
    ///
    /// # Errors
    /// Same failure cases as the bootstrap itself.
    pub async fn header(&self) -> Result<&Header> {
        Ok(&self.bootstrap(&CancellationToken::new()).await?.header)
    }

    /// Fetches one tile, issuing its data read immediately.
    ///
    /// Returns [`None`] for addresses outside the tile matrix limits and
    /// for missing tiles (which never trigger a data read).
    ///
    /// # Errors
    /// Will return [`ComtilesError::Cancelled`] when `cancel` fires, or
    /// any store or archive-validation error.
    pub async fn get_tile(
        &self,
        address: TileAddress,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Bytes>> {
        let fallback = CancellationToken::new();
        let cancel = cancel.unwrap_or(&fallback);
        let Some(range) = self.tile_data_range(address, cancel).await? else {
            return Ok(None);
        };
        let bytes = self.source.read_range(range, cancel).await?;
        if bytes.len() as u64 != range.len() {
            return Err(ComtilesError::ShortRead {
                expected: range.len(),
                got: bytes.len() as u64,
            }
            .into());
        }
        Ok(Some(gunzip_if_gzip(bytes)?))
    }

    /// Fetches one tile through the batch dispatcher, so data reads issued
    /// within the throttle window coalesce into merged range requests.
    ///
    /// # Errors
    /// Same failure cases as [`Self::get_tile`].
    pub async fn get_tile_batched(
        &self,
        address: TileAddress,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Bytes>> {
        let fallback = CancellationToken::new();
        let cancel = cancel.unwrap_or(&fallback);
        let Some(range) = self.tile_data_range(address, cancel).await? else {
            return Ok(None);
        };
        let bytes = self.batch.submit(range, cancel).await?;
        Ok(Some(gunzip_if_gzip(bytes)?))
    }

    /// Resolves a tile to its `{offset, size}` index entry without
    /// fetching any payload. [`None`] means the address lies outside the
    /// tile matrix limits; a zero size marks a missing tile.
    ///
    /// # Errors
    /// Will return [`ComtilesError::Cancelled`] when `cancel` fires, or
    /// any store or archive-validation error.
    pub async fn resolve_tile(
        &self,
        address: TileAddress,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<TileEntry>> {
        let fallback = CancellationToken::new();
        let cancel = cancel.unwrap_or(&fallback);
        self.resolve(address, cancel).await
    }

    async fn tile_data_range(
        &self,
        address: TileAddress,
        cancel: &CancellationToken,
    ) -> Result<Option<ByteRange>> {
        let Some(entry) = self.resolve(address, cancel).await? else {
            return Ok(None);
        };
        if entry.size == 0 {
            trace!(?address, "missing tile");
            return Ok(None);
        }
        let boot = self.bootstrap(cancel).await?;
        Ok(Some(ByteRange::with_length(
            boot.header.data_start() + entry.offset,
            u64::from(entry.size),
        )))
    }

    async fn resolve(
        &self,
        address: TileAddress,
        cancel: &CancellationToken,
    ) -> Result<Option<TileEntry>> {
        let boot = self.bootstrap(cancel).await?;
        let TileAddress { zoom, col, row } = address;

        let Some(matrix) = boot.geometry.matrix(zoom) else {
            return Ok(None);
        };
        if zoom >= 64 || row >= 1 << zoom {
            return Ok(None);
        }
        let tms_row = xyz_to_tms_row(zoom, row);
        if !matrix.tile_matrix_limits.contains(col, tms_row) {
            return Ok(None);
        }

        let slot = boot.geometry.index_offset_for_tile(zoom, col, tms_row)?;
        if boot
            .geometry
            .pyramid_max_zoom()
            .is_some_and(|max_zoom| zoom <= max_zoom)
        {
            // pyramid zone: the size sits at the slot, the data offset is
            // the sum of every preceding entry (the pyramid opens the
            // data section at offset 0)
            let size = read_u24_le(&boot.pyramid, usize::try_from(slot.offset)?);
            let mut offset = 0u64;
            for i in 0..usize::try_from(slot.index)? {
                offset += u64::from(read_u24_le(&boot.pyramid, i * 3));
            }
            return Ok(Some(TileEntry { offset, size }));
        }

        let range = boot.geometry.fragment_range_for_tile(
            zoom,
            col,
            tms_row,
            u64::from(boot.header.metadata_length),
            u64::from(boot.header.pyramid_length),
        )?;
        let fragment = self.fragments.fragment(&range, cancel).await?;

        let bounds = boot.geometry.fragment_bounds(zoom, col, tms_row)?;
        let local = usize::try_from(
            (tms_row - bounds.min_tile_row) * bounds.width() + (col - bounds.min_tile_col),
        )?;
        let mut offset = read_u40_le(&fragment, 0);
        for i in 0..local {
            offset += u64::from(read_u24_le(&fragment, 5 + 3 * i));
        }
        let size = read_u24_le(&fragment, 5 + 3 * local);
        Ok(Some(TileEntry { offset, size }))
    }

    async fn bootstrap(&self, cancel: &CancellationToken) -> Result<&Bootstrap> {
        let init = self.boot.get_or_try_init(|| async {
            let chunk = self
                .source
                .read_range(
                    ByteRange {
                        start: 0,
                        end: INITIAL_CHUNK_SIZE,
                    },
                    &CancellationToken::new(),
                )
                .await?;
            let header = Header::parse(&chunk)?;

            let metadata_end = u64::from(HEADER_BYTES) + u64::from(header.metadata_length);
            let pyramid_end = metadata_end + u64::from(header.pyramid_length);
            if pyramid_end > INITIAL_CHUNK_SIZE {
                return Err(ComtilesError::PyramidTruncated {
                    pyramid_end,
                    chunk_size: INITIAL_CHUNK_SIZE,
                }
                .into());
            }
            if (chunk.len() as u64) < pyramid_end {
                return Err(ComtilesError::ShortRead {
                    expected: pyramid_end,
                    got: chunk.len() as u64,
                }
                .into());
            }

            let metadata: Metadata = serde_json::from_slice(
                &chunk[usize::from(HEADER_BYTES)..usize::try_from(metadata_end)?],
            )?;
            metadata.validate_tile_format()?;
            let geometry = IndexGeometry::new(&metadata.tile_matrix_set)?;

            let pyramid = zlib_decompress(
                &chunk[usize::try_from(metadata_end)?..usize::try_from(pyramid_end)?],
            )?;
            let expected = geometry.pyramid_tile_count() * 3;
            if pyramid.len() as u64 != expected {
                return Err(ComtilesError::PyramidLengthMismatch {
                    expected,
                    got: pyramid.len() as u64,
                }
                .into());
            }

            debug!(name = %metadata.name, pyramid_tiles = pyramid.len() / 3, "archive bootstrapped");
            Ok(Bootstrap {
                header,
                metadata,
                geometry,
                pyramid: Bytes::from(pyramid),
            })
        });
        tokio::select! {
            boot = init => boot,
            () = cancel.cancelled() => Err(ComtilesError::Cancelled.into()),
        }
    }
}
