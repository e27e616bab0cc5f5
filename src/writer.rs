use std::io::SeekFrom;

use anyhow::Result;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::codec;
use crate::error::ComtilesError;
use crate::geometry::{IndexGeometry, IndexSlot};
use crate::header::Header;
use crate::metadata::Metadata;
use crate::provider::{TileProvider, TileRecord};
use crate::util::zlib_compress;

/// Largest encodable tile payload; sizes also have to fit the future
/// 20-bit packed index layout.
pub const MAX_TILE_SIZE: u32 = (1 << 20) - 1;

/// Largest encodable absolute data offset (40 bits).
pub const MAX_DATA_OFFSET: u64 = (1 << 40) - 1;

/// What a completed write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSummary {
    /// Tiles with a payload (missing tiles excluded)
    pub tiles_written: u64,
    /// Index slots padded with a zero entry
    pub tiles_missing: u64,
    /// Compressed pyramid index length
    pub pyramid_length: u32,
    /// Fragment index length
    pub fragments_length: u64,
    /// Total data section length
    pub data_length: u64,
}

/// Streams a COMTiles archive from a [`TileProvider`].
///
/// The writer makes one pass over the provider's size records to lay out
/// the two-part index, then one pass over the payloads for the data
/// section, and finally back-patches the section lengths into the header.
#[allow(clippy::module_name_repetitions)]
pub struct ArchiveWriter {
    metadata: Metadata,
    geometry: IndexGeometry,
}

impl ArchiveWriter {
    /// Builds a writer for the given metadata document.
    ///
    /// # Errors
    /// Will return an error if the tile matrix set is invalid or asks for
    /// an unsupported CRS or ordering.
    pub fn new(metadata: Metadata) -> Result<Self> {
        let geometry = IndexGeometry::new(&metadata.tile_matrix_set)?;
        Ok(Self { metadata, geometry })
    }

    /// The index geometry derived from the metadata.
    #[must_use]
    pub const fn geometry(&self) -> &IndexGeometry {
        &self.geometry
    }

    /// Writes the whole archive to `output`.
    ///
    /// # Errors
    /// Will return [`ComtilesError::TileTooLarge`],
    /// [`ComtilesError::OffsetOverflow`], a provider-contract error for
    /// out-of-order or out-of-bounds records, or any I/O error from the
    /// sink. Errors abort the write; no partial-write recovery is
    /// attempted.
    pub async fn write<P, W>(&self, provider: &mut P, output: &mut W) -> Result<WriteSummary>
    where
        P: TileProvider,
        W: AsyncWrite + AsyncSeek + Send + Unpin,
    {
        let metadata_bytes = serde_json::to_vec(&self.metadata)?;
        let mut header = Header::placeholder(u32::try_from(metadata_bytes.len())?);
        output.write_all(&header.to_vec()?).await?;
        output.write_all(&metadata_bytes).await?;
        trace!(
            metadata_bytes = metadata_bytes.len(),
            "wrote header placeholder and metadata"
        );

        let mut records = provider.tile_records()?;
        let mut pending = next_record(&mut records, &self.geometry)?;
        let mut data_offset = 0u64;
        let mut tiles_written = 0u64;

        // pyramid: every size entry lands at its slot in one buffer,
        // which then gets zlib-compressed as a whole
        let pyramid_max = self.geometry.pyramid_max_zoom();
        let mut pyramid = vec![0u8; usize::try_from(self.geometry.pyramid_tile_count() * 3)?];
        let mut last_index: Option<u64> = None;
        while let Some((record, slot)) = pending {
            let Some(max_zoom) = pyramid_max else { break };
            if record.zoom > max_zoom {
                break;
            }
            if last_index.is_some_and(|last| slot.index <= last) {
                return Err(record_out_of_order(&record));
            }
            last_index = Some(slot.index);
            validate_size(&record)?;
            codec::write_u24_le(&mut pyramid, usize::try_from(slot.offset)?, record.size);
            data_offset += u64::from(record.size);
            if record.size > 0 {
                tiles_written += 1;
            }
            pending = next_record(&mut records, &self.geometry)?;
        }
        let compressed = zlib_compress(&pyramid)?;
        output.write_all(&compressed).await?;
        header.pyramid_length = u32::try_from(compressed.len())?;
        trace!(
            pyramid_tiles = pyramid.len() / 3,
            compressed = compressed.len(),
            "wrote pyramid index"
        );

        // fragment index: walk the canonical slot enumeration and
        // merge-join the record stream against it, so gaps become zero
        // entries and every fragment gets its offset prefix even when the
        // provider skipped it entirely
        let mut fragments_length = 0u64;
        let mut prefix = [0u8; 5];
        let mut entry = [0u8; 3];
        for slot in self.geometry.tile_slots() {
            if pyramid_max.is_some_and(|max_zoom| slot.zoom <= max_zoom) {
                continue;
            }
            if slot.fragment_first {
                codec::write_u40_le(&mut prefix, 0, data_offset);
                output.write_all(&prefix).await?;
                fragments_length += 5;
            }
            let size = match pending {
                Some((record, record_slot)) if record_slot.index == slot.index => {
                    validate_size(&record)?;
                    if record.size > 0 {
                        tiles_written += 1;
                    }
                    pending = next_record(&mut records, &self.geometry)?;
                    record.size
                }
                Some((record, record_slot)) if record_slot.index < slot.index => {
                    return Err(record_out_of_order(&record));
                }
                _ => 0,
            };
            codec::write_u24_le(&mut entry, 0, size);
            output.write_all(&entry).await?;
            fragments_length += 3;
            data_offset += u64::from(size);
            if data_offset > MAX_DATA_OFFSET {
                return Err(ComtilesError::OffsetOverflow(data_offset).into());
            }
        }
        if let Some((record, _)) = pending {
            return Err(record_out_of_order(&record));
        }
        drop(records);
        header.fragments_length = fragments_length;
        trace!(fragments_length, "wrote fragment index");

        // data section: payloads stream through in the same order the
        // index recorded them; zero-size tiles contribute nothing
        let mut payload_total = 0u64;
        let mut payloads = provider.tile_payloads()?;
        while let Some(payload) = payloads.next().transpose()? {
            if payload.data.is_empty() {
                continue;
            }
            payload_total += payload.data.len() as u64;
            output.write_all(&payload.data).await?;
        }
        drop(payloads);
        if payload_total != data_offset {
            return Err(ComtilesError::DataLengthMismatch {
                expected: data_offset,
                got: payload_total,
            }
            .into());
        }

        // back-patch the index lengths into the header
        output.flush().await?;
        output.seek(SeekFrom::Start(0)).await?;
        output.write_all(&header.to_vec()?).await?;
        output.flush().await?;

        let summary = WriteSummary {
            tiles_written,
            tiles_missing: self.geometry.total_tile_count() - tiles_written,
            pyramid_length: header.pyramid_length,
            fragments_length,
            data_length: data_offset,
        };
        debug!(?summary, "archive complete");
        Ok(summary)
    }
}

fn next_record(
    records: &mut Box<dyn Iterator<Item = Result<TileRecord>> + '_>,
    geometry: &IndexGeometry,
) -> Result<Option<(TileRecord, IndexSlot)>> {
    match records.next().transpose()? {
        Some(record) => {
            let slot = geometry.index_offset_for_tile(record.zoom, record.col, record.row)?;
            Ok(Some((record, slot)))
        }
        None => Ok(None),
    }
}

fn validate_size(record: &TileRecord) -> Result<()> {
    if record.size > MAX_TILE_SIZE {
        return Err(ComtilesError::TileTooLarge {
            zoom: record.zoom,
            col: record.col,
            row: record.row,
            size: u64::from(record.size),
            max: u64::from(MAX_TILE_SIZE),
        }
        .into());
    }
    Ok(())
}

fn record_out_of_order(record: &TileRecord) -> anyhow::Error {
    ComtilesError::RecordOutOfOrder {
        zoom: record.zoom,
        col: record.col,
        row: record.row,
    }
    .into()
}
