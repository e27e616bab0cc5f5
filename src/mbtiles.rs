//! [`TileProvider`] over an MBTiles database.
//!
//! MBTiles stores TMS tile rows, matching the archive's axis convention,
//! so addresses pass through unchanged. The producer queries the database
//! in two shapes: one ordered query per zoom up to `max_zoom_db_query`
//! (reordering fragmented zooms in memory), and one windowed query per
//! fragment above it to bound memory on the big zooms.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use tracing::debug;

use crate::error::ComtilesError;
use crate::geometry::IndexGeometry;
use crate::metadata::{
    Metadata, TileMatrix, TileMatrixLimits, TileMatrixSet, PYRAMID_COEFFICIENT, TILE_FORMAT_PBF,
};
use crate::provider::{TilePayload, TileProvider, TileRecord};

/// Fragment side exponent assigned to zooms above the pyramid boundary.
pub const DEFAULT_AGGREGATION_COEFFICIENT: i32 = 6;

#[derive(Debug, Clone)]
enum QueryUnit {
    /// One query covering the whole zoom
    Zoom { zoom: u8, reorder: bool },
    /// One query covering a single fragment window
    Window { zoom: u8, bounds: TileMatrixLimits },
}

/// An MBTiles database exposed as a [`TileProvider`].
#[derive(Debug)]
pub struct MbtilesSource {
    conn: Connection,
    geometry: IndexGeometry,
    units: Vec<QueryUnit>,
}

impl MbtilesSource {
    /// Opens the database read-only and derives the archive metadata from
    /// its `metadata` table and per-zoom tile extents.
    ///
    /// Zooms up to `pyramid_max_zoom` become pyramid zooms; the rest get
    /// the default aggregation coefficient.
    ///
    /// # Errors
    /// Will return an error if the database cannot be opened, declares a
    /// tile format other than `pbf`, or holds no tiles.
    pub fn open(
        path: &Path,
        pyramid_max_zoom: u8,
        max_zoom_db_query: u8,
    ) -> Result<(Self, Metadata)> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("opening MBTiles database {}", path.display()))?;
        Self::from_connection(conn, pyramid_max_zoom, max_zoom_db_query)
    }

    /// Builds a source over an already-open connection.
    ///
    /// # Errors
    /// Same failure cases as [`Self::open`].
    pub fn from_connection(
        conn: Connection,
        pyramid_max_zoom: u8,
        max_zoom_db_query: u8,
    ) -> Result<(Self, Metadata)> {
        let metadata = read_metadata(&conn, pyramid_max_zoom)?;
        let geometry = IndexGeometry::new(&metadata.tile_matrix_set)?;

        let mut units = Vec::new();
        for matrix in geometry.matrices() {
            if matrix.is_pyramid() {
                units.push(QueryUnit::Zoom {
                    zoom: matrix.zoom,
                    reorder: false,
                });
            } else if matrix.zoom <= max_zoom_db_query {
                units.push(QueryUnit::Zoom {
                    zoom: matrix.zoom,
                    reorder: true,
                });
            } else {
                for bounds in geometry.fragment_windows(matrix.zoom)? {
                    units.push(QueryUnit::Window {
                        zoom: matrix.zoom,
                        bounds,
                    });
                }
            }
        }
        debug!(units = units.len(), "planned MBTiles queries");

        Ok((
            Self {
                conn,
                geometry,
                units,
            },
            metadata,
        ))
    }

    fn unit_records(&self, unit: &QueryUnit) -> Result<Vec<TileRecord>> {
        let (zoom, reorder, rows) = match unit {
            QueryUnit::Zoom { zoom, reorder } => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT tile_column, tile_row, LENGTH(tile_data) FROM tiles \
                     WHERE zoom_level = ?1 ORDER BY tile_row, tile_column",
                )?;
                let rows = stmt
                    .query_map([i64::from(*zoom)], row_triple)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (*zoom, *reorder, rows)
            }
            QueryUnit::Window { zoom, bounds } => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT tile_column, tile_row, LENGTH(tile_data) FROM tiles \
                     WHERE zoom_level = ?1 AND tile_column BETWEEN ?2 AND ?3 \
                     AND tile_row BETWEEN ?4 AND ?5 ORDER BY tile_row, tile_column",
                )?;
                let rows = stmt
                    .query_map(window_params(*zoom, bounds), row_triple)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (*zoom, false, rows)
            }
        };

        let records = rows
            .into_iter()
            .map(|(col, row, size)| {
                Ok(TileRecord {
                    zoom,
                    col: u64::try_from(col)?,
                    row: u64::try_from(row)?,
                    size: u32::try_from(size)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if reorder {
            return self.sort_to_index_order(records);
        }
        Ok(records)
    }

    fn unit_payloads(&self, unit: &QueryUnit) -> Result<Vec<TilePayload>> {
        let (zoom, reorder, rows) = match unit {
            QueryUnit::Zoom { zoom, reorder } => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT tile_column, tile_row, tile_data FROM tiles \
                     WHERE zoom_level = ?1 ORDER BY tile_row, tile_column",
                )?;
                let rows = stmt
                    .query_map([i64::from(*zoom)], row_blob)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (*zoom, *reorder, rows)
            }
            QueryUnit::Window { zoom, bounds } => {
                let mut stmt = self.conn.prepare_cached(
                    "SELECT tile_column, tile_row, tile_data FROM tiles \
                     WHERE zoom_level = ?1 AND tile_column BETWEEN ?2 AND ?3 \
                     AND tile_row BETWEEN ?4 AND ?5 ORDER BY tile_row, tile_column",
                )?;
                let rows = stmt
                    .query_map(window_params(*zoom, bounds), row_blob)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (*zoom, false, rows)
            }
        };

        let payloads = rows
            .into_iter()
            .map(|(col, row, data)| {
                Ok(TilePayload {
                    zoom,
                    col: u64::try_from(col)?,
                    row: u64::try_from(row)?,
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if reorder {
            return self.sort_to_index_order(payloads);
        }
        Ok(payloads)
    }

    /// Re-sorts a whole-zoom result set from plain row-major into the
    /// fragment-major index order.
    fn sort_to_index_order<T: TileAddressed>(&self, items: Vec<T>) -> Result<Vec<T>> {
        let mut keyed = items
            .into_iter()
            .map(|item| {
                let (zoom, col, row) = item.address();
                let slot = self.geometry.index_offset_for_tile(zoom, col, row)?;
                Ok((slot.index, item))
            })
            .collect::<Result<Vec<_>>>()?;
        keyed.sort_by_key(|(index, _)| *index);
        Ok(keyed.into_iter().map(|(_, item)| item).collect())
    }
}

impl TileProvider for MbtilesSource {
    fn tile_records(&mut self) -> Result<Box<dyn Iterator<Item = Result<TileRecord>> + '_>> {
        let source: &Self = self;
        Ok(Box::new(UnitRows::new(&source.units, move |unit| {
            source.unit_records(unit)
        })))
    }

    fn tile_payloads(&mut self) -> Result<Box<dyn Iterator<Item = Result<TilePayload>> + '_>> {
        let source: &Self = self;
        Ok(Box::new(UnitRows::new(&source.units, move |unit| {
            source.unit_payloads(unit)
        })))
    }
}

trait TileAddressed {
    fn address(&self) -> (u8, u64, u64);
}

impl TileAddressed for TileRecord {
    fn address(&self) -> (u8, u64, u64) {
        (self.zoom, self.col, self.row)
    }
}

impl TileAddressed for TilePayload {
    fn address(&self) -> (u8, u64, u64) {
        (self.zoom, self.col, self.row)
    }
}

fn row_triple(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn row_blob(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, i64, Vec<u8>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

#[allow(clippy::cast_possible_wrap)]
fn window_params(zoom: u8, bounds: &TileMatrixLimits) -> [i64; 5] {
    [
        i64::from(zoom),
        bounds.min_tile_col as i64,
        bounds.max_tile_col as i64,
        bounds.min_tile_row as i64,
        bounds.max_tile_row as i64,
    ]
}

/// Walks the planned query units lazily, holding at most one unit's rows
/// in memory.
struct UnitRows<'a, T, F> {
    units: &'a [QueryUnit],
    next_unit: usize,
    buffered: std::vec::IntoIter<T>,
    fetch: F,
}

impl<'a, T, F> UnitRows<'a, T, F>
where
    F: Fn(&QueryUnit) -> Result<Vec<T>>,
{
    fn new(units: &'a [QueryUnit], fetch: F) -> Self {
        Self {
            units,
            next_unit: 0,
            buffered: Vec::new().into_iter(),
            fetch,
        }
    }
}

impl<T, F> Iterator for UnitRows<'_, T, F>
where
    F: Fn(&QueryUnit) -> Result<Vec<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        loop {
            if let Some(item) = self.buffered.next() {
                return Some(Ok(item));
            }
            let unit = self.units.get(self.next_unit)?;
            self.next_unit += 1;
            match (self.fetch)(unit) {
                Ok(rows) => self.buffered = rows.into_iter(),
                Err(err) => {
                    self.next_unit = self.units.len();
                    return Some(Err(err));
                }
            }
        }
    }
}

fn read_metadata(conn: &Connection, pyramid_max_zoom: u8) -> Result<Metadata> {
    let mut table = HashMap::new();
    let mut stmt = conn.prepare("SELECT name, value FROM metadata")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    for row in rows {
        let (name, value) = row?;
        table.insert(name, value);
    }

    let format = table.get("format").cloned().unwrap_or_default();
    if format != TILE_FORMAT_PBF {
        return Err(ComtilesError::UnsupportedTileFormat(format).into());
    }

    let mut stmt = conn.prepare(
        "SELECT zoom_level, MIN(tile_column), MAX(tile_column), MIN(tile_row), MAX(tile_row) \
         FROM tiles GROUP BY zoom_level ORDER BY zoom_level",
    )?;
    let matrices = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .map(|(zoom, min_col, max_col, min_row, max_row)| {
            let zoom = u8::try_from(zoom)?;
            Ok(TileMatrix {
                zoom,
                aggregation_coefficient: if zoom <= pyramid_max_zoom {
                    PYRAMID_COEFFICIENT
                } else {
                    DEFAULT_AGGREGATION_COEFFICIENT
                },
                tile_matrix_limits: TileMatrixLimits {
                    min_tile_col: u64::try_from(min_col)?,
                    min_tile_row: u64::try_from(min_row)?,
                    max_tile_col: u64::try_from(max_col)?,
                    max_tile_row: u64::try_from(max_row)?,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if matrices.is_empty() {
        return Err(ComtilesError::InvalidTileMatrixSet("MBTiles database holds no tiles".into()).into());
    }

    let bounds = table.get("bounds").and_then(|raw| {
        let parts: Vec<f64> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();
        <[f64; 4]>::try_from(parts).ok()
    });

    Ok(Metadata {
        name: table.get("name").cloned().unwrap_or_else(|| "tileset".into()),
        description: table.get("description").cloned(),
        attribution: table.get("attribution").cloned(),
        tile_format: format,
        bounds,
        min_zoom: matrices.first().map(|m| m.zoom),
        max_zoom: matrices.last().map(|m| m.zoom),
        tile_matrix_set: TileMatrixSet::new(matrices),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fetch::MemoryRangeReader;
    use crate::reader::{ArchiveReader, TileAddress};
    use crate::writer::ArchiveWriter;
    use std::io::Cursor;

    fn fixture_db() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE metadata (name TEXT, value TEXT);
             CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, \
                                 tile_row INTEGER, tile_data BLOB);",
        )?;
        conn.execute(
            "INSERT INTO metadata VALUES ('name', 'fixture'), ('format', 'pbf'), \
             ('bounds', '-180,-85,180,85')",
            [],
        )?;

        // zoom 0: the root; zoom 1: full 2x2; zoom 2: sparse 3x2 block
        let mut insert = conn.prepare(
            "INSERT INTO tiles (zoom_level, tile_column, tile_row, tile_data) \
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        insert.execute(rusqlite::params![0, 0, 0, vec![0u8; 4]])?;
        for row in 0..2i64 {
            for col in 0..2i64 {
                let data = vec![u8::try_from(16 + row * 2 + col)?; 6];
                insert.execute(rusqlite::params![1, col, row, data])?;
            }
        }
        for (col, row) in [(1i64, 1i64), (2, 1), (3, 1), (1, 2), (3, 2)] {
            let data = vec![u8::try_from(32 + row * 4 + col)?; 8];
            insert.execute(rusqlite::params![2, col, row, data])?;
        }
        drop(insert);
        Ok(conn)
    }

    #[test]
    fn test_metadata_from_database() -> Result<()> {
        let (_, metadata) = MbtilesSource::from_connection(fixture_db()?, 1, 8)?;
        assert_eq!(metadata.name, "fixture");
        assert_eq!(metadata.bounds, Some([-180.0, -85.0, 180.0, 85.0]));
        assert_eq!(metadata.min_zoom, Some(0));
        assert_eq!(metadata.max_zoom, Some(2));

        let matrices = &metadata.tile_matrix_set.tile_matrix;
        assert_eq!(matrices.len(), 3);
        assert!(matrices[0].is_pyramid());
        assert!(matrices[1].is_pyramid());
        assert_eq!(
            matrices[2].aggregation_coefficient,
            DEFAULT_AGGREGATION_COEFFICIENT
        );
        assert_eq!(
            matrices[2].tile_matrix_limits,
            TileMatrixLimits {
                min_tile_col: 1,
                min_tile_row: 1,
                max_tile_col: 3,
                max_tile_row: 2,
            }
        );
        Ok(())
    }

    #[test]
    fn test_rejects_non_pbf_database() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE metadata (name TEXT, value TEXT);
             CREATE TABLE tiles (zoom_level INTEGER, tile_column INTEGER, \
                                 tile_row INTEGER, tile_data BLOB);
             INSERT INTO metadata VALUES ('format', 'png');",
        )?;
        let err = MbtilesSource::from_connection(conn, 1, 8).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ComtilesError>(),
            Some(ComtilesError::UnsupportedTileFormat(f)) if f == "png"
        ));
        Ok(())
    }

    #[test]
    fn test_records_come_out_in_index_order() -> Result<()> {
        for max_zoom_db_query in [8, 0] {
            let (mut source, _) =
                MbtilesSource::from_connection(fixture_db()?, 1, max_zoom_db_query)?;
            let geometry = source.geometry.clone();

            let records = source
                .tile_records()?
                .collect::<Result<Vec<_>>>()?;
            let indexes: Vec<u64> = records
                .iter()
                .map(|r| {
                    geometry
                        .index_offset_for_tile(r.zoom, r.col, r.row)
                        .map(|slot| slot.index)
                })
                .collect::<Result<Vec<_>>>()?;
            let mut sorted = indexes.clone();
            sorted.sort_unstable();
            assert_eq!(indexes, sorted, "max_zoom_db_query = {max_zoom_db_query}");
            assert_eq!(records.len(), 10);

            // the payload pass yields the same tiles in the same order
            let payloads = source.tile_payloads()?.collect::<Result<Vec<_>>>()?;
            let payload_addresses: Vec<(u8, u64, u64)> =
                payloads.iter().map(|p| (p.zoom, p.col, p.row)).collect();
            let record_addresses: Vec<(u8, u64, u64)> =
                records.iter().map(|r| (r.zoom, r.col, r.row)).collect();
            assert_eq!(payload_addresses, record_addresses);
            for (record, payload) in records.iter().zip(&payloads) {
                assert_eq!(record.size as usize, payload.data.len());
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_convert_database_and_read_back() -> Result<()> {
        // per-fragment windows at zoom 2 to exercise both query shapes
        let (mut source, metadata) = MbtilesSource::from_connection(fixture_db()?, 1, 1)?;
        let writer = ArchiveWriter::new(metadata)?;
        let mut output = Cursor::new(Vec::new());
        let summary = writer.write(&mut source, &mut output).await?;
        assert_eq!(summary.tiles_written, 10);

        let reader = ArchiveReader::with_source(MemoryRangeReader::new(output.into_inner()), 1);
        // zoom 1, tms row 1 -> xyz row 0
        let tile = reader.get_tile(TileAddress::new(1, 0, 0), None).await?;
        assert_eq!(tile.as_deref(), Some(vec![18u8; 6].as_slice()));
        // zoom 2, col 3, tms row 2 -> xyz row 1
        let tile = reader.get_tile(TileAddress::new(2, 3, 1), None).await?;
        assert_eq!(tile.as_deref(), Some(vec![43u8; 8].as_slice()));
        // absent tile inside the limits
        let tile = reader.get_tile(TileAddress::new(2, 2, 1), None).await?;
        assert!(tile.is_none());
        Ok(())
    }
}
