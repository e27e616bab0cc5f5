//! Pure index arithmetic: tile address to index offset, fragment ranges,
//! and the canonical row-major slot enumeration.
//!
//! Everything in this module is deterministic arithmetic over the tile
//! matrix set. The producer lays the archive out with it and the consumer
//! recomputes the same byte positions, so both sides must agree
//! byte-for-byte for every legal address.

use anyhow::Result;

use crate::codec::{FRAGMENT_OFFSET_BYTES, TILE_SIZE_BYTES};
use crate::error::ComtilesError;
use crate::header::HEADER_BYTES;
use crate::metadata::{TileMatrix, TileMatrixLimits, TileMatrixSet, ROW_MAJOR, WEB_MERCATOR_QUAD};

const SIZE_ENTRY: u64 = TILE_SIZE_BYTES as u64;
const OFFSET_PREFIX: u64 = FRAGMENT_OFFSET_BYTES as u64;

/// Largest accepted aggregation coefficient; keeps `2^coeff` well inside
/// the index arithmetic.
const MAX_AGGREGATION_COEFFICIENT: i32 = 30;

/// Position of a tile's size entry within the decompressed index
/// (pyramid plus fragment entries, fragment offset prefixes excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSlot {
    /// Ordinal of the tile across the whole index
    pub index: u64,
    /// Byte offset of its 3-byte size entry, always `index * 3`
    pub offset: u64,
}

/// Archive-absolute byte range of one index fragment.
///
/// The range is half-open; `end - start` is always the 5-byte offset
/// prefix plus 3 bytes per tile in the fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRange {
    /// Ordinal of the fragment across all fragmented zooms
    pub fragment_index: u64,
    /// First byte of the fragment within the archive
    pub start: u64,
    /// One past the last byte of the fragment
    pub end: u64,
}

/// One slot of the canonical row-major enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileSlot {
    pub zoom: u8,
    pub col: u64,
    /// TMS row
    pub row: u64,
    /// Ordinal across the whole index
    pub index: u64,
    /// Whether this slot opens a new fragment (fragmented zooms only)
    pub fragment_first: bool,
}

/// Validated tile matrix set with the address arithmetic on top.
#[derive(Debug, Clone)]
pub struct IndexGeometry {
    matrices: Vec<TileMatrix>,
}

impl IndexGeometry {
    /// Validates the tile matrix set and builds the geometry.
    ///
    /// # Errors
    /// Will return [`ComtilesError::UnsupportedCrs`] or
    /// [`ComtilesError::UnsupportedOrdering`] when the set asks for a CRS
    /// or ordering other than the defaults, and
    /// [`ComtilesError::InvalidTileMatrixSet`] when the matrices are
    /// structurally unsound.
    pub fn new(set: &TileMatrixSet) -> Result<Self> {
        if let Some(crs) = set.tile_matrix_crs.as_deref() {
            if crs != WEB_MERCATOR_QUAD {
                return Err(ComtilesError::UnsupportedCrs(crs.to_owned()).into());
            }
        }
        for (kind, value) in [
            ("fragment", set.fragment_ordering.as_deref()),
            ("tile", set.tile_ordering.as_deref()),
        ] {
            if let Some(ordering) = value {
                if ordering != ROW_MAJOR {
                    return Err(ComtilesError::UnsupportedOrdering {
                        kind,
                        value: ordering.to_owned(),
                    }
                    .into());
                }
            }
        }

        let matrices = set.tile_matrix.clone();
        if matrices.is_empty() {
            return Err(ComtilesError::InvalidTileMatrixSet("no tile matrices".into()).into());
        }
        let mut seen_fragmented = false;
        for pair in matrices.windows(2) {
            if pair[1].zoom <= pair[0].zoom {
                return Err(ComtilesError::InvalidTileMatrixSet(format!(
                    "zooms must be strictly increasing, got {} after {}",
                    pair[1].zoom, pair[0].zoom
                ))
                .into());
            }
        }
        for matrix in &matrices {
            let limits = &matrix.tile_matrix_limits;
            if limits.min_tile_col > limits.max_tile_col || limits.min_tile_row > limits.max_tile_row
            {
                return Err(ComtilesError::InvalidTileMatrixSet(format!(
                    "zoom {} has inverted tile matrix limits",
                    matrix.zoom
                ))
                .into());
            }
            if matrix.aggregation_coefficient < -1
                || matrix.aggregation_coefficient > MAX_AGGREGATION_COEFFICIENT
            {
                return Err(ComtilesError::InvalidTileMatrixSet(format!(
                    "zoom {} has aggregation coefficient {}",
                    matrix.zoom, matrix.aggregation_coefficient
                ))
                .into());
            }
            if matrix.is_pyramid() {
                if seen_fragmented {
                    return Err(ComtilesError::InvalidTileMatrixSet(format!(
                        "pyramid zoom {} follows a fragmented zoom",
                        matrix.zoom
                    ))
                    .into());
                }
            } else {
                seen_fragmented = true;
            }
        }
        Ok(Self { matrices })
    }

    /// The validated tile matrices, ascending by zoom.
    #[must_use]
    pub fn matrices(&self) -> &[TileMatrix] {
        &self.matrices
    }

    /// The matrix describing `zoom`, if the set covers it.
    #[must_use]
    pub fn matrix(&self, zoom: u8) -> Option<&TileMatrix> {
        self.matrices.iter().find(|m| m.zoom == zoom)
    }

    /// Highest pyramid zoom, or [`None`] when every zoom is fragmented.
    #[must_use]
    pub fn pyramid_max_zoom(&self) -> Option<u8> {
        self.matrices
            .iter()
            .filter(|m| m.is_pyramid())
            .map(|m| m.zoom)
            .max()
    }

    /// Total number of tiles across all pyramid zooms.
    #[must_use]
    pub fn pyramid_tile_count(&self) -> u64 {
        self.matrices
            .iter()
            .filter(|m| m.is_pyramid())
            .map(|m| m.tile_matrix_limits.tile_count())
            .sum()
    }

    /// Byte offset and ordinal of the tile's 3-byte size entry within the
    /// decompressed index.
    ///
    /// # Errors
    /// Will return [`ComtilesError::OutOfRange`] if `(col, row)` lies
    /// outside the tile matrix limits of `zoom`, or the set does not cover
    /// `zoom` at all.
    pub fn index_offset_for_tile(&self, zoom: u8, col: u64, row: u64) -> Result<IndexSlot> {
        let mut index = 0u64;
        for matrix in &self.matrices {
            if matrix.zoom < zoom {
                index += matrix.tile_matrix_limits.tile_count();
                continue;
            }
            if matrix.zoom > zoom {
                break;
            }
            let limits = &matrix.tile_matrix_limits;
            if !limits.contains(col, row) {
                return Err(ComtilesError::OutOfRange { zoom, col, row }.into());
            }
            index += if matrix.is_pyramid() {
                (row - limits.min_tile_row) * limits.width() + (col - limits.min_tile_col)
            } else {
                let bounds = sparse_fragment_bounds(matrix, col, row);
                entries_before_fragment(limits, &bounds)
                    + (row - bounds.min_tile_row) * bounds.width()
                    + (col - bounds.min_tile_col)
            };
            return Ok(IndexSlot {
                index,
                offset: index * SIZE_ENTRY,
            });
        }
        Err(ComtilesError::OutOfRange { zoom, col, row }.into())
    }

    /// Archive-absolute byte range of the fragment containing the tile.
    ///
    /// `metadata_length` and `pyramid_length` are the on-disk (compressed)
    /// section lengths from the header; together with the fixed header
    /// they place the fragment index inside the archive.
    ///
    /// # Errors
    /// Will return [`ComtilesError::OutOfRange`] for addresses outside the
    /// limits and [`ComtilesError::NotFragmented`] when `zoom` belongs to
    /// the pyramid.
    pub fn fragment_range_for_tile(
        &self,
        zoom: u8,
        col: u64,
        row: u64,
        metadata_length: u64,
        pyramid_length: u64,
    ) -> Result<FragmentRange> {
        let mut fragment_index = 0u64;
        let mut start = u64::from(HEADER_BYTES) + metadata_length + pyramid_length;
        for matrix in &self.matrices {
            if matrix.zoom > zoom {
                break;
            }
            if matrix.is_pyramid() {
                if matrix.zoom == zoom {
                    return Err(ComtilesError::NotFragmented(zoom).into());
                }
                continue;
            }
            let limits = &matrix.tile_matrix_limits;
            if matrix.zoom < zoom {
                let fragments = fragment_grid(matrix).tile_count();
                start += fragments * OFFSET_PREFIX + limits.tile_count() * SIZE_ENTRY;
                fragment_index += fragments;
                continue;
            }
            if !limits.contains(col, row) {
                return Err(ComtilesError::OutOfRange { zoom, col, row }.into());
            }
            let bounds = sparse_fragment_bounds(matrix, col, row);
            let before = fragments_before(matrix, col, row);
            fragment_index += before;
            start += before * OFFSET_PREFIX + entries_before_fragment(limits, &bounds) * SIZE_ENTRY;
            let end = start + OFFSET_PREFIX + bounds.tile_count() * SIZE_ENTRY;
            return Ok(FragmentRange {
                fragment_index,
                start,
                end,
            });
        }
        Err(ComtilesError::OutOfRange { zoom, col, row }.into())
    }

    /// Sparse bounds of the fragment containing the tile: the dense
    /// `2^coeff` cell intersected with the zoom's tile matrix limits.
    ///
    /// # Errors
    /// Same failure cases as [`Self::fragment_range_for_tile`].
    pub fn fragment_bounds(&self, zoom: u8, col: u64, row: u64) -> Result<TileMatrixLimits> {
        let Some(matrix) = self.matrix(zoom) else {
            return Err(ComtilesError::OutOfRange { zoom, col, row }.into());
        };
        if matrix.is_pyramid() {
            return Err(ComtilesError::NotFragmented(zoom).into());
        }
        if !matrix.tile_matrix_limits.contains(col, row) {
            return Err(ComtilesError::OutOfRange { zoom, col, row }.into());
        }
        Ok(sparse_fragment_bounds(matrix, col, row))
    }

    /// The canonical enumeration of every index slot: zooms ascending,
    /// pyramid zooms row-major by tile, fragmented zooms row-major by
    /// fragment with row-major tiles inside each fragment.
    ///
    /// The iterator lifts all of its state from the tile matrix set, so it
    /// can be restarted at any time and drives the producer's layout.
    #[must_use]
    pub fn tile_slots(&self) -> TileSlots<'_> {
        TileSlots {
            matrices: &self.matrices,
            zoom_idx: 0,
            cursor: None,
            index: 0,
        }
    }

    /// Sparse bounds of every fragment of `zoom`, in row-major fragment
    /// order. Useful for producers that query their source one fragment
    /// window at a time.
    ///
    /// # Errors
    /// Will return [`ComtilesError::NotFragmented`] for pyramid zooms and
    /// [`ComtilesError::OutOfRange`] for zooms the set does not cover.
    pub fn fragment_windows(&self, zoom: u8) -> Result<Vec<TileMatrixLimits>> {
        let Some(matrix) = self.matrix(zoom) else {
            return Err(ComtilesError::OutOfRange {
                zoom,
                col: 0,
                row: 0,
            }
            .into());
        };
        if matrix.is_pyramid() {
            return Err(ComtilesError::NotFragmented(zoom).into());
        }
        let grid = fragment_grid(matrix);
        let mut windows = Vec::with_capacity(usize::try_from(grid.tile_count())?);
        for frag_row in grid.min_tile_row..=grid.max_tile_row {
            for frag_col in grid.min_tile_col..=grid.max_tile_col {
                windows.push(fragment_cell_bounds(matrix, frag_col, frag_row));
            }
        }
        Ok(windows)
    }

    /// Total number of tiles across every zoom of the set.
    #[must_use]
    pub fn total_tile_count(&self) -> u64 {
        self.matrices
            .iter()
            .map(|m| m.tile_matrix_limits.tile_count())
            .sum()
    }
}

/// Bounds of the dense fragment cell `(frag_col, frag_row)` clipped to the
/// zoom limits. Grid cells are derived from the limits, so the
/// intersection is never empty.
fn fragment_cell_bounds(matrix: &TileMatrix, frag_col: u64, frag_row: u64) -> TileMatrixLimits {
    let span = matrix.fragment_span();
    let limits = &matrix.tile_matrix_limits;
    TileMatrixLimits {
        min_tile_col: (frag_col * span).max(limits.min_tile_col),
        min_tile_row: (frag_row * span).max(limits.min_tile_row),
        max_tile_col: (frag_col * span + span - 1).min(limits.max_tile_col),
        max_tile_row: (frag_row * span + span - 1).min(limits.max_tile_row),
    }
}

fn sparse_fragment_bounds(matrix: &TileMatrix, col: u64, row: u64) -> TileMatrixLimits {
    let span = matrix.fragment_span();
    fragment_cell_bounds(matrix, col / span, row / span)
}

/// The zoom's fragment grid, in fragment-cell units.
fn fragment_grid(matrix: &TileMatrix) -> TileMatrixLimits {
    let span = matrix.fragment_span();
    let limits = &matrix.tile_matrix_limits;
    TileMatrixLimits {
        min_tile_col: limits.min_tile_col / span,
        min_tile_row: limits.min_tile_row / span,
        max_tile_col: limits.max_tile_col / span,
        max_tile_row: limits.max_tile_row / span,
    }
}

/// Number of fragments enumerated before the one containing the tile:
/// grid rows below it plus cells to its left within its row.
fn fragments_before(matrix: &TileMatrix, col: u64, row: u64) -> u64 {
    let span = matrix.fragment_span();
    let grid = fragment_grid(matrix);
    (row / span - grid.min_tile_row) * grid.width() + (col / span - grid.min_tile_col)
}

/// Number of size entries enumerated before the fragment with the given
/// sparse bounds: tiles left of the fragment within its band plus tiles
/// below the band.
fn entries_before_fragment(limits: &TileMatrixLimits, bounds: &TileMatrixLimits) -> u64 {
    let left_before = (bounds.min_tile_col - limits.min_tile_col)
        * (bounds.max_tile_row - limits.min_tile_row + 1);
    let below_before = (limits.max_tile_col - bounds.min_tile_col + 1)
        * (bounds.min_tile_row - limits.min_tile_row);
    left_before + below_before
}

/// See [`IndexGeometry::tile_slots`].
pub struct TileSlots<'a> {
    matrices: &'a [TileMatrix],
    zoom_idx: usize,
    cursor: Option<Cursor>,
    index: u64,
}

struct Cursor {
    /// Current traversal window: the whole matrix at pyramid zooms, one
    /// sparse fragment at fragmented zooms
    window: TileMatrixLimits,
    col: u64,
    row: u64,
    window_start: bool,
    grid: Option<GridCursor>,
}

struct GridCursor {
    frag_col: u64,
    frag_row: u64,
    grid: TileMatrixLimits,
}

impl Cursor {
    fn begin(matrix: &TileMatrix) -> Self {
        if matrix.is_pyramid() {
            let window = matrix.tile_matrix_limits;
            Self {
                col: window.min_tile_col,
                row: window.min_tile_row,
                window,
                window_start: true,
                grid: None,
            }
        } else {
            let grid = fragment_grid(matrix);
            let window = fragment_cell_bounds(matrix, grid.min_tile_col, grid.min_tile_row);
            Self {
                col: window.min_tile_col,
                row: window.min_tile_row,
                window,
                window_start: true,
                grid: Some(GridCursor {
                    frag_col: grid.min_tile_col,
                    frag_row: grid.min_tile_row,
                    grid,
                }),
            }
        }
    }
}

impl Iterator for TileSlots<'_> {
    type Item = TileSlot;

    fn next(&mut self) -> Option<TileSlot> {
        loop {
            if self.zoom_idx >= self.matrices.len() {
                return None;
            }
            let matrix = &self.matrices[self.zoom_idx];
            let Some(cursor) = self.cursor.as_mut() else {
                self.cursor = Some(Cursor::begin(matrix));
                continue;
            };

            let slot = TileSlot {
                zoom: matrix.zoom,
                col: cursor.col,
                row: cursor.row,
                index: self.index,
                fragment_first: cursor.window_start && cursor.grid.is_some(),
            };
            self.index += 1;
            cursor.window_start = false;

            if cursor.col < cursor.window.max_tile_col {
                cursor.col += 1;
            } else if cursor.row < cursor.window.max_tile_row {
                cursor.col = cursor.window.min_tile_col;
                cursor.row += 1;
            } else {
                let mut zoom_done = true;
                if let Some(frag) = cursor.grid.as_mut() {
                    if frag.frag_col < frag.grid.max_tile_col {
                        frag.frag_col += 1;
                        zoom_done = false;
                    } else if frag.frag_row < frag.grid.max_tile_row {
                        frag.frag_col = frag.grid.min_tile_col;
                        frag.frag_row += 1;
                        zoom_done = false;
                    }
                    if !zoom_done {
                        cursor.window = fragment_cell_bounds(matrix, frag.frag_col, frag.frag_row);
                        cursor.col = cursor.window.min_tile_col;
                        cursor.row = cursor.window.min_tile_row;
                        cursor.window_start = true;
                    }
                }
                if zoom_done {
                    self.zoom_idx += 1;
                    self.cursor = None;
                }
            }
            return Some(slot);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn matrix(zoom: u8, coeff: i32, limits: (u64, u64, u64, u64)) -> TileMatrix {
        TileMatrix {
            zoom,
            aggregation_coefficient: coeff,
            tile_matrix_limits: TileMatrixLimits {
                min_tile_col: limits.0,
                min_tile_row: limits.1,
                max_tile_col: limits.2,
                max_tile_row: limits.3,
            },
        }
    }

    fn geometry(matrices: Vec<TileMatrix>) -> IndexGeometry {
        IndexGeometry::new(&TileMatrixSet::new(matrices)).unwrap()
    }

    #[test]
    fn test_rejects_foreign_crs_and_ordering() {
        let mut set = TileMatrixSet::new(vec![matrix(0, -1, (0, 0, 0, 0))]);
        set.tile_matrix_crs = Some("EuropeanTerrestrial".into());
        assert!(matches!(
            IndexGeometry::new(&set)
                .unwrap_err()
                .downcast_ref::<ComtilesError>(),
            Some(ComtilesError::UnsupportedCrs(_))
        ));

        let mut set = TileMatrixSet::new(vec![matrix(0, -1, (0, 0, 0, 0))]);
        set.tile_ordering = Some("HilbertCurve".into());
        assert!(matches!(
            IndexGeometry::new(&set)
                .unwrap_err()
                .downcast_ref::<ComtilesError>(),
            Some(ComtilesError::UnsupportedOrdering { kind: "tile", .. })
        ));

        // unset fields fall back to the defaults
        let set = TileMatrixSet::new(vec![matrix(0, -1, (0, 0, 0, 0))]);
        assert!(IndexGeometry::new(&set).is_ok());
    }

    #[test]
    fn test_rejects_pyramid_after_fragmented_zoom() {
        let set = TileMatrixSet::new(vec![
            matrix(0, -1, (0, 0, 0, 0)),
            matrix(1, 1, (0, 0, 1, 1)),
            matrix(2, -1, (0, 0, 3, 3)),
        ]);
        assert!(matches!(
            IndexGeometry::new(&set)
                .unwrap_err()
                .downcast_ref::<ComtilesError>(),
            Some(ComtilesError::InvalidTileMatrixSet(_))
        ));
    }

    #[test]
    fn test_pyramid_offsets_row_major() {
        // 2x2 pyramid zoom preceded by the single root tile
        let geo = geometry(vec![matrix(0, -1, (0, 0, 0, 0)), matrix(1, -1, (0, 0, 1, 1))]);
        assert_eq!(geo.pyramid_max_zoom(), Some(1));
        assert_eq!(geo.pyramid_tile_count(), 5);

        let slot = geo.index_offset_for_tile(1, 0, 0).unwrap();
        assert_eq!(slot.index, 1);
        let slot = geo.index_offset_for_tile(1, 1, 0).unwrap();
        assert_eq!(slot.index, 2);
        let slot = geo.index_offset_for_tile(1, 1, 1).unwrap();
        assert_eq!((slot.index, slot.offset), (4, 12));
    }

    #[test]
    fn test_single_fragment_local_index() {
        // one 8x8 fragment covering the whole zoom
        let geo = geometry(vec![matrix(3, 3, (0, 0, 7, 7))]);
        let slot = geo.index_offset_for_tile(3, 5, 2).unwrap();
        assert_eq!(slot.index, 2 * 8 + 5);

        // its size entry sits at byte 5 + 3 * 21 = 68 of the fragment
        let bounds = geo.fragment_bounds(3, 5, 2).unwrap();
        let local = (2 - bounds.min_tile_row) * bounds.width() + (5 - bounds.min_tile_col);
        assert_eq!(5 + 3 * local, 68);

        let range = geo.fragment_range_for_tile(3, 5, 2, 100, 10).unwrap();
        assert_eq!(range.fragment_index, 0);
        assert_eq!(range.start, 24 + 100 + 10);
        assert_eq!(range.end - range.start, 5 + 3 * 64);
    }

    #[test]
    fn test_sparse_fragment_bounds() {
        // dense cell of tile (5,4) is cols 0-7 rows 0-7, clipped by limits
        let geo = geometry(vec![matrix(4, 3, (3, 2, 13, 11))]);
        let bounds = geo.fragment_bounds(4, 5, 4).unwrap();
        assert_eq!(
            bounds,
            TileMatrixLimits {
                min_tile_col: 3,
                min_tile_row: 2,
                max_tile_col: 7,
                max_tile_row: 7,
            }
        );
        assert_eq!(bounds.tile_count(), 30);

        let range = geo.fragment_range_for_tile(4, 5, 4, 0, 0).unwrap();
        assert_eq!(range.fragment_index, 0);
        assert_eq!(range.start, 24);
        assert_eq!(range.end - range.start, 5 + 3 * 30);

        // first tile of the first fragment opens the index
        let slot = geo.index_offset_for_tile(4, 3, 2).unwrap();
        assert_eq!(slot.index, 0);
    }

    #[test]
    fn test_entries_before_later_fragments() {
        let geo = geometry(vec![matrix(4, 3, (3, 2, 13, 11))]);

        // fragment cell (1,0): 30 entries of fragment (0,0) precede it
        assert_eq!(geo.index_offset_for_tile(4, 8, 2).unwrap().index, 30);
        // fragment cell (0,1): fragments (0,0) and (1,0) precede it
        assert_eq!(geo.index_offset_for_tile(4, 3, 8).unwrap().index, 30 + 36);
        // fragment cell (1,1)
        let slot = geo.index_offset_for_tile(4, 8, 8).unwrap();
        assert_eq!(slot.index, 30 + 36 + 20);

        let range = geo.fragment_range_for_tile(4, 8, 8, 0, 0).unwrap();
        assert_eq!(range.fragment_index, 3);
        assert_eq!(range.start, 24 + 3 * 5 + 86 * 3);
        assert_eq!(range.end - range.start, 5 + 3 * 24);
    }

    #[test]
    fn test_fragment_locality() {
        let geo = geometry(vec![matrix(4, 3, (3, 2, 13, 11))]);
        let a = geo.fragment_range_for_tile(4, 3, 2, 50, 7).unwrap();
        let b = geo.fragment_range_for_tile(4, 7, 7, 50, 7).unwrap();
        assert_eq!(a, b);

        let c = geo.fragment_range_for_tile(4, 8, 7, 50, 7).unwrap();
        assert_ne!(a.start, c.start);
        assert_eq!(c.start, a.end);
    }

    #[test]
    fn test_fragment_range_accumulates_earlier_zooms() {
        let geo = geometry(vec![
            matrix(0, -1, (0, 0, 0, 0)),
            matrix(1, 1, (0, 0, 1, 1)),
            matrix(2, 1, (0, 0, 3, 3)),
        ]);
        // zoom 1: one 2x2 fragment (5 + 12 bytes); zoom 2: four fragments
        let range = geo.fragment_range_for_tile(2, 0, 0, 10, 4).unwrap();
        assert_eq!(range.fragment_index, 1);
        assert_eq!(range.start, 24 + 10 + 4 + 5 + 12);
        assert_eq!(range.end - range.start, 5 + 12);

        let range = geo.fragment_range_for_tile(2, 2, 2, 10, 4).unwrap();
        assert_eq!(range.fragment_index, 4);
        assert_eq!(range.start, 24 + 10 + 4 + (5 + 12) + 3 * (5 + 12));
    }

    #[test]
    fn test_out_of_range_and_not_fragmented() {
        let geo = geometry(vec![matrix(0, -1, (0, 0, 0, 0)), matrix(1, 1, (0, 0, 1, 1))]);
        assert!(matches!(
            geo.index_offset_for_tile(1, 2, 0)
                .unwrap_err()
                .downcast_ref::<ComtilesError>(),
            Some(ComtilesError::OutOfRange { zoom: 1, col: 2, row: 0 })
        ));
        assert!(matches!(
            geo.index_offset_for_tile(5, 0, 0)
                .unwrap_err()
                .downcast_ref::<ComtilesError>(),
            Some(ComtilesError::OutOfRange { zoom: 5, .. })
        ));
        assert!(matches!(
            geo.fragment_range_for_tile(0, 0, 0, 0, 0)
                .unwrap_err()
                .downcast_ref::<ComtilesError>(),
            Some(ComtilesError::NotFragmented(0))
        ));
        // corners are in range
        assert!(geo.index_offset_for_tile(1, 0, 0).is_ok());
        assert!(geo.index_offset_for_tile(1, 1, 1).is_ok());
    }

    #[test]
    fn test_slot_enumeration_matches_offset_arithmetic() {
        let geo = geometry(vec![
            matrix(0, -1, (0, 0, 0, 0)),
            matrix(1, -1, (0, 0, 1, 1)),
            matrix(2, 1, (1, 1, 3, 2)),
            matrix(4, 3, (3, 2, 13, 11)),
        ]);

        let mut count = 0u64;
        let mut fragment_firsts = 0u64;
        for slot in geo.tile_slots() {
            let computed = geo
                .index_offset_for_tile(slot.zoom, slot.col, slot.row)
                .unwrap();
            assert_eq!(computed.index, slot.index, "slot {slot:?}");
            if slot.fragment_first {
                fragment_firsts += 1;
            }
            count += 1;
        }
        assert_eq!(count, geo.total_tile_count());
        // zoom 2 and zoom 4 both span 2x2 fragment grids
        assert_eq!(fragment_firsts, 4 + 4);

        // the enumeration is dense and strictly increasing
        let indexes: Vec<u64> = geo.tile_slots().map(|s| s.index).collect();
        assert_eq!(indexes, (0..count).collect::<Vec<u64>>());
    }
}
