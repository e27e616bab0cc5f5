//! The JSON metadata document embedded after the archive header.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ComtilesError;

/// CRS identifier of the only supported tiling scheme.
pub const WEB_MERCATOR_QUAD: &str = "WebMercatorQuad";

/// The only supported fragment and tile ordering.
pub const ROW_MAJOR: &str = "RowMajor";

/// Tile payload format the reader accepts.
pub const TILE_FORMAT_PBF: &str = "pbf";

/// Aggregation coefficient value marking a pyramid zoom.
pub const PYRAMID_COEFFICIENT: i32 = -1;

/// Metadata document of an archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Human readable name of the tileset
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    /// Payload format of the tiles, `pbf` for Mapbox vector tiles
    pub tile_format: String,
    /// Tileset bounds as `[west, south, east, north]` degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_zoom: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_zoom: Option<u8>,
    /// The tiling scheme: extent and fragmentation policy per zoom
    pub tile_matrix_set: TileMatrixSet,
}

impl Metadata {
    /// Checks the payload format against what the reader supports.
    ///
    /// # Errors
    /// Will return [`ComtilesError::UnsupportedTileFormat`] for anything
    /// other than `pbf`.
    pub fn validate_tile_format(&self) -> Result<()> {
        if self.tile_format != TILE_FORMAT_PBF {
            return Err(ComtilesError::UnsupportedTileFormat(self.tile_format.clone()).into());
        }
        Ok(())
    }
}

/// The tile matrix set: one [`TileMatrix`] per zoom plus the CRS and
/// ordering fields. Unset CRS and orderings mean the defaults
/// (WebMercatorQuad, RowMajor).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixSet {
    #[serde(
        rename = "tileMatrixCRS",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub tile_matrix_crs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_ordering: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tile_ordering: Option<String>,
    pub tile_matrix: Vec<TileMatrix>,
}

impl TileMatrixSet {
    /// Builds a set with default CRS and orderings.
    #[must_use]
    pub const fn new(tile_matrix: Vec<TileMatrix>) -> Self {
        Self {
            tile_matrix_crs: None,
            fragment_ordering: None,
            tile_ordering: None,
            tile_matrix,
        }
    }
}

/// Description of one zoom level: extent and fragmentation policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrix {
    pub zoom: u8,
    /// `-1` marks a pyramid zoom; otherwise the fragment side length is
    /// `2^aggregationCoefficient` tiles
    pub aggregation_coefficient: i32,
    pub tile_matrix_limits: TileMatrixLimits,
}

impl TileMatrix {
    /// Whether this zoom belongs to the pyramid zone of the index.
    #[must_use]
    pub const fn is_pyramid(&self) -> bool {
        self.aggregation_coefficient == PYRAMID_COEFFICIENT
    }

    /// Fragment side length in tiles for a fragmented zoom.
    #[must_use]
    pub const fn fragment_span(&self) -> u64 {
        1 << self.aggregation_coefficient
    }
}

/// Inclusive tile bounds of a zoom level (or of a sparse fragment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMatrixLimits {
    pub min_tile_col: u64,
    pub min_tile_row: u64,
    pub max_tile_col: u64,
    pub max_tile_row: u64,
}

impl TileMatrixLimits {
    /// Number of tile columns covered.
    #[must_use]
    pub const fn width(&self) -> u64 {
        self.max_tile_col - self.min_tile_col + 1
    }

    /// Number of tile rows covered.
    #[must_use]
    pub const fn height(&self) -> u64 {
        self.max_tile_row - self.min_tile_row + 1
    }

    /// Total number of tiles covered.
    #[must_use]
    pub const fn tile_count(&self) -> u64 {
        self.width() * self.height()
    }

    /// Whether the address lies inside the bounds (inclusive on all four
    /// edges).
    #[must_use]
    pub const fn contains(&self, col: u64, row: u64) -> bool {
        col >= self.min_tile_col
            && col <= self.max_tile_col
            && row >= self.min_tile_row
            && row <= self.max_tile_row
    }
}
