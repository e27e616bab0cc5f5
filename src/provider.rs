//! The producer-side source of tiles.

use anyhow::Result;

/// One tile of the index pass: address and payload size, no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRecord {
    pub zoom: u8,
    pub col: u64,
    /// TMS row (origin south), the convention MBTiles already uses
    pub row: u64,
    /// Payload size in bytes; 0 marks a missing tile
    pub size: u32,
}

/// One tile of the data pass: address and payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePayload {
    pub zoom: u8,
    pub col: u64,
    /// TMS row (origin south)
    pub row: u64,
    pub data: Vec<u8>,
}

/// A restartable source of tiles in index order.
///
/// The writer makes two passes: first over [`tile_records`] to lay out the
/// index, then over [`tile_payloads`] to stream the data section. Both
/// passes must yield the same tiles in the same order: zooms ascending,
/// plain row-major inside pyramid zooms, and fragment-major (fragments
/// row-major, tiles row-major within each fragment) at fragmented zooms.
/// Missing tiles may either be skipped or yielded with `size == 0`.
///
/// [`tile_records`]: Self::tile_records
/// [`tile_payloads`]: Self::tile_payloads
pub trait TileProvider {
    /// Starts the index pass.
    ///
    /// # Errors
    /// Will return an error if the underlying source cannot be queried.
    fn tile_records(&mut self) -> Result<Box<dyn Iterator<Item = Result<TileRecord>> + '_>>;

    /// Starts the data pass.
    ///
    /// # Errors
    /// Will return an error if the underlying source cannot be queried.
    fn tile_payloads(&mut self) -> Result<Box<dyn Iterator<Item = Result<TilePayload>> + '_>>;
}

/// A [`TileProvider`] over an in-memory tile list, mostly for tests and
/// small fixture archives.
#[derive(Debug, Default, Clone)]
pub struct MemoryTileProvider {
    tiles: Vec<TilePayload>,
}

impl MemoryTileProvider {
    /// Builds a provider from tiles already in index order.
    #[must_use]
    pub const fn new(tiles: Vec<TilePayload>) -> Self {
        Self { tiles }
    }

    /// Appends a tile; callers keep the list in index order themselves.
    pub fn push(&mut self, zoom: u8, col: u64, row: u64, data: Vec<u8>) {
        self.tiles.push(TilePayload {
            zoom,
            col,
            row,
            data,
        });
    }
}

impl TileProvider for MemoryTileProvider {
    fn tile_records(&mut self) -> Result<Box<dyn Iterator<Item = Result<TileRecord>> + '_>> {
        Ok(Box::new(self.tiles.iter().map(|tile| {
            Ok(TileRecord {
                zoom: tile.zoom,
                col: tile.col,
                row: tile.row,
                size: u32::try_from(tile.data.len())?,
            })
        })))
    }

    fn tile_payloads(&mut self) -> Result<Box<dyn Iterator<Item = Result<TilePayload>> + '_>> {
        Ok(Box::new(self.tiles.iter().map(|tile| Ok(tile.clone()))))
    }
}
