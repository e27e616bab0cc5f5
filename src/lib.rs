//! # `COMTiles`
//!
//! A single-file archive format for vector map tiles ("Cloud-Optimized
//! Map Tiles"). One archive on any HTTP range-capable object store bundles
//! metadata, a two-part tile index, and the concatenated tile payloads, so
//! a client resolves any `z/x/y` tile with one or two ranged reads and no
//! server-side logic.
//!
//! The low zooms live in a zlib-compressed *pyramid* index that is loaded
//! in full up front; the high zooms are split into *fragments* (square
//! tile blocks) fetched and cached individually.
//!
//! ## Examples
//!
//! ### Reading tiles from a remote archive
//! ```rust,no_run
//! use comtiles::{ArchiveReader, TileAddress};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let reader = ArchiveReader::create("https://example.com/planet.comt", None).await?;
//!
//!     if let Some(tile) = reader.get_tile(TileAddress::new(5, 16, 10), None).await? {
//!         println!("got {} tile bytes", tile.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### Writing an archive from an MBTiles database
//! ```rust,no_run
//! use comtiles::{ArchiveWriter, MbtilesSource};
//! use std::path::Path;
//! use tokio::{fs::File, io::BufWriter};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (mut source, metadata) = MbtilesSource::open(Path::new("planet.mbtiles"), 7, 8)?;
//!     let writer = ArchiveWriter::new(metadata)?;
//!
//!     let mut output = BufWriter::new(File::create("planet.comt").await?);
//!     let summary = writer.write(&mut source, &mut output).await?;
//!     println!("wrote {} tiles", summary.tiles_written);
//!     Ok(())
//! }
//! ```

#![warn(clippy::cargo)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::multiple_crate_versions)]

/// Coalesces concurrent tile reads into merged range requests.
pub mod batch;

mod cache;

/// Little-endian integer primitives for the tile index.
pub mod codec;

/// Errors for the module
pub mod error;

/// Ranged access to the object store holding an archive.
pub mod fetch;

/// Tile address to byte offset arithmetic.
pub mod geometry;

mod header;

/// The archive's JSON metadata document.
pub mod metadata;

/// `MBTiles` databases as a tile source.
pub mod mbtiles;

/// The producer-side tile stream.
pub mod provider;

/// Reads a `COMTiles` archive.
pub mod reader;

mod util;

/// Writes a `COMTiles` archive.
pub mod writer;

pub use error::ComtilesError;
pub use fetch::{ByteRange, HttpRangeReader, MemoryRangeReader, RangeReader};
pub use geometry::{FragmentRange, IndexGeometry, IndexSlot, TileSlot};
pub use header::{Header, FORMAT_VERSION, HEADER_BYTES, MAGIC};
pub use mbtiles::MbtilesSource;
pub use metadata::{Metadata, TileMatrix, TileMatrixLimits, TileMatrixSet};
pub use provider::{MemoryTileProvider, TilePayload, TileProvider, TileRecord};
pub use reader::{ArchiveReader, TileAddress, TileEntry};
pub use writer::{ArchiveWriter, WriteSummary};
