use thiserror::Error;

#[derive(Error, Debug)]
/// An error which occurred within the present crate
#[allow(clippy::module_name_repetitions)]
pub enum ComtilesError {
    /// The first four bytes of the archive were not the `COMT` magic
    #[error("not a COMTiles archive (bad magic)")]
    BadMagic,

    /// The archive was written with a format version this crate cannot read
    #[error("unsupported archive version {0}, expected 1")]
    UnsupportedVersion(u32),

    /// The tile matrix set uses a CRS other than WebMercatorQuad
    #[error("unsupported CRS {0:?}, only WebMercatorQuad is supported")]
    UnsupportedCrs(String),

    /// Fragments or tiles are ordered by something other than RowMajor
    #[error("unsupported {kind} ordering {value:?}, only RowMajor is supported")]
    UnsupportedOrdering {
        /// Which ordering field was rejected (`fragment` or `tile`)
        kind: &'static str,
        /// The rejected value
        value: String,
    },

    /// The archive holds tiles in a payload format other than pbf
    #[error("unsupported tile format {0:?}, only pbf is supported")]
    UnsupportedTileFormat(String),

    /// The pyramid index does not fit inside the initial header fetch
    #[error("pyramid index ends at byte {pyramid_end} which is beyond the initial {chunk_size} byte fetch")]
    PyramidTruncated {
        /// Absolute end of the pyramid section
        pyramid_end: u64,
        /// Size of the initial chunk the reader fetches
        chunk_size: u64,
    },

    /// The decompressed pyramid index disagrees with the tile matrix set
    #[error("decompressed pyramid index is {got} bytes, tile matrix set requires {expected}")]
    PyramidLengthMismatch {
        /// Byte length implied by the pyramid tile count
        expected: u64,
        /// Byte length actually decompressed
        got: u64,
    },

    /// A tile address lies outside the tile matrix limits of its zoom
    #[error("tile {zoom}/{col}/{row} is outside the tile matrix limits")]
    OutOfRange {
        /// Zoom level of the request
        zoom: u8,
        /// Requested column
        col: u64,
        /// Requested TMS row
        row: u64,
    },

    /// A fragment operation was requested for a pyramid zoom
    #[error("zoom {0} lies in the pyramid and has no fragments")]
    NotFragmented(u8),

    /// A tile payload exceeds the 20-bit size limit of the index
    #[error("tile {zoom}/{col}/{row} is {size} bytes, larger than the {max} byte limit")]
    TileTooLarge {
        /// Zoom level of the offending tile
        zoom: u8,
        /// Column of the offending tile
        col: u64,
        /// TMS row of the offending tile
        row: u64,
        /// Offending payload size
        size: u64,
        /// Maximum encodable size
        max: u64,
    },

    /// The cumulative data section offset left the 40-bit range
    #[error("data section offset {0} no longer fits in 40 bits")]
    OffsetOverflow(u64),

    /// The operation was cancelled through its cancellation token
    #[error("operation cancelled")]
    Cancelled,

    /// The object store returned fewer bytes than the requested range
    #[error("short read: requested {expected} bytes, store returned {got}")]
    ShortRead {
        /// Bytes the range asked for
        expected: u64,
        /// Bytes actually returned
        got: u64,
    },

    /// The tile provider emitted records out of index order
    #[error("tile record {zoom}/{col}/{row} arrived out of index order")]
    RecordOutOfOrder {
        /// Zoom level of the offending record
        zoom: u8,
        /// Column of the offending record
        col: u64,
        /// TMS row of the offending record
        row: u64,
    },

    /// The payload pass disagreed with the sizes recorded in the index pass
    #[error("tile payloads total {got} bytes but the index recorded {expected}")]
    DataLengthMismatch {
        /// Total payload bytes the index pass recorded
        expected: u64,
        /// Total payload bytes the data pass produced
        got: u64,
    },

    /// The tile matrix set is structurally invalid
    #[error("invalid tile matrix set: {0}")]
    InvalidTileMatrixSet(String),
}
