use anyhow::Result;
use deku::{bitvec::BitView, DekuContainerWrite, DekuRead, DekuUpdate, DekuWrite};

use crate::error::ComtilesError;

/// Size of the fixed archive header in bytes.
pub const HEADER_BYTES: u8 = 24;

/// Magic bytes opening every archive.
pub const MAGIC: &[u8; 4] = b"COMT";

/// Archive format version this crate reads and writes.
pub const FORMAT_VERSION: u32 = 1;

/// The fixed 24-byte header at the start of every archive.
///
/// Field order and widths are part of the file format: the magic, then
/// three little-endian lengths describing the metadata, compressed pyramid
/// index, and fragment index sections that follow.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"COMT")]
pub struct Header {
    /// Format version, currently always 1
    pub version: u32,
    /// Byte length of the UTF-8 JSON metadata document
    pub metadata_length: u32,
    /// Compressed byte length of the pyramid index
    pub pyramid_length: u32,
    /// Byte length of the fragment index
    pub fragments_length: u64,
}

impl Header {
    /// Builds a header for a new archive with the index lengths still
    /// unknown (they are back-patched once the sections are written).
    #[must_use]
    pub const fn placeholder(metadata_length: u32) -> Self {
        Self {
            version: FORMAT_VERSION,
            metadata_length,
            pyramid_length: 0,
            fragments_length: 0,
        }
    }

    /// Parses and validates a header from the start of `chunk`.
    ///
    /// # Errors
    /// Will return an error if `chunk` is shorter than the header, the
    /// magic does not match, or the version is unsupported.
    pub fn parse(chunk: &[u8]) -> Result<Self> {
        if chunk.len() < HEADER_BYTES as usize {
            return Err(ComtilesError::ShortRead {
                expected: u64::from(HEADER_BYTES),
                got: chunk.len() as u64,
            }
            .into());
        }
        if &chunk[0..4] != MAGIC {
            return Err(ComtilesError::BadMagic.into());
        }
        let (_, header) = Self::read(chunk[..HEADER_BYTES as usize].view_bits(), ())?;
        if header.version != FORMAT_VERSION {
            return Err(ComtilesError::UnsupportedVersion(header.version).into());
        }
        Ok(header)
    }

    /// Serializes the header to its 24-byte wire form.
    ///
    /// # Errors
    /// Will return an error if serialization fails.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(self.to_bytes()?)
    }

    /// Absolute byte offset of the pyramid index section.
    #[must_use]
    pub const fn pyramid_start(&self) -> u64 {
        HEADER_BYTES as u64 + self.metadata_length as u64
    }

    /// Absolute byte offset of the fragment index section.
    #[must_use]
    pub const fn fragments_start(&self) -> u64 {
        self.pyramid_start() + self.pyramid_length as u64
    }

    /// Absolute byte offset of the tile data section.
    #[must_use]
    pub const fn data_start(&self) -> u64 {
        self.fragments_start() + self.fragments_length
    }
}
