//! Compression helpers and shared coordinate utilities.

use std::io::{Read, Write};

use anyhow::Result;
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;

/// Magic bytes opening a gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

/// Zlib-compresses a whole in-memory buffer.
///
/// # Errors
/// Will return an error if the encoder fails.
pub fn zlib_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Zlib-decompresses a whole in-memory buffer.
///
/// # Errors
/// Will return an error if the stream is not valid zlib.
pub fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Gunzips `data` when it is gzip-framed, otherwise passes it through.
///
/// Vector tile payloads coming out of MBTiles are conventionally gzipped;
/// the archive stores payloads verbatim, so the framing is sniffed here.
///
/// # Errors
/// Will return an error if a gzip-framed payload fails to decompress.
pub fn gunzip_if_gzip(data: Bytes) -> Result<Bytes> {
    if data.len() < GZIP_MAGIC.len() || data[0..2] != GZIP_MAGIC {
        return Ok(data);
    }
    let mut decoder = GzDecoder::new(&data[..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(Bytes::from(out))
}

/// Converts an XYZ row (origin north) to the TMS row (origin south) the
/// archive indexes by.
#[must_use]
pub const fn xyz_to_tms_row(zoom: u8, y: u64) -> u64 {
    (1 << zoom) - y - 1
}
