//! Compression methods for track and block-group images
//!
//! The first byte of every stored image names the method used for the
//! body that follows the 5-byte image header:
//!
//! - `0` none: body stored as-is
//! - `1` zlib: always available
//! - `2` bzip2: available with the `bzip2` cargo feature
//!
//! Both compressed formats are self-delimiting, which the recovery scanner
//! relies on through [`stream_extent`].

use crate::error::{CckdError, Result};
use flate2::{Decompress, FlushDecompress, Status};
use std::io::Write;

/// Compression method tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[repr(u8)]
pub enum CompressionMethod {
    /// No compression
    None = 0,
    /// zlib (deflate with zlib framing)
    Zlib = 1,
    /// bzip2
    Bzip2 = 2,
}

impl CompressionMethod {
    /// Convert from the tag byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionMethod::None),
            1 => Some(CompressionMethod::Zlib),
            2 => Some(CompressionMethod::Bzip2),
            _ => None,
        }
    }

    /// Whether this build can decode the method
    pub fn is_supported(self) -> bool {
        match self {
            CompressionMethod::None | CompressionMethod::Zlib => true,
            CompressionMethod::Bzip2 => cfg!(feature = "bzip2"),
        }
    }
}

/// True if `tag` names a method this build can decode
pub fn tag_supported(tag: u8) -> bool {
    CompressionMethod::from_u8(tag).map_or(false, CompressionMethod::is_supported)
}

/// Compress data using the specified method
pub fn compress(data: &[u8], method: CompressionMethod) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => Ok(data.to_vec()),
        CompressionMethod::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionMethod::Bzip2 => bzip2_compress(data),
    }
}

#[cfg(feature = "bzip2")]
fn bzip2_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(not(feature = "bzip2"))]
fn bzip2_compress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(CckdError::Compression(
        "bzip2 support not compiled in".to_string(),
    ))
}

/// Decompress a complete body, refusing output larger than `max_out`
pub fn decompress(data: &[u8], method: CompressionMethod, max_out: usize) -> Result<Vec<u8>> {
    match method {
        CompressionMethod::None => {
            if data.len() > max_out {
                return Err(CckdError::Compression(format!(
                    "uncompressed body of {} bytes exceeds {}",
                    data.len(),
                    max_out
                )));
            }
            Ok(data.to_vec())
        }
        _ => stream_extent(data, method, max_out)
            .map(|(_, out)| out)
            .ok_or_else(|| {
                CckdError::Compression(format!("{:?} stream is corrupt or too large", method))
            }),
    }
}

/// Decode one compressed stream from the front of `data`
///
/// Returns the number of input bytes the stream occupies together with the
/// decoded output, or `None` if the bytes are not a complete stream that
/// expands to at most `max_out` bytes.
pub fn stream_extent(
    data: &[u8],
    method: CompressionMethod,
    max_out: usize,
) -> Option<(usize, Vec<u8>)> {
    match method {
        CompressionMethod::None => None,
        CompressionMethod::Zlib => zlib_extent(data, max_out),
        CompressionMethod::Bzip2 => bzip2_extent(data, max_out),
    }
}

fn zlib_extent(data: &[u8], max_out: usize) -> Option<(usize, Vec<u8>)> {
    let mut inflater = Decompress::new(true);
    let mut out = Vec::with_capacity(max_out + 1);

    loop {
        let before = (inflater.total_in(), inflater.total_out());
        let consumed = inflater.total_in() as usize;
        let status = inflater
            .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
            .ok()?;

        if status == Status::StreamEnd {
            return (out.len() <= max_out).then(|| (inflater.total_in() as usize, out));
        }
        if out.len() > max_out || (inflater.total_in(), inflater.total_out()) == before {
            return None;
        }
    }
}

#[cfg(feature = "bzip2")]
fn bzip2_extent(data: &[u8], max_out: usize) -> Option<(usize, Vec<u8>)> {
    let mut decoder = bzip2::Decompress::new(false);
    let mut out = Vec::with_capacity(max_out + 1);

    loop {
        let before = (decoder.total_in(), decoder.total_out());
        let consumed = decoder.total_in() as usize;
        let status = decoder.decompress_vec(&data[consumed..], &mut out).ok()?;

        if status == bzip2::Status::StreamEnd {
            return (out.len() <= max_out).then(|| (decoder.total_in() as usize, out));
        }
        if out.len() > max_out || (decoder.total_in(), decoder.total_out()) == before {
            return None;
        }
    }
}

#[cfg(not(feature = "bzip2"))]
fn bzip2_extent(_data: &[u8], _max_out: usize) -> Option<(usize, Vec<u8>)> {
    None
}
