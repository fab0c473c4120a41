//! Stored-sample wire codec.
//!
//! A sample block is serialized as an ASCII `SHAPE:<rows>,<cols>;` header
//! followed by the zlib-compressed row-major sample bytes. The header makes
//! stored blobs self-describing: decode recovers the exact matrix shape with
//! no out-of-band metadata, and a blob whose payload disagrees with its
//! declared shape is rejected rather than reinterpreted.

use crate::types::{FeatureSample, FEATURE_DIM};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

const HEADER_MAGIC: &[u8] = b"SHAPE:";
const HEADER_TERMINATOR: u8 = b';';
/// Upper bound on the ASCII header; anything longer is malformed.
const MAX_HEADER_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum CodecError {
    /// Header is missing, unparseable, or declares an unusable shape.
    #[error("malformed sample header: {0}")]
    Format(String),
    /// Payload is truncated, not valid zlib, or disagrees with the header.
    #[error("corrupt sample data: {0}")]
    Corrupt(String),
    #[error("sample block i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// A shape-tagged matrix of stored samples: `rows` samples of `cols` bytes each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBlock {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl SampleBlock {
    /// Build a block from row-major bytes. `data.len()` must equal `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<u8>) -> Result<Self, CodecError> {
        if rows == 0 || cols == 0 {
            return Err(CodecError::Format(format!("empty shape {rows}x{cols}")));
        }
        let expected = rows
            .checked_mul(cols)
            .ok_or_else(|| CodecError::Format(format!("shape {rows}x{cols} overflows")))?;
        if data.len() != expected {
            return Err(CodecError::Corrupt(format!(
                "{} bytes does not match shape {rows}x{cols}",
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Pack feature samples into a block, one sample per row.
    pub fn from_samples(samples: &[FeatureSample]) -> Result<Self, CodecError> {
        let mut data = Vec::with_capacity(samples.len() * FEATURE_DIM);
        for sample in samples {
            data.extend_from_slice(sample.pixels());
        }
        Self::new(samples.len(), FEATURE_DIM, data)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Iterate rows as raw byte slices.
    pub fn row_iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.cols)
    }
}

/// Serialize a block: shape header, then zlib-compressed row bytes.
pub fn encode(block: &SampleBlock) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(HEADER_MAGIC.len() + 16 + block.data.len() / 4);
    out.extend_from_slice(HEADER_MAGIC);
    out.extend_from_slice(format!("{},{}", block.rows, block.cols).as_bytes());
    out.push(HEADER_TERMINATOR);

    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder.write_all(&block.data)?;
    Ok(encoder.finish()?)
}

/// Deserialize a block previously produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<SampleBlock, CodecError> {
    let header_end = bytes
        .iter()
        .take(MAX_HEADER_LEN)
        .position(|&b| b == HEADER_TERMINATOR)
        .ok_or_else(|| CodecError::Format("missing header terminator".into()))?;

    let header = &bytes[..header_end];
    let shape = header
        .strip_prefix(HEADER_MAGIC)
        .ok_or_else(|| CodecError::Format("missing SHAPE magic".into()))?;
    let shape = std::str::from_utf8(shape)
        .map_err(|_| CodecError::Format("non-ASCII shape header".into()))?;
    let (rows_str, cols_str) = shape
        .split_once(',')
        .ok_or_else(|| CodecError::Format(format!("unparseable shape {shape:?}")))?;
    let rows: usize = rows_str
        .parse()
        .map_err(|_| CodecError::Format(format!("bad row count {rows_str:?}")))?;
    let cols: usize = cols_str
        .parse()
        .map_err(|_| CodecError::Format(format!("bad column count {cols_str:?}")))?;
    if rows == 0 || cols == 0 {
        return Err(CodecError::Format(format!("empty shape {rows}x{cols}")));
    }
    let expected = rows
        .checked_mul(cols)
        .ok_or_else(|| CodecError::Format(format!("shape {rows}x{cols} overflows")))?;

    // Cap inflation at the declared size: a payload that keeps going past the
    // header's promise is corrupt no matter what else it contains.
    let body = &bytes[header_end + 1..];
    let mut data = Vec::with_capacity(expected);
    let mut limited = ZlibDecoder::new(body).take(expected as u64 + 1);
    limited
        .read_to_end(&mut data)
        .map_err(|e| CodecError::Corrupt(format!("inflate: {e}")))?;
    if data.len() != expected {
        return Err(CodecError::Corrupt(format!(
            "payload is {} bytes, header declared {rows}x{cols}",
            data.len()
        )));
    }

    SampleBlock::new(rows, cols, data)
}
