//! Block compression methods and their codecs.
//!
//! # Identity rules
//! A block's method is written to disk as a single ordinal byte.  The
//! ordinals are frozen in declaration order of [`CompressionMethod`] and are
//! shared with CRAM 3.0; a reader that meets an ordinal outside that range
//! MUST fail the block rather than guess.
//!
//! Some ordinals are recognised but have no codec in this build (`Bzip2`).
//! Those decode as a valid method and only fail when the block's content is
//! actually (de)compressed, with [`CodecError::UnsupportedMethod`].

pub mod rans;

use std::io::{self, Read, Write};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

// ── CompressionMethod ────────────────────────────────────────────────────────

/// On-disk compression method tag.  The discriminant is the ordinal byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressionMethod {
    Raw   = 0,
    Gzip  = 1,
    Bzip2 = 2,
    Lzma  = 3,
    Rans  = 4,
}

impl CompressionMethod {
    #[inline]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Resolve an on-disk ordinal.  Returns `None` for unknown values.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(CompressionMethod::Raw),
            1 => Some(CompressionMethod::Gzip),
            2 => Some(CompressionMethod::Bzip2),
            3 => Some(CompressionMethod::Lzma),
            4 => Some(CompressionMethod::Rans),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics and CLI only).
    pub fn name(self) -> &'static str {
        match self {
            CompressionMethod::Raw   => "raw",
            CompressionMethod::Gzip  => "gzip",
            CompressionMethod::Bzip2 => "bzip2",
            CompressionMethod::Lzma  => "lzma",
            CompressionMethod::Rans  => "rans",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "raw"   => Some(CompressionMethod::Raw),
            "gzip"  => Some(CompressionMethod::Gzip),
            "bzip2" => Some(CompressionMethod::Bzip2),
            "lzma"  => Some(CompressionMethod::Lzma),
            "rans"  => Some(CompressionMethod::Rans),
            _       => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    /// Compressing internally produced raw bytes failed.  This is an
    /// invariant violation, not a data error.
    #[error("Compression error: {0}")]
    Compression(String),
    /// Compressed bytes read from a stream are corrupt.
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Compression method '{}' is not supported by this build", .0.name())]
    UnsupportedMethod(CompressionMethod),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn method(&self) -> CompressionMethod;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Decompress `data`, which the block header says expands to `raw_size`
    /// bytes.  Output beyond `raw_size` is never materialised; it fails with
    /// [`CodecError::Decompression`].
    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>, CodecError>;
}

fn oversized(raw_size: usize) -> CodecError {
    CodecError::Decompression(format!("output exceeds declared raw size of {raw_size} bytes"))
}

/// Sink that refuses to grow past `limit` bytes.
struct BoundedSink {
    out:   Vec<u8>,
    limit: usize,
}

impl Write for BoundedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.out.len() + buf.len() > self.limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "output exceeds declared raw size"));
        }
        self.out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct RawCodec;
impl Codec for RawCodec {
    fn method(&self) -> CompressionMethod { CompressionMethod::Raw }
    fn compress(&self, data: &[u8])   -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _raw_size: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct GzipCodec;
impl Codec for GzipCodec {
    fn method(&self) -> CompressionMethod { CompressionMethod::Gzip }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        enc.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }
    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(raw_size.min(1 << 20));
        GzDecoder::new(data)
            .take(raw_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        if out.len() > raw_size {
            return Err(oversized(raw_size));
        }
        Ok(out)
    }
}

/// CRAM's LZMA method is an xz stream.
pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn method(&self) -> CompressionMethod { CompressionMethod::Lzma }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::xz_compress(&mut io::Cursor::new(data), &mut out)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>, CodecError> {
        let mut sink = BoundedSink { out: Vec::with_capacity(raw_size.min(1 << 20)), limit: raw_size };
        lzma_rs::xz_decompress(&mut io::Cursor::new(data), &mut sink)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(sink.out)
    }
}

/// rANS 4x8.  Blocks are always written with the order-1 model; both orders
/// decode.
pub struct RansCodec;
impl Codec for RansCodec {
    fn method(&self) -> CompressionMethod { CompressionMethod::Rans }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        rans::compress(data, rans::Order::One)
    }
    fn decompress(&self, data: &[u8], raw_size: usize) -> Result<Vec<u8>, CodecError> {
        rans::decompress(data, raw_size)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a method to its codec.
///
/// Returns `Err(CodecError::UnsupportedMethod)` for methods this build
/// recognises but cannot run.  The caller MUST NOT fall back to another codec.
pub fn get_codec(method: CompressionMethod) -> Result<Box<dyn Codec>, CodecError> {
    match method {
        CompressionMethod::Raw   => Ok(Box::new(RawCodec)),
        CompressionMethod::Gzip  => Ok(Box::new(GzipCodec)),
        CompressionMethod::Lzma  => Ok(Box::new(LzmaCodec)),
        CompressionMethod::Rans  => Ok(Box::new(RansCodec)),
        CompressionMethod::Bzip2 => Err(CodecError::UnsupportedMethod(method)),
    }
}
