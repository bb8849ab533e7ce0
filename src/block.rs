//! Self-describing, optionally compressed chunk of container data.
//!
//! # On-disk layout
//! ```text
//! [ method:u8 | content_type:u8 | content_id:itf8 | compressed_len:itf8 | raw_len:itf8 ]
//! [ compressed payload: compressed_len bytes ]
//! ```
//! The payload on disk is always the *compressed* form, whichever form the
//! caller last set.
//!
//! # Two representations
//! A block holds its payload raw, compressed, or both.  The missing form is
//! derived on first access and cached; replacing one form through a setter
//! drops the other.  At least one form is present at all times.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use thiserror::Error;
use tracing::trace;

use crate::codec::{get_codec, CodecError, CompressionMethod};
use crate::itf8::{read_itf8, write_itf8};

// ── ContentType ─────────────────────────────────────────────────────────────

/// Role of a block inside a container.  The discriminant is the on-disk
/// ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    FileHeader        = 0,
    CompressionHeader = 1,
    ContainerHeader   = 2,
    MappedSlice       = 3,
    Reserved          = 4,
    External          = 5,
    Core              = 6,
}

impl ContentType {
    #[inline]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(ContentType::FileHeader),
            1 => Some(ContentType::CompressionHeader),
            2 => Some(ContentType::ContainerHeader),
            3 => Some(ContentType::MappedSlice),
            4 => Some(ContentType::Reserved),
            5 => Some(ContentType::External),
            6 => Some(ContentType::Core),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ContentType::FileHeader        => "FILE_HEADER",
            ContentType::CompressionHeader => "COMPRESSION_HEADER",
            ContentType::ContainerHeader   => "CONTAINER_HEADER",
            ContentType::MappedSlice       => "MAPPED_SLICE",
            ContentType::Reserved          => "RESERVED",
            ContentType::External          => "EXTERNAL",
            ContentType::Core              => "CORE",
        }
    }
}

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Unknown compression method ordinal {0}")]
    UnknownMethod(u8),
    #[error("Unknown block content type ordinal {0}")]
    UnknownContentType(u8),
    #[error("Block payload truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Block raw size mismatch: header declares {declared} bytes, payload decodes to {actual}")]
    RawSizeMismatch { declared: usize, actual: usize },
    #[error("Block content of {0} bytes does not fit the length field")]
    TooLarge(usize),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Block ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    method:          CompressionMethod,
    content_type:    ContentType,
    content_id:      u32,
    raw:             Option<Vec<u8>>,
    compressed:      Option<Vec<u8>>,
    raw_size:        usize,
    compressed_size: usize,
    /// Length the compressed form expands to; bounds decompression.
    declared_raw_size: usize,
}

impl Block {
    // ── Constructors ────────────────────────────────────────────────────────

    /// A block holding `raw`; the compressed form is derived on demand.
    pub fn new(
        method:       CompressionMethod,
        content_type: ContentType,
        content_id:   u32,
        raw:          Vec<u8>,
    ) -> Self {
        let mut block = Self {
            method,
            content_type,
            content_id,
            raw:             None,
            compressed:      None,
            raw_size:        0,
            compressed_size: 0,
            declared_raw_size: 0,
        };
        block.set_raw_content(raw);
        block
    }

    /// Uncompressed container-header block, content id 0.
    pub fn container_header(raw: Vec<u8>) -> Self {
        Self::new(CompressionMethod::Raw, ContentType::ContainerHeader, 0, raw)
    }

    /// Uncompressed core-data block, content id 0.
    pub fn core(raw: Vec<u8>) -> Self {
        Self::new(CompressionMethod::Raw, ContentType::Core, 0, raw)
    }

    /// Uncompressed file-header block, content id 0.
    pub fn file_header(raw: Vec<u8>) -> Self {
        Self::new(CompressionMethod::Raw, ContentType::FileHeader, 0, raw)
    }

    /// External data-series block addressed by `content_id`.
    pub fn external(method: CompressionMethod, content_id: u32, raw: Vec<u8>) -> Self {
        Self::new(method, ContentType::External, content_id, raw)
    }

    // ── Serialization ───────────────────────────────────────────────────────

    /// Deserialize one block.  The raw form is populated before returning.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, BlockError> {
        let method_ord = reader.read_u8()?;
        let method = CompressionMethod::from_ordinal(method_ord)
            .ok_or(BlockError::UnknownMethod(method_ord))?;
        let type_ord = reader.read_u8()?;
        let content_type = ContentType::from_ordinal(type_ord)
            .ok_or(BlockError::UnknownContentType(type_ord))?;

        let content_id      = read_itf8(&mut reader)?;
        let compressed_size = read_itf8(&mut reader)? as usize;
        let raw_size        = read_itf8(&mut reader)? as usize;

        // Grow with the data actually present rather than trusting the header.
        let mut payload = Vec::with_capacity(compressed_size.min(1 << 20));
        (&mut reader).take(compressed_size as u64).read_to_end(&mut payload)?;
        if payload.len() != compressed_size {
            return Err(BlockError::Truncated { expected: compressed_size, actual: payload.len() });
        }

        let mut block = Self {
            method,
            content_type,
            content_id,
            raw:             None,
            compressed:      None,
            raw_size:        0,
            compressed_size: 0,
            declared_raw_size: 0,
        };
        block.set_compressed_content(payload, raw_size);
        block.uncompress()?;
        if block.raw_size != raw_size {
            return Err(BlockError::RawSizeMismatch { declared: raw_size, actual: block.raw_size });
        }
        Ok(block)
    }

    /// Serialize the block.  Both forms are materialised first; the
    /// compressed bytes are what lands on disk.
    pub fn write<W: Write>(&mut self, mut writer: W) -> Result<(), BlockError> {
        self.compress()?;
        self.uncompress()?;

        let compressed_len = length_field(self.compressed_size)?;
        let raw_len        = length_field(self.raw_size)?;

        writer.write_u8(self.method.ordinal())?;
        writer.write_u8(self.content_type.ordinal())?;
        write_itf8(&mut writer, self.content_id)?;
        write_itf8(&mut writer, compressed_len)?;
        write_itf8(&mut writer, raw_len)?;
        writer.write_all(self.compressed.as_deref().unwrap_or_default())?;
        Ok(())
    }

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, BlockError> {
        let mut out = Vec::new();
        self.write(&mut out)?;
        Ok(out)
    }

    // ── Content access ──────────────────────────────────────────────────────

    /// Uncompressed payload, decompressing on first access.
    pub fn raw_content(&mut self) -> Result<&[u8], BlockError> {
        self.uncompress()?;
        Ok(self.raw.as_deref().unwrap_or_default())
    }

    /// Compressed payload, compressing on first access.
    pub fn compressed_content(&mut self) -> Result<&[u8], BlockError> {
        self.compress()?;
        Ok(self.compressed.as_deref().unwrap_or_default())
    }

    /// Replace the payload with new raw bytes.  Any cached compressed form
    /// is dropped.
    pub fn set_raw_content(&mut self, raw: Vec<u8>) {
        self.raw_size          = raw.len();
        self.declared_raw_size = raw.len();
        self.raw               = Some(raw);
        self.compressed        = None;
        self.compressed_size   = 0;
    }

    /// Replace the payload with new compressed bytes that expand to
    /// `raw_size` bytes.  Any cached raw form is dropped.
    pub(crate) fn set_compressed_content(&mut self, compressed: Vec<u8>, raw_size: usize) {
        self.compressed_size   = compressed.len();
        self.declared_raw_size = raw_size;
        self.compressed        = Some(compressed);
        self.raw               = None;
        self.raw_size          = 0;
    }

    /// Store both forms as given, with no derivation.  The caller asserts
    /// that the two are the same logical payload.
    pub fn set_content(&mut self, raw: Vec<u8>, compressed: Vec<u8>) {
        self.raw_size          = raw.len();
        self.declared_raw_size = raw.len();
        self.compressed_size   = compressed.len();
        self.raw               = Some(raw);
        self.compressed        = Some(compressed);
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    #[inline]
    pub fn is_uncompressed(&self) -> bool {
        self.raw.is_some()
    }

    // ── Lazy derivation ─────────────────────────────────────────────────────

    fn compress(&mut self) -> Result<(), BlockError> {
        let raw = match (&self.compressed, &self.raw) {
            (None, Some(raw)) => raw,
            _                 => return Ok(()),
        };
        let compressed = match self.method {
            CompressionMethod::Raw => raw.clone(),
            method                 => get_codec(method)?.compress(raw)?,
        };
        trace!(
            method = self.method.name(),
            content_id = self.content_id,
            raw = raw.len(),
            compressed = compressed.len(),
            "block compressed"
        );
        self.compressed_size = compressed.len();
        self.compressed = Some(compressed);
        Ok(())
    }

    fn uncompress(&mut self) -> Result<(), BlockError> {
        let compressed = match (&self.raw, &self.compressed) {
            (None, Some(compressed)) => compressed,
            _                        => return Ok(()),
        };
        let raw = match self.method {
            CompressionMethod::Raw => compressed.clone(),
            method                 => get_codec(method)?.decompress(compressed, self.declared_raw_size)?,
        };
        trace!(
            method = self.method.name(),
            content_id = self.content_id,
            compressed = compressed.len(),
            raw = raw.len(),
            "block uncompressed"
        );
        self.raw_size = raw.len();
        self.raw = Some(raw);
        Ok(())
    }

    // ── Metadata ────────────────────────────────────────────────────────────

    pub fn method(&self) -> CompressionMethod { self.method }
    pub fn content_type(&self) -> ContentType { self.content_type }
    pub fn content_id(&self) -> u32 { self.content_id }
    pub fn set_content_id(&mut self, content_id: u32) { self.content_id = content_id; }
    pub fn raw_content_size(&self) -> usize { self.raw_size }
    pub fn compressed_content_size(&self) -> usize { self.compressed_size }
}

fn length_field(len: usize) -> Result<u32, BlockError> {
    u32::try_from(len).map_err(|_| BlockError::TooLarge(len))
}

fn preview(buf: &Option<Vec<u8>>) -> String {
    match buf {
        Some(b) => format!("{:?}", &b[..b.len().min(5)]),
        None    => "NULL".to_string(),
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "method={}, type={}, id={}, raw size={}, compressed size={}, raw={}, comp={}.",
            self.method.name(),
            self.content_type.name(),
            self.content_id,
            self.raw_size,
            self.compressed_size,
            preview(&self.raw),
            preview(&self.compressed),
        )
    }
}
