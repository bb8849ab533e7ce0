//! Containers: one framed batch of blocks plus the header metadata the
//! security layer keys on.
//!
//! # On-disk layout
//! All fixed-width fields are little-endian.
//! ```text
//! [ body_len:u32 | crc32(body):u32 ]
//! body = [ container_id:itf8 | pos_start:u64 | pos_end:u64 | salt:u64 ]
//!        [ block_count:itf8 ][ block ]*
//! ```
//! A stream is a plain concatenation of containers.  End of stream is a clean
//! EOF exactly at a container boundary; EOF anywhere else is truncation.
//!
//! # External blocks
//! Blocks of type [`ContentType::External`] are indexed by content id and
//! must be unique within a container.  The block with id
//! [`SENSITIVE_BLOCK_CONTENT_ID`] carries the encrypted payload.  It is
//! stored with [`CompressionMethod::Raw`] because reads uncompress eagerly;
//! any compression happens before encryption, inside the payload.
//!
//! [`CompressionMethod::Raw`]: crate::codec::CompressionMethod::Raw

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use thiserror::Error;

use crate::block::{Block, BlockError, ContentType};
use crate::itf8::{read_itf8, write_itf8};

/// Content id reserved for the per-container encrypted block.
pub const SENSITIVE_BLOCK_CONTENT_ID: u32 = 0x5345_4e53; // "SENS"

/// Byte length of the fixed `[body_len | crc32]` prefix.
pub const CONTAINER_PREFIX_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("Container truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Container checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("Duplicate external block content id {0}")]
    DuplicateContentId(u32),
    #[error("Container body has {0} trailing bytes after its last block")]
    TrailingBytes(usize),
    #[error("Container body of {0} bytes does not fit the length field")]
    TooLarge(usize),
    #[error("Block error: {0}")]
    Block(#[from] BlockError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub container_id:       u32,
    /// First genomic position covered; the security filter gates on this.
    pub absolute_pos_start: u64,
    pub absolute_pos_end:   u64,
    /// Per-container key-derivation salt.
    pub container_salt:     u64,
    /// Non-external blocks, in stream order.
    pub blocks:             Vec<Block>,
    /// External blocks keyed by content id.
    pub external:           BTreeMap<u32, Block>,
}

impl Container {
    pub fn new(container_id: u32, absolute_pos_start: u64, absolute_pos_end: u64, container_salt: u64) -> Self {
        Self {
            container_id,
            absolute_pos_start,
            absolute_pos_end,
            container_salt,
            ..Default::default()
        }
    }

    /// Add a block, routing external blocks into the content-id map.
    pub fn add_block(&mut self, block: Block) -> Result<(), ContainerError> {
        if block.content_type() != ContentType::External {
            self.blocks.push(block);
            return Ok(());
        }
        let id = block.content_id();
        if self.external.contains_key(&id) {
            return Err(ContainerError::DuplicateContentId(id));
        }
        self.external.insert(id, block);
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len() + self.external.len()
    }

    pub fn sensitive_block(&self) -> Option<&Block> {
        self.external.get(&SENSITIVE_BLOCK_CONTENT_ID)
    }

    pub fn sensitive_block_mut(&mut self) -> Option<&mut Block> {
        self.external.get_mut(&SENSITIVE_BLOCK_CONTENT_ID)
    }

    /// Serialize the container.  Blocks are written non-external first, then
    /// external in content-id order.
    pub fn write<W: Write>(&mut self, mut writer: W) -> Result<(), ContainerError> {
        let mut body = Vec::new();
        write_itf8(&mut body, self.container_id)?;
        body.write_u64::<LittleEndian>(self.absolute_pos_start)?;
        body.write_u64::<LittleEndian>(self.absolute_pos_end)?;
        body.write_u64::<LittleEndian>(self.container_salt)?;

        let count = u32::try_from(self.block_count())
            .map_err(|_| ContainerError::TooLarge(self.block_count()))?;
        write_itf8(&mut body, count)?;
        for block in self.blocks.iter_mut().chain(self.external.values_mut()) {
            block.write(&mut body)?;
        }

        let body_len = u32::try_from(body.len()).map_err(|_| ContainerError::TooLarge(body.len()))?;
        let mut hasher = Hasher::new();
        hasher.update(&body);

        writer.write_u32::<LittleEndian>(body_len)?;
        writer.write_u32::<LittleEndian>(hasher.finalize())?;
        writer.write_all(&body)?;
        Ok(())
    }
}

/// Read the next container.
///
/// Returns `Ok(None)` on a clean end of stream (no bytes left at a container
/// boundary).  Any other short read is [`ContainerError::Truncated`].
pub fn read_container<R: Read>(mut reader: R) -> Result<Option<Container>, ContainerError> {
    let mut prefix = [0u8; CONTAINER_PREFIX_LEN];
    let got = read_up_to(&mut reader, &mut prefix)?;
    if got == 0 {
        return Ok(None);
    }
    if got < CONTAINER_PREFIX_LEN {
        return Err(ContainerError::Truncated { expected: CONTAINER_PREFIX_LEN, actual: got });
    }

    let mut fixed = Cursor::new(prefix);
    let body_len = fixed.read_u32::<LittleEndian>()? as usize;
    let stored   = fixed.read_u32::<LittleEndian>()?;

    let mut body = Vec::with_capacity(body_len.min(1 << 20));
    (&mut reader).take(body_len as u64).read_to_end(&mut body)?;
    if body.len() != body_len {
        return Err(ContainerError::Truncated { expected: body_len, actual: body.len() });
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let computed = hasher.finalize();
    if computed != stored {
        return Err(ContainerError::ChecksumMismatch { stored, computed });
    }

    let mut cur = Cursor::new(body.as_slice());
    let container_id       = read_itf8(&mut cur)?;
    let absolute_pos_start = cur.read_u64::<LittleEndian>()?;
    let absolute_pos_end   = cur.read_u64::<LittleEndian>()?;
    let container_salt     = cur.read_u64::<LittleEndian>()?;
    let block_count        = read_itf8(&mut cur)?;

    let mut container = Container::new(container_id, absolute_pos_start, absolute_pos_end, container_salt);
    for _ in 0..block_count {
        container.add_block(Block::read(&mut cur)?)?;
    }

    let trailing = body.len() - cur.position() as usize;
    if trailing != 0 {
        return Err(ContainerError::TrailingBytes(trailing));
    }
    Ok(Some(container))
}

/// Fill `buf` as far as the stream allows; returns the byte count read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressionMethod;

    fn sample(id: u32) -> Container {
        let mut c = Container::new(id, 1_000 * id as u64, 1_000 * id as u64 + 999, 0xdead_beef + id as u64);
        c.add_block(Block::container_header(b"hdr".to_vec())).unwrap();
        c.add_block(Block::core(vec![1, 2, 3, 4])).unwrap();
        c.add_block(Block::external(CompressionMethod::Gzip, 11, b"quality".repeat(20))).unwrap();
        c.add_block(Block::external(CompressionMethod::Raw, SENSITIVE_BLOCK_CONTENT_ID, b"secret".to_vec()))
            .unwrap();
        c
    }

    #[test]
    fn write_then_read_roundtrips() {
        let mut buf = Vec::new();
        let mut a = sample(1);
        let mut b = sample(2);
        a.write(&mut buf).unwrap();
        b.write(&mut buf).unwrap();

        let mut cur = Cursor::new(buf);
        let first = read_container(&mut cur).unwrap().unwrap();
        let second = read_container(&mut cur).unwrap().unwrap();
        assert!(read_container(&mut cur).unwrap().is_none());

        assert_eq!(first, a);
        assert_eq!(second.container_id, 2);
        assert_eq!(second.absolute_pos_start, 2_000);
        assert_eq!(second.block_count(), 4);
        assert_eq!(second.sensitive_block().unwrap().content_id(), SENSITIVE_BLOCK_CONTENT_ID);
    }

    #[test]
    fn empty_stream_is_clean_end() {
        assert!(read_container(Cursor::new(Vec::<u8>::new())).unwrap().is_none());
    }

    #[test]
    fn partial_prefix_is_truncation() {
        let err = read_container(Cursor::new(vec![1u8, 2, 3])).unwrap_err();
        assert!(matches!(err, ContainerError::Truncated { expected: 8, actual: 3 }));
    }

    #[test]
    fn short_body_is_truncation() {
        let mut buf = Vec::new();
        sample(3).write(&mut buf).unwrap();
        buf.truncate(buf.len() - 4);
        assert!(matches!(
            read_container(Cursor::new(buf)).unwrap_err(),
            ContainerError::Truncated { .. }
        ));
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut buf = Vec::new();
        sample(4).write(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0x40;
        assert!(matches!(
            read_container(Cursor::new(buf)).unwrap_err(),
            ContainerError::ChecksumMismatch { .. }
        ));
    }

    #[test]
    fn duplicate_external_id_rejected() {
        let mut c = Container::new(1, 0, 0, 0);
        c.add_block(Block::external(CompressionMethod::Raw, 9, vec![1])).unwrap();
        let err = c.add_block(Block::external(CompressionMethod::Raw, 9, vec![2])).unwrap_err();
        assert!(matches!(err, ContainerError::DuplicateContentId(9)));
    }
}
