//! ITF8: the self-delimiting unsigned integer encoding used by every block
//! and container header field.
//!
//! The count of leading 1-bits in the first byte gives the number of
//! continuation bytes that follow:
//!
//! | Range                    | Bytes | First byte   |
//! |--------------------------|-------|--------------|
//! | `0 ..= 0x7f`             | 1     | `0xxxxxxx`   |
//! | `0x80 ..= 0x3fff`        | 2     | `10xxxxxx`   |
//! | `0x4000 ..= 0x1f_ffff`   | 3     | `110xxxxx`   |
//! | `0x20_0000 ..= 0xfff_ffff` | 4   | `1110xxxx`   |
//! | `0x1000_0000 ..= u32::MAX` | 5   | `1111xxxx`   |
//!
//! In the 5-byte form only the low nibble of the last byte is significant.
//! Continuation bytes are big-endian.

use std::io::{self, Read, Write};
use byteorder::{ReadBytesExt, WriteBytesExt};

/// Number of bytes `value` occupies once encoded.
pub fn itf8_len(value: u32) -> usize {
    match value {
        0..=0x7f                 => 1,
        0x80..=0x3fff            => 2,
        0x4000..=0x1f_ffff       => 3,
        0x20_0000..=0xfff_ffff   => 4,
        _                        => 5,
    }
}

/// Write `value` and return the number of bytes emitted.
pub fn write_itf8<W: Write>(mut writer: W, value: u32) -> io::Result<usize> {
    let len = itf8_len(value);
    match len {
        1 => writer.write_u8(value as u8)?,
        2 => {
            writer.write_u8(0x80 | (value >> 8) as u8)?;
            writer.write_u8(value as u8)?;
        }
        3 => {
            writer.write_u8(0xc0 | (value >> 16) as u8)?;
            writer.write_u8((value >> 8) as u8)?;
            writer.write_u8(value as u8)?;
        }
        4 => {
            writer.write_u8(0xe0 | (value >> 24) as u8)?;
            writer.write_u8((value >> 16) as u8)?;
            writer.write_u8((value >> 8) as u8)?;
            writer.write_u8(value as u8)?;
        }
        _ => {
            writer.write_u8(0xf0 | ((value >> 28) & 0x0f) as u8)?;
            writer.write_u8((value >> 20) as u8)?;
            writer.write_u8((value >> 12) as u8)?;
            writer.write_u8((value >> 4) as u8)?;
            writer.write_u8((value & 0x0f) as u8)?;
        }
    }
    Ok(len)
}

/// Read one value.  A stream that ends mid-value yields `UnexpectedEof`.
pub fn read_itf8<R: Read>(mut reader: R) -> io::Result<u32> {
    let b0 = reader.read_u8()? as u32;

    if b0 & 0x80 == 0 {
        return Ok(b0);
    }
    if b0 & 0x40 == 0 {
        let b1 = reader.read_u8()? as u32;
        return Ok(((b0 & 0x3f) << 8) | b1);
    }
    if b0 & 0x20 == 0 {
        let mut rest = [0u8; 2];
        reader.read_exact(&mut rest)?;
        return Ok(((b0 & 0x1f) << 16) | (rest[0] as u32) << 8 | rest[1] as u32);
    }
    if b0 & 0x10 == 0 {
        let mut rest = [0u8; 3];
        reader.read_exact(&mut rest)?;
        return Ok(((b0 & 0x0f) << 24)
            | (rest[0] as u32) << 16
            | (rest[1] as u32) << 8
            | rest[2] as u32);
    }

    let mut rest = [0u8; 4];
    reader.read_exact(&mut rest)?;
    Ok(((b0 & 0x0f) << 28)
        | (rest[0] as u32) << 20
        | (rest[1] as u32) << 12
        | (rest[2] as u32) << 4
        | (rest[3] as u32 & 0x0f))
}

/// Encode into a fresh buffer.
pub fn encode_itf8(value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(itf8_len(value));
    // Writing into a Vec cannot fail.
    let _ = write_itf8(&mut out, value);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn boundary_values_roundtrip_with_expected_length() {
        let cases: &[(u32, usize)] = &[
            (0, 1), (0x7f, 1),
            (0x80, 2), (0x3fff, 2),
            (0x4000, 3), (0x1f_ffff, 3),
            (0x20_0000, 4), (0xfff_ffff, 4),
            (0x1000_0000, 5), (u32::MAX, 5),
        ];
        for &(value, len) in cases {
            let bytes = encode_itf8(value);
            assert_eq!(bytes.len(), len, "length of {value:#x}");
            let mut cur = Cursor::new(&bytes);
            assert_eq!(read_itf8(&mut cur).unwrap(), value);
            assert_eq!(cur.position() as usize, len, "consumed bytes of {value:#x}");
        }
    }

    #[test]
    fn known_encodings() {
        assert_eq!(encode_itf8(3), vec![0x03]);
        assert_eq!(encode_itf8(0x80), vec![0x80, 0x80]);
        assert_eq!(encode_itf8(0x4000), vec![0xc0, 0x40, 0x00]);
        assert_eq!(encode_itf8(u32::MAX), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn truncated_value_is_eof() {
        let err = read_itf8(Cursor::new([0xc0u8, 0x01])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn consecutive_values_do_not_overlap() {
        let mut buf = Vec::new();
        for v in [1u32, 300, 70_000, 5] {
            write_itf8(&mut buf, v).unwrap();
        }
        let mut cur = Cursor::new(buf);
        for v in [1u32, 300, 70_000, 5] {
            assert_eq!(read_itf8(&mut cur).unwrap(), v);
        }
    }
}
