//! Signed varint codec.
//!
//! Integers travel as zig-zag-interleaved base-128 groups, little-endian,
//! at most ten bytes per value. Readers reject anything longer or anything
//! whose final byte overflows 64 bits.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest legal encoding of a 64-bit value.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the unsigned base-128 encoding of `x` to `buf`.
pub fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        buf.push((x as u8) | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

/// Append the signed (zig-zag) encoding of `x` to `buf`.
pub fn put_varint(buf: &mut Vec<u8>, x: i64) {
    let mut ux = (x as u64) << 1;
    if x < 0 {
        ux = !ux;
    }
    put_uvarint(buf, ux);
}

/// Read one unsigned varint off `reader`.
///
/// `reader` should be buffered; this reads a byte at a time.
pub async fn read_uvarint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<u64> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for i in 0..MAX_VARINT_LEN {
        let byte = reader.read_u8().await?;
        if byte < 0x80 {
            if i == MAX_VARINT_LEN - 1 && byte > 1 {
                return Err(overflow());
            }
            return Ok(x | u64::from(byte) << shift);
        }
        x |= u64::from(byte & 0x7f) << shift;
        shift += 7;
    }
    Err(overflow())
}

/// Read one signed (zig-zag) varint off `reader`.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<i64> {
    let ux = read_uvarint(reader).await?;
    let mut x = (ux >> 1) as i64;
    if ux & 1 != 0 {
        x = !x;
    }
    Ok(x)
}

fn overflow() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "varint overflows a 64-bit integer")
}
