//! Wire encoding primitives shared by the block, filter, and footer
//! formats. All multi-byte integers on disk are little-endian.

use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;
use crate::Error;

/// The checksum applied to every block trailer (castagnoli).
pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const CRC_MASK_DELTA: u32 = 0xa282_ead8;

/// Masks a crc so that a crc of the crc itself stays meaningful when
/// embedded in the stream it covers.
pub fn mask_crc(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(CRC_MASK_DELTA)
}

/// Inverse of [`mask_crc`].
pub fn unmask_crc(masked: u32) -> u32 {
    masked.wrapping_sub(CRC_MASK_DELTA).rotate_left(15)
}

pub fn put_fixed32(dst: &mut Vec<u8>, value: u32) {
    dst.extend_from_slice(&value.to_le_bytes());
}

pub fn put_fixed64(dst: &mut Vec<u8>, value: u64) {
    dst.extend_from_slice(&value.to_le_bytes());
}

/// Decodes a little-endian u32 from the first four bytes of `src`.
pub fn decode_fixed32(src: &[u8]) -> u32 {
    u32::from_le_bytes(src[..4].try_into().unwrap())
}

/// Decodes a little-endian u64 from the first eight bytes of `src`.
pub fn decode_fixed64(src: &[u8]) -> u64 {
    u64::from_le_bytes(src[..8].try_into().unwrap())
}

/// Appends `value` in varint64 representation (at most ten bytes).
pub fn put_varint64(dst: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        dst.push((value as u8) | 0x80);
        value >>= 7;
    }
    dst.push(value as u8);
}

/// Decodes a varint64 from the front of `input`, advancing it past the
/// consumed bytes.
pub fn get_varint64(input: &mut &[u8]) -> Result<u64> {
    let mut result: u64 = 0;
    for (i, &byte) in input.iter().enumerate() {
        if i >= 10 {
            break;
        }
        if byte < 0x80 {
            result |= (byte as u64) << (7 * i);
            *input = &input[i + 1..];
            return Ok(result);
        }
        result |= ((byte & 0x7f) as u64) << (7 * i);
    }
    Err(Error::Corruption("truncated varint64".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_mask_roundtrip() {
        for data in [&b""[..], &b"cinderlog"[..], &b"\x00\x00\x00\x00"[..]] {
            let crc = CRC32C.checksum(data);
            assert_ne!(mask_crc(crc), crc);
            assert_eq!(unmask_crc(mask_crc(crc)), crc);
        }
    }

    #[test]
    fn test_fixed_roundtrip() {
        let mut buf = Vec::new();
        put_fixed32(&mut buf, 0xdead_beef);
        put_fixed64(&mut buf, u64::MAX - 1);
        assert_eq!(decode_fixed32(&buf[..4]), 0xdead_beef);
        assert_eq!(decode_fixed64(&buf[4..]), u64::MAX - 1);
    }

    #[test]
    fn test_varint64_roundtrip() {
        let values = [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX];
        let mut buf = Vec::new();
        for v in values {
            put_varint64(&mut buf, v);
        }
        let mut input = buf.as_slice();
        for v in values {
            assert_eq!(get_varint64(&mut input).expect("Failed to decode varint"), v);
        }
        assert!(input.is_empty());
    }

    #[test]
    fn test_varint64_truncated() {
        let mut buf = Vec::new();
        put_varint64(&mut buf, u64::MAX);
        let mut input = &buf[..buf.len() - 1];
        assert!(get_varint64(&mut input).is_err());
    }
}
