//! Variable-length signed integer encoding used by every message body and
//! by the snapshot delta stream.
//!
//! Layout of one packed integer:
//! - first byte: bit 7 = more bytes follow, bit 6 = sign, bits 0-5 = lowest value bits
//! - following bytes: bit 7 = more bytes follow, bits 0-6 = next value bits
//!
//! Negative numbers are stored as their bitwise complement with the sign bit set,
//! so small magnitudes of either sign stay one byte long.

use thiserror::Error;

/// Longest encoding of a 32-bit value
pub const MAX_BYTES_PACKED: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of buffer")]
    Truncated,
    #[error("variable-length integer longer than {MAX_BYTES_PACKED} bytes")]
    Overlong,
    #[error("stream holds more than {0} integers")]
    TooManyInts(usize),
    #[error("raw block of {0} bytes runs past end of buffer")]
    RawOutOfBounds(usize),
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("string is not terminated")]
    UnterminatedString,
    #[error("reader already failed")]
    Poisoned,
}

/// Appends the packed form of `value` to `dst`
pub fn pack(dst: &mut Vec<u8>, value: i32) {
    let mut byte = ((value >> 25) & 0x40) as u8;
    let mut rest = (value ^ (value >> 31)) as u32;

    byte |= (rest & 0x3f) as u8;
    rest >>= 6;

    while rest != 0 {
        dst.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }

    dst.push(byte);
}

/// Reads one packed integer from the front of `src`.
///
/// Returns the value and the number of bytes consumed.
pub fn unpack(src: &[u8]) -> Result<(i32, usize), WireError> {
    let first = *src.first().ok_or(WireError::Truncated)?;
    let sign = u32::from((first >> 6) & 1);
    let mut value = u32::from(first & 0x3f);
    let mut more = first & 0x80 != 0;
    let mut used = 1;
    let mut shift = 6;

    while more {
        if used == MAX_BYTES_PACKED {
            return Err(WireError::Overlong);
        }
        let byte = *src.get(used).ok_or(WireError::Truncated)?;
        // only four value bits fit into the last byte
        let mask = if used == MAX_BYTES_PACKED - 1 { 0x0f } else { 0x7f };
        value |= u32::from(byte & mask) << shift;
        more = byte & 0x80 != 0;
        shift += 7;
        used += 1;
    }

    value ^= sign.wrapping_neg();
    Ok((value as i32, used))
}

/// Packs a whole integer slice into a byte stream
pub fn compress(ints: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ints.len() * 2);
    for &value in ints {
        pack(&mut out, value);
    }
    out
}

/// Unpacks a byte stream produced by [`compress`].
///
/// Fails on a truncated or overlong integer, or when the stream would yield
/// more than `max_ints` values.
pub fn decompress(src: &[u8], max_ints: usize) -> Result<Vec<i32>, WireError> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < src.len() {
        if out.len() == max_ints {
            return Err(WireError::TooManyInts(max_ints));
        }
        let (value, used) = unpack(&src[pos..])?;
        out.push(value);
        pos += used;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        pack(&mut out, value);
        out
    }

    #[test]
    fn test_small_values_use_one_byte() {
        assert_eq!(packed(0), vec![0x00]);
        assert_eq!(packed(1), vec![0x01]);
        assert_eq!(packed(63), vec![0x3f]);
        assert_eq!(packed(-1), vec![0x40]);
        assert_eq!(packed(-64), vec![0x7f]);
    }

    #[test]
    fn test_extension_bytes() {
        assert_eq!(packed(64), vec![0x80, 0x01]);
        assert_eq!(packed(-65), vec![0xc0, 0x01]);
    }

    #[test]
    fn test_extremes() {
        for value in [i32::MAX, i32::MIN, 1 << 20, -(1 << 27), 458797] {
            let bytes = packed(value);
            assert!(bytes.len() <= MAX_BYTES_PACKED);
            assert_eq!(unpack(&bytes), Ok((value, bytes.len())));
        }
    }

    #[test]
    fn test_unpack_truncated() {
        assert_eq!(unpack(&[]), Err(WireError::Truncated));
        assert_eq!(unpack(&[0x80]), Err(WireError::Truncated));
    }

    #[test]
    fn test_unpack_overlong() {
        assert_eq!(
            unpack(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(WireError::Overlong)
        );
    }

    #[test]
    fn test_compress_decompress() {
        let ints = vec![0, -1, 7, 3, 1, 42, -300, 100_000];
        let bytes = compress(&ints);
        assert_eq!(decompress(&bytes, 64), Ok(ints));
    }

    #[test]
    fn test_decompress_limit() {
        let bytes = compress(&[1, 2, 3, 4]);
        assert_eq!(decompress(&bytes, 3), Err(WireError::TooManyInts(3)));
        assert_eq!(decompress(&bytes, 4).map(|v| v.len()), Ok(4));
    }

    #[test]
    fn test_decompress_rejects_trailing_partial() {
        let mut bytes = compress(&[5, 6]);
        bytes.push(0x80);
        assert_eq!(decompress(&bytes, 16), Err(WireError::Truncated));
    }
}
