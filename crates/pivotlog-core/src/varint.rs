//! Variable-length Integer Encoding (Varint)
//!
//! Proto-compatible unsigned varints: each byte holds 7 value bits, the high
//! bit marks continuation. Small numbers use one byte, a full u64 uses ten.
//!
//! ## Canonical Varints
//!
//! The same value has several wire encodings when trailing zero groups are
//! padded (`0x87 0x00` also decodes to 7). The chunk encoder must reproduce
//! input records byte for byte, so it only accepts the **canonical** (minimum
//! length) encoding and treats everything else as opaque bytes. The
//! `decode_canonical_*` functions reject:
//! - a continuation byte without a successor,
//! - a multi-byte encoding whose final byte is zero (padded),
//! - encodings longer than the value range allows (for u32 a fifth byte
//!   above 0x0f, for u64 a tenth byte other than 0x01).

use bytes::BufMut;

/// Maximum encoded length of a u32 varint.
pub const MAX_LEN_VARINT32: usize = 5;

/// Maximum encoded length of a u64 varint.
pub const MAX_LEN_VARINT64: usize = 10;

/// Encode an unsigned 64-bit integer as a varint.
pub fn write_varint64(buf: &mut impl BufMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode an unsigned 32-bit integer as a varint.
pub fn write_varint32(buf: &mut impl BufMut, value: u32) {
    write_varint64(buf, u64::from(value));
}

/// Encode into a fixed scratch array, returning the array and the encoded
/// length. Used where the bytes must be handed to a prepend-style sink in one
/// piece.
pub fn encode_varint64(mut value: u64) -> ([u8; MAX_LEN_VARINT64], usize) {
    let mut out = [0u8; MAX_LEN_VARINT64];
    let mut len = 0;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out[len] = byte;
        len += 1;
        if value == 0 {
            break;
        }
    }
    (out, len)
}

/// Number of bytes `write_varint64` would produce for `value`.
pub fn length_varint64(value: u64) -> usize {
    (((64 - (value | 1).leading_zeros()) as usize) + 6) / 7
}

/// Decode an unsigned 64-bit varint from the start of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends mid-varint or exceeds ten bytes.
pub fn decode_varint64(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= MAX_LEN_VARINT64 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Decode an unsigned 32-bit varint from the start of `bytes`.
pub fn decode_varint32(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate() {
        if i >= MAX_LEN_VARINT32 {
            return None;
        }
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Decode a u32 varint, rejecting non-canonical encodings.
pub fn decode_canonical_varint32(bytes: &[u8]) -> Option<(u32, usize)> {
    let (value, len) = decode_varint32(bytes)?;
    if len > 1 && bytes[len - 1] == 0 {
        return None;
    }
    if len == MAX_LEN_VARINT32 && bytes[len - 1] >= 0x10 {
        return None;
    }
    Some((value, len))
}

/// Decode a u64 varint, rejecting non-canonical encodings.
pub fn decode_canonical_varint64(bytes: &[u8]) -> Option<(u64, usize)> {
    let (value, len) = decode_varint64(bytes)?;
    if len > 1 && bytes[len - 1] == 0 {
        return None;
    }
    if len == MAX_LEN_VARINT64 && bytes[len - 1] != 0x01 {
        return None;
    }
    Some((value, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---------------------------------------------------------------
    // Round trips
    // ---------------------------------------------------------------

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 3, 127, 128, 300, 16383, 16384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint64(&mut buf, value);
            assert_eq!(buf.len(), length_varint64(value));
            let (decoded, len) = decode_varint64(&buf).unwrap();
            assert_eq!(decoded, value, "failed for value {value}");
            assert_eq!(len, buf.len());
        }
    }

    #[test]
    fn test_encode_into_scratch_matches_write() {
        for value in [0u64, 7, 200, 1 << 21, u64::MAX] {
            let mut buf = Vec::new();
            write_varint64(&mut buf, value);
            let (scratch, len) = encode_varint64(value);
            assert_eq!(&scratch[..len], &buf[..]);
        }
    }

    #[test]
    fn test_varint_lengths() {
        assert_eq!(length_varint64(0), 1);
        assert_eq!(length_varint64(127), 1);
        assert_eq!(length_varint64(128), 2);
        assert_eq!(length_varint64(u64::from(u32::MAX)), 5);
        assert_eq!(length_varint64(u64::MAX), 10);
    }

    // ---------------------------------------------------------------
    // Canonicality
    // ---------------------------------------------------------------

    #[test]
    fn test_canonical_accepts_minimal_encodings() {
        for value in [0u64, 3, 7, 127, 128, 1 << 20, u64::MAX] {
            let mut buf = Vec::new();
            write_varint64(&mut buf, value);
            let (decoded, len) = decode_canonical_varint64(&buf).unwrap();
            assert_eq!((decoded, len), (value, buf.len()));
        }
    }

    #[test]
    fn test_canonical_rejects_padded_encoding() {
        // 0x87 0x00 decodes to 7 but is not the minimal encoding.
        assert_eq!(decode_varint64(&[0x87, 0x00]), Some((7, 2)));
        assert_eq!(decode_canonical_varint64(&[0x87, 0x00]), None);
        assert_eq!(decode_canonical_varint32(&[0x87, 0x00]), None);
    }

    #[test]
    fn test_canonical_rejects_truncated_input() {
        assert_eq!(decode_canonical_varint64(&[0x80]), None);
        assert_eq!(decode_canonical_varint64(&[]), None);
    }

    #[test]
    fn test_canonical_rejects_out_of_range_terminators() {
        // Fifth byte of a u32 varint may only carry the top four bits.
        let too_wide32 = [0xff, 0xff, 0xff, 0xff, 0x10];
        assert_eq!(decode_canonical_varint32(&too_wide32), None);
        let max32 = [0xff, 0xff, 0xff, 0xff, 0x0f];
        assert_eq!(decode_canonical_varint32(&max32), Some((u32::MAX, 5)));

        // Tenth byte of a u64 varint must be exactly 0x01.
        let mut max64 = [0xffu8; 10];
        max64[9] = 0x01;
        assert_eq!(decode_canonical_varint64(&max64), Some((u64::MAX, 10)));
        max64[9] = 0x02;
        assert_eq!(decode_canonical_varint64(&max64), None);
    }
}
