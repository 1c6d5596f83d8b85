//! Positioned Byte Reader
//!
//! `ByteReader` is a cursor over an in-memory record. It keeps an absolute
//! position and a logical end, so a sub-range of the data (one record out of
//! a concatenated batch, or one length-delimited field out of a message) can
//! be walked as if it were the whole input.
//!
//! ## Limits
//!
//! `push_limit` temporarily moves the logical end closer; `pop_limit`
//! restores the previous one. This is how the message walker scans a
//! length-delimited field speculatively without ever being able to read past
//! it, and how batched records are split without copying:
//!
//! ```
//! use pivotlog_core::ByteReader;
//!
//! let mut reader = ByteReader::new(&[1, 2, 3, 4]);
//! let saved = reader.push_limit(2);
//! assert_eq!(reader.read_slice(2), Some(&[1u8, 2][..]));
//! assert!(!reader.pull());
//! reader.pop_limit(saved);
//! assert!(reader.pull());
//! ```

use crate::varint;

/// Cursor over a byte slice with a movable logical end.
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            limit: data.len(),
        }
    }

    /// Returns true while there are bytes left before the logical end.
    pub fn pull(&self) -> bool {
        self.pos < self.limit
    }

    /// Current absolute position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Logical end of the readable range.
    pub fn size(&self) -> usize {
        self.limit
    }

    /// Bytes left before the logical end.
    pub fn remaining(&self) -> usize {
        self.limit - self.pos
    }

    /// Moves the cursor to an absolute position within the readable range.
    pub fn seek(&mut self, pos: usize) -> bool {
        if pos > self.limit {
            return false;
        }
        self.pos = pos;
        true
    }

    /// Advances the cursor by `n` bytes.
    pub fn skip(&mut self, n: usize) -> bool {
        if n > self.remaining() {
            return false;
        }
        self.pos += n;
        true
    }

    /// Reads the next `n` bytes without copying.
    pub fn read_slice(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Restricts the logical end to `limit`, returning the previous end.
    ///
    /// `limit` must lie between the current position and the current end.
    pub fn push_limit(&mut self, limit: usize) -> usize {
        debug_assert!(limit >= self.pos && limit <= self.data.len());
        let saved = self.limit;
        self.limit = limit;
        saved
    }

    /// Restores a logical end previously returned by `push_limit`.
    pub fn pop_limit(&mut self, saved: usize) {
        debug_assert!(saved >= self.limit && saved <= self.data.len());
        self.limit = saved;
    }

    /// Sets the logical end directly. Used when walking concatenated records
    /// whose end positions are known up front.
    pub fn set_limit(&mut self, limit: usize) {
        debug_assert!(limit >= self.pos && limit <= self.data.len());
        self.limit = limit;
    }

    fn ahead(&self) -> &'a [u8] {
        &self.data[self.pos..self.limit]
    }

    pub fn read_varint32(&mut self) -> Option<u32> {
        let (value, len) = varint::decode_varint32(self.ahead())?;
        self.pos += len;
        Some(value)
    }

    pub fn read_varint64(&mut self) -> Option<u64> {
        let (value, len) = varint::decode_varint64(self.ahead())?;
        self.pos += len;
        Some(value)
    }

    /// Reads a u32 varint, failing on non-canonical encodings.
    pub fn read_canonical_varint32(&mut self) -> Option<u32> {
        let (value, len) = varint::decode_canonical_varint32(self.ahead())?;
        self.pos += len;
        Some(value)
    }

    /// Reads a u64 varint, failing on non-canonical encodings.
    pub fn read_canonical_varint64(&mut self) -> Option<u64> {
        let (value, len) = varint::decode_canonical_varint64(self.ahead())?;
        self.pos += len;
        Some(value)
    }

    /// Reads a u64 varint, returning its raw bytes and length instead of the
    /// decoded value.
    pub fn copy_varint64(&mut self) -> Option<([u8; varint::MAX_LEN_VARINT64], usize)> {
        let ahead = self.ahead();
        let (_, len) = varint::decode_varint64(ahead)?;
        let mut out = [0u8; varint::MAX_LEN_VARINT64];
        out[..len].copy_from_slice(&ahead[..len]);
        self.pos += len;
        Some((out, len))
    }
}
