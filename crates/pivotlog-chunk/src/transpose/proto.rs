//! Proto Wire-Format Introspection
//!
//! The transposed encoder never sees message schemas; everything it knows
//! about a record it learns from the wire bytes. This module reads just
//! enough of the wire format to tell fields apart:
//!
//! - a **tag** is a varint holding `(field_number << 3) | wire_type`
//! - wire types 0..5 carry a varint, 8/4 fixed bytes, a length-delimited
//!   payload, or group brackets
//!
//! [`is_proto_message`] decides whether a byte range is a protocol buffer
//! message in **canonical** encoding. Canonical means every varint uses the
//! minimum number of bytes. Suboptimal encodings (`0x87 0x00` for 7) parse
//! fine with a regular proto parser, but the encoder re-serializes tags and
//! lengths itself and must reproduce the original bytes exactly, so such
//! records are stored verbatim instead of being split into buffers.

use pivotlog_core::ByteReader;

use super::tags::Subtype;

/// Nesting depth at which submessages stop being split into buffers and are
/// stored as opaque strings instead.
pub(crate) const MAX_RECURSION_DEPTH: usize = 100;

/// Largest varint first byte whose value is folded into the subtype rather
/// than written to a buffer. Must stay below 0x80 so the subtype offset
/// coincides with the one-byte varint encoding of the value.
pub(crate) const MAX_VARINT_INLINE: u8 = 3;

/// Wire type of a proto tag (the low three bits).
///
/// `Submessage` never appears on the wire; the chunk header borrows it to
/// mark end-of-submessage states, encoded as
/// `tag + (Submessage - LengthDelimited)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    StartGroup = 3,
    EndGroup = 4,
    Fixed32 = 5,
    Submessage = 6,
}

impl WireType {
    /// Decodes the wire type of an on-the-wire tag. `None` for the two
    /// values proto never produces.
    pub(crate) fn from_tag(tag: u32) -> Option<WireType> {
        match tag & 7 {
            0 => Some(WireType::Varint),
            1 => Some(WireType::Fixed64),
            2 => Some(WireType::LengthDelimited),
            3 => Some(WireType::StartGroup),
            4 => Some(WireType::EndGroup),
            5 => Some(WireType::Fixed32),
            _ => None,
        }
    }
}

/// Offset added to a length-delimited tag to mark end-of-submessage states
/// in the chunk header.
pub(crate) const END_OF_SUBMESSAGE_TAG_OFFSET: u32 =
    WireType::Submessage as u32 - WireType::LengthDelimited as u32;

/// True if states with this tag carry a subtype byte in the header.
pub(crate) fn has_subtype(tag: u32) -> bool {
    WireType::from_tag(tag) == Some(WireType::Varint)
}

/// True if states with this tag and subtype reference a data buffer.
pub(crate) fn has_data_buffer(tag: u32, subtype: Subtype) -> bool {
    match WireType::from_tag(tag) {
        Some(WireType::Varint) => subtype < super::tags::SUBTYPE_VARINT_INLINE_0,
        Some(WireType::Fixed32) | Some(WireType::Fixed64) => true,
        Some(WireType::LengthDelimited) => subtype == super::tags::SUBTYPE_DELIMITED_STRING,
        _ => false,
    }
}

/// Decides whether the readable range of `record` is a proto message in
/// canonical encoding. Consumes the reader either way; the caller seeks back.
///
/// Checks, in one forward scan:
/// - every tag and length is a canonical varint with a non-zero field number,
/// - varint values are canonical,
/// - fixed and length-delimited fields have their payload bytes present,
/// - group brackets nest properly and every opened group is closed.
pub(crate) fn is_proto_message(record: &mut ByteReader<'_>) -> bool {
    let mut open_groups: Vec<u32> = Vec::new();
    while record.pull() {
        let tag = match record.read_canonical_varint32() {
            Some(tag) => tag,
            None => return false,
        };
        let field = tag >> 3;
        if field == 0 {
            return false;
        }
        match WireType::from_tag(tag) {
            Some(WireType::Varint) => {
                if record.read_canonical_varint64().is_none() {
                    return false;
                }
            }
            Some(WireType::Fixed32) => {
                if !record.skip(4) {
                    return false;
                }
            }
            Some(WireType::Fixed64) => {
                if !record.skip(8) {
                    return false;
                }
            }
            Some(WireType::LengthDelimited) => {
                let length = match record.read_canonical_varint32() {
                    Some(length) => length,
                    None => return false,
                };
                if !record.skip(length as usize) {
                    return false;
                }
            }
            Some(WireType::StartGroup) => open_groups.push(field),
            Some(WireType::EndGroup) => {
                if open_groups.pop() != Some(field) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    open_groups.is_empty()
}
