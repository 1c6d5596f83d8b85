//! Tag Identities and the Node Registry
//!
//! The encoder views the input as a tree of field locations: "field 5 inside
//! the submessage at field 2 of the root". Each distinct location gets a
//! [`NodeId`] `(parent message, tag)` and owns a [`Node`] with its assigned
//! [`MessageId`], its data buffer, and the tags-list slot of every subtype it
//! appeared with.
//!
//! A **subtype** refines a tag with how its value is encoded, so that the
//! state machine can distinguish, say, a one-byte varint from an inline zero
//! without storing any value bytes.

use pivotlog_core::BackwardWriter;

/// Sentinel for "no position".
pub(crate) const INVALID_POS: u32 = u32::MAX;

/// Identifies a distinct message type location in the tree of nested
/// messages. Reserved values stay below 8 so they can never collide with a
/// real wire tag (a valid tag is at least 8); user IDs count up from
/// `FIRST_USER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct MessageId(pub(crate) u64);

impl MessageId {
    /// State that emits nothing and only forwards.
    pub(crate) const NO_OP: MessageId = MessageId(0);
    /// Records that are not canonical proto messages.
    pub(crate) const NON_PROTO: MessageId = MessageId(1);
    /// Record boundary marker.
    pub(crate) const START_OF_MESSAGE: MessageId = MessageId(2);
    /// Submessage entry marker.
    pub(crate) const START_OF_SUBMESSAGE: MessageId = MessageId(3);
    /// Parent of all top-level fields.
    pub(crate) const ROOT: MessageId = MessageId(4);
    /// First ID handed out to user message nodes.
    pub(crate) const FIRST_USER: MessageId = MessageId(5);

    pub(crate) fn next(self) -> MessageId {
        MessageId(self.0 + 1)
    }

    /// The varint written to the header for reserved-ID states.
    pub(crate) fn header_value(self) -> u32 {
        debug_assert!(self.0 < 8, "only reserved message IDs appear in the header");
        self.0 as u32
    }
}

/// Refines a tag with how its value is encoded. Values within one wire type
/// share a numbering; wire types never mix in one tags-list slot.
pub(crate) type Subtype = u8;

/// No subtype information.
pub(crate) const SUBTYPE_TRIVIAL: Subtype = 0;
/// Varint that is N bytes long, N in 1..=10: `SUBTYPE_VARINT_1 + (N - 1)`.
/// The bytes go to a varint buffer with their continuation bits cleared.
pub(crate) const SUBTYPE_VARINT_1: Subtype = 0;
/// Varint whose single byte is 0..=3, folded into the subtype:
/// `SUBTYPE_VARINT_INLINE_0 + value`. No bytes are written.
pub(crate) const SUBTYPE_VARINT_INLINE_0: Subtype = 10;
/// Length-prefixed payload stored verbatim, prefix included.
pub(crate) const SUBTYPE_DELIMITED_STRING: Subtype = 0;
/// Submessage exit marker.
pub(crate) const SUBTYPE_DELIMITED_END_OF_SUBMESSAGE: Subtype = 1;
/// Submessage entry marker; the decoder recurses.
pub(crate) const SUBTYPE_DELIMITED_START_OF_SUBMESSAGE: Subtype = 2;

/// Uniquely identifies a node in the field tree.
///
/// `tag` is the raw wire tag (wire type in the low three bits, field number
/// above). Reserved nodes use `tag = 0` with a reserved `MessageId` as
/// parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId {
    pub(crate) parent: MessageId,
    pub(crate) tag: u32,
}

impl NodeId {
    pub(crate) fn new(parent: MessageId, tag: u32) -> Self {
        Self { parent, tag }
    }

    /// Node for a reserved message ID (`tag = 0`).
    pub(crate) fn reserved(id: MessageId) -> Self {
        Self { parent: id, tag: 0 }
    }
}

/// Which buffer a field's value bytes land in. Only used to group similar
/// buffers next to each other so compression context modeling has something
/// to work with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferType {
    /// Varint bytes with continuation bits cleared.
    Varint,
    /// Little-endian 4-byte values.
    Fixed32,
    /// Little-endian 8-byte values.
    Fixed64,
    /// Length prefix plus payload, verbatim.
    String,
    /// Whole non-proto records.
    NonProto,
}

impl BufferType {
    pub(crate) const COUNT: usize = 5;

    /// Emission order of the per-type buffer groups.
    pub(crate) const ALL: [BufferType; Self::COUNT] = [
        BufferType::Varint,
        BufferType::Fixed32,
        BufferType::Fixed64,
        BufferType::String,
        BufferType::NonProto,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            BufferType::Varint => 0,
            BufferType::Fixed32 => 1,
            BufferType::Fixed64 => 2,
            BufferType::String => 3,
            BufferType::NonProto => 4,
        }
    }
}

/// Per-node state: assigned message ID, the node's data buffer (created on
/// first write), and the tags-list slot per subtype.
#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) message_id: MessageId,
    /// Buffer type and index into the encoder's per-type buffer vector.
    pub(crate) buffer: Option<(BufferType, usize)>,
    /// Indexed by subtype; `INVALID_POS` until the pair is first seen.
    pub(crate) encoded_tag_pos: Vec<u32>,
}

impl Node {
    pub(crate) fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            buffer: None,
            encoded_tag_pos: Vec::new(),
        }
    }
}

/// A data buffer together with the node it belongs to. The node is the sort
/// key for deterministic buffer emission.
#[derive(Debug)]
pub(crate) struct DataBuffer {
    pub(crate) writer: BackwardWriter,
    pub(crate) node_id: NodeId,
}
