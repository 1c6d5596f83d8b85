//! Transposed Chunk Encoder
//!
//! `TransposeEncoder` regroups the fields of many records into shared byte
//! buffers ("transposing" the record-major input into field-major storage),
//! which puts similar bytes next to each other and makes the compressor's
//! job easy.
//!
//! ## How a Record Is Taken Apart
//!
//! 1. The record is scanned once to check it is a canonical proto message
//!    (`proto::is_proto_message`). Records that are not - corrupted
//!    messages, arbitrary strings - are stored verbatim on a side channel
//!    and reproduced exactly.
//! 2. A proto record is walked tag by tag. Every field occurrence appends
//!    one **encoded tag** (a `(field location, subtype)` identity) to a
//!    global sequence, and its value bytes go to the buffer of that field
//!    location. Submessages recurse up to a depth cap; deeper or empty
//!    payloads count as strings.
//! 3. At `encode_and_close` the tag sequence is converted into a state
//!    machine (see `machine`) and the chunk is assembled: compressed header,
//!    bucketed compressed buffers, compressed transition stream (see
//!    `emit`).
//!
//! ## Why Buffers Are Written Backwards
//!
//! The decoder replays the tag sequence from its end, reconstructing records
//! back to front. Value bytes are therefore prepended into their buffers, so
//! that at decode time each buffer is consumed front to back.
//!
//! ## Lifecycle
//!
//! The encoder is single-threaded and caller-owned. Any failure moves it to
//! a terminal state where every call returns `Error::Closed`; a successful
//! `encode_and_close` does the same. `reset` returns it to empty.

mod emit;
mod machine;
mod proto;
mod tags;

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytes::Bytes;

use pivotlog_core::{BackwardWriter, ByteReader, Error, Result, Writer};

use crate::compress::{Compressor, CompressorOptions};
use crate::{ChunkEncoder, ChunkSummary, ChunkType, MAX_NUM_RECORDS};

use self::machine::EncodedTagInfo;
use self::proto::{is_proto_message, WireType, MAX_RECURSION_DEPTH, MAX_VARINT_INLINE};
use self::tags::{
    BufferType, DataBuffer, MessageId, Node, NodeId, SUBTYPE_DELIMITED_END_OF_SUBMESSAGE,
    SUBTYPE_DELIMITED_START_OF_SUBMESSAGE, SUBTYPE_DELIMITED_STRING, SUBTYPE_TRIVIAL,
    SUBTYPE_VARINT_1, SUBTYPE_VARINT_INLINE_0,
};

/// Default target for uncompressed bytes per compression bucket. Finer
/// buckets make partial reads cheaper but hurt compression density.
pub const DEFAULT_BUCKET_SIZE: u64 = 64 * 1024;

/// Largest single-byte transition offset the chunk format supports.
const MAX_TRANSITION: u32 = 63;

/// Default threshold for an edge to earn a slot in its source's private
/// state list.
const MIN_COUNT_FOR_STATE: u64 = 10;

/// Chunk encoder that stores same-typed fields from all records together.
///
/// ```
/// use pivotlog_chunk::{ChunkEncoder, CompressorOptions, TransposeEncoder};
///
/// let mut encoder = TransposeEncoder::new(CompressorOptions::uncompressed(), 64 * 1024);
/// encoder.add_record(&[0x08, 0x07]).unwrap();
/// let mut chunk: Vec<u8> = Vec::new();
/// let summary = encoder.encode_and_close(&mut chunk).unwrap();
/// assert_eq!(summary.num_records, 1);
/// ```
#[derive(Debug)]
pub struct TransposeEncoder {
    options: CompressorOptions,
    /// Effective bucket limit; unbounded when compression is off.
    bucket_size: u64,
    max_transition: u32,
    min_count_for_state: u64,

    open: bool,
    num_records: u64,
    decoded_data_size: u64,

    compressor: Compressor,
    /// All distinct encoded tags, indexed by their tags-list slot.
    tags_list: Vec<EncodedTagInfo>,
    /// One slot index per field occurrence, in input order.
    encoded_tags: Vec<u32>,
    /// Data buffers, one vector per buffer type.
    data: [Vec<DataBuffer>; BufferType::COUNT],
    /// Parent IDs of currently open groups.
    group_stack: Vec<MessageId>,
    /// The field tree.
    nodes: HashMap<NodeId, Node>,
    /// Sizes of non-proto records, consumed alongside their bytes.
    nonproto_lengths: BackwardWriter,
    next_message_id: MessageId,
}

impl TransposeEncoder {
    /// Creates an empty encoder. `bucket_size` is the uncompressed target
    /// size per compression bucket; it is ignored when compression is off
    /// (everything lands in one bucket per buffer group).
    pub fn new(options: CompressorOptions, bucket_size: u64) -> Self {
        Self::with_tuning(options, bucket_size, MAX_TRANSITION, MIN_COUNT_FOR_STATE)
    }

    /// Creates an encoder with explicit state machine tuning. Lowering
    /// `max_transition` below the format maximum of 63 forces deeper NoOp
    /// trees and is mainly useful for tests.
    pub fn with_tuning(
        options: CompressorOptions,
        bucket_size: u64,
        max_transition: u32,
        min_count_for_state: u64,
    ) -> Self {
        assert!(
            (1..=MAX_TRANSITION).contains(&max_transition),
            "max_transition out of range"
        );
        let bucket_size = if options.compression_type() == crate::CompressionType::None {
            u64::MAX
        } else {
            bucket_size
        };
        Self {
            options,
            bucket_size,
            max_transition,
            min_count_for_state,
            open: true,
            num_records: 0,
            decoded_data_size: 0,
            compressor: Compressor::new(options),
            tags_list: Vec::new(),
            encoded_tags: Vec::new(),
            data: Default::default(),
            group_stack: Vec::new(),
            nodes: HashMap::new(),
            nonproto_lengths: BackwardWriter::new(),
            next_message_id: MessageId::FIRST_USER,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Marks the encoder failed and propagates the error.
    fn fail<T>(&mut self, error: Error) -> Result<T> {
        self.open = false;
        Err(error)
    }

    /// Looks up the node for `node_id`, creating it with a fresh message ID
    /// on first reference.
    fn node(&mut self, node_id: NodeId) -> MessageId {
        match self.nodes.entry(node_id) {
            Entry::Occupied(entry) => entry.get().message_id,
            Entry::Vacant(entry) => {
                let id = self.next_message_id;
                self.next_message_id = id.next();
                entry.insert(Node::new(id));
                id
            }
        }
    }

    /// Tags-list slot of `(node_id, subtype)`, allocating one on first use.
    fn pos_in_tags_list(&mut self, node_id: NodeId, subtype: tags::Subtype) -> u32 {
        let next = self.tags_list.len() as u32;
        let node = self
            .nodes
            .get_mut(&node_id)
            .expect("tag node registered before its tags-list slot");
        let index = usize::from(subtype);
        if node.encoded_tag_pos.len() <= index {
            node.encoded_tag_pos.resize(index + 1, tags::INVALID_POS);
        }
        let slot = node.encoded_tag_pos[index];
        if slot != tags::INVALID_POS {
            return slot;
        }
        node.encoded_tag_pos[index] = next;
        self.tags_list.push(EncodedTagInfo::new(node_id, subtype));
        next
    }

    /// The node's data buffer, created in the `ty` group on first write.
    fn buffer(&mut self, node_id: NodeId, ty: BufferType) -> &mut BackwardWriter {
        let slot = self
            .nodes
            .get(&node_id)
            .expect("tag node registered before its buffer")
            .buffer;
        let (ty, index) = match slot {
            Some(assigned) => assigned,
            None => {
                let buffers = &mut self.data[ty.index()];
                buffers.push(DataBuffer {
                    writer: BackwardWriter::new(),
                    node_id,
                });
                let assigned = (ty, buffers.len() - 1);
                self.nodes
                    .get_mut(&node_id)
                    .expect("tag node registered before its buffer")
                    .buffer = Some(assigned);
                assigned
            }
        };
        &mut self.data[ty.index()][index].writer
    }

    fn add_record_internal(&mut self, record: &mut ByteReader<'_>) -> Result<()> {
        self.ensure_open()?;
        let pos_before = record.pos();
        let size = (record.size() - pos_before) as u64;
        if self.num_records == MAX_NUM_RECORDS {
            return self.fail(Error::ResourceExhausted("too many records"));
        }
        if size > u64::MAX - self.decoded_data_size {
            return self.fail(Error::ResourceExhausted("decoded data size overflow"));
        }
        self.num_records += 1;
        self.decoded_data_size += size;

        let is_proto = is_proto_message(record);
        let seeked = record.seek(pos_before);
        debug_assert!(seeked, "seeking back over a pulled record cannot fail");

        if is_proto {
            let start = NodeId::reserved(MessageId::START_OF_MESSAGE);
            self.node(start);
            let slot = self.pos_in_tags_list(start, SUBTYPE_TRIVIAL);
            self.encoded_tags.push(slot);
            self.add_message(record, MessageId::ROOT, 0)
        } else {
            let node_id = NodeId::reserved(MessageId::NON_PROTO);
            self.node(node_id);
            let slot = self.pos_in_tags_list(node_id, SUBTYPE_TRIVIAL);
            self.encoded_tags.push(slot);
            let bytes = record
                .read_slice(size as usize)
                .expect("record bytes are in range");
            self.buffer(node_id, BufferType::NonProto).write(bytes);
            self.nonproto_lengths.write_varint64(size);
            Ok(())
        }
    }

    /// Walks one validated message, appending encoded tags and prepending
    /// value bytes. `parent` and `depth` track the current nesting; groups
    /// shift both without recursing.
    fn add_message(
        &mut self,
        record: &mut ByteReader<'_>,
        mut parent: MessageId,
        mut depth: usize,
    ) -> Result<()> {
        while record.pull() {
            let tag = record.read_varint32().expect("tag was validated");
            let node_id = NodeId::new(parent, tag);
            let message_id = self.node(node_id);
            match WireType::from_tag(tag).expect("wire type was validated") {
                WireType::Varint => {
                    let (mut value, length) =
                        record.copy_varint64().expect("varint value was validated");
                    if value[0] <= MAX_VARINT_INLINE {
                        let slot = self
                            .pos_in_tags_list(node_id, SUBTYPE_VARINT_INLINE_0 + value[0]);
                        self.encoded_tags.push(slot);
                    } else {
                        let slot = self
                            .pos_in_tags_list(node_id, SUBTYPE_VARINT_1 + (length as u8 - 1));
                        self.encoded_tags.push(slot);
                        // Continuation bits are implied by the subtype;
                        // clearing them leaves more repetitive bytes for the
                        // compressor. The decoder restores them.
                        for byte in &mut value[..length] {
                            *byte &= 0x7f;
                        }
                        self.buffer(node_id, BufferType::Varint).write(&value[..length]);
                    }
                }
                WireType::Fixed32 => {
                    let slot = self.pos_in_tags_list(node_id, SUBTYPE_TRIVIAL);
                    self.encoded_tags.push(slot);
                    let bytes = record.read_slice(4).expect("fixed32 was validated");
                    self.buffer(node_id, BufferType::Fixed32).write(bytes);
                }
                WireType::Fixed64 => {
                    let slot = self.pos_in_tags_list(node_id, SUBTYPE_TRIVIAL);
                    self.encoded_tags.push(slot);
                    let bytes = record.read_slice(8).expect("fixed64 was validated");
                    self.buffer(node_id, BufferType::Fixed64).write(bytes);
                }
                WireType::LengthDelimited => {
                    let length_pos = record.pos();
                    let length = record.read_varint32().expect("length was validated");
                    let value_pos = record.pos();
                    let saved_limit = record.push_limit(value_pos + length as usize);
                    // Non-toplevel empty payloads are always strings; they
                    // get one node this way instead of two.
                    if depth < MAX_RECURSION_DEPTH && length != 0 && is_proto_message(record) {
                        let start = self
                            .pos_in_tags_list(node_id, SUBTYPE_DELIMITED_START_OF_SUBMESSAGE);
                        self.encoded_tags.push(start);
                        let seeked = record.seek(value_pos);
                        debug_assert!(seeked, "seeking back over a scanned payload");
                        let end = self
                            .pos_in_tags_list(node_id, SUBTYPE_DELIMITED_END_OF_SUBMESSAGE);
                        self.add_message(record, message_id, depth + 1)?;
                        self.encoded_tags.push(end);
                    } else {
                        let slot = self.pos_in_tags_list(node_id, SUBTYPE_DELIMITED_STRING);
                        self.encoded_tags.push(slot);
                        let seeked = record.seek(length_pos);
                        debug_assert!(seeked, "seeking back over a scanned payload");
                        let prefixed_length = (value_pos - length_pos) + length as usize;
                        let bytes = record
                            .read_slice(prefixed_length)
                            .expect("payload was validated");
                        self.buffer(node_id, BufferType::String).write(bytes);
                    }
                    record.pop_limit(saved_limit);
                }
                WireType::StartGroup => {
                    let slot = self.pos_in_tags_list(node_id, SUBTYPE_TRIVIAL);
                    self.encoded_tags.push(slot);
                    self.group_stack.push(parent);
                    parent = message_id;
                    depth += 1;
                }
                WireType::EndGroup => {
                    parent = self
                        .group_stack
                        .pop()
                        .expect("group nesting was validated");
                    depth -= 1;
                    // `parent` changed above, so `node_id` is keyed by the
                    // group's own message rather than the restored parent.
                    // Any unique consistent node works here, and this one
                    // saves a lookup.
                    let slot = self.pos_in_tags_list(node_id, SUBTYPE_TRIVIAL);
                    self.encoded_tags.push(slot);
                }
                WireType::Submessage => unreachable!("never produced by wire-type validation"),
            }
        }
        Ok(())
    }

    /// Finishes the chunk: builds the state machine, writes the compressed
    /// header and data sections to `dest`, and closes the encoder.
    fn encode_and_close_internal(&mut self, dest: &mut dyn Writer) -> Result<ChunkSummary> {
        self.ensure_open()?;
        // Terminal from here on, success or not.
        self.open = false;

        let num_records = self.num_records;
        let decoded_data_size = self.decoded_data_size;

        // Seal all data buffers into forward-readable bytes.
        let sealed: [Vec<emit::SealedBuffer>; BufferType::COUNT] =
            std::mem::take(&mut self.data).map(|buffers| {
                buffers
                    .into_iter()
                    .map(|buffer| emit::SealedBuffer {
                        bytes: buffer.writer.close(),
                        node_id: buffer.node_id,
                    })
                    .collect()
            });
        let nonproto_lengths: Bytes =
            std::mem::take(&mut self.nonproto_lengths).close();

        dest.write_u8(self.options.compression_type() as u8)?;

        let state_machine = machine::build(
            &mut self.tags_list,
            &self.encoded_tags,
            self.max_transition,
            self.min_count_for_state,
        );

        let mut header = bytes::BytesMut::new();
        let mut data = bytes::BytesMut::new();
        self.write_states_and_data(
            &state_machine,
            sealed,
            &nonproto_lengths,
            &mut header,
            &mut data,
        )?;

        tracing::debug!(
            num_records,
            decoded_data_size,
            states = state_machine.len(),
            header_bytes = header.len(),
            data_bytes = data.len(),
            "encoded transposed chunk"
        );

        // The header compresses as a single block, framed by its compressed
        // length so the decoder can locate the data section.
        self.compressor.reset();
        self.compressor.writer().extend_from_slice(&header);
        let mut compressed_header = bytes::BytesMut::new();
        self.compressor.encode_and_close(&mut compressed_header)?;
        dest.write_varint64(compressed_header.len() as u64)?;
        dest.write(&compressed_header)?;
        dest.write(&data)?;

        Ok(ChunkSummary {
            chunk_type: ChunkType::Transposed,
            num_records,
            decoded_data_size,
        })
    }

    #[cfg(test)]
    fn preset_decoded_data_size(&mut self, size: u64) {
        self.decoded_data_size = size;
    }
}

impl ChunkEncoder for TransposeEncoder {
    fn reset(&mut self) {
        self.open = true;
        self.num_records = 0;
        self.decoded_data_size = 0;
        self.compressor = Compressor::new(self.options);
        self.tags_list.clear();
        self.encoded_tags.clear();
        self.data = Default::default();
        self.group_stack.clear();
        self.nodes.clear();
        self.nonproto_lengths = BackwardWriter::new();
        self.next_message_id = MessageId::FIRST_USER;
    }

    fn add_record(&mut self, record: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(record);
        self.add_record_internal(&mut reader)
    }

    fn add_records(&mut self, records: &[u8], limits: &[usize]) -> Result<()> {
        assert_eq!(
            limits.last().copied().unwrap_or(0),
            records.len(),
            "record end positions do not match concatenated record values"
        );
        let mut reader = ByteReader::new(records);
        for &limit in limits {
            assert!(
                limit >= reader.pos(),
                "record end positions not sorted"
            );
            reader.set_limit(limit);
            self.add_record_internal(&mut reader)?;
            debug_assert_eq!(reader.pos(), limit, "record was not read up to its end");
        }
        Ok(())
    }

    fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<ChunkSummary> {
        self.encode_and_close_internal(dest)
    }

    fn chunk_type(&self) -> ChunkType {
        ChunkType::Transposed
    }
}
