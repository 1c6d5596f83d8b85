//! Chunk Emission
//!
//! Everything that turns the accumulated encoder state into bytes:
//!
//! - **Buffers**: per-type buffer groups are sorted largest-first and
//!   streamed into compression buckets of roughly `bucket_size` uncompressed
//!   bytes. A new bucket starts at every group boundary and whenever the
//!   next buffer would overflow the target. The non-proto lengths buffer, if
//!   present, always closes the sequence in a bucket of its own.
//! - **Header**: bucket and buffer sizes, the state table (one tag varint
//!   per state, then one base varint per state, then the subtype bytes, then
//!   the buffer indices), and the initial state index.
//! - **Transitions**: the encoded-tag sequence replayed back to front as
//!   single-byte offsets, walking up the canonical-source tree when a target
//!   is more than `max_transition` away. Zero offsets are run-length packed
//!   four to a byte in the low two bits.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use pivotlog_core::{Result, Writer};

use super::machine::StateInfo;
use super::proto::{has_data_buffer, has_subtype, WireType, END_OF_SUBMESSAGE_TAG_OFFSET};
use super::tags::{
    BufferType, MessageId, NodeId, INVALID_POS, SUBTYPE_DELIMITED_END_OF_SUBMESSAGE,
    SUBTYPE_DELIMITED_START_OF_SUBMESSAGE,
};
use super::TransposeEncoder;

/// A finalized data buffer awaiting emission.
#[derive(Debug)]
pub(super) struct SealedBuffer {
    pub(super) bytes: Bytes,
    pub(super) node_id: NodeId,
}

/// Upper bound on bytes needed for one transition: the depth of the
/// canonical-source tree, which even for `max_transition = 1` stays far
/// below this for any realistic state count.
const TRANSITION_SCRATCH: usize = 32;

impl TransposeEncoder {
    /// Writes the complete header into `header` and all compressed data
    /// (buckets, then transitions) into `data`.
    pub(super) fn write_states_and_data(
        &mut self,
        state_machine: &[StateInfo],
        sealed: [Vec<SealedBuffer>; BufferType::COUNT],
        nonproto_lengths: &Bytes,
        header: &mut BytesMut,
        data: &mut BytesMut,
    ) -> Result<()> {
        // The final decoded tag must leave by an explicit transition, or the
        // decoder could not tell end-of-stream from one more implicit step.
        // If it has a single destination, grow a second, empty slot.
        if let Some(&final_decoded) = self.encoded_tags.first() {
            let dest_info = &mut self.tags_list[final_decoded as usize].dest_info;
            if dest_info.len() == 1 {
                let first_key = *dest_info.keys().next().expect("checked non-empty");
                dest_info.entry(first_key + 1).or_default();
            }
        }

        let buffer_pos = self.write_buffers(sealed, nonproto_lengths, header, data)?;

        let mut subtypes: Vec<u8> = Vec::new();
        let mut buffer_indices: Vec<u32> = Vec::new();
        let mut bases: Vec<u32> = Vec::with_capacity(state_machine.len());

        header.write_varint32(state_machine.len() as u32)?;
        for state in state_machine {
            if state.etag_index == INVALID_POS {
                header.write_varint32(MessageId::NO_OP.header_value())?;
                debug_assert_ne!(state.base, INVALID_POS, "NoOp without a base");
                bases.push(state.base);
                continue;
            }
            let etag = &self.tags_list[state.etag_index as usize];
            let node_id = etag.node_id;
            let subtype = etag.subtype;
            if node_id.tag != 0 {
                let is_delimited =
                    WireType::from_tag(node_id.tag) == Some(WireType::LengthDelimited);
                if is_delimited && subtype == SUBTYPE_DELIMITED_START_OF_SUBMESSAGE {
                    header.write_varint32(MessageId::START_OF_SUBMESSAGE.header_value())?;
                } else if is_delimited && subtype == SUBTYPE_DELIMITED_END_OF_SUBMESSAGE {
                    // Rebased to the reserved wire type so the decoder can
                    // tell submessage exits from plain strings.
                    header.write_varint32(node_id.tag + END_OF_SUBMESSAGE_TAG_OFFSET)?;
                } else {
                    header.write_varint32(node_id.tag)?;
                    if has_subtype(node_id.tag) {
                        subtypes.push(subtype);
                    }
                    if has_data_buffer(node_id.tag, subtype) {
                        let pos = *buffer_pos
                            .get(&node_id)
                            .expect("buffer was written for this field");
                        buffer_indices.push(pos);
                    }
                }
            } else {
                header.write_varint32(node_id.parent.header_value())?;
                if node_id.parent == MessageId::NON_PROTO {
                    let pos = *buffer_pos
                        .get(&node_id)
                        .expect("buffer of non-proto records was written");
                    buffer_indices.push(pos);
                } else {
                    debug_assert_eq!(
                        node_id.parent,
                        MessageId::START_OF_MESSAGE,
                        "unexpected tagless state"
                    );
                }
            }
            if etag.base != INVALID_POS {
                // A source with exactly one destination transitions
                // implicitly; `base + state_count` signals that.
                let sentinel = if etag.dest_info.len() == 1 {
                    state_machine.len() as u32
                } else {
                    0
                };
                bases.push(etag.base + sentinel);
            } else {
                bases.push(0);
            }
        }
        for &base in &bases {
            header.write_varint32(base)?;
        }
        header.write(&subtypes)?;
        for &index in &buffer_indices {
            header.write_varint32(index)?;
        }

        // Initial state: the lowest state carrying the first decoded tag.
        let mut first_tag_pos: u32 = 0;
        if let Some(&first_decoded) = self.encoded_tags.last() {
            while state_machine[first_tag_pos as usize].etag_index != first_decoded {
                first_tag_pos += 1;
            }
        }
        header.write_varint32(first_tag_pos)?;

        self.compressor.reset();
        self.write_transitions(state_machine)?;
        self.compressor.encode_and_close(data)?;
        Ok(())
    }

    /// Sorts and streams every data buffer into compression buckets, writes
    /// bucket and buffer sizes to the header, and returns each buffer's
    /// emission position keyed by its node.
    fn write_buffers(
        &mut self,
        mut sealed: [Vec<SealedBuffer>; BufferType::COUNT],
        nonproto_lengths: &Bytes,
        header: &mut BytesMut,
        data: &mut BytesMut,
    ) -> Result<HashMap<NodeId, u32>> {
        for group in &mut sealed {
            // Largest first; node identity breaks ties so output does not
            // depend on map iteration order.
            group.sort_by(|a, b| {
                b.bytes
                    .len()
                    .cmp(&a.bytes.len())
                    .then_with(|| a.node_id.parent.cmp(&b.node_id.parent))
                    .then_with(|| a.node_id.tag.cmp(&b.node_id.tag))
            });
        }

        let mut bucket_lengths: Vec<u64> = Vec::new();
        let mut buffer_lengths: Vec<u64> = Vec::new();
        let mut buffer_pos: HashMap<NodeId, u32> = HashMap::new();

        for ty in BufferType::ALL {
            let group = &sealed[ty.index()];
            for (i, buffer) in group.iter().enumerate() {
                self.append_to_bucket(
                    i == 0,
                    &buffer.bytes,
                    data,
                    &mut bucket_lengths,
                    &mut buffer_lengths,
                )?;
                let next = buffer_pos.len() as u32;
                let displaced = buffer_pos.insert(buffer.node_id, next);
                debug_assert!(displaced.is_none(), "field has two data buffers");
            }
        }
        if !nonproto_lengths.is_empty() {
            // Always the final buffer, in a bucket of its own. The decoder
            // finds it by position, so it gets no buffer_pos entry.
            self.append_to_bucket(
                true,
                nonproto_lengths,
                data,
                &mut bucket_lengths,
                &mut buffer_lengths,
            )?;
        }
        if self.compressor.writer_pos() > 0 {
            let before = data.len() as u64;
            self.compressor.encode_and_close(data)?;
            bucket_lengths.push(data.len() as u64 - before);
        }

        header.write_varint32(bucket_lengths.len() as u32)?;
        header.write_varint32(buffer_lengths.len() as u32)?;
        for &length in &bucket_lengths {
            header.write_varint64(length)?;
        }
        for &length in &buffer_lengths {
            header.write_varint64(length)?;
        }
        Ok(buffer_pos)
    }

    /// Stages `chunk` into the current compression bucket, closing the
    /// bucket first when forced or when the target size would be exceeded.
    fn append_to_bucket(
        &mut self,
        force_new_bucket: bool,
        chunk: &[u8],
        data: &mut BytesMut,
        bucket_lengths: &mut Vec<u64>,
        buffer_lengths: &mut Vec<u64>,
    ) -> Result<()> {
        buffer_lengths.push(chunk.len() as u64);
        let staged = self.compressor.writer_pos();
        if (force_new_bucket || staged + chunk.len() as u64 > self.bucket_size) && staged > 0 {
            let before = data.len() as u64;
            self.compressor.encode_and_close(data)?;
            bucket_lengths.push(data.len() as u64 - before);
            self.compressor.reset();
        }
        self.compressor.writer().extend_from_slice(chunk);
        Ok(())
    }

    /// Replays `encoded_tags` back to front, staging transition bytes into
    /// the compressor.
    ///
    /// Per edge, three encodings exist:
    /// 1. the destination sits in the source's private list,
    /// 2. the source has no private list and the destination is reached from
    ///    the current base through the public list,
    /// 3. the source has a private list but this destination does not: hop
    ///    to the source's public NoOp first, then proceed as in 2.
    ///
    /// A source with a single destination transitions implicitly and emits
    /// nothing.
    fn write_transitions(&mut self, states: &[StateInfo]) -> Result<()> {
        if self.encoded_tags.is_empty() {
            return Ok(());
        }
        let max_transition = self.max_transition;
        let mut prev_etag = *self.encoded_tags.last().expect("checked non-empty") as usize;
        let mut current_base = self.tags_list[prev_etag].base;
        let mut last_transition: Option<u8> = None;
        for i in (1..self.encoded_tags.len()).rev() {
            let tag = self.encoded_tags[i - 1];
            if self.tags_list[prev_etag].dest_info.len() != 1 {
                let mut pos = self.tags_list[prev_etag]
                    .dest_info
                    .get(&tag)
                    .expect("edge was counted")
                    .pos;
                if pos == INVALID_POS {
                    let noop = self.tags_list[prev_etag].public_list_noop_pos;
                    if noop != INVALID_POS {
                        // Route over the NoOp that leads to the public list.
                        encode_transition(
                            states,
                            max_transition,
                            current_base,
                            noop,
                            &mut last_transition,
                            self.compressor.writer(),
                        );
                        current_base = states[noop as usize].base;
                    }
                    pos = self.tags_list[tag as usize].state_machine_pos;
                }
                debug_assert_ne!(current_base, INVALID_POS, "source tag has no base");
                debug_assert!((pos as usize) < states.len(), "target out of range");
                encode_transition(
                    states,
                    max_transition,
                    current_base,
                    pos,
                    &mut last_transition,
                    self.compressor.writer(),
                );
            } else {
                debug_assert_eq!(
                    states[self.tags_list[prev_etag].base as usize].etag_index,
                    tag,
                    "implicit transition goes to a wrong tag"
                );
            }
            prev_etag = tag as usize;
            current_base = self.tags_list[prev_etag].base;
        }
        if let Some(pending) = last_transition {
            self.compressor.writer().put_u8(pending);
        }
        Ok(())
    }
}

/// Encodes one transition from `current_base` to `pos` as root-to-leaf
/// single-byte offsets, walking up the canonical-source tree until `pos`
/// falls inside the window `[current_base, current_base + max_transition]`.
///
/// Zero offsets are packed: a transition byte holds `offset << 2 | count`,
/// and up to three following zero offsets bump `count` instead of starting a
/// new byte. `last_transition` carries the pending byte between calls; the
/// caller flushes the final one.
fn encode_transition(
    states: &[StateInfo],
    max_transition: u32,
    current_base: u32,
    mut pos: u32,
    last_transition: &mut Option<u8>,
    out: &mut BytesMut,
) {
    let mut scratch = [0u8; TRANSITION_SCRATCH];
    let mut start = TRANSITION_SCRATCH;
    while current_base > pos || pos - current_base > max_transition {
        let covering = states[pos as usize].canonical_source;
        debug_assert!(
            (covering as usize) < states.len(),
            "canonical source out of range"
        );
        debug_assert!(
            states[covering as usize].base <= pos
                && pos - states[covering as usize].base <= max_transition,
            "state unreachable from its covering NoOp"
        );
        debug_assert!(start > 0, "transition scratch overflow");
        start -= 1;
        scratch[start] = (pos - states[covering as usize].base) as u8;
        pos = covering;
    }
    debug_assert!(start > 0, "transition scratch overflow");
    start -= 1;
    scratch[start] = (pos - current_base) as u8;

    for &byte in &scratch[start..] {
        match last_transition {
            Some(pending) if byte == 0 && *pending & 3 < 3 => *pending += 1,
            _ => {
                if let Some(pending) = last_transition.take() {
                    out.put_u8(pending);
                }
                *last_transition = Some(byte << 2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(
        states: &[StateInfo],
        max_transition: u32,
        hops: &[(u32, u32)],
    ) -> Vec<u8> {
        let mut last = None;
        let mut out = BytesMut::new();
        for &(base, pos) in hops {
            encode_transition(states, max_transition, base, pos, &mut last, &mut out);
        }
        if let Some(pending) = last {
            out.put_u8(pending);
        }
        out.to_vec()
    }

    // ---------------------------------------------------------------
    // Zero-run packing
    // ---------------------------------------------------------------

    #[test]
    fn test_up_to_four_zero_offsets_share_a_byte() {
        // Five zero offsets: the first four fuse (count field saturates at
        // 3), the fifth starts a new byte.
        let hops = [(0, 0); 5];
        assert_eq!(emit(&[], 63, &hops), vec![0b0000_0011, 0b0000_0000]);
    }

    #[test]
    fn test_nonzero_offsets_flush_pending_runs() {
        let hops = [(0, 5), (0, 0), (0, 7)];
        // 5 with one fused zero, then 7.
        assert_eq!(emit(&[], 63, &hops), vec![5 << 2 | 1, 7 << 2]);
    }

    // ---------------------------------------------------------------
    // Canonical-source tree walk
    // ---------------------------------------------------------------

    #[test]
    fn test_far_target_walks_up_the_tree() {
        // NoOp at 0 with base 1 covering states 1..=2.
        let mut states = vec![
            StateInfo::new(INVALID_POS, 1),
            StateInfo::new(7, INVALID_POS),
            StateInfo::new(8, INVALID_POS),
        ];
        states[1].canonical_source = 0;
        states[2].canonical_source = 0;
        // With max_transition 1, state 2 is out of the window from base 0;
        // the encoder hops through the NoOp (offset 0) then to the leaf
        // (offset 2 - base 1 = 1).
        assert_eq!(emit(&states, 1, &[(0, 2)]), vec![0 << 2, 1 << 2]);
    }
}
