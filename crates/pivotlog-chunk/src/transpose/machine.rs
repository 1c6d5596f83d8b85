//! Transition State Machine
//!
//! After accumulation, the sequence of encoded tags is boiled down into a
//! state machine whose transition bytes reproduce the sequence. Layout goal:
//! the transitions that happen most get the cheapest encoding.
//!
//! ## Two Tiers
//!
//! - **Private lists**: a tag whose outgoing edges are frequent enough gets
//!   its own block of destination states, reachable in one byte from the
//!   tag's `base`.
//! - **Public list**: one shared block at the end of the state array holding
//!   a state per tag that still has incoming transitions after the private
//!   lists claimed theirs. Tags without a private list route here directly;
//!   tags with one reach it through a NoOp state in their block.
//!
//! ## Balanced NoOp Trees
//!
//! A one-byte transition can only target offsets `0..=max_transition` from
//! the source's base. Blocks wider than that are split into a balanced tree
//! of sub-blocks joined by NoOp states; each NoOp's `base` points at its
//! child block and each covered state remembers the NoOp as its
//! `canonical_source`. Encoding a transition then walks up the
//! canonical-source tree until the target block is reachable, emitting one
//! byte per level.
//!
//! States are allocated back to front so a block's base is always below the
//! indices it points into; the base-index solver depends on transitions in
//! the public list only ever moving to higher indices.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::BTreeMap;

use super::tags::{NodeId, Subtype, INVALID_POS};

/// One entry of the state machine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StateInfo {
    /// Tags-list slot this state emits, or `INVALID_POS` for NoOp states.
    pub(crate) etag_index: u32,
    /// First index of the block reachable from this state, or `INVALID_POS`
    /// if the state has no outgoing transitions.
    pub(crate) base: u32,
    /// The NoOp state whose block covers this state, or `INVALID_POS` for
    /// states in a root block.
    pub(crate) canonical_source: u32,
}

impl StateInfo {
    pub(crate) fn new(etag_index: u32, base: u32) -> Self {
        Self {
            etag_index,
            base,
            canonical_source: INVALID_POS,
        }
    }
}

impl Default for StateInfo {
    fn default() -> Self {
        Self::new(INVALID_POS, INVALID_POS)
    }
}

/// Where one outgoing edge of a tag leads.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DestInfo {
    /// State index in the source tag's private list, or `INVALID_POS` if the
    /// edge is served through the public list.
    pub(crate) pos: u32,
    /// How often this edge occurs in the input.
    pub(crate) num_transitions: u64,
}

impl Default for DestInfo {
    fn default() -> Self {
        Self {
            pos: INVALID_POS,
            num_transitions: 0,
        }
    }
}

/// The state machine's view of one distinct encoded tag.
#[derive(Debug)]
pub(crate) struct EncodedTagInfo {
    pub(crate) node_id: NodeId,
    pub(crate) subtype: Subtype,
    /// Outgoing edges keyed by destination tags-list slot. Ordered map:
    /// iteration order leaks into emitted base indices.
    pub(crate) dest_info: BTreeMap<u32, DestInfo>,
    /// Incoming edges not yet claimed by a private list.
    pub(crate) num_incoming_transitions: u64,
    /// This tag's state in the public list, or `INVALID_POS`.
    pub(crate) state_machine_pos: u32,
    /// The NoOp in this tag's private list that forwards into the public
    /// list, or `INVALID_POS`.
    pub(crate) public_list_noop_pos: u32,
    /// First index of this tag's destination block, or `INVALID_POS` if it
    /// has none.
    pub(crate) base: u32,
}

impl EncodedTagInfo {
    pub(crate) fn new(node_id: NodeId, subtype: Subtype) -> Self {
        Self {
            node_id,
            subtype,
            dest_info: BTreeMap::new(),
            num_incoming_transitions: 0,
            state_machine_pos: INVALID_POS,
            public_list_noop_pos: INVALID_POS,
            base: INVALID_POS,
        }
    }
}

/// Heap entry ordering destinations for back-to-front block layout: the
/// lightest entry pops first and lands at the highest index, so the most
/// frequent destination ends up at its block's base with transition offset
/// zero. Ties pop the larger index first for reproducible output.
///
/// Synthetic entries for block NoOps use `dest_index` values at or above the
/// tags-list length, so no two live entries ever compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeapEntry {
    dest_index: u32,
    num_transitions: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .num_transitions
            .cmp(&self.num_transitions)
            .then_with(|| self.dest_index.cmp(&other.dest_index))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Counts edges between consecutive tags of `encoded_tags`, walked in decode
/// order (back to front), into `dest_info` and `num_incoming_transitions`.
///
/// The tag referenced by the last entry is the decoder's initial state; its
/// incoming count is forced to at least one so a state is materialized for
/// it even when nothing transitions into it.
fn collect_transition_statistics(tags_list: &mut [EncodedTagInfo], encoded_tags: &[u32]) {
    let mut prev = *encoded_tags.last().expect("tag sequence is not empty");
    for i in (1..encoded_tags.len()).rev() {
        let pos = encoded_tags[i - 1];
        tags_list[prev as usize]
            .dest_info
            .entry(pos)
            .or_default()
            .num_transitions += 1;
        tags_list[pos as usize].num_incoming_transitions += 1;
        prev = pos;
    }

    let first = *encoded_tags.last().expect("tag sequence is not empty") as usize;
    if tags_list[first].num_incoming_transitions == 0 {
        tags_list[first].num_incoming_transitions = 1;
    }
}

/// Builds the two-tier state machine for `encoded_tags`.
///
/// On return every tag with outgoing transitions has its `base` set, every
/// tag surviving into the public list has `state_machine_pos`, and hot edges
/// have their private-list state index in `dest_info`.
pub(crate) fn build(
    tags_list: &mut Vec<EncodedTagInfo>,
    encoded_tags: &[u32],
    max_transition: u32,
    min_count_for_state: u64,
) -> Vec<StateInfo> {
    let mut states: Vec<StateInfo> = Vec::new();
    if encoded_tags.is_empty() {
        return states;
    }

    collect_transition_statistics(tags_list, encoded_tags);

    // Claim hot edges for their source's private list and subtract them from
    // the destination's incoming count, so the count left over is exactly the
    // public-list weight.
    const IN_LIST_POS: u32 = 0;
    for src in 0..tags_list.len() {
        let hot: Vec<(u32, u64)> = tags_list[src]
            .dest_info
            .iter()
            .filter(|(_, info)| info.num_transitions >= min_count_for_state)
            .map(|(&dest, info)| (dest, info.num_transitions))
            .collect();
        for (dest, count) in hot {
            tags_list[dest as usize].num_incoming_transitions -= count;
            tags_list[src].dest_info.get_mut(&dest).expect("edge exists").pos = IN_LIST_POS;
        }
    }

    let tags_len = tags_list.len() as u32;
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    // (tag index, state index) of every NoOp whose base lands in the public
    // list; their bases are solved after the public list exists.
    let mut public_list_noops: Vec<(u32, u32)> = Vec::new();
    // Base of each block NoOp created while laying out the current list.
    let mut noop_base: Vec<u32> = Vec::new();

    // Private lists.
    for tag_id in 0..tags_list.len() {
        let snapshot: Vec<(u32, u32, u64)> = tags_list[tag_id]
            .dest_info
            .iter()
            .map(|(&dest, info)| (dest, info.pos, info.num_transitions))
            .collect();
        let num_dests = snapshot.len() as u32;
        // If exactly one destination stays cold, pulling it in beats paying
        // for a one-entry public NoOp.
        let mut excluded = HeapEntry {
            dest_index: 0,
            num_transitions: 0,
        };
        let mut num_excluded_transitions: u64 = 0;
        for &(dest, pos, count) in &snapshot {
            let claimed = pos == IN_LIST_POS
                || count == tags_list[dest as usize].num_incoming_transitions;
            if claimed {
                if pos != IN_LIST_POS {
                    // All remaining inbound traffic of `dest` is this edge;
                    // absorb it instead of leaving a public singleton.
                    tags_list[dest as usize].num_incoming_transitions -= count;
                }
                heap.push(HeapEntry {
                    dest_index: dest,
                    num_transitions: count,
                });
            } else {
                num_excluded_transitions += count;
                excluded = HeapEntry {
                    dest_index: dest,
                    num_transitions: count,
                };
            }
        }
        let mut num_states = heap.len() as u32;
        if num_states == 0 {
            continue;
        }
        if num_states + 1 == num_dests {
            num_states += 1;
            tags_list[excluded.dest_index as usize].num_incoming_transitions -=
                excluded.num_transitions;
            heap.push(excluded);
        }
        if num_states != num_dests {
            heap.push(HeapEntry {
                dest_index: INVALID_POS,
                num_transitions: num_excluded_transitions,
            });
            num_states += 1;
        }
        tags_list[tag_id].base = states.len() as u32;
        lay_out_blocks(
            &mut states,
            &mut heap,
            &mut noop_base,
            num_states,
            max_transition,
            tags_len,
            |states, state_index, dest| {
                if dest == INVALID_POS {
                    states[state_index as usize] = StateInfo::new(INVALID_POS, INVALID_POS);
                    tags_list[tag_id].public_list_noop_pos = state_index;
                    public_list_noops.push((tag_id as u32, state_index));
                } else {
                    states[state_index as usize] = StateInfo::new(dest, INVALID_POS);
                    tags_list[tag_id]
                        .dest_info
                        .get_mut(&dest)
                        .expect("destination exists")
                        .pos = state_index;
                }
            },
        );
    }

    // Public list.
    let public_list_base = states.len() as u32;
    for i in 0..tags_list.len() {
        if tags_list[i].num_incoming_transitions != 0 {
            heap.push(HeapEntry {
                dest_index: i as u32,
                num_transitions: tags_list[i].num_incoming_transitions,
            });
        }
    }
    let num_states = heap.len() as u32;
    if num_states > 0 {
        lay_out_blocks(
            &mut states,
            &mut heap,
            &mut noop_base,
            num_states,
            max_transition,
            tags_len,
            |states, state_index, dest| {
                states[state_index as usize] = StateInfo::new(dest, INVALID_POS);
                tags_list[dest as usize].state_machine_pos = state_index;
            },
        );
    }

    compute_base_indices(
        max_transition,
        public_list_base,
        &public_list_noops,
        tags_list,
        &mut states,
    );

    states
}

/// Drains `heap` into a run of blocks appended to `states`, filling back to
/// front so heavier entries land at higher indices.
///
/// `num_states` counts the real entries in the heap; block NoOps are added on
/// top. The last-created (lowest) block is the root that the source's `base`
/// points at. Whenever a block fills up while entries remain, a synthetic
/// NoOp covering it is pushed back into the heap with the block's summed
/// weight, encoded as `tags_len + k` to keep it apart from real
/// destinations.
fn lay_out_blocks(
    states: &mut Vec<StateInfo>,
    heap: &mut BinaryHeap<HeapEntry>,
    noop_base: &mut Vec<u32>,
    mut num_states: u32,
    max_transition: u32,
    tags_len: u32,
    mut place: impl FnMut(&mut Vec<StateInfo>, u32, u32),
) {
    let noop_states = if num_states <= max_transition + 1 {
        0
    } else {
        (num_states - 2) / max_transition
    };
    num_states += noop_states;
    let mut next_state = states.len() as u32 + num_states;
    states.resize(next_state as usize, StateInfo::default());
    // All blocks hold max_transition + 1 states except the last one created,
    // which takes the remainder.
    let mut block_size = (num_states - 1) % (max_transition + 1) + 1;
    noop_base.clear();
    loop {
        let mut block_weight: u64 = 0;
        for _ in 0..block_size {
            let entry = heap.pop().expect("heap drained before the block was full");
            block_weight += entry.num_transitions;
            next_state -= 1;
            if entry.dest_index != INVALID_POS && entry.dest_index >= tags_len {
                // NoOp covering an earlier (higher-index) block.
                let base = noop_base[(entry.dest_index - tags_len) as usize];
                states[next_state as usize] = StateInfo::new(INVALID_POS, base);
                for offset in 0..=max_transition {
                    if base + offset >= states.len() as u32 {
                        break;
                    }
                    states[(base + offset) as usize].canonical_source = next_state;
                }
            } else {
                place(states, next_state, entry.dest_index);
            }
        }
        if heap.is_empty() {
            break;
        }
        debug_assert!(
            tags_len.checked_add(noop_base.len() as u32 + 1).is_some(),
            "synthetic NoOp index overflow"
        );
        heap.push(HeapEntry {
            dest_index: tags_len + noop_base.len() as u32,
            num_transitions: block_weight,
        });
        noop_base.push(next_state);
        block_size = max_transition + 1;
    }
}

/// Fills in `base` for tags without a private list and for private-list
/// NoOps that forward into the public list.
///
/// Setting every such base to the start of the public list would be valid,
/// but most tags target only a few destinations, so a base closer to them
/// saves transition bytes. The base is found per destination by walking the
/// canonical-source tree: while the destination is not reachable in one
/// byte, either hoist the base one level up (when it sits above the
/// destination) or replace the destination by its covering NoOp. The tree's
/// fan-out is bounded by `max_transition + 1`, so the walk terminates.
fn compute_base_indices(
    max_transition: u32,
    public_list_base: u32,
    public_list_noops: &[(u32, u32)],
    tags_list: &mut [EncodedTagInfo],
    states: &mut [StateInfo],
) {
    for &(tag_index, noop_state) in public_list_noops {
        let dests: Vec<(u32, u32)> = tags_list[tag_index as usize]
            .dest_info
            .iter()
            .map(|(&dest, info)| (dest, info.pos))
            .collect();
        let min_pos = reachable_base(&dests, tags_list, states, max_transition, public_list_base);
        debug_assert_ne!(min_pos, INVALID_POS, "public NoOp with no outgoing edges");
        states[noop_state as usize].base = min_pos;
    }

    for tag_index in 0..tags_list.len() {
        if tags_list[tag_index].base != INVALID_POS {
            continue;
        }
        let dests: Vec<(u32, u32)> = tags_list[tag_index]
            .dest_info
            .iter()
            .map(|(&dest, info)| (dest, info.pos))
            .collect();
        let min_pos = reachable_base(&dests, tags_list, states, max_transition, public_list_base);
        if min_pos != INVALID_POS {
            tags_list[tag_index].base = min_pos;
        }
    }
}

/// Smallest state index from which every public-list destination in `dests`
/// can be reached through the canonical-source tree with single-byte
/// offsets. `INVALID_POS` when no destination routes through the public
/// list.
fn reachable_base(
    dests: &[(u32, u32)],
    tags_list: &[EncodedTagInfo],
    states: &[StateInfo],
    max_transition: u32,
    public_list_base: u32,
) -> u32 {
    let mut base = INVALID_POS;
    let mut min_pos = INVALID_POS;
    for &(dest, private_pos) in dests {
        if private_pos != INVALID_POS {
            // Served by the private list.
            continue;
        }
        let mut pos = tags_list[dest as usize].state_machine_pos;
        debug_assert_ne!(pos, INVALID_POS, "destination missing from the public list");
        // `base == INVALID_POS` enters the loop through the `base > pos` arm
        // and seeds it from the destination's covering NoOp.
        while base > pos || pos - base > max_transition {
            if base > pos {
                let up = if base == INVALID_POS {
                    states[pos as usize].canonical_source
                } else {
                    let covering = states[base as usize].canonical_source;
                    debug_assert_ne!(covering, INVALID_POS, "base above an uncovered state");
                    // Transitions into already-processed states will route
                    // through this NoOp.
                    min_pos = min_pos.min(covering);
                    states[covering as usize].canonical_source
                };
                base = if up == INVALID_POS {
                    public_list_base
                } else {
                    states[up as usize].base
                };
            } else {
                let covering = states[pos as usize].canonical_source;
                debug_assert!(
                    (covering as usize) < states.len(),
                    "state not covered by any NoOp"
                );
                debug_assert!(
                    states[covering as usize].base <= pos
                        && pos - states[covering as usize].base <= max_transition,
                    "state unreachable from its covering NoOp"
                );
                pos = covering;
            }
        }
        min_pos = min_pos.min(pos);
    }
    min_pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transpose::tags::MessageId;

    fn tag_info(n: usize) -> Vec<EncodedTagInfo> {
        (0..n)
            .map(|i| EncodedTagInfo::new(NodeId::new(MessageId::ROOT, 8 + 8 * i as u32), 0))
            .collect()
    }

    /// Checks the structural invariants every built machine must satisfy:
    /// NoOp children sit within one byte of their parent's base and point
    /// back at it, and private-list edge positions are inside the machine.
    fn assert_well_formed(states: &[StateInfo], tags_list: &[EncodedTagInfo], max_transition: u32) {
        for (index, state) in states.iter().enumerate() {
            if state.etag_index == INVALID_POS && state.base != INVALID_POS {
                for offset in 0..=max_transition {
                    let child = state.base + offset;
                    if child as usize >= states.len() {
                        break;
                    }
                    let covering = states[child as usize].canonical_source;
                    if covering == index as u32 {
                        assert!(child >= state.base && child - state.base <= max_transition);
                    }
                }
            }
        }
        for tag in tags_list {
            for info in tag.dest_info.values() {
                if info.pos != INVALID_POS {
                    assert!((info.pos as usize) < states.len());
                }
            }
            if tag.base != INVALID_POS {
                assert!((tag.base as usize) < states.len());
            }
        }
        for state in states {
            if state.canonical_source != INVALID_POS {
                let parent = &states[state.canonical_source as usize];
                assert_eq!(parent.etag_index, INVALID_POS, "canonical source must be a NoOp");
            }
        }
    }

    #[test]
    fn test_empty_sequence_builds_empty_machine() {
        let mut tags = tag_info(0);
        let states = build(&mut tags, &[], 63, 10);
        assert!(states.is_empty());
    }

    #[test]
    fn test_single_edge_repeated_forms_private_lists() {
        // Tag sequence 0 1 0 1: both edges carry all traffic of their
        // destination, so both tags end up with a private list and the
        // public list stays empty.
        let mut tags = tag_info(2);
        let states = build(&mut tags, &[0, 1, 0, 1], 63, 10);
        assert_eq!(states.len(), 2);
        assert_eq!(tags[0].base, 0);
        assert_eq!(tags[1].base, 1);
        assert_eq!(states[0].etag_index, 1);
        assert_eq!(states[1].etag_index, 0);
        assert_eq!(tags[0].num_incoming_transitions, 0);
        assert_eq!(tags[1].num_incoming_transitions, 0);
        assert_well_formed(&states, &tags, 63);
    }

    #[test]
    fn test_initial_tag_is_materialized_without_incoming_edges() {
        // One-element sequence: no edges at all, but the decoder still needs
        // its initial state.
        let mut tags = tag_info(1);
        let states = build(&mut tags, &[0], 63, 10);
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].etag_index, 0);
        assert_eq!(tags[0].state_machine_pos, 0);
    }

    #[test]
    fn test_wide_fanout_builds_noop_tree() {
        // One hub tag transitioning to 100 distinct destinations and back,
        // with a low max_transition, forces NoOp sub-blocks.
        let num_dests = 100u32;
        let max_transition = 7u32;
        let mut tags = tag_info(1 + num_dests as usize);
        let mut sequence = Vec::new();
        // hub -> dest -> hub -> dest ... each dest edge once, hot threshold 1.
        for dest in 1..=num_dests {
            sequence.push(0);
            sequence.push(dest);
        }
        // Decode order is reversed, so edges counted are dest->hub and
        // hub->dest alike; both directions exist.
        let states = build(&mut tags, &sequence, max_transition, 1);
        assert!(!states.is_empty());
        // NoOps exist.
        assert!(states.iter().any(|s| s.etag_index == INVALID_POS));
        // Every covered state points at a NoOp whose block contains it.
        for (index, state) in states.iter().enumerate() {
            let covering = state.canonical_source;
            if covering != INVALID_POS {
                let parent = &states[covering as usize];
                assert_eq!(parent.etag_index, INVALID_POS);
                let base = parent.base;
                assert!(base <= index as u32 && index as u32 - base <= max_transition);
            }
        }
        assert_well_formed(&states, &tags, max_transition);
        // Hub has a private list; its base points at the root block.
        assert_ne!(tags[0].base, INVALID_POS);
    }

    #[test]
    fn test_public_list_transitions_increase_indices() {
        // Cold edges only: everything lands in the public list, and bases
        // assigned to tags must not exceed their destinations' positions.
        let mut tags = tag_info(6);
        let sequence: Vec<u32> = (0..6u32).cycle().take(12).collect();
        let states = build(&mut tags, &sequence, 63, 100);
        for tag in tags.iter() {
            if tag.base == INVALID_POS {
                continue;
            }
            for (&dest, info) in &tag.dest_info {
                if info.pos != INVALID_POS {
                    continue;
                }
                let pos = tags[dest as usize].state_machine_pos;
                assert!(pos >= tag.base, "destination below the source base");
            }
        }
        assert_well_formed(&states, &tags, 63);
    }

    #[test]
    fn test_deterministic_across_runs() {
        let sequence: Vec<u32> = vec![0, 1, 2, 1, 0, 2, 2, 1, 0, 1, 1, 2];
        let mut tags_a = tag_info(3);
        let mut tags_b = tag_info(3);
        let a = build(&mut tags_a, &sequence, 63, 2);
        let b = build(&mut tags_b, &sequence, 63, 2);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.etag_index, y.etag_index);
            assert_eq!(x.base, y.base);
            assert_eq!(x.canonical_source, y.canonical_source);
        }
    }
}
