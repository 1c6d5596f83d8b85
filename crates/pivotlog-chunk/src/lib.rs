//! Chunk Encoders
//!
//! This crate turns a sequence of records into a single self-contained
//! **chunk**: a compact byte block an outer container stores and a decoder
//! reconstructs record by record.
//!
//! ## Encoders
//!
//! ### TransposeEncoder
//! Inspects each record's proto wire format and regroups same-typed fields
//! from all records into shared byte buffers, then encodes the record
//! structure as transitions through a state machine tuned so that frequent
//! field sequences cost one byte each. Records that are not canonical proto
//! messages pass through verbatim on a side channel. This is the encoder to
//! use for streams of similarly-shaped messages.
//!
//! ### SimpleEncoder
//! Stores record sizes and record values as two compressed blocks, without
//! looking inside the records. Cheap to encode, and the fallback when record
//! shapes share nothing.
//!
//! ## Chunk Layout
//!
//! Both encoders produce:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ Compression type (1 byte)                   │
//! ├─────────────────────────────────────────────┤
//! │ Header length (varint)                      │
//! ├─────────────────────────────────────────────┤
//! │ Header (possibly compressed)                │
//! ├─────────────────────────────────────────────┤
//! │ Data (possibly compressed, encoder-defined) │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Every compressed block is prefixed with its varint-encoded uncompressed
//! size so a decoder can size its output buffer up front.

pub mod compress;
pub mod simple;
pub mod transpose;

pub use compress::{CompressionType, CompressorOptions};
pub use simple::SimpleEncoder;
pub use transpose::{TransposeEncoder, DEFAULT_BUCKET_SIZE};

use pivotlog_core::{Result, Writer};

/// Most records one chunk may hold.
pub const MAX_NUM_RECORDS: u64 = (1 << 48) - 1;

/// Identifies how a chunk's data section is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    /// Record sizes and values stored as-is.
    Simple = b'r',
    /// Records split into per-field buffers plus a transition stream.
    Transposed = b't',
}

/// What `encode_and_close` reports about the finished chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSummary {
    pub chunk_type: ChunkType,
    pub num_records: u64,
    /// Total size of the records as the decoder will reproduce them.
    pub decoded_data_size: u64,
}

/// Common surface of the chunk encoders.
///
/// An encoder accumulates records, then `encode_and_close` writes the chunk
/// and closes it. A failed or closed encoder rejects every operation with
/// `Error::Closed` until `reset` returns it to the empty open state.
pub trait ChunkEncoder {
    fn reset(&mut self);

    fn add_record(&mut self, record: &[u8]) -> Result<()>;

    /// Adds a batch of records stored concatenated in `records`, where
    /// `limits` holds the cumulative end position of each record.
    ///
    /// Panics if `limits` is not sorted or does not end at `records.len()`.
    fn add_records(&mut self, records: &[u8], limits: &[usize]) -> Result<()>;

    fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<ChunkSummary>;

    fn chunk_type(&self) -> ChunkType;
}
