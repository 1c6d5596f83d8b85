//! Compression Backends
//!
//! Chunks compress their header, their data buckets, and their transition
//! stream independently. All three go through one reusable [`Compressor`]:
//! uncompressed input is staged in an in-memory buffer and compressed in one
//! shot when the block is closed, the same way segment blocks are flushed in
//! block-based storage formats.
//!
//! ## Supported Codecs
//!
//! - **None**: staged bytes are written through unchanged
//! - **Zstd**: best density, tunable level
//! - **Snappy**: fastest, no levels
//! - **Lz4**: fast with good ratios
//!
//! Every compressed block is prefixed with its varint-encoded uncompressed
//! size. `None` writes no prefix.

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use pivotlog_core::{Error, Result, Writer};

/// Compression codec applied to chunk blocks.
///
/// The discriminant is the byte stored in the chunk's first position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
    Zstd = b'z',
    Snappy = b's',
    Lz4 = b'l',
}

/// Default Zstd compression level.
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

/// Codec selection plus codec-specific tuning.
///
/// Parseable from text for configuration files and CLI flags:
///
/// ```
/// use pivotlog_chunk::CompressorOptions;
///
/// let options: CompressorOptions = "zstd:9".parse().unwrap();
/// assert_eq!(options.level(), 9);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressorOptions {
    compression: CompressionType,
    level: i32,
}

impl Default for CompressorOptions {
    fn default() -> Self {
        Self::zstd(DEFAULT_ZSTD_LEVEL)
    }
}

impl CompressorOptions {
    pub fn uncompressed() -> Self {
        Self {
            compression: CompressionType::None,
            level: 0,
        }
    }

    pub fn zstd(level: i32) -> Self {
        Self {
            compression: CompressionType::Zstd,
            level,
        }
    }

    pub fn snappy() -> Self {
        Self {
            compression: CompressionType::Snappy,
            level: 0,
        }
    }

    pub fn lz4() -> Self {
        Self {
            compression: CompressionType::Lz4,
            level: 0,
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

/// Error returned when parsing a compression options string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptionsError(String);

impl fmt::Display for ParseOptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid compression options: {}", self.0)
    }
}

impl std::error::Error for ParseOptionsError {}

impl FromStr for CompressorOptions {
    type Err = ParseOptionsError;

    /// Accepts `uncompressed`, `zstd`, `zstd:LEVEL`, `snappy`, and `lz4`.
    fn from_str(text: &str) -> std::result::Result<Self, Self::Err> {
        let (name, level) = match text.split_once(':') {
            Some((name, level)) => (name, Some(level)),
            None => (text, None),
        };
        match (name, level) {
            ("uncompressed", None) => Ok(Self::uncompressed()),
            ("zstd", None) => Ok(Self::zstd(DEFAULT_ZSTD_LEVEL)),
            ("zstd", Some(level)) => {
                let level: i32 = level
                    .parse()
                    .map_err(|_| ParseOptionsError(text.to_string()))?;
                Ok(Self::zstd(level))
            }
            ("snappy", None) => Ok(Self::snappy()),
            ("lz4", None) => Ok(Self::lz4()),
            _ => Err(ParseOptionsError(text.to_string())),
        }
    }
}

/// Reusable one-shot compressor.
///
/// Usage cycle: write uncompressed bytes through `writer()`, close the block
/// with `encode_and_close`, then call `reset` before the next block. Using
/// the writer of a closed compressor is a programming error.
#[derive(Debug)]
pub(crate) struct Compressor {
    options: CompressorOptions,
    buf: BytesMut,
    closed: bool,
}

impl Compressor {
    pub(crate) fn new(options: CompressorOptions) -> Self {
        Self {
            options,
            buf: BytesMut::new(),
            closed: false,
        }
    }

    /// Returns the compressor to the empty open state.
    pub(crate) fn reset(&mut self) {
        self.buf.clear();
        self.closed = false;
    }

    /// The sink uncompressed data is staged into.
    pub(crate) fn writer(&mut self) -> &mut BytesMut {
        debug_assert!(!self.closed, "compressor used without reset");
        &mut self.buf
    }

    /// Bytes staged so far.
    pub(crate) fn writer_pos(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Compresses the staged bytes into `dest` and closes the block.
    ///
    /// For every codec except `None` the output starts with the
    /// varint-encoded uncompressed size.
    pub(crate) fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<()> {
        debug_assert!(!self.closed, "compressor closed twice without reset");
        self.closed = true;
        match self.options.compression {
            CompressionType::None => {
                dest.write(&self.buf)?;
            }
            CompressionType::Zstd => {
                let compressed = zstd::encode_all(&self.buf[..], self.options.level)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                dest.write_varint64(self.buf.len() as u64)?;
                dest.write(&compressed)?;
            }
            CompressionType::Snappy => {
                let compressed = snap::raw::Encoder::new()
                    .compress_vec(&self.buf)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                dest.write_varint64(self.buf.len() as u64)?;
                dest.write(&compressed)?;
            }
            CompressionType::Lz4 => {
                let compressed = lz4_flex::compress(&self.buf);
                dest.write_varint64(self.buf.len() as u64)?;
                dest.write(&compressed)?;
            }
        }
        self.buf.clear();
        Ok(())
    }
}
