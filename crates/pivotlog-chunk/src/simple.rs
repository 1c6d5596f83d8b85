//! Row-wise Chunk Encoder
//!
//! `SimpleEncoder` keeps records whole: one compressed block of record
//! sizes, one compressed block of concatenated record values. It never
//! inspects record contents, so it works equally well for proto messages and
//! arbitrary bytes, and it is the cheaper choice when records share no
//! structure worth transposing.
//!
//! ## Chunk Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Compression type (1 byte)                    │
//! ├──────────────────────────────────────────────┤
//! │ Length of compressed sizes block (varint)    │
//! ├──────────────────────────────────────────────┤
//! │ Sizes block: one varint per record           │
//! ├──────────────────────────────────────────────┤
//! │ Values block: concatenated record bytes      │
//! └──────────────────────────────────────────────┘
//! ```

use pivotlog_core::{varint, Error, Result, Writer};

use crate::compress::{Compressor, CompressorOptions};
use crate::{ChunkEncoder, ChunkSummary, ChunkType, MAX_NUM_RECORDS};

/// Chunk encoder that stores record sizes and values as-is.
#[derive(Debug)]
pub struct SimpleEncoder {
    options: CompressorOptions,
    open: bool,
    num_records: u64,
    sizes: Compressor,
    values: Compressor,
}

impl SimpleEncoder {
    pub fn new(options: CompressorOptions) -> Self {
        Self {
            options,
            open: true,
            num_records: 0,
            sizes: Compressor::new(options),
            values: Compressor::new(options),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        self.open = false;
        Err(error)
    }
}

impl ChunkEncoder for SimpleEncoder {
    fn reset(&mut self) {
        self.open = true;
        self.num_records = 0;
        self.sizes = Compressor::new(self.options);
        self.values = Compressor::new(self.options);
    }

    fn add_record(&mut self, record: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if self.num_records == MAX_NUM_RECORDS {
            return self.fail(Error::ResourceExhausted("too many records"));
        }
        self.num_records += 1;
        varint::write_varint64(self.sizes.writer(), record.len() as u64);
        self.values.writer().extend_from_slice(record);
        Ok(())
    }

    fn add_records(&mut self, records: &[u8], limits: &[usize]) -> Result<()> {
        assert_eq!(
            limits.last().copied().unwrap_or(0),
            records.len(),
            "record end positions do not match concatenated record values"
        );
        self.ensure_open()?;
        if limits.len() as u64 > MAX_NUM_RECORDS - self.num_records {
            return self.fail(Error::ResourceExhausted("too many records"));
        }
        self.num_records += limits.len() as u64;
        let mut start = 0;
        for &limit in limits {
            assert!(limit >= start, "record end positions not sorted");
            varint::write_varint64(self.sizes.writer(), (limit - start) as u64);
            start = limit;
        }
        self.values.writer().extend_from_slice(records);
        Ok(())
    }

    fn encode_and_close(&mut self, dest: &mut dyn Writer) -> Result<ChunkSummary> {
        self.ensure_open()?;
        self.open = false;

        let num_records = self.num_records;
        let decoded_data_size = self.values.writer_pos();

        dest.write_u8(self.options.compression_type() as u8)?;

        let mut compressed_sizes: Vec<u8> = Vec::new();
        self.sizes.encode_and_close(&mut compressed_sizes)?;
        dest.write_varint64(compressed_sizes.len() as u64)?;
        dest.write(&compressed_sizes)?;

        self.values.encode_and_close(dest)?;

        Ok(ChunkSummary {
            chunk_type: ChunkType::Simple,
            num_records,
            decoded_data_size,
        })
    }

    fn chunk_type(&self) -> ChunkType {
        ChunkType::Simple
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pivotlog_core::varint;

    #[test]
    fn test_uncompressed_layout() {
        let mut encoder = SimpleEncoder::new(CompressorOptions::uncompressed());
        encoder.add_record(b"abc").unwrap();
        encoder.add_record(b"defgh").unwrap();
        let mut chunk: Vec<u8> = Vec::new();
        let summary = encoder.encode_and_close(&mut chunk).unwrap();
        assert_eq!(summary.chunk_type, ChunkType::Simple);
        assert_eq!(summary.num_records, 2);
        assert_eq!(summary.decoded_data_size, 8);

        assert_eq!(chunk[0], 0); // no compression
        let (sizes_len, prefix) = varint::decode_varint64(&chunk[1..]).unwrap();
        let sizes_start = 1 + prefix;
        let sizes = &chunk[sizes_start..sizes_start + sizes_len as usize];
        assert_eq!(sizes, &[3, 5]);
        assert_eq!(&chunk[sizes_start + sizes_len as usize..], b"abcdefgh");
    }

    #[test]
    fn test_add_records_matches_sequential() {
        let records: [&[u8]; 3] = [b"one", b"", b"three"];
        let mut concat = Vec::new();
        let mut limits = Vec::new();
        for record in records {
            concat.extend_from_slice(record);
            limits.push(concat.len());
        }

        let mut batched = SimpleEncoder::new(CompressorOptions::uncompressed());
        batched.add_records(&concat, &limits).unwrap();
        let mut chunk_batched: Vec<u8> = Vec::new();
        batched.encode_and_close(&mut chunk_batched).unwrap();

        let mut sequential = SimpleEncoder::new(CompressorOptions::uncompressed());
        for record in records {
            sequential.add_record(record).unwrap();
        }
        let mut chunk_sequential: Vec<u8> = Vec::new();
        sequential.encode_and_close(&mut chunk_sequential).unwrap();

        assert_eq!(chunk_batched, chunk_sequential);
    }

    #[test]
    fn test_closed_after_encode() {
        let mut encoder = SimpleEncoder::new(CompressorOptions::uncompressed());
        let mut chunk: Vec<u8> = Vec::new();
        encoder.encode_and_close(&mut chunk).unwrap();
        assert!(matches!(encoder.add_record(b"x"), Err(Error::Closed)));
        encoder.reset();
        assert!(encoder.add_record(b"x").is_ok());
    }

    #[test]
    fn test_compressed_sizes_block_roundtrips() {
        let mut encoder = SimpleEncoder::new(CompressorOptions::zstd(3));
        for _ in 0..100 {
            encoder.add_record(&[0x42; 32]).unwrap();
        }
        let mut chunk: Vec<u8> = Vec::new();
        encoder.encode_and_close(&mut chunk).unwrap();
        assert_eq!(chunk[0], b'z');
        let (sizes_len, prefix) = varint::decode_varint64(&chunk[1..]).unwrap();
        let sizes_block = &chunk[1 + prefix..1 + prefix + sizes_len as usize];
        let (uncompressed, inner) = varint::decode_varint64(sizes_block).unwrap();
        assert_eq!(uncompressed, 100);
        let sizes = zstd::decode_all(&sizes_block[inner..]).unwrap();
        assert_eq!(sizes, vec![32u8; 100]);
    }
}
