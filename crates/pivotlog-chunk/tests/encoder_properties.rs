//! Randomized properties of the chunk encoders.

use proptest::prelude::*;

use pivotlog_chunk::{
    ChunkEncoder, CompressorOptions, SimpleEncoder, TransposeEncoder,
};

fn encode_transposed(records: &[Vec<u8>]) -> (Vec<u8>, u64, u64) {
    let mut encoder = TransposeEncoder::new(CompressorOptions::uncompressed(), 64 * 1024);
    for record in records {
        encoder.add_record(record).unwrap();
    }
    let mut chunk: Vec<u8> = Vec::new();
    let summary = encoder.encode_and_close(&mut chunk).unwrap();
    (chunk, summary.num_records, summary.decoded_data_size)
}

proptest! {
    /// Identical inputs always produce byte-identical chunks, whatever mix
    /// of proto-shaped and arbitrary records comes in.
    #[test]
    fn transposed_encoding_is_deterministic(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..24)
    ) {
        let (first, num_records, decoded) = encode_transposed(&records);
        let (second, _, _) = encode_transposed(&records);
        prop_assert_eq!(first, second);
        prop_assert_eq!(num_records, records.len() as u64);
        prop_assert_eq!(
            decoded,
            records.iter().map(|r| r.len() as u64).sum::<u64>()
        );
    }

    /// The row-wise encoder reports exactly the bytes it was given, and its
    /// uncompressed chunk embeds them unchanged.
    #[test]
    fn simple_encoding_accounts_for_every_byte(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..24)
    ) {
        let mut encoder = SimpleEncoder::new(CompressorOptions::uncompressed());
        for record in &records {
            encoder.add_record(record).unwrap();
        }
        let mut chunk: Vec<u8> = Vec::new();
        let summary = encoder.encode_and_close(&mut chunk).unwrap();
        let total: usize = records.iter().map(|r| r.len()).sum();
        prop_assert_eq!(summary.decoded_data_size, total as u64);
        // Concatenated values form the chunk's tail.
        let mut concat = Vec::new();
        for record in &records {
            concat.extend_from_slice(record);
        }
        prop_assert!(chunk.ends_with(&concat));
    }

    /// Batch submission is indistinguishable from one-at-a-time submission.
    #[test]
    fn batched_and_sequential_adds_agree(
        records in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..32), 1..12)
    ) {
        let mut concat = Vec::new();
        let mut limits = Vec::new();
        for record in &records {
            concat.extend_from_slice(record);
            limits.push(concat.len());
        }
        let mut batched = TransposeEncoder::new(CompressorOptions::uncompressed(), 64 * 1024);
        batched.add_records(&concat, &limits).unwrap();
        let mut chunk_batched: Vec<u8> = Vec::new();
        batched.encode_and_close(&mut chunk_batched).unwrap();

        let (chunk_sequential, _, _) = encode_transposed(&records);
        prop_assert_eq!(chunk_batched, chunk_sequential);
    }
}
