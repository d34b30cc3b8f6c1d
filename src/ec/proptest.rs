//! Property-Based Tests for Erasure Coding
//!
//! # Test Properties
//!
//! 1. **Any 4 of 6**: every one of the C(6,4)=15 index subsets decodes
//! 2. **Determinism**: same input always produces the same shards
//! 3. **Checksums**: a flipped byte in a used shard is reported, never decoded
//! 4. **Loss bound**: three missing shards always fail

#![cfg(test)]

use std::collections::BTreeMap;

use proptest::prelude::*;

use super::encoder::{calculate_shard_size, EcEncoder};
use crate::adapters::ReedSolomonCodecAdapter;
use crate::domain::ports::{EcCodec, StoredShard};
use crate::error::Error;

/// All 4-element subsets of the 6 shard indices.
fn four_of_six() -> Vec<[usize; 4]> {
    let mut subsets = Vec::new();
    for a in 0..6 {
        for b in a + 1..6 {
            for c in b + 1..6 {
                for d in c + 1..6 {
                    subsets.push([a, b, c, d]);
                }
            }
        }
    }
    subsets
}

fn pick(shards: &[StoredShard], indices: &[usize]) -> BTreeMap<usize, StoredShard> {
    indices.iter().map(|&i| (i, shards[i].clone())).collect()
}

fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..4096)
}

#[test]
fn test_fifteen_subsets() {
    assert_eq!(four_of_six().len(), 15);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: decode(encode(P)) == P for every 4-of-6 subset.
    #[test]
    fn prop_any_four_of_six_roundtrip(data in data_strategy()) {
        let codec = ReedSolomonCodecAdapter::standard_4_2()?;
        let encoded = codec.encode(&data)?;
        prop_assert_eq!(encoded.shards.len(), 6);

        for subset in four_of_six() {
            let recovered = codec.decode(&pick(&encoded.shards, &subset), data.len())?;
            prop_assert_eq!(&recovered, &data, "subset {:?} failed", subset);
        }
    }

    /// Property: identical input yields identical shards and checksums.
    #[test]
    fn prop_encoding_is_deterministic(data in data_strategy()) {
        let codec = ReedSolomonCodecAdapter::standard_4_2()?;
        let first = codec.encode(&data)?;
        let second = codec.encode(&data)?;
        prop_assert_eq!(first.shards, second.shards);
    }

    /// Property: the data shards are a padded partition of the input.
    #[test]
    fn prop_data_shards_are_systematic(data in prop::collection::vec(any::<u8>(), 1..2048)) {
        let encoder = EcEncoder::new(4, 2)?;
        let shards = encoder.encode(&data)?;
        let shard_size = calculate_shard_size(data.len(), 4);

        let mut joined: Vec<u8> = shards[..4].concat();
        prop_assert_eq!(joined.len(), shard_size * 4);
        prop_assert!(joined[data.len()..].iter().all(|b| *b == 0));
        joined.truncate(data.len());
        prop_assert_eq!(joined, data);
    }

    /// Property: three missing shards can never be decoded.
    #[test]
    fn prop_three_missing_fails(
        data in prop::collection::vec(any::<u8>(), 1..1024),
        kept in prop::sample::subsequence((0usize..6).collect::<Vec<_>>(), 3),
    ) {
        let codec = ReedSolomonCodecAdapter::standard_4_2()?;
        let encoded = codec.encode(&data)?;

        let result = codec.decode(&pick(&encoded.shards, &kept), data.len());
        let is_insufficient = matches!(result, Err(Error::InsufficientShards { available: 3, required: 4 }));
        prop_assert!(is_insufficient);
    }

    /// Property: a corrupted shard among those supplied is detected.
    #[test]
    fn prop_corruption_detected(
        data in prop::collection::vec(any::<u8>(), 1..1024),
        victim in 0usize..6,
        flip in any::<u8>().prop_filter("non-zero flip", |b| *b != 0),
    ) {
        let codec = ReedSolomonCodecAdapter::standard_4_2()?;
        let encoded = codec.encode(&data)?;

        let mut shards = pick(&encoded.shards, &[0, 1, 2, 3, 4, 5]);
        let original = shards[&victim].clone();
        let mut bytes = original.data.to_vec();
        bytes[0] ^= flip;
        shards.insert(victim, StoredShard { data: bytes.into(), checksum: original.checksum });

        let result = codec.decode(&shards, data.len());
        let is_corrupt = matches!(result, Err(Error::CorruptShard { index, .. }) if index == victim);
        prop_assert!(is_corrupt);
    }
}
