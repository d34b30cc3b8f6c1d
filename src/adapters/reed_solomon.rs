//! Reed-Solomon Codec Adapter
//!
//! Implements the `EcCodec` port on top of `EcEncoder`/`EcDecoder`, sealing
//! every shard with a CRC32 checksum and verifying checksums before decoding.

use std::collections::BTreeMap;

use crate::domain::ports::{EcCodec, EncodedData, StoredShard, DATA_SHARDS, PARITY_SHARDS};
use crate::ec::encoder::{calculate_shard_size, EcDecoder, EcEncoder};
use crate::error::Result;

/// Reed-Solomon based erasure coding adapter.
pub struct ReedSolomonCodecAdapter {
    encoder: EcEncoder,
    decoder: EcDecoder,
}

impl std::fmt::Debug for ReedSolomonCodecAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReedSolomonCodecAdapter")
            .field("data_shards", &self.encoder.data_shards())
            .field("parity_shards", &self.encoder.parity_shards())
            .finish()
    }
}

impl ReedSolomonCodecAdapter {
    /// Create a codec adapter with an arbitrary k+m geometry.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Ok(Self {
            encoder: EcEncoder::new(data_shards, parity_shards)?,
            decoder: EcDecoder::new(data_shards, parity_shards)?,
        })
    }

    /// The 4+2 geometry every content entry uses.
    pub fn standard_4_2() -> Result<Self> {
        Self::new(DATA_SHARDS, PARITY_SHARDS)
    }
}

impl EcCodec for ReedSolomonCodecAdapter {
    fn data_shards(&self) -> usize {
        self.encoder.data_shards()
    }

    fn parity_shards(&self) -> usize {
        self.encoder.parity_shards()
    }

    fn encode(&self, data: &[u8]) -> Result<EncodedData> {
        let shards = self.encoder.encode(data)?;
        let shard_size = shards.first().map(Vec::len).unwrap_or(0);

        Ok(EncodedData {
            shards: shards.into_iter().map(StoredShard::seal).collect(),
            shard_size,
            original_len: data.len(),
        })
    }

    fn decode(
        &self,
        shards: &BTreeMap<usize, StoredShard>,
        original_size: usize,
    ) -> Result<Vec<u8>> {
        for (index, shard) in shards {
            shard.verify(*index)?;
        }

        let raw: BTreeMap<usize, &[u8]> = shards
            .iter()
            .map(|(index, shard)| (*index, shard.data.as_ref()))
            .collect();
        self.decoder.decode(&raw, original_size)
    }

    fn calculate_shard_size(&self, data_len: usize) -> usize {
        calculate_shard_size(data_len, self.data_shards())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;

    fn all_shards(encoded: &EncodedData) -> BTreeMap<usize, StoredShard> {
        encoded.shards.iter().cloned().enumerate().collect()
    }

    #[test]
    fn test_standard_geometry() {
        let codec = ReedSolomonCodecAdapter::standard_4_2().unwrap();
        assert_eq!(codec.data_shards(), 4);
        assert_eq!(codec.parity_shards(), 2);
        assert_eq!(codec.total_shards(), 6);
        assert!(codec.can_recover(2));
        assert!(!codec.can_recover(3));
    }

    #[test]
    fn test_encode_seals_shards() {
        let codec = ReedSolomonCodecAdapter::standard_4_2().unwrap();
        let encoded = codec.encode(b"Hello, World! This is test data.").unwrap();

        assert_eq!(encoded.data_shards().len(), 4);
        assert_eq!(encoded.parity_shards().len(), 2);
        assert_eq!(encoded.original_len, 32);
        assert_eq!(encoded.shard_size, 8);
        for (i, shard) in encoded.shards.iter().enumerate() {
            assert!(shard.verify(i).is_ok());
            assert_eq!(shard.len(), 8);
        }
    }

    #[test]
    fn test_decode_with_two_losses() {
        let codec = ReedSolomonCodecAdapter::standard_4_2().unwrap();
        let original = b"Test data for recovery after shard loss!";
        let encoded = codec.encode(original).unwrap();

        let mut shards = all_shards(&encoded);
        shards.remove(&0);
        shards.remove(&3);

        let recovered = codec.decode(&shards, original.len()).unwrap();
        assert_eq!(recovered, original);
    }

    #[test]
    fn test_decode_rejects_corrupt_shard() {
        let codec = ReedSolomonCodecAdapter::standard_4_2().unwrap();
        let encoded = codec.encode(b"checksummed content").unwrap();

        let mut shards = all_shards(&encoded);
        let good = shards.remove(&2).unwrap();
        let mut bytes = good.data.to_vec();
        bytes[0] ^= 0xff;
        shards.insert(
            2,
            StoredShard {
                data: bytes.into(),
                checksum: good.checksum,
            },
        );

        assert_matches!(
            codec.decode(&shards, 19),
            Err(Error::CorruptShard { index: 2, .. })
        );
    }

    #[test]
    fn test_decode_insufficient() {
        let codec = ReedSolomonCodecAdapter::standard_4_2().unwrap();
        let encoded = codec.encode(b"three is not enough").unwrap();

        let shards: BTreeMap<usize, StoredShard> = all_shards(&encoded)
            .into_iter()
            .filter(|(i, _)| *i >= 3)
            .collect();

        assert_matches!(
            codec.decode(&shards, 19),
            Err(Error::InsufficientShards {
                available: 3,
                required: 4
            })
        );
    }

    #[test]
    fn test_calculate_shard_size() {
        let codec = ReedSolomonCodecAdapter::standard_4_2().unwrap();
        assert_eq!(codec.calculate_shard_size(100), 25);
        assert_eq!(codec.calculate_shard_size(101), 26);
        assert_eq!(codec.calculate_shard_size(0), 1);
    }
}
