//! Erasure Coding Encoder/Decoder
//!
//! Systematic Reed-Solomon over GF(2^8) using the `reed-solomon-erasure` crate.
//! The first k shards are a direct partition of the input, zero padded to an
//! equal-size boundary; the remaining m shards are parity.

use crate::error::{Error, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

fn build_codec(data_shards: usize, parity_shards: usize) -> Result<Arc<ReedSolomon>> {
    if data_shards == 0 {
        return Err(Error::InvalidEcConfig(
            "data_shards must be greater than 0".to_string(),
        ));
    }
    if parity_shards == 0 {
        return Err(Error::InvalidEcConfig(
            "parity_shards must be greater than 0".to_string(),
        ));
    }

    let rs = ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
        Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
    })?;
    Ok(Arc::new(rs))
}

// =============================================================================
// EC Encoder
// =============================================================================

/// Erasure coding encoder producing k data shards and m parity shards
pub struct EcEncoder {
    rs: Arc<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl EcEncoder {
    /// Create a new encoder with the specified k+m configuration
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Ok(Self {
            rs: build_codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Encode data into shards (data followed by parity).
    ///
    /// Empty input still yields one-byte shards, since the codec cannot work on
    /// zero-length shards; decoding truncates back to the original size.
    #[instrument(skip(self, data), fields(data_len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = calculate_shard_size(data.len(), self.data_shards);

        let mut shards: Vec<Vec<u8>> = data
            .chunks(shard_size)
            .map(|chunk| {
                let mut shard = chunk.to_vec();
                shard.resize(shard_size, 0);
                shard
            })
            .collect();
        // Inputs shorter than k * shard_size leave trailing data shards empty
        shards.resize(self.total_shards(), vec![0u8; shard_size]);

        self.rs
            .encode(&mut shards)
            .map_err(|e| Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e)))?;

        debug!(
            "Encoded {} bytes into {} shards of {} bytes",
            data.len(),
            self.total_shards(),
            shard_size
        );

        Ok(shards)
    }

    /// Verify that the parity shards are consistent with the data shards
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        self.rs
            .verify(shards)
            .map_err(|e| Error::EcEncodingFailed(format!("Verification failed: {}", e)))
    }
}

// =============================================================================
// EC Decoder
// =============================================================================

/// Erasure coding decoder rebuilding the original bytes from any k shards
pub struct EcDecoder {
    rs: Arc<ReedSolomon>,
    data_shards: usize,
    parity_shards: usize,
}

impl EcDecoder {
    /// Create a new decoder with the specified k+m configuration
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        Ok(Self {
            rs: build_codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Decode from shards keyed by shard index.
    ///
    /// Only the first k indices (in index order) are used; extra shards are
    /// ignored. All used shards must have the same length.
    #[instrument(skip(self, shards), fields(present = shards.len(), original_size))]
    pub fn decode<S: AsRef<[u8]>>(
        &self,
        shards: &BTreeMap<usize, S>,
        original_size: usize,
    ) -> Result<Vec<u8>> {
        let present: Vec<(usize, &[u8])> = shards
            .iter()
            .filter(|(index, _)| **index < self.total_shards())
            .map(|(index, shard)| (*index, shard.as_ref()))
            .take(self.data_shards)
            .collect();

        if present.len() < self.data_shards {
            return Err(Error::InsufficientShards {
                available: present.len(),
                required: self.data_shards,
            });
        }

        let shard_size = present[0].1.len();
        if present.iter().any(|(_, s)| s.len() != shard_size) {
            return Err(Error::EcReconstructionFailed(
                "shards have mismatched lengths".to_string(),
            ));
        }
        if shard_size * self.data_shards < original_size {
            return Err(Error::EcReconstructionFailed(format!(
                "{} shards of {} bytes cannot hold {} bytes",
                self.data_shards, shard_size, original_size
            )));
        }

        let mut slots: Vec<Option<Vec<u8>>> = vec![None; self.total_shards()];
        for (index, shard) in &present {
            slots[*index] = Some(shard.to_vec());
        }

        // The library fills the missing data slots in place
        self.rs
            .reconstruct_data(&mut slots)
            .map_err(|e| Error::EcReconstructionFailed(format!("Reed-Solomon: {}", e)))?;

        let mut data = Vec::with_capacity(shard_size * self.data_shards);
        for slot in slots.iter().take(self.data_shards) {
            match slot {
                Some(shard) => data.extend_from_slice(shard),
                None => {
                    return Err(Error::EcReconstructionFailed(
                        "data shard missing after reconstruction".to_string(),
                    ))
                }
            }
        }
        data.truncate(original_size);

        debug!(
            "Decoded {} bytes from shard indices {:?}",
            original_size,
            present.iter().map(|(i, _)| *i).collect::<Vec<_>>()
        );

        Ok(data)
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Shard size for a given data size and data shard count (never zero)
pub fn calculate_shard_size(data_size: usize, data_shards: usize) -> usize {
    data_size.div_ceil(data_shards).max(1)
}

/// Storage overhead ratio (total/data)
pub fn storage_overhead(data_shards: usize, parity_shards: usize) -> f64 {
    (data_shards + parity_shards) as f64 / data_shards as f64
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed(shards: Vec<Vec<u8>>, keep: &[usize]) -> BTreeMap<usize, Vec<u8>> {
        shards
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .collect()
    }

    #[test]
    fn test_encoder_invalid_config() {
        assert!(EcEncoder::new(0, 2).is_err());
        assert!(EcEncoder::new(4, 0).is_err());
        assert!(EcDecoder::new(0, 2).is_err());
    }

    #[test]
    fn test_encode_is_systematic() {
        let encoder = EcEncoder::new(4, 2).unwrap();
        let data = b"0123456789abcdef";

        let shards = encoder.encode(data).unwrap();

        assert_eq!(shards.len(), 6);
        assert_eq!(shards[0], b"0123");
        assert_eq!(shards[1], b"4567");
        assert_eq!(shards[2], b"89ab");
        assert_eq!(shards[3], b"cdef");
        assert!(encoder.verify(&shards).unwrap());
    }

    #[test]
    fn test_encode_pads_last_data_shard() {
        let encoder = EcEncoder::new(4, 2).unwrap();
        let shards = encoder.encode(b"Hello").unwrap();

        // 5 bytes -> shard size 2: "He", "ll", "o\0", "\0\0"
        assert!(shards.iter().all(|s| s.len() == 2));
        assert_eq!(shards[2], vec![b'o', 0]);
        assert_eq!(shards[3], vec![0, 0]);
    }

    #[test]
    fn test_encode_empty_data() {
        let encoder = EcEncoder::new(4, 2).unwrap();
        let decoder = EcDecoder::new(4, 2).unwrap();

        let shards = encoder.encode(&[]).unwrap();
        assert!(shards.iter().all(|s| s.len() == 1));

        let recovered = decoder.decode(&indexed(shards, &[0, 1, 2, 3]), 0).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_encode_is_deterministic() {
        let encoder = EcEncoder::new(4, 2).unwrap();
        let data = b"same bytes, same shards";
        assert_eq!(encoder.encode(data).unwrap(), encoder.encode(data).unwrap());
    }

    #[test]
    fn test_decode_from_parity() {
        let encoder = EcEncoder::new(4, 2).unwrap();
        let decoder = EcDecoder::new(4, 2).unwrap();
        let original = b"Testing recovery from shard loss with erasure coding!";

        let shards = encoder.encode(original).unwrap();
        let recovered = decoder
            .decode(&indexed(shards, &[1, 2, 4, 5]), original.len())
            .unwrap();

        assert_eq!(recovered, original);
    }

    #[test]
    fn test_decode_insufficient_shards() {
        let encoder = EcEncoder::new(4, 2).unwrap();
        let decoder = EcDecoder::new(4, 2).unwrap();
        let shards = encoder.encode(b"not enough").unwrap();

        let result = decoder.decode(&indexed(shards, &[0, 4, 5]), 10);
        assert!(matches!(
            result,
            Err(Error::InsufficientShards {
                available: 3,
                required: 4
            })
        ));
    }

    #[test]
    fn test_decode_ignores_out_of_range_indices() {
        let decoder = EcDecoder::new(4, 2).unwrap();
        let mut shards = BTreeMap::new();
        for i in [0usize, 1, 2, 9] {
            shards.insert(i, vec![0u8; 4]);
        }
        assert!(matches!(
            decoder.decode(&shards, 8),
            Err(Error::InsufficientShards { available: 3, .. })
        ));
    }

    #[test]
    fn test_decode_mismatched_lengths() {
        let decoder = EcDecoder::new(4, 2).unwrap();
        let mut shards = BTreeMap::new();
        shards.insert(0usize, vec![0u8; 4]);
        shards.insert(1, vec![0u8; 4]);
        shards.insert(2, vec![0u8; 3]);
        shards.insert(3, vec![0u8; 4]);

        assert!(matches!(
            decoder.decode(&shards, 10),
            Err(Error::EcReconstructionFailed(_))
        ));
    }

    #[test]
    fn test_calculate_shard_size() {
        assert_eq!(calculate_shard_size(0, 4), 1);
        assert_eq!(calculate_shard_size(100, 4), 25);
        assert_eq!(calculate_shard_size(101, 4), 26);
    }

    #[test]
    fn test_storage_overhead() {
        assert!((storage_overhead(4, 2) - 1.5).abs() < 0.001);
    }
}
