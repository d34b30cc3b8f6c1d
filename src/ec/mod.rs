//! Erasure Coding Module
//!
//! Reed-Solomon encoding and decoding for content entries.
//!
//! # Components
//!
//! - **Encoder/Decoder** (`encoder.rs`): systematic k+m Reed-Solomon using the
//!   `reed-solomon-erasure` crate. The engine always runs it as 4+2 through
//!   [`crate::adapters::ReedSolomonCodecAdapter`], which adds per-shard
//!   checksums.
//!
//! # Usage
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use shardvault::ec::encoder::{EcDecoder, EcEncoder};
//!
//! let encoder = EcEncoder::new(4, 2).unwrap();
//! let decoder = EcDecoder::new(4, 2).unwrap();
//!
//! let data = b"Hello, World!";
//! let shards = encoder.encode(data).unwrap();
//!
//! // Lose shards 0 and 3, decode from the rest
//! let survivors: BTreeMap<usize, Vec<u8>> = shards
//!     .into_iter()
//!     .enumerate()
//!     .filter(|(i, _)| *i != 0 && *i != 3)
//!     .collect();
//!
//! let recovered = decoder.decode(&survivors, data.len()).unwrap();
//! assert_eq!(recovered, data);
//! ```

pub mod encoder;

#[cfg(test)]
mod proptest;

pub use encoder::{calculate_shard_size, storage_overhead, EcDecoder, EcEncoder};
