//! Binary state codec
//!
//! Feature-store state is persisted as compact binary blobs rather than JSON.
//! All integers are fixed-width big-endian; sequences carry a u64 length prefix
//! and strings are UTF-8 with the same prefix. The layouts are:
//!
//! - slot store: `[capacity:u32][n:u64]{label, slot:u32}*[n:u64]{slot:u32, timestamp:i64}*`
//! - aggregator: `[children:u64]{[tag][bytes]}*`
//!
//! Decoding is bounded by [`MAX_BLOB_BYTES`] so a corrupt length prefix cannot
//! trigger a huge allocation.

use crate::error::PredictError;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Upper bound on any decoded blob
pub const MAX_BLOB_BYTES: u64 = 4 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_BLOB_BYTES)
}

/// Encode a wire record
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PredictError> {
    options()
        .serialize(value)
        .map_err(|e| PredictError::Encode(e.to_string()))
}

/// Decode a wire record, rejecting trailing bytes
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PredictError> {
    options()
        .deserialize(bytes)
        .map_err(|e| PredictError::Decode(e.to_string()))
}

/// Wire form of a label slot store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStoreRecord {
    pub capacity: u32,
    /// label -> slot, in slot order
    pub labels: Vec<(String, u32)>,
    /// slot -> last used timestamp (epoch millis), in slot order
    pub timestamps: Vec<(u32, i64)>,
}

/// One serialized aggregator child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub tag: String,
    pub bytes: Vec<u8>,
}

/// Wire form of a feature aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorRecord {
    pub children: Vec<ChildRecord>,
}
