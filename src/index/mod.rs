//! Hash index for rowcache
//!
//! This module provides the open-addressing hash index each generation builds per
//! indexed column. Keys and framed values live in the generation's arena; buckets
//! only hold handles into it.

mod bucket;
mod hash_index;
mod stats;

pub use bucket::Bucket;
pub use hash_index::{
    bucket_bytes, capacity_for_hint, HashIndex, IndexError, InsertOutcome, MAX_LOAD_FACTOR,
    MAX_PROBE_COUNT,
};
pub use stats::ProbeStats;

use crate::codec::hash64;

/// Key hash type for index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyHash {
    hash: u64,
}

impl KeyHash {
    /// Number of bits used for the tag
    pub const TAG_BITS: u32 = 8;

    /// Create a new key hash
    #[inline]
    pub const fn new(hash: u64) -> Self {
        Self { hash }
    }

    /// Hash raw key bytes
    #[inline]
    pub fn of(key: &[u8]) -> Self {
        Self::new(hash64(key))
    }

    /// Get the full hash value
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Home slot for a table of `capacity` buckets (must be a power of two)
    #[inline]
    pub const fn slot(&self, capacity: usize) -> usize {
        (self.hash as usize) & (capacity - 1)
    }

    /// Get the tag portion of the hash (top byte)
    #[inline]
    pub const fn tag(&self) -> u8 {
        (self.hash >> (64 - Self::TAG_BITS)) as u8
    }
}

impl From<u64> for KeyHash {
    #[inline]
    fn from(hash: u64) -> Self {
        Self::new(hash)
    }
}
