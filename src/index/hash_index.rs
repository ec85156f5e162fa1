//! Open-addressing hash index over an arena
//!
//! The table has a fixed power-of-two capacity chosen at build time from a row
//! count hint. Collisions are resolved by linear probing. The index never resizes;
//! the next generation is sized for its own row count instead.

use crate::arena::{Arena, ArenaError, Handle};
use crate::index::{Bucket, KeyHash, ProbeStats};
use crate::utility::{div_ceil, is_power_of_two, next_power_of_two};

/// Highest load factor the sizing rule allows
pub const MAX_LOAD_FACTOR: f64 = 0.7;

/// Upper bound on buckets inspected by one insert or lookup
pub const MAX_PROBE_COUNT: usize = 1024;

/// Capacity the index uses for `hint` expected keys.
///
/// Smallest power of two that is `>= ceil(hint * 10 / 7)`, never zero.
pub fn capacity_for_hint(hint: usize) -> usize {
    let scaled = div_ceil((hint as u64).saturating_mul(10), 7);
    let capacity = next_power_of_two(scaled);
    usize::try_from(capacity).unwrap_or(1 << (usize::BITS - 1))
}

/// What an insert did with the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new
    Inserted,
    /// The key existed; its value was replaced
    Replaced,
}

/// Errors returned by [`HashIndex::insert`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    /// No free or matching bucket within the probe limit
    #[error("no free bucket within {limit} probes")]
    ProbeLimit {
        /// Probe limit in effect
        limit: usize,
    },
    /// Storing the key bytes failed
    #[error("failed to store key: {0}")]
    Arena(#[from] ArenaError),
    /// The bucket array would exceed the configured byte limit
    #[error("bucket array of {requested} bytes exceeds limit of {limit}")]
    CapacityExceeded {
        /// Bytes the bucket array needs, saturated at `usize::MAX`
        requested: usize,
        /// Configured limit
        limit: usize,
    },
    /// The allocator refused the bucket array
    #[error("failed to allocate {bytes} bytes of buckets")]
    OutOfMemory {
        /// Bytes requested
        bytes: usize,
    },
}

/// Bytes taken by the bucket array of an index with `capacity` buckets
pub fn bucket_bytes(capacity: usize) -> Option<usize> {
    capacity.checked_mul(std::mem::size_of::<Bucket>())
}

/// Hash index mapping raw key bytes to framed values in an [`Arena`]
#[derive(Debug)]
pub struct HashIndex {
    buckets: Box<[Bucket]>,
    len: usize,
    probe_limit: usize,
    stats: ProbeStats,
}

impl HashIndex {
    /// Build an empty index sized for `capacity_hint` keys.
    pub fn build(capacity_hint: usize) -> Result<Self, IndexError> {
        Self::with_limits(capacity_hint, MAX_PROBE_COUNT, usize::MAX)
    }

    /// Build an empty index with a custom probe limit.
    ///
    /// The limit is clamped to `1..=MAX_PROBE_COUNT`.
    pub fn with_probe_limit(
        capacity_hint: usize,
        probe_limit: usize,
    ) -> Result<Self, IndexError> {
        Self::with_limits(capacity_hint, probe_limit, usize::MAX)
    }

    /// Build an empty index whose bucket array may take at most `max_bytes`.
    ///
    /// Fails instead of aborting when the array is over the limit or the allocator
    /// refuses it.
    pub fn with_limits(
        capacity_hint: usize,
        probe_limit: usize,
        max_bytes: usize,
    ) -> Result<Self, IndexError> {
        let capacity = capacity_for_hint(capacity_hint);
        debug_assert!(is_power_of_two(capacity as u64));
        let bytes = bucket_bytes(capacity).unwrap_or(usize::MAX);
        if bytes > max_bytes || bytes > isize::MAX as usize {
            return Err(IndexError::CapacityExceeded {
                requested: bytes,
                limit: max_bytes,
            });
        }

        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(capacity)
            .map_err(|_| IndexError::OutOfMemory { bytes })?;
        buckets.resize(capacity, Bucket::EMPTY);

        let probe_limit = probe_limit.clamp(1, MAX_PROBE_COUNT);
        Ok(Self {
            buckets: buckets.into_boxed_slice(),
            len: 0,
            probe_limit,
            stats: ProbeStats::new(probe_limit),
        })
    }

    /// Number of buckets
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of distinct keys stored
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no key is stored
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fraction of buckets in use
    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.capacity() as f64
    }

    /// Configured probe limit
    #[inline]
    pub fn probe_limit(&self) -> usize {
        self.probe_limit
    }

    /// Probe histogram collected by inserts
    #[inline]
    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }

    /// Insert `key`, pointing it at the frame `value_handle..value_handle + value_len`.
    ///
    /// New keys have their bytes copied into `arena`. A key that is already present
    /// keeps its bucket and takes the new value. On failure no existing bucket is
    /// modified.
    pub fn insert(
        &mut self,
        arena: &mut Arena,
        key: &[u8],
        value_handle: Handle,
        value_len: u32,
    ) -> Result<InsertOutcome, IndexError> {
        let hash = KeyHash::of(key);
        let limit = self.effective_limit();
        let mask = self.capacity() - 1;
        let mut slot = hash.slot(self.capacity());

        for probes in 1..=limit {
            let bucket = self.buckets[slot];
            if bucket.is_empty() {
                let key_len = u32::try_from(key.len()).map_err(|_| ArenaError::CapacityExceeded {
                    requested: key.len(),
                    limit: arena.max_capacity(),
                })?;
                let key_handle = arena.store(key)?;
                self.buckets[slot] =
                    Bucket::occupied(hash, key_handle, key_len, value_handle, value_len);
                self.len += 1;
                self.stats.record(probes);
                return Ok(InsertOutcome::Inserted);
            }
            if Self::matches(arena, &bucket, hash, key) {
                self.buckets[slot].set_value(value_handle, value_len);
                self.stats.record(probes);
                return Ok(InsertOutcome::Replaced);
            }
            slot = (slot + 1) & mask;
        }

        self.stats.record_overflow();
        Err(IndexError::ProbeLimit { limit })
    }

    /// Find the bucket holding `key`.
    pub fn lookup_entry(&self, arena: &Arena, key: &[u8]) -> Option<&Bucket> {
        let hash = KeyHash::of(key);
        let mask = self.capacity() - 1;
        let mut slot = hash.slot(self.capacity());

        for _ in 0..self.effective_limit() {
            let bucket = &self.buckets[slot];
            if bucket.is_empty() {
                return None;
            }
            if Self::matches(arena, bucket, hash, key) {
                return Some(bucket);
            }
            slot = (slot + 1) & mask;
        }
        None
    }

    /// Find the framed value (length prefix included) stored for `key`.
    pub fn lookup<'a>(&self, arena: &'a Arena, key: &[u8]) -> Option<&'a [u8]> {
        let bucket = self.lookup_entry(arena, key)?;
        arena.resolve(bucket.value_handle(), bucket.value_len() as usize)
    }

    /// Occupied buckets in table order
    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.iter().filter(|bucket| !bucket.is_empty())
    }

    #[inline]
    fn effective_limit(&self) -> usize {
        self.probe_limit.min(self.capacity())
    }

    #[inline]
    fn matches(arena: &Arena, bucket: &Bucket, hash: KeyHash, key: &[u8]) -> bool {
        bucket.tag() == hash.tag()
            && bucket.hash() == hash.hash()
            && bucket.key_len() as usize == key.len()
            && arena.resolve(bucket.key_handle(), key.len()) == Some(key)
    }
}
