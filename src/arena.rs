//! Bump-pointer arena
//!
//! An `Arena` is a growable flat byte buffer. Allocating bumps the used count and
//! returns the previous count as a [`Handle`]. Handles are offsets, not addresses,
//! so they stay valid when the buffer is reallocated during growth. There is no
//! piece-wise deallocation; the arena is reset or dropped as a whole.

use std::fmt;

use crate::codec::{frame_header, frame_payload_len, FRAME_HEADER_LEN};
use crate::size::MIB;

/// Default initial capacity (1 MiB)
pub const DEFAULT_ARENA_CAPACITY: usize = MIB;

/// Hard upper bound on arena size. Every valid offset must fit below [`Handle::NONE`].
pub const MAX_ARENA_CAPACITY: usize = u32::MAX as usize - 1;

/// Offset of an allocation inside an [`Arena`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Sentinel meaning "no value"
    pub const NONE: Handle = Handle(u32::MAX);

    /// Create a handle from a raw offset
    #[inline]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// Raw offset
    #[inline]
    pub const fn offset(&self) -> u32 {
        self.0
    }

    /// Check for the sentinel
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == u32::MAX
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "Handle(NONE)")
        } else {
            write!(f, "Handle({})", self.0)
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors returned when the arena cannot satisfy an allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    /// The allocation would push the arena past its configured limit.
    #[error("arena limit exceeded: {requested} bytes needed, limit is {limit}")]
    CapacityExceeded {
        /// Total bytes the arena would need to hold
        requested: usize,
        /// Configured maximum
        limit: usize,
    },
    /// The system allocator refused to grow the buffer.
    #[error("out of memory growing arena to {requested} bytes")]
    OutOfMemory {
        /// Capacity that could not be reserved
        requested: usize,
    },
}

/// Growable bump allocator handing out stable offsets
pub struct Arena {
    /// Backing storage; `buf.len()` is the used byte count
    buf: Vec<u8>,
    /// Logical capacity, grown by doubling
    capacity: usize,
    /// Growth never goes past this
    max_capacity: usize,
}

impl Arena {
    /// Create an arena with the given initial capacity and the default limit.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_ARENA_CAPACITY);
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            max_capacity: MAX_ARENA_CAPACITY,
        }
    }

    /// Create an arena with an initial capacity and a growth limit.
    ///
    /// The limit is clamped to [`MAX_ARENA_CAPACITY`] and the initial capacity to the limit.
    pub fn with_limits(capacity: usize, max_capacity: usize) -> Result<Self, ArenaError> {
        let max_capacity = max_capacity.clamp(1, MAX_ARENA_CAPACITY);
        let capacity = capacity.clamp(1, max_capacity);
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| ArenaError::OutOfMemory {
                requested: capacity,
            })?;
        Ok(Self {
            buf,
            capacity,
            max_capacity,
        })
    }

    /// Current capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far
    #[inline]
    pub fn used(&self) -> usize {
        self.buf.len()
    }

    /// Growth limit in bytes
    #[inline]
    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    /// Check if nothing has been allocated
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Allocate `len` zeroed bytes and return their handle.
    pub fn allocate(&mut self, len: usize) -> Result<Handle, ArenaError> {
        let handle = self.reserve_for(len)?;
        let end = self.buf.len() + len;
        self.buf.resize(end, 0);
        Ok(handle)
    }

    /// Copy `bytes` into the arena.
    pub fn store(&mut self, bytes: &[u8]) -> Result<Handle, ArenaError> {
        let handle = self.reserve_for(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(handle)
    }

    /// Copy `bytes` into the arena behind a 4-byte big-endian length prefix.
    ///
    /// The handle points at the prefix; the frame occupies `4 + bytes.len()` bytes.
    pub fn store_framed(&mut self, bytes: &[u8]) -> Result<Handle, ArenaError> {
        let header = frame_header(bytes.len()).ok_or(ArenaError::CapacityExceeded {
            requested: self.buf.len().saturating_add(FRAME_HEADER_LEN + bytes.len()),
            limit: self.max_capacity,
        })?;
        let handle = self.reserve_for(FRAME_HEADER_LEN + bytes.len())?;
        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(bytes);
        Ok(handle)
    }

    /// Read `len` bytes at `handle`.
    ///
    /// Returns `None` for [`Handle::NONE`] or a range past the used bytes.
    #[inline]
    pub fn resolve(&self, handle: Handle, len: usize) -> Option<&[u8]> {
        if handle.is_none() {
            return None;
        }
        let start = handle.offset() as usize;
        self.buf.get(start..start.checked_add(len)?)
    }

    /// Mutable view of `len` bytes at `handle`.
    #[inline]
    pub fn resolve_mut(&mut self, handle: Handle, len: usize) -> Option<&mut [u8]> {
        if handle.is_none() {
            return None;
        }
        let start = handle.offset() as usize;
        self.buf.get_mut(start..start.checked_add(len)?)
    }

    /// Read the whole frame (prefix included) stored at `handle`.
    pub fn resolve_frame(&self, handle: Handle) -> Option<&[u8]> {
        if handle.is_none() {
            return None;
        }
        let start = handle.offset() as usize;
        let len = frame_payload_len(self.buf.get(start..)?)?;
        self.buf.get(start..start + FRAME_HEADER_LEN + len)
    }

    /// Read only the payload of the frame stored at `handle`.
    pub fn frame_payload(&self, handle: Handle) -> Option<&[u8]> {
        self.resolve_frame(handle)
            .map(|frame| &frame[FRAME_HEADER_LEN..])
    }

    /// Discard all contents, keeping the buffer.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Make room for `len` more bytes and return the handle they will start at.
    fn reserve_for(&mut self, len: usize) -> Result<Handle, ArenaError> {
        let start = self.buf.len();
        let needed = start
            .checked_add(len)
            .filter(|needed| *needed <= self.max_capacity)
            .ok_or(ArenaError::CapacityExceeded {
                requested: start.saturating_add(len),
                limit: self.max_capacity,
            })?;
        if needed > self.capacity {
            self.grow(needed)?;
        }
        Ok(Handle(start as u32))
    }

    fn grow(&mut self, needed: usize) -> Result<(), ArenaError> {
        let mut new_capacity = self.capacity.max(1);
        while new_capacity < needed {
            new_capacity = new_capacity.saturating_mul(2);
        }
        let new_capacity = new_capacity.min(self.max_capacity);
        self.buf
            .try_reserve_exact(new_capacity - self.buf.len())
            .map_err(|_| ArenaError::OutOfMemory {
                requested: new_capacity,
            })?;
        self.capacity = new_capacity;
        Ok(())
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ARENA_CAPACITY)
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.buf.len())
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_handles_are_offsets() {
        let mut arena = Arena::with_capacity(16);
        let a = arena.store(&[1u8; 10]).unwrap();
        assert_eq!(a, Handle::new(0));
        assert_eq!(arena.capacity(), 16);

        let b = arena.store(&[2u8; 20]).unwrap();
        assert_eq!(b, Handle::new(10));
        assert_eq!(arena.used(), 30);
        assert_eq!(arena.capacity(), 32);

        assert_eq!(arena.resolve(a, 10), Some(&[1u8; 10][..]));
        assert_eq!(arena.resolve(b, 20), Some(&[2u8; 20][..]));
    }

    #[test]
    fn test_doubling_repeats_until_fit() {
        let mut arena = Arena::with_capacity(4);
        arena.allocate(100).unwrap();
        assert_eq!(arena.capacity(), 128);
        assert_eq!(arena.resolve(Handle::new(0), 100), Some(&[0u8; 100][..]));
    }

    #[test]
    fn test_growth_keeps_old_bytes() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut arena = Arena::with_capacity(8);
        let mut stored: Vec<(Handle, Vec<u8>)> = Vec::new();

        for _ in 0..500 {
            let len = rng.gen_range(0..64);
            let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let handle = arena.store(&bytes).unwrap();
            stored.push((handle, bytes));

            for (handle, bytes) in &stored {
                assert_eq!(arena.resolve(*handle, bytes.len()), Some(bytes.as_slice()));
            }
        }
    }

    #[test]
    fn test_store_framed() {
        let mut arena = Arena::with_capacity(4);
        arena.store(b"xx").unwrap();
        let h = arena.store_framed(b"hello").unwrap();
        assert_eq!(h, Handle::new(2));
        assert_eq!(arena.resolve(h, 4), Some(&[0u8, 0, 0, 5][..]));
        assert_eq!(arena.resolve_frame(h), Some(&b"\0\0\0\x05hello"[..]));
        assert_eq!(arena.frame_payload(h), Some(&b"hello"[..]));
    }

    #[test]
    fn test_empty_frame() {
        let mut arena = Arena::with_capacity(4);
        let h = arena.store_framed(b"").unwrap();
        assert_eq!(arena.frame_payload(h), Some(&b""[..]));
    }

    #[test]
    fn test_resolve_sentinel_and_out_of_range() {
        let mut arena = Arena::with_capacity(16);
        let h = arena.store(b"abc").unwrap();
        assert_eq!(arena.resolve(Handle::NONE, 0), None);
        assert_eq!(arena.resolve_frame(Handle::NONE), None);
        assert_eq!(arena.resolve(h, 4), None);
        assert_eq!(arena.resolve(Handle::new(3), 0), Some(&b""[..]));
        assert_eq!(arena.resolve(Handle::new(4), 0), None);
    }

    #[test]
    fn test_allocate_then_fill() {
        let mut arena = Arena::with_capacity(16);
        let h = arena.allocate(3).unwrap();
        arena.resolve_mut(h, 3).unwrap().copy_from_slice(b"xyz");
        assert_eq!(arena.resolve(h, 3), Some(&b"xyz"[..]));
    }

    #[test]
    fn test_limit_is_enforced() {
        let mut arena = Arena::with_limits(8, 32).unwrap();
        arena.store(&[0u8; 20]).unwrap();
        assert_eq!(arena.capacity(), 32);

        let err = arena.store(&[0u8; 20]).unwrap_err();
        assert_eq!(
            err,
            ArenaError::CapacityExceeded {
                requested: 40,
                limit: 32
            }
        );
        // A failed allocation leaves earlier data intact.
        assert_eq!(arena.used(), 20);
        arena.store(&[1u8; 12]).unwrap();
        assert_eq!(arena.used(), 32);
    }

    #[test]
    fn test_growth_clamps_to_limit() {
        let mut arena = Arena::with_limits(16, 24).unwrap();
        arena.store(&[0u8; 20]).unwrap();
        assert_eq!(arena.capacity(), 24);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut arena = Arena::with_capacity(4);
        arena.store(&[0u8; 100]).unwrap();
        let capacity = arena.capacity();

        arena.reset();
        assert!(arena.is_empty());
        assert_eq!(arena.capacity(), capacity);
        assert_eq!(arena.store(b"a").unwrap(), Handle::new(0));
    }

    #[test]
    fn test_handle_debug() {
        assert_eq!(format!("{:?}", Handle::NONE), "Handle(NONE)");
        assert_eq!(format!("{}", Handle::new(7)), "Handle(7)");
        assert!(Handle::default().is_none());
    }
}
