//! Hash index bucket

use crate::arena::Handle;
use crate::index::KeyHash;

/// One slot of the open-addressing table.
///
/// A bucket is empty while its key handle is [`Handle::NONE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    hash: u64,
    tag: u8,
    key_handle: Handle,
    key_len: u32,
    value_handle: Handle,
    value_len: u32,
}

impl Bucket {
    /// Unoccupied bucket
    pub const EMPTY: Bucket = Bucket {
        hash: 0,
        tag: 0,
        key_handle: Handle::NONE,
        key_len: 0,
        value_handle: Handle::NONE,
        value_len: 0,
    };

    pub(crate) fn occupied(
        hash: KeyHash,
        key_handle: Handle,
        key_len: u32,
        value_handle: Handle,
        value_len: u32,
    ) -> Self {
        Self {
            hash: hash.hash(),
            tag: hash.tag(),
            key_handle,
            key_len,
            value_handle,
            value_len,
        }
    }

    pub(crate) fn set_value(&mut self, value_handle: Handle, value_len: u32) {
        self.value_handle = value_handle;
        self.value_len = value_len;
    }

    /// Check if the bucket holds no key
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.key_handle.is_none()
    }

    /// Full key hash
    #[inline]
    pub const fn hash(&self) -> u64 {
        self.hash
    }

    /// Top byte of the key hash
    #[inline]
    pub const fn tag(&self) -> u8 {
        self.tag
    }

    /// Where the key bytes live
    #[inline]
    pub const fn key_handle(&self) -> Handle {
        self.key_handle
    }

    /// Key length in bytes
    #[inline]
    pub const fn key_len(&self) -> u32 {
        self.key_len
    }

    /// Where the framed value starts
    #[inline]
    pub const fn value_handle(&self) -> Handle {
        self.value_handle
    }

    /// Frame length (4-byte prefix plus payload)
    #[inline]
    pub const fn value_len(&self) -> u32 {
        self.value_len
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::EMPTY
    }
}
