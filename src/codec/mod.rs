//! Byte-level encodings shared by the index, the arena, and the wire protocol.
//!
//! Keys are hashed and compared as raw bytes. Integer keys are encoded as 8 bytes
//! big-endian, string keys as their UTF-8 bytes, so a client can compute the exact
//! key bytes the index was built with.

mod frame;
mod hash;

pub use frame::{
    frame_header, frame_payload, frame_payload_len, write_frame, FRAME_HEADER_LEN,
    MAX_FRAME_PAYLOAD,
};
pub use hash::hash64;

use std::fmt;

/// Encoded length of an integer key.
pub const INT_KEY_LEN: usize = 8;

/// A typed key extracted from a source row for one index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// Integer column value
    Int(i64),
    /// String column value
    Str(String),
}

impl IndexKey {
    /// Append the key's byte encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            IndexKey::Int(value) => out.extend_from_slice(&encode_int_key(*value)),
            IndexKey::Str(value) => out.extend_from_slice(value.as_bytes()),
        }
    }

    /// Owned byte encoding of the key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Whether the key encodes to zero bytes (only possible for strings).
    pub fn is_empty(&self) -> bool {
        matches!(self, IndexKey::Str(s) if s.is_empty())
    }

    /// Integer value, if this is an integer key.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IndexKey::Int(value) => Some(*value),
            IndexKey::Str(_) => None,
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Int(value) => write!(f, "{value}"),
            IndexKey::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for IndexKey {
    fn from(value: i64) -> Self {
        IndexKey::Int(value)
    }
}

impl From<&str> for IndexKey {
    fn from(value: &str) -> Self {
        IndexKey::Str(value.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(value: String) -> Self {
        IndexKey::Str(value)
    }
}

/// Encode an integer key.
#[inline]
pub const fn encode_int_key(value: i64) -> [u8; INT_KEY_LEN] {
    value.to_be_bytes()
}

/// Decode an integer key, if `bytes` has the right length.
#[inline]
pub fn decode_int_key(bytes: &[u8]) -> Option<i64> {
    let raw: [u8; INT_KEY_LEN] = bytes.try_into().ok()?;
    Some(i64::from_be_bytes(raw))
}
