//! Binary request/response protocol
//!
//! Request: an 8-byte header followed by `key_len` key bytes.
//!
//! ```text
//! +---------+--------+----------+----------+----------------+
//! | version | action | table_id | index_id | key_len (BE32) |
//! +---------+--------+----------+----------+----------------+
//! ```
//!
//! Response: one status byte followed by a frame (big-endian `u32` length and
//! payload). Fetch responses carry the stored value; stats and describe
//! responses carry JSON. Non-`Ok` responses carry an empty frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::{frame_header, FRAME_HEADER_LEN};
use crate::size::KIB;
use crate::status::Status;
use crate::table::{IndexId, TableId};

/// Protocol version carried in every request
pub const PROTOCOL_VERSION: u8 = 0x11;

/// Request header length
pub const REQUEST_HEADER_LEN: usize = 8;

/// Longest accepted key
pub const MAX_KEY_LEN: usize = 64 * KIB;

/// Status byte plus frame header
pub const RESPONSE_HEADER_LEN: usize = 1 + FRAME_HEADER_LEN;

/// Request action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Action {
    /// Look a key up
    Fetch = b'F',
    /// Statistics of one table
    Stats = b'S',
    /// Schema of every table
    Describe = b'D',
    /// Close the connection
    Quit = b'Q',
}

impl Action {
    /// Parse an action byte
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            b'F' => Some(Action::Fetch),
            b'S' => Some(Action::Stats),
            b'D' => Some(Action::Describe),
            b'Q' => Some(Action::Quit),
            _ => None,
        }
    }

    /// Wire representation
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer speaks another protocol version
    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),

    /// Unrecognized action byte
    #[error("unknown action {0:#04x}")]
    UnknownAction(u8),

    /// Key longer than [`MAX_KEY_LEN`]
    #[error("key of {0} bytes exceeds the {MAX_KEY_LEN} byte limit")]
    KeyTooLong(usize),

    /// Unrecognized response status byte
    #[error("unknown status {0}")]
    UnknownStatus(u8),

    /// Payload does not fit in a frame
    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    /// JSON payload could not be encoded or decoded
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer closed the connection mid-message
    #[error("connection closed")]
    Closed,
}

impl ProtocolError {
    /// Whether the stream is still aligned on a request boundary after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::UnknownAction(_))
    }
}

/// Decoded request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Raw action byte
    pub action: u8,
    /// Target table
    pub table: TableId,
    /// Target index
    pub index: IndexId,
    /// Key length in bytes
    pub key_len: u32,
}

impl RequestHeader {
    /// Create a header for `action`.
    pub fn new(action: Action, table: TableId, index: IndexId, key_len: u32) -> Self {
        Self {
            action: action.as_u8(),
            table,
            index,
            key_len,
        }
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let len = self.key_len.to_be_bytes();
        [
            PROTOCOL_VERSION,
            self.action,
            self.table,
            self.index,
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }

    /// Decode wire bytes, checking version and key length.
    pub fn decode(bytes: &[u8; REQUEST_HEADER_LEN]) -> Result<Self, ProtocolError> {
        if bytes[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::BadVersion(bytes[0]));
        }
        let key_len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if key_len as usize > MAX_KEY_LEN {
            return Err(ProtocolError::KeyTooLong(key_len as usize));
        }
        Ok(Self {
            action: bytes[1],
            table: bytes[2],
            index: bytes[3],
            key_len,
        })
    }

    /// Parsed action
    pub fn action(&self) -> Result<Action, ProtocolError> {
        Action::from_u8(self.action).ok_or(ProtocolError::UnknownAction(self.action))
    }
}

/// Encode a complete request.
pub fn encode_request(
    action: Action,
    table: TableId,
    index: IndexId,
    key: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if key.len() > MAX_KEY_LEN {
        return Err(ProtocolError::KeyTooLong(key.len()));
    }
    let header = RequestHeader::new(action, table, index, key.len() as u32);
    let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + key.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(key);
    Ok(out)
}

/// Read one request, leaving its key in `key`.
///
/// Returns `Ok(None)` when the peer closes cleanly between requests. An
/// unknown action is reported only after the key has been consumed, so the
/// stream can keep going.
pub async fn read_request<R>(reader: &mut R, key: &mut Vec<u8>) -> Result<Option<RequestHeader>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; REQUEST_HEADER_LEN];
    let first = reader.read(&mut header).await?;
    if first == 0 {
        return Ok(None);
    }
    if first < REQUEST_HEADER_LEN {
        read_exact(reader, &mut header[first..]).await?;
    }
    let header = RequestHeader::decode(&header)?;

    key.clear();
    key.resize(header.key_len as usize, 0);
    read_exact(reader, key).await?;
    header.action()?;
    Ok(Some(header))
}

/// Append a response to `out`.
pub fn encode_response(out: &mut Vec<u8>, status: Status, payload: &[u8]) -> Result<(), ProtocolError> {
    let header = frame_header(payload.len()).ok_or(ProtocolError::PayloadTooLarge(payload.len()))?;
    out.push(status.as_u8());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Ok(())
}

/// Read one response.
pub async fn read_response<R>(reader: &mut R) -> Result<(Status, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; RESPONSE_HEADER_LEN];
    read_exact(reader, &mut header).await?;
    let status = Status::from_u8(header[0]).ok_or(ProtocolError::UnknownStatus(header[0]))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload).await?;
    Ok((status, payload))
}

/// Write a complete message and flush.
pub async fn write_message<W>(writer: &mut W, bytes: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(ProtocolError::Closed),
        Err(err) => Err(err.into()),
    }
}
