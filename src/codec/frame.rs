//! Length-prefixed frames.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload. Values are
//! stored framed in the arena so the server can write them to a socket verbatim.

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a frame can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize - FRAME_HEADER_LEN;

/// Encode a frame header for a payload of `len` bytes.
///
/// Returns `None` if `len` does not fit in the header.
#[inline]
pub fn frame_header(len: usize) -> Option<[u8; FRAME_HEADER_LEN]> {
    if len > MAX_FRAME_PAYLOAD {
        return None;
    }
    Some((len as u32).to_be_bytes())
}

/// Read the payload length out of a frame header.
///
/// Returns `None` if `bytes` is shorter than the header.
#[inline]
pub fn frame_payload_len(bytes: &[u8]) -> Option<usize> {
    let header: [u8; FRAME_HEADER_LEN] = bytes.get(..FRAME_HEADER_LEN)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

/// Split a complete frame into its payload.
///
/// Returns `None` if the frame is truncated.
#[inline]
pub fn frame_payload(frame: &[u8]) -> Option<&[u8]> {
    let len = frame_payload_len(frame)?;
    frame.get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)
}

/// Append a framed copy of `payload` to `out`.
pub fn write_frame(out: &mut Vec<u8>, payload: &[u8]) -> Option<()> {
    let header = frame_header(payload.len())?;
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    Some(())
}
