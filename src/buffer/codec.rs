//! Length-prefixed record framing for buffer data files.
//!
//! Each record is stored as a 4-byte little-endian payload length followed by
//! the payload. A frame cut short by a crash is recognised as incomplete, so a
//! reader never interprets a neighbouring record's bytes as payload.

use super::BufferError;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

/// Largest payload accepted by the writer. A larger declared length can only
/// come from corruption.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Result of decoding the frame at the start of a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame<'a> {
    /// A complete record; `len` is the full frame size including the prefix.
    Record { payload: &'a [u8], len: usize },
    /// Not enough bytes for a full frame (including an empty slice).
    Incomplete,
    /// The length prefix is larger than any record the writer produces.
    Corrupt { declared: usize },
}

/// Frames one record.
pub fn encode(record: &[u8]) -> Result<Vec<u8>, BufferError> {
    if record.len() > MAX_RECORD_SIZE {
        return Err(BufferError::RecordTooLarge {
            len: record.len(),
            max: MAX_RECORD_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + record.len());
    frame.extend_from_slice(&(record.len() as u32).to_le_bytes());
    frame.extend_from_slice(record);
    Ok(frame)
}

/// Decodes the frame at the start of `buf`.
pub fn decode(buf: &[u8]) -> Frame<'_> {
    let Some(prefix) = buf.get(..LENGTH_PREFIX) else {
        return Frame::Incomplete;
    };
    let mut raw = [0u8; LENGTH_PREFIX];
    raw.copy_from_slice(prefix);
    let declared = u32::from_le_bytes(raw) as usize;

    if declared > MAX_RECORD_SIZE {
        return Frame::Corrupt { declared };
    }

    let len = LENGTH_PREFIX + declared;
    match buf.get(LENGTH_PREFIX..len) {
        Some(payload) => Frame::Record { payload, len },
        None => Frame::Incomplete,
    }
}

/// Returns the length of the longest prefix of `buf` made of complete frames.
pub fn complete_prefix_len(buf: &[u8]) -> usize {
    let mut pos = 0;
    while let Frame::Record { len, .. } = decode(&buf[pos..]) {
        pos += len;
    }
    pos
}
