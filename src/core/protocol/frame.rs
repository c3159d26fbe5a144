//! Chunk Framing Codec.
//!
//! Every binary message on the data channel is exactly one chunk frame:
//!
//!   [4 bytes: fileIdLength LE] [4 bytes: chunkIndex LE] [fileId UTF-8] [payload]
//!
//! There is one layout and no fallback parsing. A frame that fails any
//! check is rejected with a [`FrameDecodeError`]; the caller logs it and
//! drops it without touching Transfer state.

use bytes::{BufMut, Bytes};

use crate::core::error::FrameDecodeError;

/// Fixed header: id length + chunk index.
pub const FRAME_HEADER_LEN: usize = 8;

/// Longest accepted file id, in bytes.
pub const MAX_FILE_ID_LEN: usize = 256;

/// A decoded chunk frame. `payload` shares the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub file_id: String,
    pub chunk_index: u32,
    pub payload: Bytes,
}

/// Encode a chunk frame into a fresh buffer.
pub fn encode_chunk_frame(file_id: &str, chunk_index: u32, payload: &[u8]) -> Bytes {
    let id = file_id.as_bytes();
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + id.len() + payload.len());
    buf.put_u32_le(id.len() as u32);
    buf.put_u32_le(chunk_index);
    buf.extend_from_slice(id);
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

/// Decode a binary message into a [`ChunkFrame`].
pub fn decode_chunk_frame(data: &Bytes) -> Result<ChunkFrame, FrameDecodeError> {
    let total = data.len();
    if total < FRAME_HEADER_LEN + 1 {
        return Err(FrameDecodeError::TooShort(total));
    }

    let id_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let chunk_index = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if id_len == 0 || id_len as usize > MAX_FILE_ID_LEN {
        return Err(FrameDecodeError::InvalidIdLength(id_len));
    }

    // At least one payload byte must follow the id.
    let id_end = FRAME_HEADER_LEN + id_len as usize;
    if id_end >= total {
        return Err(FrameDecodeError::Truncated {
            id_len,
            frame_len: total,
        });
    }

    let file_id = std::str::from_utf8(&data[FRAME_HEADER_LEN..id_end])
        .map_err(|_| FrameDecodeError::InvalidUtf8)?;
    if file_id.trim().is_empty() {
        return Err(FrameDecodeError::EmptyId);
    }

    Ok(ChunkFrame {
        file_id: file_id.to_owned(),
        chunk_index,
        payload: data.slice(id_end..),
    })
}
