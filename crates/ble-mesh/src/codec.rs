//! Chunk codec for the broadcast-only radio channel
//!
//! A message is split into fixed-size chunks small enough to ride in a single
//! advertisement. Every chunk is self-describing so a listener can rebuild the
//! message from any arrival order.
//!
//! Wire layout (9 bytes):
//!
//! ```text
//! 0      1               2        3            9
//! +------+---+-----------+--------+------------+
//! |  id  | A |   total   | number | 6 data     |
//! +------+---+-----------+--------+------------+
//! ```
//!
//! `A` is the top bit of byte 1 and marks an acknowledgement; the low seven
//! bits carry the chunk count. Id 0 is never issued.

use crate::error::{MeshError, MeshResult};
use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use tracing::warn;

/// Identifier shared by every chunk of one message and by its acknowledgement
pub type MessageId = u8;

/// Header bytes preceding the payload
pub const CHUNK_HEADER_LEN: usize = 3;

/// Payload bytes carried by each chunk
pub const CHUNK_DATA_LEN: usize = 6;

/// Total encoded size of one chunk
pub const CHUNK_LEN: usize = CHUNK_HEADER_LEN + CHUNK_DATA_LEN;

/// Largest number of chunks a message may span
pub const MAX_CHUNKS: usize = TOTAL_MASK as usize;

/// Largest message, in bytes, the codec accepts
pub const MAX_MESSAGE_LEN: usize = MAX_CHUNKS * CHUNK_DATA_LEN;

const FLAG_ACK: u8 = 0x80;
const TOTAL_MASK: u8 = 0x7F;

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: MessageId,
    pub total_chunks: u8,
    pub chunk_number: u8,
    pub is_ack: bool,
}

/// One broadcastable unit, immutable once produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Chunk {
    bytes: [u8; CHUNK_LEN],
}

/// Whether an encoded message opens a new exchange or answers one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMeta {
    /// New request under a freshly drawn id
    Request,
    /// Acknowledgement reusing the request's id
    Ack(MessageId),
}

impl Chunk {
    /// Validate raw bytes received from the transport
    pub fn parse(bytes: &[u8]) -> Option<Chunk> {
        decode_header(bytes)?;
        let bytes: [u8; CHUNK_LEN] = bytes.try_into().ok()?;
        Some(Chunk { bytes })
    }

    fn build(header: ChunkHeader, data: &[u8]) -> Chunk {
        debug_assert!(data.len() <= CHUNK_DATA_LEN);

        let mut bytes = [0u8; CHUNK_LEN];
        bytes[0] = header.id;
        bytes[1] = header.total_chunks | if header.is_ack { FLAG_ACK } else { 0 };
        bytes[2] = header.chunk_number;
        bytes[CHUNK_HEADER_LEN..CHUNK_HEADER_LEN + data.len()].copy_from_slice(data);
        Chunk { bytes }
    }

    pub fn header(&self) -> ChunkHeader {
        read_header(&self.bytes)
    }

    /// Payload portion, including any zero padding
    pub fn data(&self) -> &[u8] {
        &self.bytes[CHUNK_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn read_header(bytes: &[u8; CHUNK_LEN]) -> ChunkHeader {
    ChunkHeader {
        id: bytes[0],
        total_chunks: bytes[1] & TOTAL_MASK,
        chunk_number: bytes[2],
        is_ack: bytes[1] & FLAG_ACK != 0,
    }
}

/// Decode the header of raw chunk bytes, `None` for anything malformed or foreign
pub fn decode_header(bytes: &[u8]) -> Option<ChunkHeader> {
    let bytes: &[u8; CHUNK_LEN] = bytes.try_into().ok()?;
    let header = read_header(bytes);

    if header.id == 0
        || header.total_chunks == 0
        || header.chunk_number == 0
        || header.chunk_number > header.total_chunks
    {
        return None;
    }

    Some(header)
}

/// Draw a random non-zero id for which `in_use` is false
///
/// Fails with `IdsExhausted` once every id is taken.
pub fn fresh_message_id(in_use: impl Fn(MessageId) -> bool) -> MeshResult<MessageId> {
    let free: Vec<MessageId> = (1..=MessageId::MAX).filter(|id| !in_use(*id)).collect();
    free.choose(&mut rand::thread_rng())
        .copied()
        .ok_or(MeshError::IdsExhausted)
}

/// Split `text` into chunks numbered 1..=N
pub fn encode_message(text: &str, meta: EncodeMeta) -> MeshResult<Vec<Chunk>> {
    match meta {
        EncodeMeta::Request => encode_with_id(text, fresh_message_id(|_| false)?, false),
        EncodeMeta::Ack(id) => encode_with_id(text, id, true),
    }
}

/// Split `text` into chunks under an explicit id
pub fn encode_with_id(text: &str, id: MessageId, is_ack: bool) -> MeshResult<Vec<Chunk>> {
    let bytes = text.as_bytes();

    if id == 0 {
        return Err(MeshError::InvalidMessage("message id 0 is reserved".to_string()));
    }
    if bytes.is_empty() {
        return Err(MeshError::EmptyMessage);
    }
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(MeshError::MessageTooLarge {
            len: bytes.len(),
            max: MAX_MESSAGE_LEN,
        });
    }
    // Trailing NULs are indistinguishable from padding
    if bytes.last() == Some(&0) {
        return Err(MeshError::InvalidMessage(
            "message must not end with a NUL byte".to_string(),
        ));
    }

    let total_chunks = bytes.len().div_ceil(CHUNK_DATA_LEN) as u8;

    Ok(bytes
        .chunks(CHUNK_DATA_LEN)
        .enumerate()
        .map(|(index, data)| {
            Chunk::build(
                ChunkHeader {
                    id,
                    total_chunks,
                    chunk_number: index as u8 + 1,
                    is_ack,
                },
                data,
            )
        })
        .collect())
}

/// Rebuild the text from a complete chunk set keyed by chunk number
///
/// Chunks are concatenated in numeric order whatever order they arrived in.
/// Returns `None` if any chunk in 1..=total is missing.
pub fn reassemble(total_chunks: u8, chunks: &BTreeMap<u8, Chunk>) -> Option<String> {
    let mut buffer = Vec::with_capacity(total_chunks as usize * CHUNK_DATA_LEN);
    for number in 1..=total_chunks {
        buffer.extend_from_slice(chunks.get(&number)?.data());
    }

    let text_len = buffer.iter().rposition(|b| *b != 0).map_or(0, |last| last + 1);
    buffer.truncate(text_len);

    Some(match String::from_utf8(buffer) {
        Ok(text) => text,
        Err(e) => {
            warn!("Reassembled message is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    })
}
