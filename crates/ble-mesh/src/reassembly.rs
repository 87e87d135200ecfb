//! Reassembly table for chunks heard on the mesh
//!
//! Each message id maps to one [`MessageState`]. An id first denotes a
//! request and may later denote its acknowledgement; the switch happens in
//! [`MessageState::accept`] as an explicit transition.

use crate::codec::{self, Chunk, ChunkHeader, MessageId};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Which side of an exchange a message carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Request,
    Ack,
}

impl MessageRole {
    fn from_flag(is_ack: bool) -> Self {
        if is_ack {
            MessageRole::Ack
        } else {
            MessageRole::Request
        }
    }
}

/// Reassembly phase of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Complete { text: String },
}

/// Progress of a message towards completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub received: usize,
    pub total: usize,
    pub percent: u8,
}

/// Why a chunk left the table unchanged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Undecodable,
    AlreadyComplete,
    DuplicateChunk,
    /// Total count disagrees with the chunks already held for this id
    TotalMismatch,
    /// Request chunk for an id that already carries an acknowledgement
    StaleRequest,
}

/// A message whose every chunk has been received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub id: MessageId,
    pub role: MessageRole,
    pub text: String,
    /// Chunks in canonical 1..=N order
    pub chunks: Vec<Chunk>,
}

/// Result of offering one chunk to the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Discarded(DiscardReason),
    Stored,
    Completed(CompletedMessage),
}

/// Per-id reassembly record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageState {
    id: MessageId,
    role: MessageRole,
    total_chunks: u8,
    chunks: BTreeMap<u8, Chunk>,
    phase: Phase,
}

impl MessageState {
    fn new(header: &ChunkHeader) -> Self {
        Self {
            id: header.id,
            role: MessageRole::from_flag(header.is_ack),
            total_chunks: header.total_chunks,
            chunks: BTreeMap::new(),
            phase: Phase::Pending,
        }
    }

    /// Build an already-complete record from a full chunk set
    fn complete(id: MessageId, role: MessageRole, chunks: Vec<Chunk>, text: String) -> Self {
        Self {
            id,
            role,
            total_chunks: chunks.len() as u8,
            chunks: chunks
                .into_iter()
                .map(|chunk| (chunk.header().chunk_number, chunk))
                .collect(),
            phase: Phase::Complete { text },
        }
    }

    /// Reset a request record to start collecting its acknowledgement
    fn flip_to_ack(&mut self, total_chunks: u8) {
        self.role = MessageRole::Ack;
        self.total_chunks = total_chunks;
        self.chunks.clear();
        self.phase = Phase::Pending;
    }

    /// Apply one chunk whose header id matches this record
    fn accept(&mut self, header: &ChunkHeader, chunk: Chunk) -> ChunkOutcome {
        let incoming = MessageRole::from_flag(header.is_ack);

        match (self.role, incoming) {
            (MessageRole::Request, MessageRole::Ack) => {
                debug!(
                    "Message {} switching from request to acknowledgement ({} chunks)",
                    self.id, header.total_chunks
                );
                self.flip_to_ack(header.total_chunks);
            }
            (MessageRole::Ack, MessageRole::Request) => {
                return ChunkOutcome::Discarded(DiscardReason::StaleRequest);
            }
            _ => {}
        }

        if self.is_complete() {
            return ChunkOutcome::Discarded(DiscardReason::AlreadyComplete);
        }
        if header.total_chunks != self.total_chunks {
            return ChunkOutcome::Discarded(DiscardReason::TotalMismatch);
        }
        if self.chunks.contains_key(&header.chunk_number) {
            return ChunkOutcome::Discarded(DiscardReason::DuplicateChunk);
        }

        self.chunks.insert(header.chunk_number, chunk);

        if self.chunks.len() < self.total_chunks as usize {
            return ChunkOutcome::Stored;
        }

        // Numbers are validated against the total, so a full map holds 1..=total
        let text = codec::reassemble(self.total_chunks, &self.chunks).unwrap_or_default();
        self.phase = Phase::Complete { text: text.clone() };

        ChunkOutcome::Completed(CompletedMessage {
            id: self.id,
            role: self.role,
            text,
            chunks: self.ordered_chunks(),
        })
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn role(&self) -> MessageRole {
        self.role
    }

    pub fn is_ack(&self) -> bool {
        self.role == MessageRole::Ack
    }

    pub fn total_chunks(&self) -> u8 {
        self.total_chunks
    }

    pub fn received_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.phase, Phase::Complete { .. })
    }

    /// Full text once complete
    pub fn text(&self) -> Option<&str> {
        match &self.phase {
            Phase::Complete { text } => Some(text),
            Phase::Pending => None,
        }
    }

    pub fn has_chunk(&self, chunk_number: u8) -> bool {
        self.chunks.contains_key(&chunk_number)
    }

    /// Chunks held so far, in chunk-number order
    pub fn ordered_chunks(&self) -> Vec<Chunk> {
        self.chunks.values().copied().collect()
    }

    pub fn progress(&self) -> Progress {
        let received = self.chunks.len();
        let total = self.total_chunks.max(1) as usize;
        let percent = ((received * 100 + total / 2) / total).min(100) as u8;
        Progress {
            received,
            total: self.total_chunks as usize,
            percent,
        }
    }
}

/// Table of every message this node has seen or originated
#[derive(Debug, Default)]
pub struct ReassemblyStore {
    entries: BTreeMap<MessageId, MessageState>,
}

impl ReassemblyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record raw chunk bytes heard on the channel
    ///
    /// Malformed, duplicate and irrelevant chunks are discarded without error;
    /// the table only ever degrades to still waiting.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> ChunkOutcome {
        let Some(chunk) = Chunk::parse(bytes) else {
            return ChunkOutcome::Discarded(DiscardReason::Undecodable);
        };
        let header = chunk.header();

        let entry = self
            .entries
            .entry(header.id)
            .or_insert_with(|| MessageState::new(&header));

        let outcome = entry.accept(&header, chunk);

        match &outcome {
            ChunkOutcome::Discarded(reason) => {
                debug!(
                    "Discarded chunk {}/{} of message {}: {:?}",
                    header.chunk_number, header.total_chunks, header.id, reason
                );
            }
            ChunkOutcome::Stored => {
                debug!(
                    "Stored chunk {}/{} of message {}",
                    header.chunk_number, header.total_chunks, header.id
                );
            }
            ChunkOutcome::Completed(message) => {
                info!(
                    "Message {} reassembled from {} chunks ({:?}, {} bytes)",
                    message.id,
                    message.chunks.len(),
                    message.role,
                    message.text.len()
                );
            }
        }

        outcome
    }

    /// Store a message this node already holds in full, replacing any record for the id
    pub fn insert_complete(
        &mut self,
        id: MessageId,
        role: MessageRole,
        chunks: Vec<Chunk>,
        text: String,
    ) {
        self.entries
            .insert(id, MessageState::complete(id, role, chunks, text));
    }

    pub fn get(&self, id: MessageId) -> Option<&MessageState> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageState> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
