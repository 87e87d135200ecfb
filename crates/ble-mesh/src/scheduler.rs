//! Round-robin broadcast scheduler
//!
//! The channel gives no delivery confirmation, so every queued message is
//! repeated until it is explicitly cleared. Each tick sends exactly one chunk;
//! consecutive ticks visit consecutive queue entries and every entry walks its
//! own chunks in sequence order, wrapping independently.

use crate::adapter::MeshTransport;
use crate::codec::{Chunk, MessageId};
use tracing::{debug, info, warn};

/// A message waiting for airtime
#[derive(Debug, Clone)]
struct QueueEntry {
    id: MessageId,
    chunks: Vec<Chunk>,
    /// Index of the next chunk this entry transmits
    next_chunk: usize,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Scheduler is not running
    Idle,
    /// Queue was empty, the scheduler stopped itself
    Stopped,
    /// Entry had no chunks and was removed without transmitting
    Dropped(MessageId),
    /// One chunk went to the transport
    Sent { id: MessageId, chunk_number: u8 },
}

enum Step {
    Send(Chunk),
    Dropped(MessageId),
}

#[derive(Debug, Default)]
pub struct BroadcastScheduler {
    queue: Vec<QueueEntry>,
    queue_index: usize,
    running: bool,
}

impl BroadcastScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `chunks` for repetition, replacing an existing entry for `id` in place
    ///
    /// Returns `true` if the call started a stopped scheduler.
    pub fn enqueue(&mut self, id: MessageId, chunks: Vec<Chunk>) -> bool {
        match self.queue.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                debug!("Replacing {} queued chunks of message {}", chunks.len(), id);
                entry.chunks = chunks;
                entry.next_chunk = 0;
            }
            None => {
                debug!("Queueing {} chunks of message {}", chunks.len(), id);
                self.queue.push(QueueEntry {
                    id,
                    chunks,
                    next_chunk: 0,
                });
            }
        }

        if self.running {
            false
        } else {
            self.start();
            true
        }
    }

    /// Mark the scheduler running from the first queue position
    pub fn start(&mut self) {
        info!("Broadcast scheduler started ({} queued)", self.queue.len());
        self.running = true;
        self.reset_cursor();
    }

    /// Halt repetition and stop advertising; the queue is kept
    pub async fn stop(&mut self, transport: &dyn MeshTransport) {
        self.running = false;
        self.reset_cursor();

        if let Err(e) = transport.stop_broadcast().await {
            warn!("Failed to stop advertising: {}", e);
        }
        info!("Broadcast scheduler stopped ({} queued)", self.queue.len());
    }

    /// Run one scheduler period
    pub async fn tick(&mut self, transport: &dyn MeshTransport) -> TickOutcome {
        if !self.running {
            return TickOutcome::Idle;
        }
        if self.queue.is_empty() {
            self.stop(transport).await;
            return TickOutcome::Stopped;
        }

        let chunk = match self.advance() {
            Step::Send(chunk) => chunk,
            Step::Dropped(id) => return TickOutcome::Dropped(id),
        };

        let header = chunk.header();
        if let Err(e) = transport.broadcast_chunk(chunk.as_bytes()).await {
            warn!(
                "Broadcast of chunk {}/{} for message {} failed: {}",
                header.chunk_number, header.total_chunks, header.id, e
            );
        }

        TickOutcome::Sent {
            id: header.id,
            chunk_number: header.chunk_number,
        }
    }

    /// Pick the chunk for this tick and move the cursor on
    ///
    /// The cursor moves to the next entry on every tick while each entry keeps
    /// its own chunk position, so queued messages interleave chunk by chunk:
    /// ids 10 (3 chunks) and 11 (2 chunks) go out as 10.1 11.1 10.2 11.2 10.3
    /// 11.1. Advancing the entry only after its chunks wrap would send
    /// 10.1 10.2 10.3 11.1 instead.
    fn advance(&mut self) -> Step {
        if self.queue_index >= self.queue.len() {
            self.queue_index = 0;
        }

        let entry = &mut self.queue[self.queue_index];
        if entry.chunks.is_empty() {
            let removed = self.queue.remove(self.queue_index);
            debug!("Removed empty queue entry {}", removed.id);
            self.reset_cursor();
            return Step::Dropped(removed.id);
        }

        let position = entry.next_chunk % entry.chunks.len();
        let chunk = entry.chunks[position];
        entry.next_chunk = (position + 1) % entry.chunks.len();

        self.queue_index = (self.queue_index + 1) % self.queue.len();
        Step::Send(chunk)
    }

    fn reset_cursor(&mut self) {
        self.queue_index = 0;
        for entry in &mut self.queue {
            entry.next_chunk = 0;
        }
    }

    /// Entry the next tick will transmit from
    pub fn current_entry(&self) -> Option<(MessageId, &[Chunk])> {
        if self.queue.is_empty() {
            return None;
        }
        let entry = &self.queue[self.queue_index % self.queue.len()];
        Some((entry.id, &entry.chunks))
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.queue.iter().any(|entry| entry.id == id)
    }

    /// Queued ids in insertion order
    pub fn queued_ids(&self) -> Vec<MessageId> {
        self.queue.iter().map(|entry| entry.id).collect()
    }

    /// Drop every queued message
    pub fn clear(&mut self) {
        self.queue.clear();
        self.reset_cursor();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
