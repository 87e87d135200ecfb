//! Transport abstraction for the broadcast-only radio channel
//!
//! The engine never talks to a radio stack directly. A transport broadcasts
//! one chunk at a time and hands out a [`ListenHandle`] yielding every packet
//! observed on the channel, including the node's own echoes.

use crate::codec::CHUNK_LEN;
use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Trait for platform-agnostic broadcast operations
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Largest packet, in bytes, a single broadcast may carry
    fn max_packet_size(&self) -> usize;

    /// Advertise one chunk, replacing whatever was advertised before
    async fn broadcast_chunk(&self, chunk: &[u8]) -> MeshResult<()>;

    /// Stop advertising
    async fn stop_broadcast(&self) -> MeshResult<()>;

    /// Start receiving packets heard on the channel
    async fn listen(&self) -> MeshResult<ListenHandle>;
}

/// Receive side of a transport subscription
///
/// Dropping the handle cancels its token, which tells the transport to stop
/// feeding it.
#[derive(Debug)]
pub struct ListenHandle {
    packets: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
}

impl ListenHandle {
    pub fn new(packets: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) -> Self {
        Self { packets, cancel }
    }

    /// Create a handle together with the sender and token its producer uses
    pub fn channel(buffer: usize) -> (mpsc::Sender<Vec<u8>>, CancellationToken, ListenHandle) {
        let (tx, rx) = mpsc::channel(buffer);
        let cancel = CancellationToken::new();
        (tx, cancel.clone(), ListenHandle::new(rx, cancel))
    }

    /// Next packet, `None` once the producer is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.packets.recv().await
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        debug!("Releasing transport listen handle");
        self.cancel.cancel();
    }
}

/// Reject transports whose packets cannot hold a full chunk
pub fn check_packet_size(transport: &dyn MeshTransport) -> MeshResult<()> {
    let ceiling = transport.max_packet_size();
    if CHUNK_LEN > ceiling {
        return Err(MeshError::PacketTooLarge {
            chunk_len: CHUNK_LEN,
            ceiling,
        });
    }
    Ok(())
}
