//! UDP broadcast stand-in for the radio channel
//!
//! Every chunk becomes one datagram sent to the broadcast address. Listening
//! binds a fresh socket per handle, so a cleared engine really stops hearing
//! traffic until it listens again.

use async_trait::async_trait;
use ble_mesh::{ListenHandle, MeshError, MeshResult, MeshTransport};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const RECEIVE_BUFFER: usize = 256;
const DATAGRAM_MAX: usize = 64;

pub struct UdpTransport {
    socket: UdpSocket,
    listen_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    max_packet_size: usize,
}

impl UdpTransport {
    pub async fn bind(
        listen_addr: SocketAddr,
        broadcast_addr: SocketAddr,
        max_packet_size: usize,
    ) -> MeshResult<Self> {
        let bind_addr: SocketAddr = if broadcast_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;

        info!(
            "UDP transport sending to {} and listening on {}",
            broadcast_addr, listen_addr
        );

        Ok(Self {
            socket,
            listen_addr,
            broadcast_addr,
            max_packet_size,
        })
    }
}

#[async_trait]
impl MeshTransport for UdpTransport {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    async fn broadcast_chunk(&self, chunk: &[u8]) -> MeshResult<()> {
        if chunk.len() > self.max_packet_size {
            return Err(MeshError::PacketTooLarge {
                chunk_len: chunk.len(),
                ceiling: self.max_packet_size,
            });
        }

        self.socket
            .send_to(chunk, self.broadcast_addr)
            .await
            .map_err(|e| MeshError::TransmissionFailed(e.to_string()))?;
        Ok(())
    }

    async fn stop_broadcast(&self) -> MeshResult<()> {
        // Datagrams are not advertised continuously, nothing to withdraw
        debug!("UDP transport idle");
        Ok(())
    }

    async fn listen(&self) -> MeshResult<ListenHandle> {
        let socket = UdpSocket::bind(self.listen_addr).await?;
        let (packets, cancel, handle) = ListenHandle::channel(RECEIVE_BUFFER);

        tokio::spawn(async move {
            let mut buffer = [0u8; DATAGRAM_MAX];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buffer) => match received {
                        Ok((len, from)) => {
                            debug!("Received {} bytes from {}", len, from);
                            if packets.send(buffer[..len].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("UDP receive failed: {}", e),
                    },
                }
            }
            debug!("UDP listener closed");
        });

        Ok(handle)
    }
}
