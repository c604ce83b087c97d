use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::UdpSocket;

/// Fire-and-forget datagram sender.
///
/// Every outbound message in the node goes through this seam: responses, forwarded and
/// replicated requests, and gossip digests.
pub trait Transport: Send + Sync {
    fn local_addr(&self) -> SocketAddr;
    fn send(&self, bytes: &[u8], dest: SocketAddr);
}

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn send(&self, bytes: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.try_send_to(bytes, dest) {
            tracing::warn!(%dest, "Failed to send datagram: {}", e);
        }
    }
}

#[cfg(test)]
pub use memory::MemoryTransport;
