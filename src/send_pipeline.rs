//! The socket-write seam.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::packet::Packet;

/// Abstraction for writing a datagram to a socket, introduced to facilitate
/// mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, data: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, data: &[u8]) {
        trace!(%to, len = data.len(), "sending datagram");
        if let Err(e) = self.send_to(data, to).await {
            error!(%to, "error sending datagram: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub async fn send_packet(&self, to: SocketAddr, packet: &Packet) {
        self.socket.send_datagram(to, &packet.encode()).await;
    }
}
