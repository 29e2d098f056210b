//! Thin UDP channel: one datagram per packet, header and payload assembled
//! into a single buffer before `send_to`.

use crate::error::Result;
use crate::protocol::{ControlPacket, DataPacket, SocketType};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
}

impl UdpChannel {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serializes and transmits one data packet.
    pub async fn send_data(
        &self,
        packet: &DataPacket,
        kind: SocketType,
        peer: SocketAddr,
    ) -> Result<()> {
        let mut buf = BytesMut::with_capacity(packet.wire_len(kind));
        packet.encode(&mut buf, kind);
        self.socket.send_to(&buf, peer).await?;
        trace!("sent data seq {} ({} bytes) to {}", packet.seq, buf.len(), peer);
        Ok(())
    }

    /// Serializes and transmits one control packet.
    pub async fn send_ctrl(&self, packet: &ControlPacket, peer: SocketAddr) -> Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.socket.send_to(&buf, peer).await?;
        trace!("sent control {:?} to {}", packet.info, peer);
        Ok(())
    }
}
