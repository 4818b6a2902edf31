use std::net::SocketAddr;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::trace;

/// An abstraction for sending and receiving datagrams, introduced to allow running the
///  protocol over something other than a real UDP socket for testing
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()>;

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn send_datagram(&self, to: SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        let num_sent = self.send_to(datagram, to).await?;
        if num_sent < datagram.len() {
            return Err(std::io::Error::new(std::io::ErrorKind::WriteZero, format!("only {} of {} bytes were sent", num_sent, datagram.len())));
        }
        Ok(())
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(UdpSocket::local_addr(self)?)
    }
}
