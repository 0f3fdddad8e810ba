use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// A UDP socket bound to an ephemeral local port with a fixed target.
pub struct UdpTransport {
    host: String,
    port: u16,
    socket: Option<UdpSocket>,
}
impl UdpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            socket: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Err(Error::Connection("already connected".into()));
        }
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        self.socket = Some(socket);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        let _ = self.socket.take();
    }

    fn socket(&mut self) -> Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let target = (self.host.clone(), self.port);
        let _ = self.socket()?.send_to(data, target).await?;
        Ok(())
    }

    /// Receive one datagram, ignoring the sender address.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.socket()?.recv_from(buf).await?;
        Ok(n)
    }
}
