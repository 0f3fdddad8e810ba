use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::{Error, Result};

/// A blocking-style TCP stream to one host/port pair.
pub struct TcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}
impl TcpTransport {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the connection, waiting at most `timeout` for it to be
    /// established.
    pub async fn connect(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Connection("already connected".into()));
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect).await.map_err(|_| {
                Error::Timeout(format!(
                    "connecting to {}:{} took more than {:?}",
                    self.host, self.port, timeout
                ))
            })?,
            None => connect.await,
        };

        self.stream = Some(stream.map_err(|e| {
            Error::Connection(format!("cannot connect to {}:{}: {e}", self.host, self.port))
        })?);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        let _ = self.stream.take();
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream()?.write_all(data).await?;
        Ok(())
    }

    /// Receive up to `buf.len()` bytes, returning the number received.
    /// Zero means the peer closed the connection.
    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream()?.read(buf).await?)
    }

    /// Receive exactly `buf.len()` bytes, looping over partial reads.
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream()?.read_exact(buf).await?;
        Ok(())
    }
}
