//! Message-based communication over a TCP stream or UDP datagrams.

use async_trait::async_trait;

use crate::{
    address::Address,
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings, TimeBudget},
    transport::{TcpTransport, UdpTransport},
};

enum SocketTransport {
    Tcp(TcpTransport),
    Udp(UdpTransport),
}
impl SocketTransport {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            Self::Tcp(t) => {
                let n = t.recv(buf).await?;
                if n == 0 {
                    return Err(Error::Connection("the peer closed the connection".into()));
                }
                Ok(n)
            }
            Self::Udp(t) => t.recv(buf).await,
        }
    }

    async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Tcp(t) => t.send_all(data).await,
            Self::Udp(t) => t.send_all(data).await,
        }
    }
}

/// Message-based communication with equipment behind a TCP or UDP socket.
///
/// Bytes received beyond the current message stay in an internal buffer
/// and are consumed by the next read.
pub struct SocketProtocol {
    host: String,
    port: u16,
    udp: bool,
    settings: MessageSettings,
    /// Number of bytes to receive at a time
    buffer_size: usize,
    byte_buffer: Vec<u8>,
    transport: Option<SocketTransport>,
}

impl SocketProtocol {
    pub fn new(host: &str, port: u16, udp: bool) -> Self {
        Self {
            host: host.to_string(),
            port,
            udp,
            settings: MessageSettings::default(),
            buffer_size: 4096,
            byte_buffer: vec![],
            transport: None,
        }
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        match address {
            Address::Socket { host, port, udp } => Ok(Self::new(host, *port, *udp)),
            _ => Err(Error::AddressParse(format!(
                "{address:?} is not a socket address"
            ))),
        }
    }

    /// Take a complete message out of the byte buffer, if one is there.
    fn take_buffered(&mut self, size: Option<usize>) -> Option<Vec<u8>> {
        match size {
            Some(size) => {
                if self.byte_buffer.len() >= size {
                    let rest = self.byte_buffer.split_off(size);
                    return Some(std::mem::replace(&mut self.byte_buffer, rest));
                }
            }
            None => {
                if let Some(termination) = &self.settings.read_termination {
                    if !termination.is_empty() {
                        if let Some(index) = self
                            .byte_buffer
                            .windows(termination.len())
                            .position(|w| w == termination.as_slice())
                        {
                            let rest = self.byte_buffer.split_off(index + termination.len());
                            return Some(std::mem::replace(&mut self.byte_buffer, rest));
                        }
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl Interface for SocketProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Err(Error::Connection("already connected".into()));
        }
        self.byte_buffer.clear();
        let transport = if self.udp {
            let mut udp = UdpTransport::new(&self.host, self.port);
            udp.connect().await?;
            SocketTransport::Udp(udp)
        } else {
            let mut tcp = TcpTransport::new(&self.host, self.port);
            tcp.connect(self.settings.timeout).await?;
            SocketTransport::Tcp(tcp)
        };
        self.transport = Some(transport);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let _ = self.transport.take();
        Ok(())
    }
}

#[async_trait]
impl MessageBased for SocketProtocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let budget = TimeBudget::new(self.settings.timeout);
        let max_read_size = self.settings.max_read_size;
        let mut chunk = vec![0u8; self.buffer_size];
        loop {
            if let Some(message) = self.take_buffered(size) {
                return Ok(message);
            }

            let transport = self
                .transport
                .as_mut()
                .ok_or_else(|| Error::Connection("not connected".into()))?;
            let received = budget.run(transport.recv(&mut chunk)).await?;
            self.byte_buffer.extend_from_slice(&chunk[..received]);

            if self.byte_buffer.len() > max_read_size {
                return Err(Error::Connection(format!(
                    "buffered {} bytes exceeds max_read_size [{max_read_size}]",
                    self.byte_buffer.len()
                )));
            }
        }
    }

    async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
        let budget = TimeBudget::new(self.settings.timeout);
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".into()))?;
        budget.run(transport.send_all(message)).await?;
        Ok(message.len())
    }
}
