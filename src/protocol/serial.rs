//! Message-based communication over a serial port.

use async_trait::async_trait;

use crate::{
    address::Address,
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings, TimeBudget},
    transport::{SerialConfig, SerialTransport},
};

/// Message-based communication with equipment behind a serial port
/// (or a USB-to-serial adaptor).
pub struct SerialProtocol {
    port: String,
    config: SerialConfig,
    settings: MessageSettings,
    transport: Option<SerialTransport>,
}

impl SerialProtocol {
    pub fn new(port: &str, config: SerialConfig) -> Self {
        Self {
            port: port.to_string(),
            config,
            settings: MessageSettings::default(),
            transport: None,
        }
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        match address {
            Address::Serial { port } => Ok(Self::new(port, SerialConfig::default())),
            _ => Err(Error::AddressParse(format!(
                "{address:?} is not a serial address"
            ))),
        }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Line-coding changes only apply on the next connect.
    pub fn config_mut(&mut self) -> &mut SerialConfig {
        &mut self.config
    }
}

#[async_trait]
impl Interface for SerialProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.transport.is_some() {
            return Err(Error::Connection("already connected".into()));
        }
        let mut transport = SerialTransport::new(&self.port, self.config.clone());
        transport.connect()?;
        self.transport = Some(transport);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBased for SerialProtocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let budget = TimeBudget::new(self.settings.timeout);
        let inter_byte = self
            .transport
            .as_ref()
            .and_then(SerialTransport::inter_byte_timeout);
        let max_read_size = self.settings.max_read_size;
        let termination = self.settings.read_termination.clone();
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".into()))?;

        if let Some(size) = size {
            let mut message = vec![0u8; size];
            budget.run(transport.recv_exact(&mut message)).await?;
            return Ok(message);
        }

        let mut message = vec![];
        let mut byte = [0u8; 1];
        loop {
            // the inter-byte timeout bounds the gap between characters,
            // the operation budget bounds the whole read
            let recv = transport.recv_exact(&mut byte);
            match inter_byte {
                Some(limit) => {
                    budget
                        .run(async { tokio::time::timeout(limit, recv).await? })
                        .await?;
                }
                None => budget.run(recv).await?,
            }
            message.push(byte[0]);

            if let Some(termination) = &termination {
                if !termination.is_empty() && message.ends_with(termination) {
                    return Ok(message);
                }
            }

            if message.len() > max_read_size {
                return Err(Error::Connection(format!(
                    "received {} bytes exceeds max_read_size [{max_read_size}]",
                    message.len()
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
