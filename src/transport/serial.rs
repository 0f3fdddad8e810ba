use std::time::Duration;

use strum_macros::{Display, EnumIter, EnumString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};

/// Number of data bits per character.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum DataBits {
    Five = 5,
    Six = 6,
    Seven = 7,
    #[default]
    Eight = 8,
}

/// Parity checking mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Number of stop bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Flow control mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum FlowControl {
    #[default]
    None,
    /// Software flow control
    XonXoff,
    /// Hardware (RTS/CTS) flow control
    RtsCts,
    /// Hardware (DSR/DTR) flow control
    DsrDtr,
}

/// Line coding for a serial port.
#[derive(Clone, Debug)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Maximum duration allowed between two consecutive received bytes
    pub inter_byte_timeout: Option<Duration>,
}
impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
            inter_byte_timeout: None,
        }
    }
}

/// A byte stream over a serial port (or a USB-to-serial adaptor).
pub struct SerialTransport {
    port: String,
    config: SerialConfig,
    stream: Option<SerialStream>,
}
impl SerialTransport {
    pub fn new(port: &str, config: SerialConfig) -> Self {
        Self {
            port: port.to_string(),
            config,
            stream: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::Connection("already connected".into()));
        }

        let parity = match self.config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
            // mark/space parity is not supported by the backend
            Parity::Mark | Parity::Space => {
                return Err(Error::NotSupported(format!(
                    "{} parity on {}",
                    self.config.parity, self.port
                )));
            }
        };
        let data_bits = match self.config.data_bits {
            DataBits::Five => tokio_serial::DataBits::Five,
            DataBits::Six => tokio_serial::DataBits::Six,
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::OnePointFive => {
                return Err(Error::NotSupported(format!("1.5 stop bits on {}", self.port)));
            }
            StopBits::Two => tokio_serial::StopBits::Two,
        };
        let flow_control = match self.config.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::XonXoff => tokio_serial::FlowControl::Software,
            FlowControl::RtsCts => tokio_serial::FlowControl::Hardware,
            FlowControl::DsrDtr => {
                return Err(Error::NotSupported(format!(
                    "DSR/DTR flow control on {}",
                    self.port
                )));
            }
        };

        let stream = tokio_serial::new(&self.port, self.config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .open_native_async()?;
        self.stream = Some(stream);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        let _ = self.stream.take();
    }

    fn stream(&mut self) -> Result<&mut SerialStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected".into()))
    }

    pub fn inter_byte_timeout(&self) -> Option<Duration> {
        self.config.inter_byte_timeout
    }

    pub async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        self.stream()?.write_all(data).await?;
        Ok(())
    }

    pub async fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stream()?.read(buf).await?)
    }

    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream()?.read_exact(buf).await?;
        Ok(())
    }
}
