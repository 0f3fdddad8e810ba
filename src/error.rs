use std::{fmt::Display, result};

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// A VISA-style address string could not be parsed
    AddressParse(String),
    /// An operation exceeded its configured timeout
    Timeout(String),
    /// Transport open/recv/send failure, or a protocol-layer invariant was violated
    Connection(String),
    /// A well-formed but semantically wrong reply from the device
    Protocol(String),
    /// A HiSLIP FatalError, both channels must be closed after propagation
    FatalProtocol(String),
    /// Device or interface does not support the requested operation
    NotSupported(String),
    IoError(std::io::Error),
}
impl std::error::Error for Error {}
impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AddressParse(desc) => write!(f, "Invalid address: {desc}"),
            Error::Timeout(desc) => write!(f, "Timed out: {desc}"),
            Error::Connection(desc) => write!(f, "Connection error: {desc}"),
            Error::Protocol(desc) => write!(f, "Protocol error: {desc}"),
            Error::FatalProtocol(desc) => write!(f, "Fatal protocol error: {desc}"),
            Error::NotSupported(desc) => write!(f, "Not supported: {desc}"),
            Error::IoError(e) => write!(f, "IO error: {e}"),
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(value.to_string())
            }
            _ => Self::IoError(value),
        }
    }
}
impl From<tokio::time::error::Elapsed> for Error {
    fn from(value: tokio::time::error::Elapsed) -> Self {
        Self::Timeout(value.to_string())
    }
}
impl From<tokio_serial::Error> for Error {
    fn from(value: tokio_serial::Error) -> Self {
        Self::Connection(value.to_string())
    }
}
