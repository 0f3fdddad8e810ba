//! Multi-transport wire-protocol support for laboratory instruments.
//!
//! Application code talks to measurement equipment through a
//! [`MessageBased`](message::MessageBased) connection, regardless of
//! whether the instrument speaks VXI-11, HiSLIP, USBTMC, GPIB (directly
//! or behind a Prologix controller), Modbus, or a raw socket or serial
//! stream. Instruments are located with the [`discovery`] searches and
//! addressed with VISA-style strings parsed by [`address::Address`].

pub mod address;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod message;
pub mod protocol;
pub mod transport;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
