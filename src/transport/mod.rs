//! Byte-level transports: TCP streams, UDP datagrams and serial ports.

mod serial;
mod tcp;
mod udp;

pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;
