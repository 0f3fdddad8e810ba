//! Wire-protocol clients and message-based interfaces.

use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    address::Address,
    error::{Error, Result},
    message::MessageBased,
};

pub mod gpib;
pub mod hislip;
pub mod modbus;
pub mod prologix;
pub mod serial;
pub mod socket;
pub mod usbtmc;
pub mod vxi11;

pub use gpib::GpibProtocol;
pub use hislip::HislipProtocol;
pub use modbus::ModbusProtocol;
pub use prologix::PrologixProtocol;
pub use serial::SerialProtocol;
pub use socket::SocketProtocol;
pub use usbtmc::UsbtmcProtocol;
pub use vxi11::Vxi11Protocol;

/// State changes of the GPIB Remote Enable line, optionally combined with
/// the remote/local state of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum RenMode {
    /// Disable remote
    Deassert,
    /// Enable remote
    Assert,
    /// Disable remote and go to local
    DeassertGtl,
    /// Enable remote and go to remote
    AssertAddress,
    /// Enable remote and lock out local
    AssertLlo,
    /// Enable remote, go to remote and set local lockout
    AssertAddressLlo,
    /// Go to local without changing the REN or lockout state
    AddressGtl,
}
impl RenMode {
    /// The request value of the HiSLIP `AsyncRemoteLocalControl` message.
    pub(crate) fn hislip_request(self) -> u8 {
        match self {
            Self::Deassert => 0,
            Self::Assert => 1,
            Self::DeassertGtl => 2,
            Self::AssertAddress => 3,
            Self::AssertLlo => 4,
            Self::AssertAddressLlo => 5,
            Self::AddressGtl => 6,
        }
    }
}

/// Build the message-based connection that matches a parsed address.
/// The connection is constructed but not yet connected.
///
/// USB and FTDI addresses need a platform USB binding (see
/// [`usbtmc::UsbDevice`]) and Modbus addresses carry function-coded
/// frames rather than messages; both are built through their own
/// constructors instead.
pub fn open(address: &Address) -> Result<Box<dyn MessageBased>> {
    match address {
        Address::Vxi11 { .. } => Ok(Box::new(Vxi11Protocol::from_address(address)?)),
        Address::Hislip { .. } => Ok(Box::new(HislipProtocol::from_address(address)?)),
        Address::Socket { .. } => Ok(Box::new(SocketProtocol::from_address(address)?)),
        Address::Serial { .. } => Ok(Box::new(SerialProtocol::from_address(address)?)),
        Address::Gpib { .. } => Ok(Box::new(GpibProtocol::from_address(address)?)),
        Address::Prologix { .. } => Ok(Box::new(PrologixProtocol::from_address(address)?)),
        Address::Modbus { .. } => Err(Error::NotSupported(
            "Modbus connections are built with ModbusProtocol::from_address".to_string(),
        )),
        Address::Usb { .. } | Address::Ftdi { .. } => Err(Error::NotSupported(
            "USB connections need a platform UsbDevice implementation".to_string(),
        )),
        Address::Zmq { .. } => Err(Error::NotSupported(
            "ZeroMQ connections are not part of the wire-protocol core".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_selects_statically() {
        for address in [
            "TCPIP::10.0.0.1::inst0::INSTR",
            "TCPIP::10.0.0.1::hislip0::INSTR",
            "TCP::10.0.0.1::5025",
            "ASRL2",
            "GPIB0::6",
            "Prologix::10.0.0.1::1234::6",
        ] {
            let parsed = Address::parse(address).unwrap();
            assert!(open(&parsed).is_ok(), "{address}");
        }

        for address in ["USB::0x1234::0x5678::SER::INSTR", "ZMQ::10.0.0.1::5555"] {
            let parsed = Address::parse(address).unwrap();
            assert!(matches!(open(&parsed), Err(Error::NotSupported(_))), "{address}");
        }
    }

    #[test]
    fn ren_mode_names() {
        use std::str::FromStr;
        assert_eq!(RenMode::from_str("assert").unwrap(), RenMode::Assert);
        assert_eq!(RenMode::from_str("AssertAddressLlo").unwrap().hislip_request(), 5);
    }
}
