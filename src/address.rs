//! Parsing of VISA-style resource address strings.
//!
//! Every supported scheme parses into an [`Address`] variant; anything else
//! is an [`Error::AddressParse`]. Parsing never panics.

use crate::error::{Error, Result};

/// Primary GPIB addresses must be in `[0, 30]`.
pub const MIN_PAD_ADDRESS: u8 = 0;
pub const MAX_PAD_ADDRESS: u8 = 30;
/// Secondary GPIB addresses must be in `[96, 126]`.
pub const MIN_SAD_ADDRESS: u8 = 96;
pub const MAX_SAD_ADDRESS: u8 = 126;

/// Default port of the HiSLIP service.
pub const HISLIP_PORT: u16 = 4880;
/// Default port of a Modbus TCP/UDP server.
pub const MODBUS_PORT: u16 = 502;

/// How to frame Modbus messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModbusFramer {
    Ascii,
    Rtu,
    Socket,
}

/// A parsed VISA-style address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// `TCPIP[board]::host[::name][::INSTR]`, where `name` is a LAN device
    /// name such as `inst0` or `gpib0,2` (default `inst0`)
    Vxi11 { board: u16, host: String, name: String },
    /// `TCPIP[board]::host::hislip<n>[,port][::INSTR]`
    Hislip {
        board: u16,
        host: String,
        name: String,
        port: u16,
    },
    /// `TCP::host::port`, `UDP::host::port` or `TCPIP[board]::host::port::SOCKET`
    Socket { host: String, port: u16, udp: bool },
    /// `USB[board]::vid::pid::serial[::interface][::INSTR|::RAW]`
    Usb {
        board: u16,
        vid: String,
        pid: String,
        serial: String,
        interface: Option<u8>,
        raw: bool,
    },
    /// `FTDI[driver]::vid::pid::serial[::interface]`
    Ftdi {
        driver: Option<u8>,
        vid: String,
        pid: String,
        serial: String,
        interface: Option<u8>,
    },
    /// `GPIB[board][::pad|::name][::sad]`
    Gpib {
        board: u16,
        pad: Option<u8>,
        sad: Option<u8>,
        name: Option<String>,
    },
    /// `Prologix::hw[::enet-port][::GPIB]::pad[::sad]`
    Prologix {
        hw_address: String,
        enet_port: Option<u16>,
        pad: u8,
        sad: Option<u8>,
    },
    /// `ASRL<n>`, `ASRLCOM<n>`, `COM<n>` or `ASRL/dev/<name>`
    Serial { port: String },
    /// `MODBUS::<serial-port|host[::port]>[::ASCII|RTU|SOCKET][::UDP]`
    Modbus {
        inner: Box<Address>,
        framer: ModbusFramer,
    },
    /// `ZMQ::host::port`
    Zmq { host: String, port: u16 },
}

impl Address {
    /// Parse a VISA-style address string.
    pub fn parse(address: &str) -> Result<Address> {
        let fields = split_fields(address);
        let scheme = fields[0].to_ascii_uppercase();

        if let Some(board) = scheme.strip_prefix("TCPIP") {
            return parse_tcpip(address, board, &fields);
        }
        if scheme == "TCP" || scheme == "UDP" {
            return parse_socket(address, &fields, scheme == "UDP");
        }
        if let Some(board) = scheme.strip_prefix("USB") {
            return parse_usb(address, board, &fields);
        }
        if let Some(driver) = scheme.strip_prefix("FTDI") {
            return parse_ftdi(address, driver, &fields);
        }
        if let Some(board) = scheme.strip_prefix("GPIB") {
            return parse_gpib(address, board, &fields);
        }
        if scheme == "PROLOGIX" {
            return parse_prologix(address, &fields);
        }
        if scheme == "MODBUS" {
            return parse_modbus(address, &fields);
        }
        if scheme == "ZMQ" {
            return parse_zmq(address, &fields);
        }
        if let Some(port) = parse_serial_port(&fields[0]) {
            if fields.len() == 1 {
                return Ok(Address::Serial { port });
            }
        }

        Err(Error::AddressParse(address.to_string()))
    }
}

/// Split on `::` but keep anything inside `[...]` as part of one field, so
/// LAN device names such as `usb0[1234::5678::SER::0]` stay intact.
fn split_fields(address: &str) -> Vec<&str> {
    let bytes = address.as_bytes();
    let mut fields = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                fields.push(&address[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    fields.push(&address[start..]);
    fields
}

fn bad(address: &str) -> Error {
    Error::AddressParse(address.to_string())
}

fn parse_board(text: &str) -> Option<u16> {
    if text.is_empty() {
        Some(0)
    } else {
        text.parse().ok()
    }
}

fn is_hostname(text: &str) -> bool {
    !text.is_empty() && !text.contains(char::is_whitespace) && !text.contains(':')
}

/// A VXI-11 LAN device name is non-empty, contains no whitespace, and ends
/// with a digit optionally followed by a `[...]` group.
fn is_lan_device_name(text: &str) -> bool {
    let head = match (text.find('['), text.ends_with(']')) {
        (Some(i), true) => &text[..i],
        (None, false) => text,
        _ => return false,
    };
    !head.is_empty()
        && !head.contains(char::is_whitespace)
        && !head.contains(':')
        && head.ends_with(|c: char| c.is_ascii_digit())
}

fn parse_tcpip(address: &str, board: &str, fields: &[&str]) -> Result<Address> {
    let board = parse_board(board).ok_or_else(|| bad(address))?;
    if fields.len() < 2 {
        return Err(bad(address));
    }
    let host = fields[1];
    if !is_hostname(host) {
        return Err(bad(address));
    }

    // Strip a trailing ::INSTR before looking at the device name
    let mut rest: Vec<&str> = fields[2..].to_vec();
    let instr = rest
        .last()
        .is_some_and(|f| f.eq_ignore_ascii_case("INSTR"));
    if instr {
        let _ = rest.pop();
    }

    match rest.as_slice() {
        [] => Ok(Address::Vxi11 {
            board,
            host: host.to_string(),
            name: "inst0".to_string(),
        }),
        [name] => {
            if name
                .get(..6)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("hislip"))
            {
                return parse_hislip_name(address, board, host, name);
            }
            // `TCPIP::host::port::SOCKET` is handled below; a bare port
            // number is not a valid LAN device name
            if !is_lan_device_name(name) {
                return Err(bad(address));
            }
            Ok(Address::Vxi11 {
                board,
                host: host.to_string(),
                name: name.to_string(),
            })
        }
        [port, suffix] if suffix.eq_ignore_ascii_case("SOCKET") && !instr => {
            let port = port.parse().map_err(|_| bad(address))?;
            Ok(Address::Socket {
                host: host.to_string(),
                port,
                udp: false,
            })
        }
        _ => Err(bad(address)),
    }
}

fn parse_hislip_name(address: &str, board: u16, host: &str, name: &str) -> Result<Address> {
    let (name, port) = match name.split_once(',') {
        Some((name, port)) => (name, port.parse().map_err(|_| bad(address))?),
        None => (name, HISLIP_PORT),
    };
    let digits = &name[6..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad(address));
    }
    Ok(Address::Hislip {
        board,
        host: host.to_string(),
        name: name.to_string(),
        port,
    })
}

fn parse_socket(address: &str, fields: &[&str], udp: bool) -> Result<Address> {
    let [_, host, port] = fields else {
        return Err(bad(address));
    };
    if !is_hostname(host) {
        return Err(bad(address));
    }
    Ok(Address::Socket {
        host: host.to_string(),
        port: port.parse().map_err(|_| bad(address))?,
        udp,
    })
}

fn parse_usb(address: &str, board: &str, fields: &[&str]) -> Result<Address> {
    let board = parse_board(board).ok_or_else(|| bad(address))?;
    let mut rest: Vec<&str> = fields[1..].to_vec();

    let raw = match rest.last() {
        Some(f) if f.eq_ignore_ascii_case("RAW") => {
            let _ = rest.pop();
            true
        }
        Some(f) if f.eq_ignore_ascii_case("INSTR") => {
            let _ = rest.pop();
            false
        }
        _ => false,
    };

    let (vid, pid, serial, interface) = match rest.as_slice() {
        [vid, pid, serial] => (vid, pid, serial, None),
        [vid, pid, serial, iface] => {
            (vid, pid, serial, Some(iface.parse().map_err(|_| bad(address))?))
        }
        _ => return Err(bad(address)),
    };
    if vid.is_empty() || pid.is_empty() {
        return Err(bad(address));
    }
    Ok(Address::Usb {
        board,
        vid: vid.to_string(),
        pid: pid.to_string(),
        serial: serial.to_string(),
        interface,
        raw,
    })
}

fn parse_ftdi(address: &str, driver: &str, fields: &[&str]) -> Result<Address> {
    let driver = if driver.is_empty() {
        None
    } else {
        Some(driver.parse().map_err(|_| bad(address))?)
    };
    let (vid, pid, serial, interface) = match &fields[1..] {
        [vid, pid, serial] => (vid, pid, serial, None),
        [vid, pid, serial, iface] => {
            (vid, pid, serial, Some(iface.parse().map_err(|_| bad(address))?))
        }
        _ => return Err(bad(address)),
    };
    if vid.is_empty() || pid.is_empty() || serial.is_empty() {
        return Err(bad(address));
    }
    Ok(Address::Ftdi {
        driver,
        vid: vid.to_string(),
        pid: pid.to_string(),
        serial: serial.to_string(),
        interface,
    })
}

fn parse_gpib(address: &str, board: &str, fields: &[&str]) -> Result<Address> {
    if board.len() > 2 {
        return Err(bad(address));
    }
    let board = parse_board(board).ok_or_else(|| bad(address))?;

    let mut rest: Vec<&str> = fields[1..].to_vec();
    if rest
        .last()
        .is_some_and(|f| f.eq_ignore_ascii_case("INSTR"))
    {
        let _ = rest.pop();
    }

    let (pad, sad, name) = match rest.as_slice() {
        [] => (None, None, None),
        [field] => match field.parse::<u8>() {
            Ok(pad) => (Some(pad), None, None),
            Err(_) if is_hostname(field) => (None, None, Some(field.to_string())),
            Err(_) => return Err(bad(address)),
        },
        [pad, sad] => {
            let pad = pad.parse().map_err(|_| bad(address))?;
            let sad = sad.parse().map_err(|_| bad(address))?;
            (Some(pad), Some(sad), None)
        }
        _ => return Err(bad(address)),
    };

    Ok(Address::Gpib {
        board,
        pad,
        sad,
        name,
    })
}

fn parse_prologix(address: &str, fields: &[&str]) -> Result<Address> {
    let mut rest: Vec<&str> = fields[1..].to_vec();
    if rest.is_empty() {
        return Err(bad(address));
    }
    let hw_address = rest.remove(0);
    if !is_hostname(hw_address) {
        return Err(bad(address));
    }

    // an ethernet port is at least 4 digits, which keeps it distinct from a
    // GPIB primary address
    let enet_port = match rest.first() {
        Some(f) if f.len() >= 4 && f.bytes().all(|b| b.is_ascii_digit()) => {
            let port = f.parse().map_err(|_| bad(address))?;
            let _ = rest.remove(0);
            Some(port)
        }
        _ => None,
    };

    // optional `GPIB[n]` separator between the hardware and GPIB addresses
    if rest.first().is_some_and(|f| {
        let upper = f.to_ascii_uppercase();
        upper.strip_prefix("GPIB")
            .is_some_and(|tail| tail.bytes().all(|b| b.is_ascii_digit()))
    }) {
        let _ = rest.remove(0);
    }

    let (pad, sad) = match rest.as_slice() {
        [pad] => (pad.parse::<u8>().map_err(|_| bad(address))?, None),
        [pad, sad] => (
            pad.parse::<u8>().map_err(|_| bad(address))?,
            Some(sad.parse::<u8>().map_err(|_| bad(address))?),
        ),
        _ => return Err(bad(address)),
    };

    if pad > MAX_PAD_ADDRESS {
        return Err(Error::AddressParse(format!(
            "invalid primary GPIB address {pad}, must be in the range [{MIN_PAD_ADDRESS}, {MAX_PAD_ADDRESS}]"
        )));
    }
    if let Some(sad) = sad {
        if !(MIN_SAD_ADDRESS..=MAX_SAD_ADDRESS).contains(&sad) {
            return Err(Error::AddressParse(format!(
                "invalid secondary GPIB address {sad}, must be in the range [{MIN_SAD_ADDRESS}, {MAX_SAD_ADDRESS}]"
            )));
        }
    }

    Ok(Address::Prologix {
        hw_address: hw_address.to_string(),
        enet_port,
        pad,
        sad,
    })
}

fn parse_serial_port(field: &str) -> Option<String> {
    let upper = field.to_ascii_uppercase();
    for prefix in ["ASRLCOM", "ASRL", "COM"] {
        if let Some(tail) = upper.strip_prefix(prefix) {
            if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
                return Some(format!("COM{tail}"));
            }
            // device path keeps its original case
            let tail = &field[prefix.len()..];
            if tail.starts_with("/dev/") && !tail.contains(char::is_whitespace) {
                return Some(tail.to_string());
            }
            return None;
        }
    }
    None
}

fn parse_modbus(address: &str, fields: &[&str]) -> Result<Address> {
    let mut rest: Vec<&str> = fields[1..].to_vec();
    if rest.is_empty() {
        return Err(bad(address));
    }

    let udp = rest
        .last()
        .is_some_and(|f| f.eq_ignore_ascii_case("UDP"));
    if udp {
        let _ = rest.pop();
    }

    let framer = match rest.last().map(|f| f.to_ascii_uppercase()) {
        Some(f) if f == "ASCII" => {
            let _ = rest.pop();
            Some(ModbusFramer::Ascii)
        }
        Some(f) if f == "RTU" => {
            let _ = rest.pop();
            Some(ModbusFramer::Rtu)
        }
        Some(f) if f == "SOCKET" => {
            let _ = rest.pop();
            Some(ModbusFramer::Socket)
        }
        _ => None,
    };

    let is_com_port = |field: &str| {
        field
            .get(..3)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("COM"))
            && !field[3..].is_empty()
            && field[3..].bytes().all(|b| b.is_ascii_digit())
    };

    let inner = match rest.as_slice() {
        [hw] if hw.starts_with("/dev/") || is_com_port(hw) => {
            if udp {
                return Err(bad(address));
            }
            let port = parse_serial_port(hw)
                .or_else(|| hw.starts_with("/dev/").then(|| hw.to_string()))
                .ok_or_else(|| bad(address))?;
            Address::Serial { port }
        }
        [host] if is_hostname(host) => Address::Socket {
            host: host.to_string(),
            port: MODBUS_PORT,
            udp,
        },
        [host, port] if is_hostname(host) => Address::Socket {
            host: host.to_string(),
            port: port.parse().map_err(|_| bad(address))?,
            udp,
        },
        _ => return Err(bad(address)),
    };

    let framer = framer.unwrap_or(match inner {
        Address::Socket { .. } => ModbusFramer::Socket,
        _ => ModbusFramer::Rtu,
    });

    Ok(Address::Modbus {
        inner: Box::new(inner),
        framer,
    })
}

fn parse_zmq(address: &str, fields: &[&str]) -> Result<Address> {
    let [_, host, port] = fields else {
        return Err(bad(address));
    };
    if !is_hostname(host) {
        return Err(bad(address));
    }
    Ok(Address::Zmq {
        host: host.to_string(),
        port: port.parse().map_err(|_| bad(address))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[test]
    fn vxi11_accepts() {
        assert_eq!(
            parse("TCPIP::dev.company.com::InStR"),
            Address::Vxi11 {
                board: 0,
                host: "dev.company.com".into(),
                name: "inst0".into()
            }
        );
        assert_eq!(
            parse("TCPIP1::company::INSTR"),
            Address::Vxi11 {
                board: 1,
                host: "company".into(),
                name: "inst0".into()
            }
        );
        assert_eq!(
            parse("TCPIP::myMachine"),
            Address::Vxi11 {
                board: 0,
                host: "myMachine".into(),
                name: "inst0".into()
            }
        );
        assert_eq!(
            parse("TCPIP0::10.0.0.1::usb0[1234::5678::MYSERIAL::0]::INSTR"),
            Address::Vxi11 {
                board: 0,
                host: "10.0.0.1".into(),
                name: "usb0[1234::5678::MYSERIAL::0]".into()
            }
        );
        assert_eq!(
            parse("TCPIP10::192.168.1.100::gpib,5::iNsTr"),
            Address::Vxi11 {
                board: 10,
                host: "192.168.1.100".into(),
                name: "gpib,5".into()
            }
        );
        assert_eq!(
            parse("TCPIP0::testMachine1::COM1,488::INSTR"),
            Address::Vxi11 {
                board: 0,
                host: "testMachine1".into(),
                name: "COM1,488".into()
            }
        );
        assert_eq!(
            parse("TCPIP0::myMachine::gpib0,2,3"),
            Address::Vxi11 {
                board: 0,
                host: "myMachine".into(),
                name: "gpib0,2,3".into()
            }
        );
    }

    #[test]
    fn vxi11_rejects() {
        for address in [
            "TCPI::dev.company.com::INSTR",
            "TCPIP0::dev.company.com::instr::INSTR",
            "TCPIP0::myMachine::UsbDevice::INSTR",
            "TCPIP::host::inst0::RAW",
        ] {
            assert!(Address::parse(address).is_err(), "{address}");
        }
    }

    #[test]
    fn hislip() {
        assert_eq!(
            parse("TCPIP::1.2.3.4::HiSLIP0::INSTR"),
            Address::Hislip {
                board: 0,
                host: "1.2.3.4".into(),
                name: "HiSLIP0".into(),
                port: 4880
            }
        );
        assert_eq!(
            parse("TCPIP::company::hislip1,3::INSTR"),
            Address::Hislip {
                board: 0,
                host: "company".into(),
                name: "hislip1".into(),
                port: 3
            }
        );
        assert!(Address::parse("TCPIP::dev.company.com::hislip::INSTR").is_err());
    }

    #[test]
    fn sockets() {
        assert_eq!(
            parse("TCPIP::169.254.100.15::5025::SOCKET"),
            Address::Socket {
                host: "169.254.100.15".into(),
                port: 5025,
                udp: false
            }
        );
        assert_eq!(
            parse("TCP::localhost::5555"),
            Address::Socket {
                host: "localhost".into(),
                port: 5555,
                udp: false
            }
        );
        assert_eq!(
            parse("UDP::192.168.1.100::514"),
            Address::Socket {
                host: "192.168.1.100".into(),
                port: 514,
                udp: true
            }
        );
        // without the ::SOCKET suffix a trailing number is a LAN device name
        assert_eq!(
            parse("TCPIP0::192.168.2.100::5000"),
            Address::Vxi11 {
                board: 0,
                host: "192.168.2.100".into(),
                name: "5000".into()
            }
        );
    }

    #[test]
    fn usb() {
        assert_eq!(
            parse("USB::0x0957::0x2007::MY12345678::INSTR"),
            Address::Usb {
                board: 0,
                vid: "0x0957".into(),
                pid: "0x2007".into(),
                serial: "MY12345678".into(),
                interface: None,
                raw: false
            }
        );
        assert_eq!(
            parse("USB1::1234::5678::SER::0::RAW"),
            Address::Usb {
                board: 1,
                vid: "1234".into(),
                pid: "5678".into(),
                serial: "SER".into(),
                interface: Some(0),
                raw: true
            }
        );
        assert_eq!(
            parse("FTDI::0x0403::0x6001::FT1234"),
            Address::Ftdi {
                driver: None,
                vid: "0x0403".into(),
                pid: "0x6001".into(),
                serial: "FT1234".into(),
                interface: None
            }
        );
    }

    #[test]
    fn gpib() {
        assert_eq!(
            parse("GPIB::23"),
            Address::Gpib {
                board: 0,
                pad: Some(23),
                sad: None,
                name: None
            }
        );
        assert_eq!(
            parse("GPIB0::6::96::INSTR"),
            Address::Gpib {
                board: 0,
                pad: Some(6),
                sad: Some(96),
                name: None
            }
        );
        assert_eq!(
            parse("GPIB1::voltmeter"),
            Address::Gpib {
                board: 1,
                pad: None,
                sad: None,
                name: Some("voltmeter".into())
            }
        );
        assert_eq!(
            parse("GPIB2"),
            Address::Gpib {
                board: 2,
                pad: None,
                sad: None,
                name: None
            }
        );
    }

    #[test]
    fn prologix() {
        assert_eq!(
            parse("Prologix::192.168.1.110::1234::6"),
            Address::Prologix {
                hw_address: "192.168.1.110".into(),
                enet_port: Some(1234),
                pad: 6,
                sad: None
            }
        );
        assert_eq!(
            parse("Prologix::COM3::GPIB::22::96"),
            Address::Prologix {
                hw_address: "COM3".into(),
                enet_port: None,
                pad: 22,
                sad: Some(96)
            }
        );
        assert_eq!(
            parse("Prologix::/dev/ttyUSB0::6::112"),
            Address::Prologix {
                hw_address: "/dev/ttyUSB0".into(),
                enet_port: None,
                pad: 6,
                sad: Some(112)
            }
        );
    }

    #[test]
    fn prologix_address_ranges() {
        assert!(Address::parse("Prologix::COM3::31").is_err());
        assert!(Address::parse("Prologix::COM3::6::95").is_err());
        assert!(Address::parse("Prologix::COM3::6::127").is_err());
        assert!(Address::parse("Prologix::COM3::30::126").is_ok());
        assert!(Address::parse("Prologix::COM3::0::96").is_ok());
    }

    #[test]
    fn serial() {
        assert_eq!(parse("COM4"), Address::Serial { port: "COM4".into() });
        assert_eq!(parse("ASRL7"), Address::Serial { port: "COM7".into() });
        assert_eq!(
            parse("ASRL/dev/ttyUSB1"),
            Address::Serial {
                port: "/dev/ttyUSB1".into()
            }
        );
        assert_eq!(parse("ASRLCOM2"), Address::Serial { port: "COM2".into() });
        assert!(Address::parse("COM").is_err());
        assert!(Address::parse("SERIAL1").is_err());
    }

    #[test]
    fn modbus() {
        assert_eq!(
            parse("MODBUS::192.168.1.100"),
            Address::Modbus {
                inner: Box::new(Address::Socket {
                    host: "192.168.1.100".into(),
                    port: 502,
                    udp: false
                }),
                framer: ModbusFramer::Socket
            }
        );
        assert_eq!(
            parse("MODBUS::device.lab::503::UDP"),
            Address::Modbus {
                inner: Box::new(Address::Socket {
                    host: "device.lab".into(),
                    port: 503,
                    udp: true
                }),
                framer: ModbusFramer::Socket
            }
        );
        assert_eq!(
            parse("MODBUS::COM2::RTU"),
            Address::Modbus {
                inner: Box::new(Address::Serial { port: "COM2".into() }),
                framer: ModbusFramer::Rtu
            }
        );
        assert_eq!(
            parse("MODBUS::/dev/ttyS0"),
            Address::Modbus {
                inner: Box::new(Address::Serial {
                    port: "/dev/ttyS0".into()
                }),
                framer: ModbusFramer::Rtu
            }
        );
    }

    #[test]
    fn zmq() {
        assert_eq!(
            parse("ZMQ::192.168.20.90::5555"),
            Address::Zmq {
                host: "192.168.20.90".into(),
                port: 5555
            }
        );
    }
}
