//! Modbus client over a message-based transport, framed with the MBAP
//! header of the Modbus TCP specification.

use async_trait::async_trait;

use crate::{
    address::{Address, ModbusFramer},
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings},
    protocol::{serial::SerialProtocol, socket::SocketProtocol},
};

const READ_INPUT_REGISTERS: u8 = 0x04;
const WRITE_SINGLE_COIL: u8 = 0x05;
const WRITE_SINGLE_REGISTER: u8 = 0x06;
const WRITE_MULTIPLE_COILS: u8 = 0x0F;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Most coils a single request may write.
const MAX_COILS: usize = 1968;
/// Most registers a single request may write.
const MAX_REGISTERS: usize = 123;

fn exception_message(code: u8) -> String {
    match code {
        0x01 => "Modbus function code is not supported".to_string(),
        0x02 => "Invalid Modbus register address requested".to_string(),
        0x03 => "The structure of the Modbus request message is invalid".to_string(),
        0x04 => "An unrecoverable error occurred in the Modbus device".to_string(),
        0x05 => "The Modbus device has accepted the request and is processing it".to_string(),
        0x06 => "The Modbus device is busy processing a previous request".to_string(),
        0x08 => "Parity error in the memory of the Modbus device".to_string(),
        0x0A => "The Modbus gateway is misconfigured or overloaded".to_string(),
        0x0B => "The Modbus device is not present on the network".to_string(),
        code => format!("Unknown Modbus exception code 0x{code:02X}"),
    }
}

/// A Modbus Protocol Data Unit response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModbusPdu {
    pub device_id: u8,
    pub function_code: u8,
    pub data: Vec<u8>,
}
impl ModbusPdu {
    fn checked(self, function_code: u8) -> Result<ModbusPdu> {
        if self.function_code != function_code {
            return Err(Error::Protocol(format!(
                "received unexpected Modbus function code 0x{:02X}, expected 0x{function_code:02X}",
                self.function_code
            )));
        }
        Ok(self)
    }

    fn fixed<const N: usize>(&self) -> Result<[u8; N]> {
        self.data.as_slice().try_into().map_err(|_| {
            Error::Protocol(format!(
                "Modbus register data is {} bytes, expected {N}",
                self.data.len()
            ))
        })
    }

    /// The register data as big-endian 16-bit values.
    pub fn registers(&self) -> Result<Vec<u16>> {
        if self.data.len() % 2 != 0 {
            return Err(Error::Protocol(format!(
                "Modbus register data of {} bytes is not a multiple of 2",
                self.data.len()
            )));
        }
        Ok(self
            .data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn u16(&self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.fixed()?))
    }

    pub fn i16(&self) -> Result<i16> {
        Ok(i16::from_be_bytes(self.fixed()?))
    }

    pub fn u32(&self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.fixed()?))
    }

    pub fn i32(&self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.fixed()?))
    }

    pub fn u64(&self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.fixed()?))
    }

    pub fn i64(&self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.fixed()?))
    }

    pub fn f32(&self) -> Result<f32> {
        Ok(f32::from_be_bytes(self.fixed()?))
    }

    pub fn f64(&self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.fixed()?))
    }
}

/// Pack coil states into bytes, least-significant bit first.
fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; values.len().div_ceil(8)];
    for (index, &bit) in values.iter().enumerate() {
        if bit {
            out[index / 8] |= 1 << (index % 8);
        }
    }
    out
}

/// A Modbus client. The RTU and ASCII serial framers are reserved; only
/// the MBAP (socket) framer is currently implemented.
pub struct ModbusProtocol {
    interface: Box<dyn MessageBased>,
    framer: ModbusFramer,
    /// MBAP transaction id: increments per request, wraps at 65535 and
    /// skips 0
    transaction_id: u16,
}

impl ModbusProtocol {
    pub fn new(interface: Box<dyn MessageBased>, framer: ModbusFramer) -> Result<Self> {
        if framer != ModbusFramer::Socket {
            return Err(Error::NotSupported(
                "only the SOCKET Modbus framer is currently supported".to_string(),
            ));
        }
        Ok(Self {
            interface,
            framer,
            transaction_id: 0,
        })
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        let Address::Modbus { inner, framer } = address else {
            return Err(Error::AddressParse(format!(
                "{address:?} is not a Modbus address"
            )));
        };
        let interface: Box<dyn MessageBased> = match inner.as_ref() {
            Address::Socket { .. } => Box::new(SocketProtocol::from_address(inner)?),
            Address::Serial { .. } => Box::new(SerialProtocol::from_address(inner)?),
            inner => {
                return Err(Error::AddressParse(format!(
                    "{inner:?} cannot carry Modbus frames"
                )));
            }
        };
        Self::new(interface, *framer)
    }

    pub fn framer(&self) -> ModbusFramer {
        self.framer
    }

    pub fn set_timeout_secs(&mut self, timeout: Option<f64>) {
        self.interface.settings_mut().set_timeout_secs(timeout);
    }

    /// Send a PDU wrapped in an MBAP header.
    async fn write_frame(&mut self, device_id: u8, pdu: &[u8]) -> Result<usize> {
        self.transaction_id = match self.transaction_id {
            u16::MAX => 1,
            id => id + 1,
        };

        let mut frame = Vec::with_capacity(7 + pdu.len());
        frame.extend(self.transaction_id.to_be_bytes());
        frame.extend(0u16.to_be_bytes()); // protocol id
        frame.extend((pdu.len() as u16 + 1).to_be_bytes());
        frame.push(device_id);
        frame.extend_from_slice(pdu);
        (self.interface.as_mut() as &mut dyn MessageBased)
            .write(frame)
            .await
    }

    /// Read one MBAP-framed response and decode exception replies.
    async fn read_frame(&mut self) -> Result<ModbusPdu> {
        let interface = self.interface.as_mut() as &mut dyn MessageBased;
        let header = interface.read(Some(7)).await?;
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let remaining = u16::from_be_bytes([header[4], header[5]]) as usize;
        let device_id = header[6];

        // read the whole frame before deciding whether it is an error
        let response = interface.read(Some(remaining.saturating_sub(1))).await?;
        if transaction_id != self.transaction_id {
            return Err(Error::Connection(format!(
                "received unexpected Modbus transaction id {transaction_id}, expected {}",
                self.transaction_id
            )));
        }
        let function_code = *response
            .first()
            .ok_or_else(|| Error::Protocol("empty Modbus response".to_string()))?;
        if function_code > 0x80 {
            let code = response.get(1).copied().unwrap_or(0);
            return Err(Error::Protocol(exception_message(code)));
        }
        Ok(ModbusPdu {
            device_id,
            function_code,
            data: response[1..].to_vec(),
        })
    }

    async fn transact(&mut self, device_id: u8, function_code: u8, data: &[u8]) -> Result<ModbusPdu> {
        let mut pdu = Vec::with_capacity(1 + data.len());
        pdu.push(function_code);
        pdu.extend_from_slice(data);
        let _ = self.write_frame(device_id, &pdu).await?;
        self.read_frame().await?.checked(function_code)
    }

    /// Read input registers, function code `0x04`. The returned data is
    /// the register bytes without the byte-count prefix.
    pub async fn read_input_registers(
        &mut self,
        address: u16,
        count: u16,
        device_id: u8,
    ) -> Result<ModbusPdu> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend(count.to_be_bytes());
        let mut pdu = self.transact(device_id, READ_INPUT_REGISTERS, &data).await?;
        // drop the byte-count prefix
        if !pdu.data.is_empty() {
            let _ = pdu.data.remove(0);
        }
        Ok(pdu)
    }

    /// Set the state of a single coil, function code `0x05`. The reply is
    /// an echo of the request.
    pub async fn write_coil(&mut self, address: u16, value: bool, device_id: u8) -> Result<ModbusPdu> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend(if value { [0xFF, 0x00] } else { [0x00, 0x00] });
        self.transact(device_id, WRITE_SINGLE_COIL, &data).await
    }

    /// Write a single holding register, function code `0x06`. The reply
    /// is an echo of the request.
    pub async fn write_register(
        &mut self,
        address: u16,
        value: u16,
        device_id: u8,
    ) -> Result<ModbusPdu> {
        let mut data = address.to_be_bytes().to_vec();
        data.extend(value.to_be_bytes());
        self.transact(device_id, WRITE_SINGLE_REGISTER, &data).await
    }

    /// Set the state of up to 1968 coils, function code `0x0F`.
    pub async fn write_coils(
        &mut self,
        address: u16,
        values: &[bool],
        device_id: u8,
    ) -> Result<ModbusPdu> {
        if values.len() > MAX_COILS {
            return Err(Error::Protocol(format!(
                "too many values, {}, to write to the Modbus coils, must be <= {MAX_COILS}",
                values.len()
            )));
        }
        let bits = pack_bits(values);
        let mut data = address.to_be_bytes().to_vec();
        data.extend((values.len() as u16).to_be_bytes());
        data.push(bits.len() as u8);
        data.extend(bits);
        self.transact(device_id, WRITE_MULTIPLE_COILS, &data).await
    }

    /// Write a block of up to 123 contiguous registers, function code
    /// `0x10`.
    pub async fn write_registers(
        &mut self,
        address: u16,
        values: &[u16],
        device_id: u8,
    ) -> Result<ModbusPdu> {
        if values.len() > MAX_REGISTERS {
            return Err(Error::Protocol(format!(
                "too many values, {}, to write to the Modbus registers, must be <= {MAX_REGISTERS}",
                values.len()
            )));
        }
        let mut data = address.to_be_bytes().to_vec();
        data.extend((values.len() as u16).to_be_bytes());
        data.push((2 * values.len()) as u8);
        for value in values {
            data.extend(value.to_be_bytes());
        }
        self.transact(device_id, WRITE_MULTIPLE_REGISTERS, &data).await
    }
}

#[async_trait]
impl Interface for ModbusProtocol {
    async fn connect(&mut self) -> Result<()> {
        self.interface.connect().await?;
        // Modbus frames are length-prefixed, never terminated
        let settings = self.interface.settings_mut();
        settings.read_termination = None;
        settings.write_termination = None;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.interface.disconnect().await
    }
}
