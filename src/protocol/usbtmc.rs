//! USBTMC framing, per the USB Test and Measurement Class specification
//! (Revision 1.0) and its USB488 subclass.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings},
    protocol::RenMode,
};

// Bulk-OUT message ids, Table 2
const DEV_DEP_MSG_OUT: u8 = 1;
const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
// Bulk-IN response message id, Table 2
const DEV_DEP_MSG_IN: u8 = 2;
// USB488 subclass, Table 1
const TRIGGER: u8 = 128;

// class-specific requests, Table 15 and USB488 Table 9
const GET_CAPABILITIES: u8 = 7;
const INDICATOR_PULSE: u8 = 64;
const READ_STATUS_BYTE: u8 = 128;
const REN_CONTROL: u8 = 160;
const GO_TO_LOCAL: u8 = 161;
const LOCAL_LOCKOUT: u8 = 162;

/// Dir=IN, Type=Class, Recipient=Interface
const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;

const STATUS_SUCCESS: u8 = 1;

/// Raw access to the USB endpoints of one interface of a device.
///
/// The platform USB binding provides an implementation; this crate only
/// performs the USBTMC framing on top of it. `bulk_in` and
/// `interrupt_in` must return exactly the requested number of bytes.
#[async_trait]
pub trait UsbDevice: Send {
    async fn bulk_out(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<usize>;

    async fn bulk_in(&mut self, size: usize, timeout: Option<Duration>) -> Result<Vec<u8>>;

    async fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>>;

    async fn interrupt_in(&mut self, size: usize, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Whether the interface has an Interrupt-IN endpoint.
    fn has_interrupt_endpoint(&self) -> bool;

    /// The `bInterfaceNumber` of the claimed interface.
    fn interface_number(&self) -> u16;
}

/// The `GET_CAPABILITIES` record of a device, Table 37 plus the USB488
/// additions of its Table 8.
#[derive(Clone, Copy, Debug, Default)]
pub struct Capabilities {
    pub is_listen_only: bool,
    pub is_talk_only: bool,
    pub accepts_indicator_pulse: bool,
    /// Whether the device supports ending a Bulk-IN transfer on a
    /// termination character
    pub accepts_term_char: bool,
    pub accepts_trigger: bool,
    pub accepts_remote_local: bool,
    pub accepts_service_request: bool,
    /// Whether the device understands all mandatory SCPI commands and is
    /// a full 488.2 interface
    pub is_488: bool,
}
impl Capabilities {
    /// Parse a `GET_CAPABILITIES` response. An unsuccessful status byte
    /// silently clears every capability.
    pub fn parse(data: &[u8]) -> Result<Capabilities> {
        if data.len() < 0x18 {
            return Err(Error::Protocol(format!(
                "GET_CAPABILITIES response is {} bytes, expected 24",
                data.len()
            )));
        }

        let (iface, device, iface_488, device_488) = if data[0] == STATUS_SUCCESS {
            (data[4], data[5], data[14], data[15])
        } else {
            (0, 0, 0, 0)
        };

        let is_488_interface = iface_488 & (1 << 2) != 0;
        let accepts_remote_local = iface_488 & (1 << 1) != 0;
        let accepts_interface_trigger = iface_488 & (1 << 0) != 0;

        let understands_scpi = device_488 & (1 << 3) != 0;
        let is_sr_capable = device_488 & (1 << 2) != 0;
        let is_rl_capable = device_488 & (1 << 1) != 0;
        let is_dt_capable = device_488 & (1 << 0) != 0;

        // USB488 Section 4.2.2 rules 1-4 specify how the interface and
        // device bitmaps combine; not all vendors obey them, so either
        // bit being set is treated as capable
        Ok(Capabilities {
            accepts_indicator_pulse: iface & (1 << 2) != 0,
            is_talk_only: iface & (1 << 1) != 0,
            is_listen_only: iface & (1 << 0) != 0,
            accepts_term_char: device & (1 << 0) != 0,
            accepts_trigger: is_dt_capable || accepts_interface_trigger,
            accepts_remote_local: is_rl_capable || accepts_remote_local,
            accepts_service_request: is_488_interface || is_sr_capable,
            is_488: understands_scpi || (is_sr_capable && is_488_interface),
        })
    }
}

fn dev_dep_msg_out(tag: u8, message: &[u8]) -> Vec<u8> {
    // Section 3.2.1.1, Table 3
    let mut out = Vec::with_capacity(12 + message.len() + 3);
    out.push(DEV_DEP_MSG_OUT);
    out.push(tag);
    out.push(tag ^ 0xFF);
    out.push(0);
    out.extend((message.len() as u32).to_le_bytes());
    out.push(1); // EOM
    out.extend([0, 0, 0]);
    out.extend_from_slice(message);
    out.extend(std::iter::repeat_n(0u8, message.len().wrapping_neg() % 4));
    out
}

fn request_dev_dep_msg_in(tag: u8, size: usize) -> Vec<u8> {
    // Section 3.2.1.2, Table 4
    let mut out = Vec::with_capacity(12);
    out.push(REQUEST_DEV_DEP_MSG_IN);
    out.push(tag);
    out.push(tag ^ 0xFF);
    out.push(0);
    out.extend((size as u32).to_le_bytes());
    out.extend([0, 0, 0, 0]); // no termination character
    out
}

fn trigger_message(tag: u8) -> Vec<u8> {
    // USB488 Section 3.2.1.1, Table 2
    let mut out = vec![TRIGGER, tag, tag ^ 0xFF];
    out.extend([0u8; 9]);
    out
}

/// USBTMC message framing over a USB bulk endpoint pair.
pub struct UsbtmcProtocol {
    device: Box<dyn UsbDevice>,
    settings: MessageSettings,
    /// Bulk transfer tag, wraps within 1..=255
    tag: u8,
    /// READ_STATUS_BYTE tag, wraps within 2..=127
    status_tag: u8,
    capabilities: Capabilities,
    connected: bool,
}

impl UsbtmcProtocol {
    pub fn new(device: Box<dyn UsbDevice>) -> Self {
        Self {
            device,
            settings: MessageSettings::default(),
            tag: 0,
            status_tag: 1,
            capabilities: Capabilities::default(),
            connected: false,
        }
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn next_tag(&mut self) -> u8 {
        // Section 3.2, Table 1: a bTag must be 1..=255
        self.tag = if self.tag >= 255 { 1 } else { self.tag + 1 };
        self.tag
    }

    fn next_status_tag(&mut self) -> u8 {
        self.status_tag = if self.status_tag >= 127 { 2 } else { self.status_tag + 1 };
        self.status_tag
    }

    fn timeout(&self) -> Option<Duration> {
        self.settings.timeout
    }

    /// Issue a class-specific control-IN request and verify the
    /// USBTMC_status byte of the response, Table 16.
    async fn checked_control_in(&mut self, request: u8, value: u16, length: u16) -> Result<Vec<u8>> {
        let index = self.device.interface_number();
        let timeout = self.timeout();
        let data = self
            .device
            .control_in(REQUEST_TYPE_CLASS_IN, request, value, index, length, timeout)
            .await?;
        if data.first() != Some(&STATUS_SUCCESS) {
            return Err(Error::Protocol(format!(
                "the control request 0x{request:02X} was not successful [status={:?}]",
                data.first()
            )));
        }
        Ok(data)
    }

    /// Request to turn on an activity indicator for identification. The
    /// indicator turns itself off after at most a second.
    pub async fn indicator_pulse(&mut self) -> Result<()> {
        if !self.capabilities.accepts_indicator_pulse {
            return Err(Error::NotSupported(
                "the device does not accept the indicator-pulse request".to_string(),
            ));
        }
        let _ = self.checked_control_in(INDICATOR_PULSE, 0, 1).await?;
        Ok(())
    }

    /// Trigger the device, the USB488 equivalent of a group execute
    /// trigger.
    pub async fn trigger(&mut self) -> Result<()> {
        if !self.capabilities.accepts_trigger {
            return Err(Error::NotSupported(
                "the device does not accept the trigger request".to_string(),
            ));
        }
        let tag = self.next_tag();
        let timeout = self.timeout();
        let _ = self.device.bulk_out(&trigger_message(tag), timeout).await?;
        Ok(())
    }

    /// Read the status byte, using the dedicated control-endpoint tag
    /// sequence and the Interrupt-IN endpoint when the device has one.
    pub async fn serial_poll(&mut self) -> Result<u8> {
        if !self.capabilities.is_488 {
            return Err(Error::NotSupported(
                "the device does not accept the serial-poll request".to_string(),
            ));
        }

        let tag = self.next_status_tag();
        let data = self
            .checked_control_in(READ_STATUS_BYTE, u16::from(tag), 3)
            .await?;
        if data.len() < 3 {
            return Err(Error::Protocol(format!(
                "READ_STATUS_BYTE response is {} bytes, expected 3",
                data.len()
            )));
        }
        if data[1] != tag {
            return Err(Error::Connection(format!(
                "sent bTag [{tag}] != received bTag [{}]",
                data[1]
            )));
        }

        if !self.device.has_interrupt_endpoint() {
            return Ok(data[2]);
        }

        // USB488 Section 3.4.2, Table 7: the status arrives in a follow-up
        // notify packet on the Interrupt-IN endpoint
        let timeout = self.timeout();
        let notify = self.device.interrupt_in(2, timeout).await?;
        if notify.len() != 2 {
            return Err(Error::Connection(
                "invalid Interrupt-IN response packet, expected 2 bytes".to_string(),
            ));
        }
        if notify[0] & 0x80 == 0 {
            return Err(Error::Connection(
                "invalid Interrupt-IN response packet, bit 7 is not 1".to_string(),
            ));
        }
        if notify[0] & 0x7F != tag {
            return Err(Error::Connection(format!(
                "invalid Interrupt-IN response packet, sent bTag [{tag}] != received bTag [{}]",
                notify[0] & 0x7F
            )));
        }
        Ok(notify[1])
    }

    /// Control the state of the Remote Enable line, and optionally the
    /// remote/local state of the device.
    pub async fn control_ren(&mut self, mode: RenMode) -> Result<()> {
        if !self.capabilities.accepts_remote_local {
            return Err(Error::NotSupported(
                "the device does not accept a remote-local request".to_string(),
            ));
        }

        use RenMode::*;
        if matches!(mode, Assert | AssertAddress | AssertAddressLlo) {
            let _ = self.checked_control_in(REN_CONTROL, 1, 1).await?;
        }
        if matches!(mode, AssertLlo | AssertAddressLlo) {
            let _ = self.checked_control_in(LOCAL_LOCKOUT, 0, 1).await?;
        }
        if matches!(mode, DeassertGtl | AddressGtl) {
            let _ = self.checked_control_in(GO_TO_LOCAL, 0, 1).await?;
        }
        if matches!(mode, Deassert | DeassertGtl) {
            let _ = self.checked_control_in(REN_CONTROL, 0, 1).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Interface for UsbtmcProtocol {
    async fn connect(&mut self) -> Result<()> {
        // Section 4.2.1.8, Table 36
        let data = self.checked_control_in(GET_CAPABILITIES, 0, 0x18).await?;
        self.capabilities = Capabilities::parse(&data)?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}

#[async_trait]
impl MessageBased for UsbtmcProtocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        if self.capabilities.is_listen_only {
            return Err(Error::NotSupported(
                "the device does not accept a read request".to_string(),
            ));
        }

        let request_size = size.unwrap_or(self.settings.max_read_size);
        let tag = self.next_tag();
        let timeout = self.timeout();

        // ask the device to send data, Section 3.2.1.2
        let request = request_dev_dep_msg_in(tag, request_size);
        let _ = self.device.bulk_out(&request, timeout).await?;

        // Bulk-IN header, Section 3.3.1.1, Table 9; only bTag is checked,
        // bTagInverse is ignored
        let header = self.device.bulk_in(12, timeout).await?;
        if header.len() != 12 {
            return Err(Error::Connection(format!(
                "Bulk-IN header is {} bytes, expected 12",
                header.len()
            )));
        }
        if header[0] != DEV_DEP_MSG_IN {
            return Err(Error::Connection(format!(
                "wrong DEV_DEP_MSG_IN value {} (expect 2), the device does not obey USBTMC standards",
                header[0]
            )));
        }
        if header[1] != tag {
            return Err(Error::Connection(format!(
                "received bTag [{}] != sent bTag [{tag}], the device does not obey USBTMC standards",
                header[1]
            )));
        }

        let transfer_size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let alignment = transfer_size.wrapping_neg() % 4;
        let mut data = self.device.bulk_in(transfer_size + alignment, timeout).await?;
        data.truncate(transfer_size);
        Ok(data)
    }

    async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
        if self.capabilities.is_talk_only {
            return Err(Error::NotSupported(
                "the device does not accept a write request".to_string(),
            ));
        }

        // The host must send a complete USBTMC message in a single
        // transfer (Section 3.2, rule 5); the USB layer handles the
        // packet-level fragmentation.
        let tag = self.next_tag();
        let timeout = self.timeout();
        self.device
            .bulk_out(&dev_dep_msg_out(tag, message), timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Default)]
    struct MockState {
        bulk_out: Vec<Vec<u8>>,
        bulk_in: VecDeque<Vec<u8>>,
        control_in: VecDeque<Vec<u8>>,
        control_requests: Vec<(u8, u8, u16, u16)>,
        interrupt_in: VecDeque<Vec<u8>>,
        with_interrupt: bool,
    }

    #[derive(Clone, Default)]
    struct MockUsb(Arc<Mutex<MockState>>);
    impl MockUsb {
        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.0.lock().unwrap()
        }
    }
    #[async_trait]
    impl UsbDevice for MockUsb {
        async fn bulk_out(&mut self, data: &[u8], _t: Option<Duration>) -> Result<usize> {
            self.state().bulk_out.push(data.to_vec());
            Ok(data.len())
        }
        async fn bulk_in(&mut self, size: usize, _t: Option<Duration>) -> Result<Vec<u8>> {
            let mut data = self.state().bulk_in.pop_front().expect("unexpected bulk_in");
            data.truncate(size);
            Ok(data)
        }
        async fn control_in(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            _length: u16,
            _t: Option<Duration>,
        ) -> Result<Vec<u8>> {
            let mut state = self.state();
            state.control_requests.push((request_type, request, value, index));
            Ok(state.control_in.pop_front().expect("unexpected control_in"))
        }
        async fn interrupt_in(&mut self, _size: usize, _t: Option<Duration>) -> Result<Vec<u8>> {
            Ok(self.state().interrupt_in.pop_front().expect("unexpected interrupt_in"))
        }
        fn has_interrupt_endpoint(&self) -> bool {
            self.state().with_interrupt
        }
        fn interface_number(&self) -> u16 {
            0
        }
    }

    fn capabilities_response(iface: u8, device: u8, iface_488: u8, device_488: u8) -> Vec<u8> {
        let mut data = vec![0u8; 0x18];
        data[0] = STATUS_SUCCESS;
        data[4] = iface;
        data[5] = device;
        data[14] = iface_488;
        data[15] = device_488;
        data
    }

    async fn connected(mock: MockUsb) -> (UsbtmcProtocol, MockUsb) {
        // fully capable device
        mock.state()
            .control_in
            .push_front(capabilities_response(0b100, 0b1, 0b111, 0b1111));
        let mut protocol = UsbtmcProtocol::new(Box::new(mock.clone()));
        protocol.connect().await.unwrap();
        (protocol, mock)
    }

    #[tokio::test]
    async fn write_framing() {
        let (mut protocol, mock) = connected(MockUsb::default()).await;
        protocol.settings_mut().write_termination = None;

        let n = (&mut protocol as &mut dyn MessageBased).write("*IDN?").await.unwrap();
        let frame = mock.state().bulk_out.pop().unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(
            frame,
            [
                1, 1, 0xFE, 0, // DEV_DEP_MSG_OUT, bTag, ~bTag, reserved
                5, 0, 0, 0, // transfer size, little-endian
                1, 0, 0, 0, // EOM
                b'*', b'I', b'D', b'N', b'?', 0, 0, 0, // payload + alignment
            ]
        );
    }

    #[tokio::test]
    async fn aligned_write_has_no_padding() {
        let (mut protocol, mock) = connected(MockUsb::default()).await;
        protocol.settings_mut().write_termination = None;
        let _ = (&mut protocol as &mut dyn MessageBased).write("*RST").await.unwrap();
        let frame = mock.state().bulk_out.pop().unwrap();
        assert_eq!(frame.len(), 16);
    }

    #[tokio::test]
    async fn read_validates_header() {
        let (mut protocol, mock) = connected(MockUsb::default()).await;
        {
            let mut state = mock.state();
            // header: DEV_DEP_MSG_IN, bTag=1, ~bTag, pad, size=6 LE, EOM
            state.bulk_in.push_back(vec![2, 1, 0xFE, 0, 6, 0, 0, 0, 1, 0, 0, 0]);
            state.bulk_in.push_back(b"1.25\r\n\0\0".to_vec());
        }
        let data = (&mut protocol as &mut dyn MessageBased).read(None).await.unwrap();
        assert_eq!(data, b"1.25\r\n");

        // the request frame asked for max_read_size bytes
        let request = mock.state().bulk_out.pop().unwrap();
        assert_eq!(request[0], 2);
        assert_eq!(request[1], 1);
        assert_eq!(
            u32::from_le_bytes(request[4..8].try_into().unwrap()),
            1 << 20
        );
    }

    #[tokio::test]
    async fn read_aborts_on_tag_mismatch() {
        let (mut protocol, mock) = connected(MockUsb::default()).await;
        mock.state()
            .bulk_in
            .push_back(vec![2, 99, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0]);
        let err = (&mut protocol as &mut dyn MessageBased).read(None).await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn bulk_tag_wraps_to_one() {
        let (mut protocol, _mock) = connected(MockUsb::default()).await;
        protocol.tag = 255;
        assert_eq!(protocol.next_tag(), 1);
        assert_eq!(protocol.next_tag(), 2);
    }

    #[tokio::test]
    async fn serial_poll_with_interrupt_endpoint() {
        let base = MockUsb::default();
        base.state().with_interrupt = true;
        let (mut protocol, mock) = connected(base).await;
        {
            let mut state = mock.state();
            state.control_in.push_back(vec![STATUS_SUCCESS, 2, 0]);
            // notify packet: bit 7 set, low bits carry the tag
            state.interrupt_in.push_back(vec![0x80 | 2, 0x42]);
        }
        assert_eq!(protocol.serial_poll().await.unwrap(), 0x42);

        // the status-byte tag sequence is separate from the bulk tag
        assert_eq!(protocol.status_tag, 2);
        protocol.status_tag = 127;
        assert_eq!(protocol.next_status_tag(), 2);
    }

    #[tokio::test]
    async fn serial_poll_rejects_bad_notify() {
        let base = MockUsb::default();
        base.state().with_interrupt = true;
        let (mut protocol, mock) = connected(base).await;
        {
            let mut state = mock.state();
            state.control_in.push_back(vec![STATUS_SUCCESS, 2, 0]);
            state.interrupt_in.push_back(vec![2, 0x42]); // bit 7 not set
        }
        let err = protocol.serial_poll().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn capability_gates() {
        // status byte != success clears every capability
        let base = MockUsb::default();
        let mut failed = capabilities_response(0xFF, 0xFF, 0xFF, 0xFF);
        failed[0] = 0;
        base.state().control_in.push_back(failed);
        let mut protocol = UsbtmcProtocol::new(Box::new(base));
        protocol.connect().await.unwrap();

        assert!(!protocol.capabilities().accepts_trigger);
        assert!(matches!(
            protocol.trigger().await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(matches!(
            protocol.control_ren(RenMode::Assert).await.unwrap_err(),
            Error::NotSupported(_)
        ));
        assert!(matches!(
            protocol.serial_poll().await.unwrap_err(),
            Error::NotSupported(_)
        ));
    }

    #[tokio::test]
    async fn usb488_rules_use_or() {
        // only the device bitmap advertises trigger/remote-local support
        let capabilities =
            Capabilities::parse(&capabilities_response(0, 0, 0, 0b0011)).unwrap();
        assert!(capabilities.accepts_trigger);
        assert!(capabilities.accepts_remote_local);
        assert!(!capabilities.is_488);

        // SCPI bit alone is enough for rule 4
        let capabilities =
            Capabilities::parse(&capabilities_response(0, 0, 0, 0b1000)).unwrap();
        assert!(capabilities.is_488);
    }

    #[tokio::test]
    async fn ren_control_sequences() {
        let (mut protocol, mock) = connected(MockUsb::default()).await;
        {
            let mut state = mock.state();
            state.control_requests.clear();
            state.control_in.push_back(vec![STATUS_SUCCESS]);
            state.control_in.push_back(vec![STATUS_SUCCESS]);
        }
        protocol.control_ren(RenMode::AssertAddressLlo).await.unwrap();
        let requests: Vec<u8> = mock
            .state()
            .control_requests
            .iter()
            .map(|r| r.1)
            .collect();
        assert_eq!(requests, [REN_CONTROL, LOCAL_LOCKOUT]);
    }
}
