//! HiSLIP message framing, per IVI-6.1 (HiSLIP) v2.0.
//!
//! Every message is a 16-byte header, optionally followed by a payload:
//! the `HS` prologue, a message type, an 8-bit control code, a 32-bit
//! parameter and a 64-bit payload length. All integers are big-endian.

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 16;
pub const PROLOGUE: &[u8; 2] = b"HS";

/// Message type codes, Table 4 of Section 2.5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Initialize = 0,
    InitializeResponse = 1,
    FatalError = 2,
    Error = 3,
    AsyncLock = 4,
    AsyncLockResponse = 5,
    Data = 6,
    DataEnd = 7,
    DeviceClearComplete = 8,
    DeviceClearAcknowledge = 9,
    AsyncRemoteLocalControl = 10,
    AsyncRemoteLocalResponse = 11,
    Trigger = 12,
    Interrupted = 13,
    AsyncInterrupted = 14,
    AsyncMaximumMessageSize = 15,
    AsyncMaximumMessageSizeResponse = 16,
    AsyncInitialize = 17,
    AsyncInitializeResponse = 18,
    AsyncDeviceClear = 19,
    AsyncServiceRequest = 20,
    AsyncStatusQuery = 21,
    AsyncStatusResponse = 22,
    AsyncDeviceClearAcknowledge = 23,
    AsyncLockInfo = 24,
    AsyncLockInfoResponse = 25,
    GetDescriptors = 26,
    GetDescriptorsResponse = 27,
    StartTLS = 28,
    AsyncStartTLS = 29,
    AsyncStartTLSResponse = 30,
    EndTLS = 31,
    AsyncEndTLS = 32,
    AsyncEndTLSResponse = 33,
    GetSaslMechanismList = 34,
    GetSaslMechanismListResponse = 35,
    AuthenticationStart = 36,
    AuthenticationExchange = 37,
    AuthenticationResult = 38,
}
impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        use MessageType::*;
        // type codes are contiguous from 0
        const ALL: [MessageType; 39] = [
            Initialize,
            InitializeResponse,
            FatalError,
            Error,
            AsyncLock,
            AsyncLockResponse,
            Data,
            DataEnd,
            DeviceClearComplete,
            DeviceClearAcknowledge,
            AsyncRemoteLocalControl,
            AsyncRemoteLocalResponse,
            Trigger,
            Interrupted,
            AsyncInterrupted,
            AsyncMaximumMessageSize,
            AsyncMaximumMessageSizeResponse,
            AsyncInitialize,
            AsyncInitializeResponse,
            AsyncDeviceClear,
            AsyncServiceRequest,
            AsyncStatusQuery,
            AsyncStatusResponse,
            AsyncDeviceClearAcknowledge,
            AsyncLockInfo,
            AsyncLockInfoResponse,
            GetDescriptors,
            GetDescriptorsResponse,
            StartTLS,
            AsyncStartTLS,
            AsyncStartTLSResponse,
            EndTLS,
            AsyncEndTLS,
            AsyncEndTLSResponse,
            GetSaslMechanismList,
            GetSaslMechanismListResponse,
            AuthenticationStart,
            AuthenticationExchange,
            AuthenticationResult,
        ];
        ALL.get(value as usize).copied()
    }
}

// Fatal error codes, Table 14 of Section 6.2
pub mod fatal {
    pub const UNIDENTIFIED: u8 = 0;
    pub const BAD_HEADER: u8 = 1;
    pub const CHANNELS_INACTIVATED: u8 = 2;
    pub const INVALID_INIT_SEQUENCE: u8 = 3;
    pub const MAX_CLIENTS: u8 = 4;
}

// Non-fatal error codes, Table 16 of Section 6.3
pub mod nonfatal {
    pub const UNIDENTIFIED: u8 = 0;
    pub const BAD_MESSAGE_TYPE: u8 = 1;
    pub const BAD_CONTROL_CODE: u8 = 2;
    pub const BAD_VENDOR: u8 = 3;
    pub const MESSAGE_TOO_LARGE: u8 = 4;
    pub const AUTHENTICATION_FAILED: u8 = 5;
}

/// One HiSLIP message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub control_code: u8,
    pub parameter: u32,
    pub payload: Vec<u8>,
}
impl Message {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            control_code: 0,
            parameter: 0,
            payload: vec![],
        }
    }

    pub fn with_control(mut self, control_code: u8) -> Self {
        self.control_code = control_code;
        self
    }

    pub fn with_parameter(mut self, parameter: u32) -> Self {
        self.parameter = parameter;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Total size on the wire.
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend(PROLOGUE);
        out.push(self.message_type as u8);
        out.push(self.control_code);
        out.extend(self.parameter.to_be_bytes());
        out.extend((self.payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a header, returning `(raw type, control code, parameter,
    /// payload length)`. The payload is read separately.
    pub fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(u8, u8, u32, u64)> {
        if &header[..2] != PROLOGUE {
            return Err(Error::FatalProtocol(
                "poorly formed message header, prologue != HS".to_string(),
            ));
        }
        Ok((
            header[2],
            header[3],
            u32::from_be_bytes(header[4..8].try_into().unwrap()),
            u64::from_be_bytes(header[8..16].try_into().unwrap()),
        ))
    }

    // ---- client-to-server messages ----

    /// The first message of the initialization transaction. The parameter
    /// carries the protocol version the client supports and its
    /// two-character vendor id; the payload is the sub-address.
    pub fn initialize(major: u8, minor: u8, client_id: [u8; 2], sub_address: &[u8]) -> Message {
        let parameter = u32::from_be_bytes([major, minor, client_id[0], client_id[1]]);
        Message::new(MessageType::Initialize)
            .with_parameter(parameter)
            .with_payload(sub_address.to_vec())
    }

    pub fn async_initialize(session_id: u16) -> Message {
        Message::new(MessageType::AsyncInitialize).with_parameter(u32::from(session_id))
    }

    pub fn async_maximum_message_size(size: u64) -> Message {
        Message::new(MessageType::AsyncMaximumMessageSize).with_payload(size.to_be_bytes().to_vec())
    }

    pub fn data(rmt: u8, message_id: u32, payload: &[u8]) -> Message {
        Message::new(MessageType::Data)
            .with_control(rmt)
            .with_parameter(message_id)
            .with_payload(payload.to_vec())
    }

    pub fn data_end(rmt: u8, message_id: u32, payload: &[u8]) -> Message {
        Message::new(MessageType::DataEnd)
            .with_control(rmt)
            .with_parameter(message_id)
            .with_payload(payload.to_vec())
    }

    pub fn trigger(rmt: u8, message_id: u32) -> Message {
        Message::new(MessageType::Trigger)
            .with_control(rmt)
            .with_parameter(message_id)
    }

    pub fn fatal_error(code: u8, reason: &str) -> Message {
        Message::new(MessageType::FatalError)
            .with_control(code)
            .with_payload(reason.as_bytes().to_vec())
    }

    // ---- server response accessors ----

    /// Whether the server is in overlapped (rather than synchronous) mode.
    /// Valid on an `InitializeResponse`.
    pub fn overlap_mode(&self) -> bool {
        self.control_code & 1 != 0
    }

    /// Whether encryption is mandatory. Valid on an `InitializeResponse`.
    pub fn encryption_mandatory(&self) -> bool {
        self.control_code & 2 != 0
    }

    /// Whether the client shall switch to encrypted mode immediately.
    /// Valid on an `InitializeResponse`.
    pub fn initial_encryption(&self) -> bool {
        self.control_code & 4 != 0
    }

    /// The negotiated `(major, minor)` protocol version. Valid on an
    /// `InitializeResponse`.
    pub fn protocol_version(&self) -> (u8, u8) {
        let bytes = self.parameter.to_be_bytes();
        (bytes[0], bytes[1])
    }

    /// The session id. Valid on an `InitializeResponse`.
    pub fn session_id(&self) -> u16 {
        self.parameter as u16
    }

    /// The two-character vendor abbreviation of the server. Valid on an
    /// `AsyncInitializeResponse`.
    pub fn server_vendor_id(&self) -> [u8; 2] {
        (self.parameter as u16).to_be_bytes()
    }

    /// Whether the server supports secure connections. Valid on an
    /// `AsyncInitializeResponse`.
    pub fn secure_connection_supported(&self) -> bool {
        self.control_code & 1 != 0
    }

    /// The maximum message size the server's synchronous channel accepts.
    /// Valid on an `AsyncMaximumMessageSizeResponse`.
    pub fn maximum_message_size(&self) -> Result<u64> {
        let bytes: [u8; 8] = self.payload.as_slice().try_into().map_err(|_| {
            Error::Protocol("AsyncMaximumMessageSizeResponse payload is not 8 bytes".to_string())
        })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// The feature bitmap the server prefers. Valid on an
    /// `AsyncDeviceClearAcknowledge`.
    pub fn feature_bitmap(&self) -> u8 {
        self.control_code
    }
}

/// Outcome of a lock request or release, Tables 19 and 20 of Section 6.5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockResponse {
    /// Requested but not granted, the timeout expired
    Failure,
    /// Requesting or releasing succeeded
    Success,
    /// Releasing a shared lock succeeded
    SharedReleased,
    /// Released a lock that was not acquired, or requested a lock that was
    /// already granted
    Error,
}
impl LockResponse {
    pub fn from_control_code(code: u8) -> Result<LockResponse> {
        match code {
            0 => Ok(Self::Failure),
            1 => Ok(Self::Success),
            2 => Ok(Self::SharedReleased),
            3 => Ok(Self::Error),
            code => Err(Error::Protocol(format!(
                "unknown AsyncLockResponse control code {code}"
            ))),
        }
    }

    pub fn success(self) -> bool {
        matches!(self, Self::Success | Self::SharedReleased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let message = Message::data_end(1, 0xFFFF_FF02, b"*IDN?");
        let packed = message.pack();
        assert_eq!(packed.len(), 21);
        assert_eq!(&packed[..2], b"HS");
        assert_eq!(packed[2], MessageType::DataEnd as u8);
        assert_eq!(packed[3], 1);
        assert_eq!(&packed[4..8], &0xFFFF_FF02u32.to_be_bytes());
        assert_eq!(&packed[8..16], &5u64.to_be_bytes());
        assert_eq!(&packed[16..], b"*IDN?");

        let header: [u8; HEADER_SIZE] = packed[..16].try_into().unwrap();
        let (typ, control, parameter, length) = Message::parse_header(&header).unwrap();
        assert_eq!(MessageType::from_u8(typ), Some(MessageType::DataEnd));
        assert_eq!(control, 1);
        assert_eq!(parameter, 0xFFFF_FF02);
        assert_eq!(length, 5);
    }

    #[test]
    fn bad_prologue() {
        let mut header = [0u8; HEADER_SIZE];
        header[..2].copy_from_slice(b"hs");
        assert!(matches!(
            Message::parse_header(&header),
            Err(Error::FatalProtocol(_))
        ));
    }

    #[test]
    fn initialize_parameter() {
        let message = Message::initialize(1, 0, *b"XX", b"hislip0");
        assert_eq!(message.parameter, 0x0100_5858);
        assert_eq!(message.payload, b"hislip0");
    }

    #[test]
    fn initialize_response_fields() {
        // version 2.1, session id 0xBEEF, overlap + encryption-mandatory
        let response = Message::new(MessageType::InitializeResponse)
            .with_control(0b011)
            .with_parameter(0x0201_BEEF);
        assert_eq!(response.protocol_version(), (2, 1));
        assert_eq!(response.session_id(), 0xBEEF);
        assert!(response.overlap_mode());
        assert!(response.encryption_mandatory());
        assert!(!response.initial_encryption());
    }

    #[test]
    fn async_initialize_response_fields() {
        let response = Message::new(MessageType::AsyncInitializeResponse)
            .with_control(1)
            .with_parameter(u32::from(u16::from_be_bytes(*b"RS")));
        assert_eq!(&response.server_vendor_id(), b"RS");
        assert!(response.secure_connection_supported());
    }

    #[test]
    fn maximum_message_size_payload() {
        let message = Message::async_maximum_message_size(1 << 20);
        assert_eq!(message.maximum_message_size().unwrap(), 1 << 20);

        let malformed = Message::new(MessageType::AsyncMaximumMessageSizeResponse)
            .with_payload(vec![1, 2, 3]);
        assert!(malformed.maximum_message_size().is_err());
    }

    #[test]
    fn message_type_bounds() {
        assert_eq!(MessageType::from_u8(0), Some(MessageType::Initialize));
        assert_eq!(
            MessageType::from_u8(38),
            Some(MessageType::AuthenticationResult)
        );
        assert_eq!(MessageType::from_u8(39), None);
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn lock_response_codes() {
        assert!(LockResponse::from_control_code(1).unwrap().success());
        assert!(LockResponse::from_control_code(2).unwrap().success());
        assert!(!LockResponse::from_control_code(0).unwrap().success());
        assert!(!LockResponse::from_control_code(3).unwrap().success());
        assert!(LockResponse::from_control_code(4).is_err());
    }
}
