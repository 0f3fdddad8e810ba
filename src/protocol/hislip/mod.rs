//! HiSLIP client, per IVI-6.1: High-Speed LAN Instrument Protocol v2.0.
//!
//! A connection is a pair of TCP channels to the same server: the
//! synchronous channel carries instrument data, the asynchronous channel
//! carries control transactions (locks, status queries, device clear).

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};

use crate::{
    address::{Address, HISLIP_PORT},
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings, TimeBudget},
    protocol::RenMode,
    transport::TcpTransport,
};

pub mod message;

use message::{fatal, HEADER_SIZE, LockResponse, Message, MessageType};

/// Message ids restart here at initialization and after a device clear.
const INITIAL_MESSAGE_ID: u32 = 0xFFFF_FF00;

/// A `Data` message carrying this id is accepted regardless of the
/// current message id.
const ANY_MESSAGE_ID: u32 = 0xFFFF_FFFF;

/// Default `VI_ATTR_TCPIP_HISLIP_MAX_MESSAGE_KB` before negotiation.
const DEFAULT_MAX_MESSAGE_SIZE: u64 = 1 << 20;

/// One day stands in for waiting forever on a lock.
const ONE_DAY: Duration = Duration::from_secs(86_400);

/// The Interrupted/AsyncInterrupted rendezvous of Section 3.1.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InterruptState {
    Normal,
    /// `AsyncInterrupted` was seen first: discard `Data`/`DataEnd` until
    /// `Interrupted` arrives on the synchronous channel
    AwaitingInterrupted,
    /// `Interrupted` was seen first: sending is blocked until
    /// `AsyncInterrupted` arrives on the asynchronous channel
    AwaitingAsyncInterrupted,
}

/// One TCP channel of a HiSLIP connection.
struct Channel {
    transport: TcpTransport,
    /// Send ceiling negotiated with `AsyncMaximumMessageSize`
    max_server_message_size: u64,
}
impl Channel {
    async fn open(host: &str, port: u16, timeout: Option<Duration>) -> Result<Channel> {
        let mut transport = TcpTransport::new(host, port);
        transport.connect(timeout).await?;
        Ok(Channel {
            transport,
            max_server_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        })
    }

    fn close(&mut self) {
        self.transport.disconnect();
    }

    async fn write(&mut self, message: &Message, timeout: Option<Duration>) -> Result<()> {
        if message.size() as u64 > self.max_server_message_size {
            return Err(Error::Protocol(format!(
                "message too large, {} > {}",
                message.size(),
                self.max_server_message_size
            )));
        }
        let budget = TimeBudget::new(timeout);
        budget.run(self.transport.send_all(&message.pack())).await
    }

    /// Read one message of any type. A received `FatalError` or `Error`
    /// surfaces as the corresponding error kind.
    async fn read_any(&mut self, chunk_size: usize, timeout: Option<Duration>) -> Result<Message> {
        let budget = TimeBudget::new(timeout);

        let mut header = [0u8; HEADER_SIZE];
        budget.run(self.transport.recv_exact(&mut header)).await?;
        let (raw_type, control_code, parameter, length) = Message::parse_header(&header)?;

        let mut payload = vec![0u8; length as usize];
        for chunk in payload.chunks_mut(chunk_size) {
            budget.run(self.transport.recv_exact(chunk)).await?;
        }

        match MessageType::from_u8(raw_type) {
            Some(MessageType::FatalError) => Err(Error::FatalProtocol(format!(
                "{} [code={control_code}]",
                String::from_utf8_lossy(&payload)
            ))),
            Some(MessageType::Error) => Err(Error::Protocol(format!(
                "{} [code={control_code}]",
                String::from_utf8_lossy(&payload)
            ))),
            Some(message_type) => Ok(Message {
                message_type,
                control_code,
                parameter,
                payload,
            }),
            None => Err(Error::Protocol(format!(
                "unrecognized message type {raw_type}"
            ))),
        }
    }

    async fn read_expected(
        &mut self,
        expected: MessageType,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        let message = self.read_any(chunk_size, timeout).await?;
        if message.message_type != expected {
            return Err(Error::Protocol(format!(
                "expected {expected:?}, received {:?}",
                message.message_type
            )));
        }
        Ok(message)
    }
}

/// The synchronous channel with its message-id bookkeeping.
struct SyncChannel {
    channel: Channel,
    /// Id to use for the next sent Data/DataEnd/Trigger
    message_id: u32,
    /// Id of the most recent message that has completed
    previous_message_id: u32,
    /// Id of the most recent Data/DataEnd received from the server
    message_id_received: u32,
    /// 1 when the last received DataEnd carried the response terminator
    rmt: u8,
    interrupt_state: InterruptState,
}
impl SyncChannel {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            message_id: INITIAL_MESSAGE_ID,
            previous_message_id: INITIAL_MESSAGE_ID.wrapping_sub(2),
            message_id_received: INITIAL_MESSAGE_ID.wrapping_sub(2),
            rmt: 0,
            interrupt_state: InterruptState::Normal,
        }
    }

    fn reset_message_id(&mut self) {
        self.message_id = INITIAL_MESSAGE_ID;
        self.previous_message_id = INITIAL_MESSAGE_ID.wrapping_sub(2);
        self.message_id_received = INITIAL_MESSAGE_ID.wrapping_sub(2);
    }

    /// Called after each sent Data, DataEnd or Trigger message:
    /// increment by 2 and wrap on 32-bit overflow.
    fn increment_message_id(&mut self) {
        self.rmt = 0;
        self.previous_message_id = self.message_id;
        self.message_id = self.message_id.wrapping_add(2);
    }

    async fn initialize(
        &mut self,
        sub_address: &[u8],
        timeout: Option<Duration>,
        chunk_size: usize,
    ) -> Result<Message> {
        if sub_address.len() > 256 {
            return Err(Error::Protocol(
                "the maximum length of a sub-address is 256 characters".to_string(),
            ));
        }
        self.reset_message_id();
        self.channel
            .write(&Message::initialize(1, 0, *b"XX", sub_address), timeout)
            .await?;
        self.channel
            .read_expected(MessageType::InitializeResponse, chunk_size, timeout)
            .await
    }

    /// Send data, splitting it into `Data` frames capped by the negotiated
    /// maximum message size, with the final frame a `DataEnd` carrying the
    /// RMT-delivered bit.
    async fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if self.interrupt_state == InterruptState::AwaitingAsyncInterrupted {
            return Err(Error::Connection(
                "cannot send data until an AsyncInterrupted message is received".to_string(),
            ));
        }

        let max_payload = (self.channel.max_server_message_size as usize).saturating_sub(HEADER_SIZE);
        if max_payload == 0 {
            return Err(Error::Connection(
                "the negotiated maximum message size cannot hold a header".to_string(),
            ));
        }

        let rmt = self.rmt;
        let n_chunks = data.len().div_ceil(max_payload);
        for (index, chunk) in data.chunks(max_payload).enumerate() {
            let frame = if index == n_chunks - 1 {
                Message::data_end(rmt, self.message_id, chunk)
            } else {
                Message::data(0, self.message_id, chunk)
            };
            self.channel.write(&frame, timeout).await?;
            self.increment_message_id();
        }
        Ok(data.len())
    }

    /// Receive data until a `DataEnd` carrying the expected message id (or
    /// `size` bytes) arrives, enforcing the synchronized-mode client rules
    /// of Section 3.1.2.
    async fn receive(
        &mut self,
        size: Option<usize>,
        max_size: usize,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let budget = TimeBudget::new(timeout);
        let mut data: Vec<u8> = vec![];
        loop {
            let remaining = budget.remaining()?;
            let message = self.channel.read_any(chunk_size, remaining).await?;

            let done = match message.message_type {
                MessageType::DataEnd => {
                    if self.interrupt_state == InterruptState::AwaitingInterrupted {
                        continue;
                    }
                    self.message_id_received = message.parameter;
                    // an id that is not the most recently sent one discards
                    // the whole buffered response
                    if message.parameter != self.previous_message_id {
                        warn!(
                            "discarding DataEnd with message id {:#010x}, expected {:#010x}",
                            message.parameter, self.previous_message_id
                        );
                        data.clear();
                        continue;
                    }
                    self.rmt = 1;
                    true
                }
                MessageType::Data => {
                    if self.interrupt_state == InterruptState::AwaitingInterrupted {
                        continue;
                    }
                    self.message_id_received = message.parameter;
                    if message.parameter != ANY_MESSAGE_ID
                        && message.parameter != self.previous_message_id
                    {
                        warn!(
                            "discarding Data with message id {:#010x}, expected {:#010x}",
                            message.parameter, self.previous_message_id
                        );
                        data.clear();
                        continue;
                    }
                    false
                }
                MessageType::AsyncInterrupted => {
                    data.clear();
                    self.interrupt_state = match self.interrupt_state {
                        // Interrupted came first, sending unblocks now
                        InterruptState::AwaitingAsyncInterrupted => InterruptState::Normal,
                        _ => InterruptState::AwaitingInterrupted,
                    };
                    continue;
                }
                MessageType::Interrupted => {
                    data.clear();
                    self.interrupt_state = match self.interrupt_state {
                        InterruptState::AwaitingInterrupted => InterruptState::Normal,
                        // Interrupted first: block sends until AsyncInterrupted
                        _ => InterruptState::AwaitingAsyncInterrupted,
                    };
                    continue;
                }
                _ => continue,
            };

            data.extend_from_slice(&message.payload);

            if let Some(size) = size {
                if data.len() >= size {
                    data.truncate(size);
                    return Ok(data);
                }
            }

            if data.len() > max_size {
                return Err(Error::Connection(format!(
                    "message of {} bytes exceeds max_read_size [{max_size}]",
                    data.len()
                )));
            }

            if done {
                return Ok(data);
            }
        }
    }

    /// Complete the device-clear transaction on the synchronous channel
    /// and reset the message id, Section 6.12.
    async fn device_clear_complete(
        &mut self,
        feature_bitmap: u8,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let message = Message::new(MessageType::DeviceClearComplete).with_control(feature_bitmap);
        self.channel.write(&message, timeout).await?;
        let _ = self
            .channel
            .read_expected(MessageType::DeviceClearAcknowledge, chunk_size, timeout)
            .await?;
        self.reset_message_id();
        self.interrupt_state = InterruptState::Normal;
        Ok(())
    }

    /// Emulates a GPIB group-execute-trigger event.
    async fn trigger(&mut self, timeout: Option<Duration>) -> Result<()> {
        let message = Message::trigger(self.rmt, self.message_id);
        self.channel.write(&message, timeout).await?;
        self.increment_message_id();
        Ok(())
    }
}

/// The asynchronous (control) channel.
struct AsyncChannel {
    channel: Channel,
}
impl AsyncChannel {
    async fn initialize(
        &mut self,
        session_id: u16,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        self.channel
            .write(&Message::async_initialize(session_id), timeout)
            .await?;
        self.channel
            .read_expected(MessageType::AsyncInitializeResponse, chunk_size, timeout)
            .await
    }

    /// Exchange maximum message sizes, returning the size the server's
    /// synchronous channel accepts.
    async fn maximum_message_size(
        &mut self,
        size: u64,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        self.channel
            .write(&Message::async_maximum_message_size(size), timeout)
            .await?;
        let response = self
            .channel
            .read_expected(
                MessageType::AsyncMaximumMessageSizeResponse,
                chunk_size,
                timeout,
            )
            .await?;
        response.maximum_message_size()
    }

    async fn lock_request(
        &mut self,
        lock_timeout: Duration,
        lock_string: &str,
        chunk_size: usize,
    ) -> Result<LockResponse> {
        if lock_string.len() > 256 {
            return Err(Error::Protocol(
                "the maximum length of a lock string is 256 characters".to_string(),
            ));
        }
        let message = Message::new(MessageType::AsyncLock)
            .with_control(1)
            .with_parameter(lock_timeout.as_millis().min(u128::from(u32::MAX)) as u32)
            .with_payload(lock_string.as_bytes().to_vec());
        // the socket must outlive the requested lock timeout
        let socket_timeout = Some(Duration::from_secs(10) + lock_timeout);
        self.channel.write(&message, socket_timeout).await?;
        let response = self
            .channel
            .read_expected(MessageType::AsyncLockResponse, chunk_size, socket_timeout)
            .await?;
        LockResponse::from_control_code(response.control_code)
    }

    async fn lock_release(
        &mut self,
        message_id: u32,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<LockResponse> {
        let message = Message::new(MessageType::AsyncLock).with_parameter(message_id);
        self.channel.write(&message, timeout).await?;
        let response = self
            .channel
            .read_expected(MessageType::AsyncLockResponse, chunk_size, timeout)
            .await?;
        LockResponse::from_control_code(response.control_code)
    }

    /// Whether the server holds an exclusive lock, and how many clients
    /// hold a lock.
    async fn lock_info(
        &mut self,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<(bool, u32)> {
        self.channel
            .write(&Message::new(MessageType::AsyncLockInfo), timeout)
            .await?;
        let response = self
            .channel
            .read_expected(MessageType::AsyncLockInfoResponse, chunk_size, timeout)
            .await?;
        Ok((response.control_code == 1, response.parameter))
    }

    async fn remote_local_control(
        &mut self,
        request: u8,
        message_id: u32,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let message = Message::new(MessageType::AsyncRemoteLocalControl)
            .with_control(request)
            .with_parameter(message_id);
        self.channel.write(&message, timeout).await?;
        let _ = self
            .channel
            .read_expected(MessageType::AsyncRemoteLocalResponse, chunk_size, timeout)
            .await?;
        Ok(())
    }

    /// Start the device-clear transaction, returning the feature bitmap
    /// the server prefers.
    async fn device_clear(&mut self, chunk_size: usize, timeout: Option<Duration>) -> Result<u8> {
        self.channel
            .write(&Message::new(MessageType::AsyncDeviceClear), timeout)
            .await?;
        let response = self
            .channel
            .read_expected(
                MessageType::AsyncDeviceClearAcknowledge,
                chunk_size,
                timeout,
            )
            .await?;
        Ok(response.feature_bitmap())
    }

    /// The 8-bit status response corresponding to a VISA `viReadSTB`.
    async fn status_query(
        &mut self,
        rmt: u8,
        message_id: u32,
        chunk_size: usize,
        timeout: Option<Duration>,
    ) -> Result<u8> {
        let message = Message::new(MessageType::AsyncStatusQuery)
            .with_control(rmt)
            .with_parameter(message_id);
        self.channel.write(&message, timeout).await?;
        let response = self
            .channel
            .read_expected(MessageType::AsyncStatusResponse, chunk_size, timeout)
            .await?;
        Ok(response.control_code)
    }
}

/// A HiSLIP connection to one instrument.
pub struct HislipProtocol {
    host: String,
    port: u16,
    sub_address: String,
    settings: MessageSettings,
    /// Maximum number of bytes to receive at a time
    buffer_size: usize,
    lock_timeout: Duration,
    sync: Option<SyncChannel>,
    control: Option<AsyncChannel>,
}

impl HislipProtocol {
    pub fn new(host: &str, port: u16, sub_address: &str) -> Self {
        let mut settings = MessageSettings::default();
        // HiSLIP does not use termination characters, message boundaries
        // come from DataEnd frames
        settings.read_termination = None;
        settings.write_termination = None;

        Self {
            host: host.to_string(),
            port,
            sub_address: sub_address.to_string(),
            settings,
            buffer_size: 4096,
            lock_timeout: Duration::ZERO,
            sync: None,
            control: None,
        }
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        match address {
            Address::Hislip {
                host, name, port, ..
            } => Ok(Self::new(host, *port, name)),
            _ => Err(Error::AddressParse(format!(
                "{address:?} is not a HiSLIP address"
            ))),
        }
    }

    /// Time, in seconds, to wait to acquire a lock. `None` or a negative
    /// value means wait forever.
    pub fn set_lock_timeout(&mut self, timeout: Option<f64>) {
        self.lock_timeout = match timeout {
            Some(t) if t >= 0.0 => Duration::from_secs_f64(t),
            _ => ONE_DAY,
        };
    }

    fn timeout(&self) -> Option<Duration> {
        self.settings.timeout
    }

    fn sync_mut(&mut self) -> Result<&mut SyncChannel> {
        self.sync
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected to the HiSLIP server".into()))
    }

    fn control_mut(&mut self) -> Result<&mut AsyncChannel> {
        self.control
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected to the HiSLIP server".into()))
    }

    /// Send a `FatalError` to the server on both channels and close them,
    /// Section 6.2: after a client-detected fatal error the client shall
    /// close the connection.
    async fn send_fatal_error(&mut self, code: u8, reason: &str) {
        let message = Message::fatal_error(code, reason);
        let timeout = self.timeout();
        if let Some(sync) = &mut self.sync {
            let _ = sync.channel.write(&message, timeout).await;
            sync.channel.close();
        }
        if let Some(control) = &mut self.control {
            let _ = control.channel.write(&message, timeout).await;
            control.channel.close();
        }
        self.sync = None;
        self.control = None;
    }

    /// Tear down both channels after a fatal or connection error; the
    /// timeout path leaves the connection open.
    async fn handle_channel_error(&mut self, error: Error) -> Error {
        match &error {
            Error::FatalProtocol(reason) | Error::Connection(reason) => {
                let reason = reason.clone();
                self.send_fatal_error(fatal::UNIDENTIFIED, &reason).await;
            }
            _ => {}
        }
        error
    }

    /// Read the status byte from the device.
    pub async fn read_stb(&mut self) -> Result<u8> {
        let (rmt, id) = {
            let sync = self.sync_mut()?;
            (sync.rmt, sync.previous_message_id)
        };
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        self.control_mut()?
            .status_query(rmt, id, chunk_size, timeout)
            .await
    }

    /// Send the trigger message.
    pub async fn trigger(&mut self) -> Result<()> {
        let timeout = self.timeout();
        self.sync_mut()?.trigger(timeout).await
    }

    /// Run the device-clear transaction, Section 6.12. Resets the message
    /// id to its initial value.
    pub async fn clear(&mut self) -> Result<()> {
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        let feature = self.control_mut()?.device_clear(chunk_size, timeout).await?;
        self.sync_mut()?
            .device_clear_complete(feature, chunk_size, timeout)
            .await
    }

    /// Request the device's lock. An empty lock string requests an
    /// exclusive lock, otherwise it identifies a shared lock. Returns
    /// whether the lock was granted.
    pub async fn lock(&mut self, lock_string: &str) -> Result<bool> {
        let lock_timeout = self.lock_timeout;
        let chunk_size = self.buffer_size;
        let response = self
            .control_mut()?
            .lock_request(lock_timeout, lock_string, chunk_size)
            .await?;
        Ok(response.success())
    }

    /// Release the lock acquired by [`lock`](Self::lock).
    pub async fn unlock(&mut self) -> Result<bool> {
        let message_id = self.sync_mut()?.previous_message_id;
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        let response = self
            .control_mut()?
            .lock_release(message_id, chunk_size, timeout)
            .await?;
        Ok(response.success())
    }

    /// Whether the server holds an exclusive lock and the number of
    /// clients that hold a lock.
    pub async fn lock_status(&mut self) -> Result<(bool, u32)> {
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        self.control_mut()?.lock_info(chunk_size, timeout).await
    }

    /// Send a GPIB-like remote/local control request.
    pub async fn remote_local_control(&mut self, mode: RenMode) -> Result<()> {
        let message_id = self.sync_mut()?.previous_message_id;
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        self.control_mut()?
            .remote_local_control(mode.hislip_request(), message_id, chunk_size, timeout)
            .await
    }

    /// Request the server capability descriptors added in HiSLIP 2.0.
    pub async fn get_descriptors(&mut self) -> Result<Vec<u8>> {
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        let sync = self.sync_mut()?;
        sync.channel
            .write(&Message::new(MessageType::GetDescriptors), timeout)
            .await?;
        let response = sync
            .channel
            .read_expected(MessageType::GetDescriptorsResponse, chunk_size, timeout)
            .await?;
        Ok(response.payload)
    }

    /// Drop both channels and run the initialization transaction again.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await
    }
}

#[async_trait]
impl Interface for HislipProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.sync.is_some() {
            return Err(Error::Connection("already connected".into()));
        }

        let timeout = self.timeout();
        let chunk_size = self.buffer_size;

        // Section 6.1: Initialization Transaction
        let channel = Channel::open(&self.host, self.port, timeout).await?;
        let mut sync = SyncChannel::new(channel);
        let sub_address = self.sub_address.as_bytes().to_vec();
        let response = sync.initialize(&sub_address, timeout, chunk_size).await?;
        let (major, minor) = response.protocol_version();
        debug!(
            "HiSLIP session {} negotiated protocol {major}.{minor}",
            response.session_id()
        );

        if response.encryption_mandatory() || response.initial_encryption() {
            self.sync = Some(sync);
            let reason = "the server requires encryption";
            self.send_fatal_error(fatal::INVALID_INIT_SEQUENCE, reason).await;
            return Err(Error::FatalProtocol(reason.to_string()));
        }

        let channel = Channel::open(&self.host, self.port, timeout).await?;
        let mut control = AsyncChannel { channel };
        let init = control
            .initialize(response.session_id(), chunk_size, timeout)
            .await?;
        debug!(
            "HiSLIP server vendor {:?}",
            String::from_utf8_lossy(&init.server_vendor_id())
        );

        let server_size = control
            .maximum_message_size(self.settings.max_read_size as u64, chunk_size, timeout)
            .await?;
        let effective = server_size.min(self.settings.max_read_size as u64);
        sync.channel.max_server_message_size = effective;
        control.channel.max_server_message_size = effective;

        self.sync = Some(sync);
        self.control = Some(control);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut sync) = self.sync.take() {
            sync.channel.close();
        }
        if let Some(mut control) = self.control.take() {
            control.channel.close();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBased for HislipProtocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let max_size = self.settings.max_read_size;
        let chunk_size = self.buffer_size;
        let timeout = self.timeout();
        let result = self
            .sync_mut()?
            .receive(size, max_size, chunk_size, timeout)
            .await;
        match result {
            Ok(data) => Ok(data),
            Err(e) => Err(self.handle_channel_error(e).await),
        }
    }

    async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
        let timeout = self.timeout();
        let result = self.sync_mut()?.send(message, timeout).await;
        match result {
            Ok(written) => Ok(written),
            Err(e) => Err(self.handle_channel_error(e).await),
        }
    }
}

/// The default port for a HiSLIP server.
pub const PORT: u16 = HISLIP_PORT;

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let (raw_type, control_code, parameter, length) = Message::parse_header(&header).unwrap();
        let mut payload = vec![0u8; length as usize];
        stream.read_exact(&mut payload).await.unwrap();
        Message {
            message_type: MessageType::from_u8(raw_type).unwrap(),
            control_code,
            parameter,
            payload,
        }
    }

    async fn write_message(stream: &mut TcpStream, message: &Message) {
        stream.write_all(&message.pack()).await.unwrap();
    }

    /// Accept the sync and async channels and run the initialization
    /// transaction, reporting `max_size` as the server maximum.
    async fn accept_session(
        listener: &TcpListener,
        max_size: u64,
    ) -> (TcpStream, TcpStream) {
        let (mut sync, _) = listener.accept().await.unwrap();
        let initialize = read_message(&mut sync).await;
        assert_eq!(initialize.message_type, MessageType::Initialize);
        // protocol 1.0, session id 0x1234
        write_message(
            &mut sync,
            &Message::new(MessageType::InitializeResponse).with_parameter(0x0100_1234),
        )
        .await;

        let (mut control, _) = listener.accept().await.unwrap();
        let init = read_message(&mut control).await;
        assert_eq!(init.message_type, MessageType::AsyncInitialize);
        assert_eq!(init.parameter, 0x1234);
        write_message(
            &mut control,
            &Message::new(MessageType::AsyncInitializeResponse)
                .with_parameter(u32::from(u16::from_be_bytes(*b"RS"))),
        )
        .await;

        let request = read_message(&mut control).await;
        assert_eq!(request.message_type, MessageType::AsyncMaximumMessageSize);
        write_message(
            &mut control,
            &Message::new(MessageType::AsyncMaximumMessageSizeResponse)
                .with_payload(max_size.to_be_bytes().to_vec()),
        )
        .await;

        (sync, control)
    }

    async fn connected_client(port: u16) -> HislipProtocol {
        let mut device = HislipProtocol::new("127.0.0.1", port, "hislip0");
        device.settings_mut().set_timeout_secs(Some(5.0));
        device.connect().await.unwrap();
        device
    }

    #[tokio::test]
    async fn send_is_split_into_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, _control) = accept_session(&listener, 4096).await;

            // 10 kB split by a 4096-byte ceiling: 4080 + 4080 + 1840
            let first = read_message(&mut sync).await;
            assert_eq!(first.message_type, MessageType::Data);
            assert_eq!(first.payload.len(), 4080);
            assert_eq!(first.parameter, 0xFFFF_FF00);

            let second = read_message(&mut sync).await;
            assert_eq!(second.message_type, MessageType::Data);
            assert_eq!(second.payload.len(), 4080);
            assert_eq!(second.parameter, 0xFFFF_FF02);

            let last = read_message(&mut sync).await;
            assert_eq!(last.message_type, MessageType::DataEnd);
            assert_eq!(last.payload.len(), 1840);
            assert_eq!(last.parameter, 0xFFFF_FF04);
        });

        let mut device = connected_client(port).await;
        let payload = vec![0x55u8; 10_000];
        let written = (&mut device as &mut dyn MessageBased)
            .write(&payload)
            .await
            .unwrap();
        assert_eq!(written, 10_000);
        assert_eq!(device.sync.as_ref().unwrap().message_id, 0xFFFF_FF06);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn receive_discards_mismatched_message_ids() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, _control) = accept_session(&listener, 4096).await;
            let request = read_message(&mut sync).await;
            assert_eq!(request.message_type, MessageType::DataEnd);
            let id = request.parameter;

            // stale data for an older request must be discarded together
            // with anything buffered before it
            write_message(&mut sync, &Message::data(0, id.wrapping_sub(2), b"stale")).await;
            // the any-id sentinel is always accepted
            write_message(&mut sync, &Message::data(0, ANY_MESSAGE_ID, b"head,")).await;
            write_message(&mut sync, &Message::data_end(0, id, b"tail")).await;
        });

        let mut device = connected_client(port).await;
        let reply = (&mut device as &mut dyn MessageBased)
            .query("READ?", None)
            .await
            .unwrap();
        assert_eq!(reply, b"head,tail");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn interrupted_before_async_interrupted_blocks_sending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, _control) = accept_session(&listener, 4096).await;
            let request = read_message(&mut sync).await;
            let id = request.parameter;

            write_message(&mut sync, &Message::data(0, id, b"partial")).await;
            write_message(&mut sync, &Message::new(MessageType::Interrupted)).await;
            write_message(&mut sync, &Message::data_end(0, id, b"after")).await;
        });

        let mut device = connected_client(port).await;
        let reply = (&mut device as &mut dyn MessageBased)
            .query("READ?", None)
            .await
            .unwrap();
        // the Interrupted cleared the buffered "partial"
        assert_eq!(reply, b"after");

        // and sending stays blocked until AsyncInterrupted arrives
        let err = (&mut device as &mut dyn MessageBased)
            .write("NEXT")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn async_interrupted_first_discards_until_interrupted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, _control) = accept_session(&listener, 4096).await;
            let request = read_message(&mut sync).await;
            let id = request.parameter;

            write_message(&mut sync, &Message::new(MessageType::AsyncInterrupted)).await;
            // these must be discarded even though the id matches
            write_message(&mut sync, &Message::data(0, id, b"dead")).await;
            write_message(&mut sync, &Message::data_end(0, id, b"dead")).await;
            write_message(&mut sync, &Message::new(MessageType::Interrupted)).await;
            write_message(&mut sync, &Message::data_end(0, id, b"alive")).await;
        });

        let mut device = connected_client(port).await;
        let reply = (&mut device as &mut dyn MessageBased)
            .query("READ?", None)
            .await
            .unwrap();
        assert_eq!(reply, b"alive");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn device_clear_resets_message_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, mut control) = accept_session(&listener, 4096).await;

            let frame = read_message(&mut sync).await;
            assert_eq!(frame.parameter, 0xFFFF_FF00);
            write_message(&mut sync, &Message::data_end(0, 0xFFFF_FF00, b"ok")).await;

            let clear = read_message(&mut control).await;
            assert_eq!(clear.message_type, MessageType::AsyncDeviceClear);
            write_message(
                &mut control,
                &Message::new(MessageType::AsyncDeviceClearAcknowledge).with_control(0),
            )
            .await;

            let complete = read_message(&mut sync).await;
            assert_eq!(complete.message_type, MessageType::DeviceClearComplete);
            write_message(&mut sync, &Message::new(MessageType::DeviceClearAcknowledge)).await;

            let frame = read_message(&mut sync).await;
            assert_eq!(frame.parameter, INITIAL_MESSAGE_ID);
        });

        let mut device = connected_client(port).await;
        let _ = (&mut device as &mut dyn MessageBased)
            .query("*RST", None)
            .await
            .unwrap();
        assert_eq!(device.sync.as_ref().unwrap().message_id, 0xFFFF_FF02);

        device.clear().await.unwrap();
        assert_eq!(device.sync.as_ref().unwrap().message_id, INITIAL_MESSAGE_ID);

        let _ = (&mut device as &mut dyn MessageBased).write("AFTER").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn encryption_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut sync).await;
            // encryption-mandatory bit set
            write_message(
                &mut sync,
                &Message::new(MessageType::InitializeResponse)
                    .with_control(2)
                    .with_parameter(0x0100_0001),
            )
            .await;
            // the client reports a fatal error before closing
            let fatal = read_message(&mut sync).await;
            assert_eq!(fatal.message_type, MessageType::FatalError);
        });

        let mut device = HislipProtocol::new("127.0.0.1", port, "hislip0");
        device.settings_mut().set_timeout_secs(Some(5.0));
        let err = device.connect().await.unwrap_err();
        assert!(matches!(err, Error::FatalProtocol(_)));
        assert!(device.sync.is_none() && device.control.is_none());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn status_query_carries_rmt_and_message_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sync, mut control) = accept_session(&listener, 4096).await;

            let frame = read_message(&mut sync).await;
            write_message(&mut sync, &Message::data_end(0, frame.parameter, b"1")).await;

            let query = read_message(&mut control).await;
            assert_eq!(query.message_type, MessageType::AsyncStatusQuery);
            assert_eq!(query.control_code, 1); // an RMT was just delivered
            assert_eq!(query.parameter, 0xFFFF_FF00);
            write_message(
                &mut control,
                &Message::new(MessageType::AsyncStatusResponse).with_control(0x42),
            )
            .await;
        });

        let mut device = connected_client(port).await;
        let _ = (&mut device as &mut dyn MessageBased)
            .query("*OPC?", None)
            .await
            .unwrap();
        assert_eq!(device.read_stb().await.unwrap(), 0x42);

        server.await.unwrap();
    }
}
