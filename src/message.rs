//! The read/write state machine shared by every message-based interface.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::Instant;

use crate::{
    codec::{self, ByteOrder, Element},
    error::{Error, Result},
};

/// Text encoding used when converting between strings and wire bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Utf8,
    Ascii,
    Latin1,
}
impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Self::Utf8 => String::from_utf8(bytes.to_vec())
                .map_err(|e| Error::Protocol(format!("reply is not valid UTF-8: {e}"))),
            Self::Ascii => {
                if bytes.is_ascii() {
                    Ok(bytes.iter().map(|&b| b as char).collect())
                } else {
                    Err(Error::Protocol("reply is not valid ASCII".to_string()))
                }
            }
            Self::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        match self {
            Self::Utf8 => Ok(text.as_bytes().to_vec()),
            Self::Ascii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(Error::Protocol(format!("{text:?} is not valid ASCII")))
                }
            }
            Self::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(c as u32)
                        .map_err(|_| Error::Protocol(format!("{text:?} is not valid Latin-1")))
                })
                .collect(),
        }
    }
}

/// Per-connection state for message-based reads and writes.
#[derive(Clone, Debug)]
pub struct MessageSettings {
    /// Read/write timeout. `None` blocks forever.
    pub timeout: Option<Duration>,
    /// Sequence that terminates an unsized read
    pub read_termination: Option<Vec<u8>>,
    /// Sequence appended to written messages when not already present
    pub write_termination: Option<Vec<u8>>,
    /// Upper bound on the number of bytes a single read may accumulate
    pub max_read_size: usize,
    /// Remove trailing ASCII whitespace from read messages
    pub rstrip: bool,
    pub encoding: Encoding,
}
impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            timeout: None,
            read_termination: Some(b"\n".to_vec()),
            write_termination: Some(b"\r\n".to_vec()),
            max_read_size: 1 << 20,
            rstrip: false,
            encoding: Encoding::default(),
        }
    }
}
impl MessageSettings {
    /// Set the timeout in seconds. Negative values mean blocking mode.
    pub fn set_timeout_secs(&mut self, timeout: Option<f64>) {
        self.timeout = match timeout {
            Some(t) if t >= 0.0 => Some(Duration::from_secs_f64(t)),
            _ => None,
        };
    }

    /// Set both termination sequences from a string, encoded with the
    /// current encoding.
    pub fn set_termination(&mut self, termination: Option<&str>) -> Result<()> {
        let termination = match termination {
            Some(t) => Some(self.encoding.encode(t)?),
            None => None,
        };
        self.read_termination = termination.clone();
        self.write_termination = termination;
        Ok(())
    }
}

/// A connection to a device.
#[async_trait]
pub trait Interface: Send {
    async fn connect(&mut self) -> Result<()>;

    /// Close the connection. Idempotent, and safe to call after a failure.
    async fn disconnect(&mut self) -> Result<()>;
}

/// A connection that exchanges discrete messages with a device.
///
/// Implementors provide the transport-specific `raw_read`/`raw_write`
/// primitives; the shared `read`/`write`/`query` behaviour lives on
/// `dyn MessageBased`.
#[async_trait]
pub trait MessageBased: Interface {
    fn settings(&self) -> &MessageSettings;

    fn settings_mut(&mut self) -> &mut MessageSettings;

    /// Read a message. With `size` the read finishes once that many bytes
    /// arrived, otherwise it finishes on the read termination (or whatever
    /// end-of-message indicator the transport has). Must honour the
    /// configured timeout and `max_read_size`.
    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>>;

    /// Write a fully terminated message, returning the number of bytes
    /// placed on the wire.
    async fn raw_write(&mut self, message: &[u8]) -> Result<usize>;
}

impl<'a> dyn MessageBased + 'a {
    /// Read a message from the device.
    ///
    /// Blocks until the first of: `size` bytes arrived (when given), the
    /// read termination is seen, the timeout elapses (a [`Error::Timeout`])
    /// or more than `max_read_size` bytes accumulate (a
    /// [`Error::Connection`]).
    pub async fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let max_read_size = self.settings().max_read_size;
        if let Some(size) = size {
            if size > max_read_size {
                return Err(Error::Connection(format!(
                    "max_read_size is {max_read_size} bytes, requesting {size} bytes"
                )));
            }
        }

        let mut message = self.raw_read(size).await?;

        if let Some(size) = size {
            if message.len() != size {
                return Err(Error::Connection(format!(
                    "received {} bytes, requested {size} bytes",
                    message.len()
                )));
            }
        }

        if self.settings().rstrip {
            while message.last().is_some_and(u8::is_ascii_whitespace) {
                let _ = message.pop();
            }
        }

        debug!("read({size:?}) -> {}", printable(&message));
        Ok(message)
    }

    /// Read a message and decode it with the configured encoding.
    pub async fn read_string(&mut self) -> Result<String> {
        let message = self.read(None).await?;
        self.settings().encoding.decode(&message)
    }

    /// Read a message holding an IEEE 488.2 definite/indefinite block.
    pub async fn read_ieee<T: Element>(&mut self, order: ByteOrder) -> Result<Vec<T>> {
        let message = self.read(None).await?;
        codec::from_bytes_ieee(&message, order)
    }

    /// Write a message, appending the write termination if it is not
    /// already present. Returns the number of bytes placed on the wire.
    pub async fn write(&mut self, message: impl AsRef<[u8]>) -> Result<usize> {
        let message = message.as_ref();
        let mut data = message.to_vec();
        if let Some(termination) = &self.settings().write_termination {
            if !termination.is_empty() && !data.ends_with(termination) {
                data.extend_from_slice(termination);
            }
        }
        debug!("write({})", printable(&data));
        self.raw_write(&data).await
    }

    /// Write a message followed by an IEEE 488.2 definite-length block.
    pub async fn write_ieee<T: Element>(
        &mut self,
        message: &[u8],
        values: &[T],
        order: ByteOrder,
    ) -> Result<usize> {
        let mut data = message.to_vec();
        data.append(&mut codec::to_bytes_ieee(values, order)?);
        self.write(data).await
    }

    /// A write followed by a read, optionally separated by a delay.
    pub async fn query(
        &mut self,
        message: impl AsRef<[u8]>,
        delay: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let _ = self.write(message).await?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.read(None).await
    }

    /// A `query` that decodes the reply with the configured encoding.
    pub async fn query_string(&mut self, message: impl AsRef<[u8]>) -> Result<String> {
        let _ = self.write(message).await?;
        self.read_string().await
    }
}

/// Make control characters visible in log output.
pub(crate) fn printable(data: &[u8]) -> String {
    String::from_utf8_lossy(data)
        .replace('\n', "␤")
        .replace('\r', "␊")
        .replace('\x1b', "␛")
}

/// Tracks the remaining time of one logical operation so the timeout is
/// ratcheted down across its chunked reads.
pub(crate) struct TimeBudget {
    deadline: Option<Instant>,
}
impl TimeBudget {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// The time left, or an error if the budget is spent. `None` means the
    /// operation is unbounded.
    pub fn remaining(&self) -> Result<Option<Duration>> {
        match self.deadline {
            None => Ok(None),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    Err(Error::Timeout("operation deadline elapsed".to_string()))
                } else {
                    Ok(Some(deadline - now))
                }
            }
        }
    }

    /// Run a future, bounding it by the remaining budget.
    pub async fn run<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self.remaining()? {
            None => fut.await,
            Some(remaining) => tokio::time::timeout(remaining, fut).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes scripted replies and records what was written.
    struct Scripted {
        settings: MessageSettings,
        written: Vec<Vec<u8>>,
        replies: Vec<Vec<u8>>,
    }
    impl Scripted {
        fn new(replies: &[&[u8]]) -> Self {
            Self {
                settings: MessageSettings::default(),
                written: vec![],
                replies: replies.iter().rev().map(|r| r.to_vec()).collect(),
            }
        }
    }
    #[async_trait]
    impl Interface for Scripted {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }
    }
    #[async_trait]
    impl MessageBased for Scripted {
        fn settings(&self) -> &MessageSettings {
            &self.settings
        }
        fn settings_mut(&mut self) -> &mut MessageSettings {
            &mut self.settings
        }
        async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
            let reply = self.replies.pop().unwrap();
            match size {
                Some(size) => Ok(reply[..size.min(reply.len())].to_vec()),
                None => Ok(reply),
            }
        }
        async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
            self.written.push(message.to_vec());
            Ok(message.len())
        }
    }

    #[tokio::test]
    async fn write_appends_termination_once() {
        let mut device = Scripted::new(&[]);
        let n = (&mut device as &mut dyn MessageBased).write("*CLS").await.unwrap();
        assert_eq!(n, 6);
        let n = (&mut device as &mut dyn MessageBased)
            .write(b"*RST\r\n".as_slice())
            .await
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(device.written, vec![b"*CLS\r\n".to_vec(), b"*RST\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn write_without_termination() {
        let mut device = Scripted::new(&[]);
        device.settings_mut().write_termination = None;
        let n = (&mut device as &mut dyn MessageBased).write("*CLS").await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(device.written, vec![b"*CLS".to_vec()]);
    }

    #[tokio::test]
    async fn read_checks_requested_size() {
        let mut device = Scripted::new(&[b"abc"]);
        let err = (&mut device as &mut dyn MessageBased)
            .read(Some(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));

        let mut device = Scripted::new(&[b"abc"]);
        device.settings_mut().max_read_size = 4;
        let err = (&mut device as &mut dyn MessageBased)
            .read(Some(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn rstrip_removes_trailing_whitespace() {
        let mut device = Scripted::new(&[b"value,1.0  \r\n"]);
        device.settings_mut().rstrip = true;
        let message = (&mut device as &mut dyn MessageBased).read(None).await.unwrap();
        assert_eq!(message, b"value,1.0");
    }

    #[tokio::test]
    async fn query_is_write_then_read() {
        let mut device = Scripted::new(&[b"FLUKE,8588A,1,1.0\n"]);
        let reply = (&mut device as &mut dyn MessageBased)
            .query("*IDN?", None)
            .await
            .unwrap();
        assert_eq!(reply, b"FLUKE,8588A,1,1.0\n");
        assert_eq!(device.written, vec![b"*IDN?\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn ieee_block_round_trip_through_interface() {
        let block = codec::to_bytes_ieee(&[1.0f32, 2.0, 3.0], ByteOrder::Little).unwrap();
        let mut device = Scripted::new(&[&block]);
        let values: Vec<f32> = (&mut device as &mut dyn MessageBased)
            .read_ieee(ByteOrder::Little)
            .await
            .unwrap();
        assert_eq!(values, [1.0, 2.0, 3.0]);

        let _ = (&mut device as &mut dyn MessageBased)
            .write_ieee(b"CURV ", &[1u16, 2], ByteOrder::Big)
            .await
            .unwrap();
        assert_eq!(device.written[0][..7].to_vec(), b"CURV #2".to_vec());
    }

    #[test]
    fn timeout_normalisation() {
        let mut settings = MessageSettings::default();
        settings.set_timeout_secs(Some(-1.0));
        assert_eq!(settings.timeout, None);
        settings.set_timeout_secs(Some(2.5));
        assert_eq!(settings.timeout, Some(Duration::from_millis(2500)));
        settings.set_timeout_secs(None);
        assert_eq!(settings.timeout, None);
    }

    #[test]
    fn latin1_encoding() {
        let encoding = Encoding::Latin1;
        let bytes = encoding.encode("caf\u{e9}").unwrap();
        assert_eq!(bytes, b"caf\xe9");
        assert_eq!(encoding.decode(&bytes).unwrap(), "caf\u{e9}");
        assert!(Encoding::Ascii.encode("caf\u{e9}").is_err());
    }
}
