//! Sun RPC v2 client, as defined by RFC 5531 (record marking per RFC 1057
//! Section 10).

use std::time::Duration;

use log::warn;

use crate::{
    error::{Error, Result},
    transport::TcpTransport,
};

use super::xdr::{XdrPack, XdrReader};

pub const RPC_VERSION: u32 = 2;

const CALL: u32 = 0;
const REPLY: u32 = 1;

const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;

/// The most data a single RPC fragment can carry.
const MAX_FRAGMENT: usize = 0x7FFF_FFFF;
const LAST_FRAGMENT: u32 = 0x8000_0000;

fn accept_status(status: u32) -> &'static str {
    match status {
        1 => "PROG_UNAVAIL",
        2 => "PROG_MISMATCH",
        3 => "PROC_UNAVAIL",
        4 => "GARBAGE_ARGS",
        5 => "SYSTEM_ERR",
        _ => "unknown accept status",
    }
}

fn auth_status(status: u32) -> &'static str {
    match status {
        1 => "AUTH_BADCRED",
        2 => "AUTH_REJECTEDCRED",
        3 => "AUTH_BADVERF",
        4 => "AUTH_REJECTEDVERF",
        5 => "AUTH_TOOWEAK",
        _ => "unknown auth status",
    }
}

/// Check an RPC reply against the expected transaction id and strip the
/// reply headers.
///
/// Returns `None` when the reply carries a different transaction id, which
/// happens when a service interrupt is interleaved with the expected reply.
pub(crate) fn check_reply(expected_xid: u32, message: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut reader = XdrReader::new(message);
    let xid = reader.u32()?;
    if xid != expected_xid {
        return Ok(None);
    }

    let message_type = reader.u32()?;
    if message_type != REPLY {
        return Err(Error::Protocol(format!(
            "RPC message type is not REPLY, got {message_type}"
        )));
    }

    match reader.u32()? {
        MSG_ACCEPTED => {
            let _verifier = reader.u64()?;
            let status = reader.u32()?;
            if status == 0 {
                return Ok(Some(reader.remaining().to_vec()));
            }
            if status == 2 {
                let low = reader.u32()?;
                let high = reader.u32()?;
                return Err(Error::Protocol(format!(
                    "RPC call failed: PROG_MISMATCH: low={low}, high={high}"
                )));
            }
            Err(Error::Protocol(format!(
                "RPC call failed: {}",
                accept_status(status)
            )))
        }
        MSG_DENIED => match reader.u32()? {
            0 => {
                let low = reader.u32()?;
                let high = reader.u32()?;
                Err(Error::Protocol(format!(
                    "RPC call failed: RPC_MISMATCH: low={low}, high={high}"
                )))
            }
            1 => {
                let status = reader.u32()?;
                Err(Error::Protocol(format!(
                    "RPC authentication failed: {}",
                    auth_status(status)
                )))
            }
            status => Err(Error::Protocol(format!(
                "RPC MSG_DENIED status {status} is not RPC_MISMATCH nor AUTH_ERROR"
            ))),
        },
        status => Err(Error::Protocol(format!(
            "RPC reply status {status} is not MSG_ACCEPTED nor MSG_DENIED"
        ))),
    }
}

/// Split a call message into record-marked fragments. Only the last
/// fragment has the most-significant header bit set.
fn fragments(buffer: &[u8], max_fragment: usize) -> Vec<(u32, &[u8])> {
    let mut out = Vec::with_capacity(1);
    let mut remaining = buffer;
    loop {
        if remaining.len() <= max_fragment {
            out.push((remaining.len() as u32 | LAST_FRAGMENT, remaining));
            return out;
        }
        let (chunk, rest) = remaining.split_at(max_fragment);
        out.push((chunk.len() as u32, chunk));
        remaining = rest;
    }
}

/// An RPC client over one TCP connection.
pub struct RpcClient {
    host: String,
    transport: Option<TcpTransport>,
    timeout: Option<Duration>,
    chunk_size: usize,
    xid: u32,
    buffer: Vec<u8>,
    /// Invoked when a reply with an unexpected transaction id is read,
    /// which indicates an interleaved service-request interrupt
    interrupt_handler: Option<Box<dyn FnMut() + Send>>,
}
impl RpcClient {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            transport: None,
            timeout: None,
            chunk_size: 4096,
            xid: 0,
            buffer: vec![],
            interrupt_handler: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.max(1);
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_interrupt_handler(&mut self, handler: Option<Box<dyn FnMut() + Send>>) {
        self.interrupt_handler = handler;
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    pub async fn connect(&mut self, port: u16) -> Result<()> {
        self.close();
        let mut transport = TcpTransport::new(&self.host, port);
        transport.connect(self.timeout).await?;
        self.transport = Some(transport);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
    }

    fn transport(&mut self) -> Result<&mut TcpTransport> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::Connection("the RPC socket is disconnected".into()))
    }

    /// Begin a new call message for the given program/version/procedure,
    /// assigning the next transaction id.
    pub fn init(&mut self, prog: u32, vers: u32, proc: u32) {
        self.xid = self.xid.wrapping_add(1);
        self.buffer.clear();
        self.xid.pack_xdr(&mut self.buffer);
        CALL.pack_xdr(&mut self.buffer);
        RPC_VERSION.pack_xdr(&mut self.buffer);
        prog.pack_xdr(&mut self.buffer);
        vers.pack_xdr(&mut self.buffer);
        proc.pack_xdr(&mut self.buffer);
        // VXI-11 does not use authentication, the credential and the
        // verifier are both AUTH_NONE with no body
        0u64.pack_xdr(&mut self.buffer);
        0u64.pack_xdr(&mut self.buffer);
    }

    /// Append raw bytes to the body of the current call message.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Append a variable-length opaque to the body of the current call.
    pub fn append_opaque(&mut self, data: &[u8]) {
        data.pack_xdr(&mut self.buffer);
    }

    /// The current call message, without record marking.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Send the buffered call message as one or more record fragments.
    pub async fn write(&mut self) -> Result<()> {
        let buffer = std::mem::take(&mut self.buffer);
        let timeout = self.timeout;
        let transport = self.transport()?;

        for (header, chunk) in fragments(&buffer, MAX_FRAGMENT) {
            let mut data = Vec::with_capacity(4 + chunk.len());
            data.extend(header.to_be_bytes());
            data.extend_from_slice(chunk);
            run_with_timeout(timeout, transport.send_all(&data)).await?;
        }
        self.buffer = buffer;
        Ok(())
    }

    /// Read a reply, verify it, and return the procedure-specific data.
    ///
    /// A reply whose transaction id does not match is assumed to be an
    /// interleaved interrupt: the interrupt handler is invoked and the
    /// read continues until the expected transaction id arrives.
    pub async fn read(&mut self) -> Result<Vec<u8>> {
        loop {
            let message = self.read_record().await?;
            if let Some(reply) = check_reply(self.xid, &message)? {
                return Ok(reply);
            }
            warn!("discarding RPC reply with an unexpected transaction id");
            if let Some(handler) = &mut self.interrupt_handler {
                handler();
            }
        }
    }

    /// Read one record-marked message, reassembling its fragments.
    async fn read_record(&mut self) -> Result<Vec<u8>> {
        let chunk_size = self.chunk_size;
        let timeout = self.timeout;
        let transport = self.transport()?;

        let mut message = vec![];
        loop {
            let mut header = [0u8; 4];
            run_with_timeout(timeout, transport.recv_exact(&mut header)).await?;
            let header = u32::from_be_bytes(header);
            let last = header & LAST_FRAGMENT != 0;
            let size = (header & !LAST_FRAGMENT) as usize;

            // a fragment must be consumed completely before the next one
            let start = message.len();
            message.resize(start + size, 0);
            for chunk in message[start..].chunks_mut(chunk_size) {
                run_with_timeout(timeout, transport.recv_exact(chunk)).await?;
            }

            if last {
                return Ok(message);
            }
        }
    }
}

async fn run_with_timeout<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match timeout {
        None => fut.await,
        Some(timeout) => tokio::time::timeout(timeout, fut).await?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_invariants() {
        for (length, max) in [(0usize, 10usize), (5, 10), (10, 10), (11, 10), (35, 10)] {
            let buffer = vec![0xABu8; length];
            let frags = fragments(&buffer, max);
            let total: usize = frags.iter().map(|(h, _)| (h & !LAST_FRAGMENT) as usize).sum();
            assert_eq!(total, length);
            let last_count = frags.iter().filter(|(h, _)| h & LAST_FRAGMENT != 0).count();
            assert_eq!(last_count, 1);
            assert!(frags.last().unwrap().0 & LAST_FRAGMENT != 0);
        }
    }

    #[test]
    fn call_message_layout() {
        let mut client = RpcClient::new("127.0.0.1");
        client.init(100000, 2, 3);
        client.append(&[0xAA, 0xBB]);

        let buffer = client.buffer();
        let mut reader = XdrReader::new(buffer);
        assert_eq!(reader.u32().unwrap(), 1); // first xid
        assert_eq!(reader.u32().unwrap(), CALL);
        assert_eq!(reader.u32().unwrap(), RPC_VERSION);
        assert_eq!(reader.u32().unwrap(), 100000);
        assert_eq!(reader.u32().unwrap(), 2);
        assert_eq!(reader.u32().unwrap(), 3);
        assert_eq!(reader.u64().unwrap(), 0);
        assert_eq!(reader.u64().unwrap(), 0);
        assert_eq!(reader.remaining(), [0xAA, 0xBB]);
    }

    #[test]
    fn xid_wraps_on_overflow() {
        let mut client = RpcClient::new("127.0.0.1");
        client.xid = u32::MAX;
        client.init(1, 1, 0);
        assert_eq!(client.xid(), 0);
    }

    fn accepted_reply(xid: u32, data: &[u8]) -> Vec<u8> {
        let mut reply = vec![];
        xid.pack_xdr(&mut reply);
        REPLY.pack_xdr(&mut reply);
        MSG_ACCEPTED.pack_xdr(&mut reply);
        0u64.pack_xdr(&mut reply);
        0u32.pack_xdr(&mut reply); // SUCCESS
        reply.extend_from_slice(data);
        reply
    }

    #[tokio::test]
    async fn interrupt_resynchronises_on_xid_mismatch() {
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        };

        use tokio::{io::AsyncWriteExt, net::TcpListener};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // an interleaved service interrupt (previous transaction id),
            // then the reply that is actually expected
            for (xid, data) in [(0u32, b"old".as_slice()), (1, b"new")] {
                let reply = accepted_reply(xid, data);
                let mut framed = ((reply.len() as u32) | LAST_FRAGMENT).to_be_bytes().to_vec();
                framed.extend(reply);
                stream.write_all(&framed).await.unwrap();
            }
        });

        let interrupts = Arc::new(AtomicUsize::new(0));
        let seen = interrupts.clone();

        let mut client = RpcClient::new("127.0.0.1");
        client.set_timeout(Some(Duration::from_secs(5)));
        client.connect(port).await.unwrap();
        client.set_interrupt_handler(Some(Box::new(move || {
            let _ = seen.fetch_add(1, Ordering::SeqCst);
        })));

        client.init(1, 1, 0);
        let reply = client.read().await.unwrap();
        assert_eq!(reply, b"new");
        assert_eq!(interrupts.load(Ordering::SeqCst), 1);
        server.await.unwrap();
    }

    #[test]
    fn reply_checking() {
        let reply = accepted_reply(7, b"data");
        assert_eq!(check_reply(7, &reply).unwrap().unwrap(), b"data");

        // a different transaction id is not an error, the reply is skipped
        assert!(check_reply(8, &reply).unwrap().is_none());

        // PROG_MISMATCH carries the low/high supported versions
        let mut reply = vec![];
        7u32.pack_xdr(&mut reply);
        REPLY.pack_xdr(&mut reply);
        MSG_ACCEPTED.pack_xdr(&mut reply);
        0u64.pack_xdr(&mut reply);
        2u32.pack_xdr(&mut reply);
        1u32.pack_xdr(&mut reply);
        2u32.pack_xdr(&mut reply);
        let err = check_reply(7, &reply).unwrap_err();
        assert!(err.to_string().contains("PROG_MISMATCH"));

        // AUTH_ERROR rejection
        let mut reply = vec![];
        7u32.pack_xdr(&mut reply);
        REPLY.pack_xdr(&mut reply);
        MSG_DENIED.pack_xdr(&mut reply);
        1u32.pack_xdr(&mut reply);
        5u32.pack_xdr(&mut reply);
        let err = check_reply(7, &reply).unwrap_err();
        assert!(err.to_string().contains("AUTH_TOOWEAK"));
    }
}
