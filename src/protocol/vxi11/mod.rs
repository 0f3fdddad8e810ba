//! VXI-11 protocol, referencing the TCP/IP Instrument Protocol
//! Specification (Revision 1.0) of the VXIbus Consortium.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    address::Address,
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings, TimeBudget},
};

pub mod onc;
pub mod portmap;
pub mod rpc;
pub mod xdr;

use onc::RpcClient;
use portmap::IpProtocol;
use rpc::{OperationFlags, Procedure};
use xdr::XdrPack;

/// One day in milliseconds, treated as equivalent to waiting forever.
const ONE_DAY_MS: u32 = 86_400_000;

/// A device never accepts more than this many bytes in one `device_write`.
const MAX_WRITE_CHUNK: u32 = 65_536;

/// A client of the VXI-11 Device Core (and, lazily, Device Async)
/// programs of one network instrument.
pub struct Vxi11Protocol {
    host: String,
    /// LAN device name from the address, e.g. `inst0`
    name: String,
    settings: MessageSettings,
    /// Maximum number of bytes requested per `device_read`
    buffer_size: u32,
    lock_timeout_ms: u32,
    configured_port: Option<u16>,
    pmap_port: u16,
    core: Option<RpcClient>,
    abort_client: Option<RpcClient>,
    link_id: i32,
    abort_port: u16,
    max_recv_size: u32,
}

impl Vxi11Protocol {
    pub fn new(host: &str, name: &str) -> Self {
        let mut settings = MessageSettings::default();
        // VXI-11 signals message boundaries with the END indicator, the
        // termination characters are opt-in
        settings.read_termination = None;
        settings.write_termination = None;

        Self {
            host: host.to_string(),
            name: name.to_string(),
            settings,
            buffer_size: 4096,
            lock_timeout_ms: 0,
            configured_port: None,
            pmap_port: portmap::PMAP_PORT,
            core: None,
            abort_client: None,
            link_id: -1,
            abort_port: 0,
            max_recv_size: 0,
        }
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        match address {
            Address::Vxi11 { host, name, .. } => Ok(Self::new(host, name)),
            _ => Err(Error::AddressParse(format!(
                "{address:?} is not a VXI-11 address"
            ))),
        }
    }

    /// Use a fixed Device Core port instead of asking the port mapper.
    pub fn set_core_port(&mut self, port: Option<u16>) {
        self.configured_port = port;
    }

    #[cfg(test)]
    fn set_portmapper_port(&mut self, port: u16) {
        self.pmap_port = port;
    }

    /// Time, in seconds, to wait to acquire a device lock. `None` or a
    /// negative value means wait forever.
    pub fn set_lock_timeout(&mut self, timeout: Option<f64>) {
        self.lock_timeout_ms = match timeout {
            Some(t) if t >= 0.0 => (t * 1000.0) as u32,
            _ => ONE_DAY_MS,
        };
        self.apply_socket_timeout();
    }

    fn io_timeout_ms(&self) -> u32 {
        match self.settings.timeout {
            // one day is equivalent to a socket in blocking mode
            None => ONE_DAY_MS,
            Some(t) => t.as_millis().min(u128::from(u32::MAX)) as u32,
        }
    }

    /// The RPC socket timeout must exceed the io and lock timeouts so the
    /// device, not the socket, reports slow operations.
    fn socket_timeout(&self) -> Option<Duration> {
        self.settings.timeout.map(|t| {
            Duration::from_secs(1) + t + Duration::from_millis(u64::from(self.lock_timeout_ms))
        })
    }

    fn apply_socket_timeout(&mut self) {
        let timeout = self.socket_timeout();
        if let Some(core) = &mut self.core {
            core.set_timeout(timeout);
        }
        if let Some(abort) = &mut self.abort_client {
            abort.set_timeout(timeout);
        }
    }

    fn init_flags(&self) -> OperationFlags {
        OperationFlags {
            wait_lock: self.lock_timeout_ms > 0,
            ..Default::default()
        }
    }

    fn generic_params(&self) -> rpc::GenericParams {
        rpc::GenericParams {
            link_id: self.link_id,
            flags: self.init_flags(),
            lock_timeout: self.lock_timeout_ms,
            io_timeout: self.io_timeout_ms(),
        }
    }

    async fn call(&mut self, proc: Procedure, args: impl XdrPack) -> Result<Vec<u8>> {
        let core = self
            .core
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected to the VXI-11 device".into()))?;
        core.init(rpc::DEVICE_CORE, rpc::DEVICE_CORE_VERSION, proc as u32);
        let mut packed = vec![];
        args.pack_xdr(&mut packed);
        core.append(&packed);
        core.write().await?;
        core.read().await
    }

    async fn open_link(&mut self) -> Result<()> {
        let port = match self.configured_port {
            Some(port) => port,
            None => {
                portmap::get_port_at(
                    &self.host,
                    self.pmap_port,
                    rpc::DEVICE_CORE,
                    rpc::DEVICE_CORE_VERSION,
                    IpProtocol::Tcp,
                    self.settings.timeout,
                )
                .await?
            }
        };

        let mut core = RpcClient::new(&self.host);
        core.set_chunk_size(self.buffer_size as usize);
        core.set_timeout(self.socket_timeout());
        core.connect(port).await?;
        self.core = Some(core);

        let client_id = (rand::random::<u32>() >> 1) as i32;
        let name = self.name.clone();
        let reply = self
            .call(
                Procedure::CreateLink,
                rpc::CreateLinkRequest {
                    client_id,
                    lock_device: false,
                    lock_timeout: self.lock_timeout_ms,
                    device: &name,
                },
            )
            .await?;
        let response = rpc::CreateLinkResponse::unpack(&reply)?;

        self.link_id = response.link_id;
        self.abort_port = response.abort_port;
        self.max_recv_size = response.max_recv_size.clamp(1, MAX_WRITE_CHUNK);
        Ok(())
    }

    /// Send the device clear command.
    pub async fn clear(&mut self) -> Result<()> {
        let params = self.generic_params();
        let reply = self.call(Procedure::DeviceClear, params).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Send a trigger to the device.
    pub async fn trigger(&mut self) -> Result<()> {
        let params = self.generic_params();
        let reply = self.call(Procedure::DeviceTrigger, params).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Disable all programmable local controls of the device.
    pub async fn remote(&mut self) -> Result<()> {
        let params = self.generic_params();
        let reply = self.call(Procedure::DeviceRemote, params).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Enable all programmable local controls of the device.
    pub async fn local(&mut self) -> Result<()> {
        let params = self.generic_params();
        let reply = self.call(Procedure::DeviceLocal, params).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Read the status byte from the device.
    pub async fn read_stb(&mut self) -> Result<u8> {
        let params = self.generic_params();
        let reply = self.call(Procedure::DeviceReadStb, params).await?;
        rpc::unpack_read_stb(&reply)
    }

    /// Acquire the device's lock.
    pub async fn lock(&mut self) -> Result<()> {
        let request = rpc::DeviceLockRequest {
            link_id: self.link_id,
            flags: self.init_flags(),
            lock_timeout: self.lock_timeout_ms,
        };
        let reply = self.call(Procedure::DeviceLock, request).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Release the lock acquired by [`lock`](Self::lock).
    pub async fn unlock(&mut self) -> Result<()> {
        let link_id = self.link_id;
        let reply = self.call(Procedure::DeviceUnlock, link_id).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Enable or disable the device sending service-request interrupts.
    /// The handle is host-specific data of at most 40 bytes.
    pub async fn enable_srq(&mut self, enable: bool, handle: &[u8]) -> Result<()> {
        if handle.len() > 40 {
            return Err(Error::Protocol(format!(
                "the service-request handle must be <= 40 bytes, got {}",
                handle.len()
            )));
        }
        let request = rpc::DeviceEnableSrqRequest {
            link_id: self.link_id,
            enable,
            handle,
        };
        let reply = self.call(Procedure::DeviceEnableSrq, request).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Execute a device-specific command, e.g. an IEEE 488 bus command.
    /// Values are always sent in network (big-endian) byte order.
    pub async fn docmd(&mut self, cmd: i32, datasize: i32, data: &[u8]) -> Result<Vec<u8>> {
        let request = rpc::DeviceDoCmdRequest {
            link_id: self.link_id,
            flags: self.init_flags(),
            io_timeout: self.io_timeout_ms(),
            lock_timeout: self.lock_timeout_ms,
            cmd,
            network_order: true,
            datasize,
            data_in: data,
        };
        let reply = self.call(Procedure::DeviceDoCmd, request).await?;
        rpc::unpack_docmd(&reply)
    }

    /// Ask the server to establish an interrupt channel back to the host.
    pub async fn create_intr_chan(
        &mut self,
        host_addr: u32,
        host_port: u32,
        prog_num: u32,
        prog_vers: u32,
        prog_family: u32,
    ) -> Result<()> {
        let request = rpc::CreateIntrChanRequest {
            host_addr,
            host_port,
            prog_num,
            prog_vers,
            prog_family,
        };
        let reply = self.call(Procedure::CreateIntrChan, request).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Ask the server to close its interrupt channel.
    pub async fn destroy_intr_chan(&mut self) -> Result<()> {
        let reply = self.call(Procedure::DestroyIntrChan, ()).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Destroy the link with the device.
    pub async fn destroy_link(&mut self) -> Result<()> {
        let link_id = self.link_id;
        let reply = self.call(Procedure::DestroyLink, link_id).await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Stop an in-progress request via the Device Async program.
    pub async fn abort(&mut self) -> Result<()> {
        if self.abort_client.is_none() {
            let mut client = RpcClient::new(&self.host);
            client.set_timeout(self.socket_timeout());
            client.connect(self.abort_port).await?;
            self.abort_client = Some(client);
        }

        let client = self.abort_client.as_mut().unwrap();
        client.init(
            rpc::DEVICE_ASYNC,
            rpc::DEVICE_ASYNC_VERSION,
            Procedure::DeviceAbort as u32,
        );
        let mut packed = vec![];
        self.link_id.pack_xdr(&mut packed);
        client.append(&packed);
        client.write().await?;
        let reply = client.read().await?;
        rpc::check_error(&mut xdr::XdrReader::new(&reply))
    }

    /// Drop the current link and establish a new one.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await
    }
}

impl XdrPack for () {
    fn pack_xdr(self, _out: &mut Vec<u8>) {}
}

#[async_trait]
impl Interface for Vxi11Protocol {
    async fn connect(&mut self) -> Result<()> {
        if self.core.is_some() {
            return Err(Error::Connection("already connected".into()));
        }
        if let Err(e) = self.open_link().await {
            if let Some(mut core) = self.core.take() {
                core.close();
            }
            return match e {
                Error::Timeout(_) => Err(e),
                e => Err(Error::Connection(format!(
                    "cannot connect to {}: {e}",
                    self.host
                ))),
            };
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut abort) = self.abort_client.take() {
            abort.close();
        }
        if let Some(mut core) = self.core.take() {
            if self.link_id != -1 {
                self.core = Some(core);
                let _ = self.destroy_link().await;
                core = self.core.take().unwrap();
                self.link_id = -1;
            }
            core.close();
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBased for Vxi11Protocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let budget = TimeBudget::new(self.settings.timeout);

        let mut flags = self.init_flags();
        let mut term_char = 0;
        if let Some(termination) = &self.settings.read_termination {
            if let Some(&last) = termination.last() {
                term_char = last;
                flags.termchr_set = true;
            }
        }

        let max_read_size = self.settings.max_read_size;
        let lock_timeout = self.lock_timeout_ms;
        let mut remaining = size;
        let mut message: Vec<u8> = vec![];
        loop {
            let io_timeout = match budget.remaining()? {
                None => ONE_DAY_MS,
                Some(left) => left.as_millis().min(u128::from(u32::MAX)) as u32,
            };
            let request_size = remaining
                .map_or(self.buffer_size, |r| (r as u32).min(self.buffer_size));

            let reply = self
                .call(
                    Procedure::DeviceRead,
                    rpc::DeviceReadRequest {
                        link_id: self.link_id,
                        request_size,
                        io_timeout,
                        lock_timeout,
                        flags,
                        term_char,
                    },
                )
                .await?;
            let response = rpc::DeviceReadResponse::unpack(&reply)?;
            message.extend_from_slice(&response.data);

            if let Some(left) = &mut remaining {
                *left = left.saturating_sub(response.data.len());
                if *left == 0 {
                    break;
                }
            }

            if message.len() > max_read_size {
                return Err(Error::Connection(format!(
                    "message of {} bytes exceeds max_read_size [{max_read_size}]",
                    message.len()
                )));
            }

            if response.reason & (rpc::REASON_END | rpc::REASON_CHR) != 0 {
                break;
            }
        }

        Ok(message)
    }

    async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
        let mut flags = self.init_flags();
        let io_timeout = self.io_timeout_ms();
        let lock_timeout = self.lock_timeout_ms;

        let n_chunks = message.len().div_ceil(self.max_recv_size as usize);
        let mut written = 0;
        for (index, chunk) in message.chunks(self.max_recv_size as usize).enumerate() {
            flags.end = index == n_chunks - 1;
            let reply = self
                .call(
                    Procedure::DeviceWrite,
                    rpc::DeviceWriteRequest {
                        link_id: self.link_id,
                        io_timeout,
                        lock_timeout,
                        flags,
                        data: chunk,
                    },
                )
                .await?;
            let size = rpc::unpack_device_write(&reply)?;
            if size < chunk.len() {
                return Err(Error::Connection(format!(
                    "the device accepted {size} of {} bytes",
                    chunk.len()
                )));
            }
            written += size;
        }
        Ok(written)
    }
}
