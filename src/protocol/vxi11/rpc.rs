//! The procedures defined by the VXI-11 specification (Revision 1.0).

use crate::error::{Error, Result};

use super::xdr::{XdrPack, XdrReader};

// program and version numbers, Section B.6
pub const DEVICE_CORE: u32 = 0x0607AF;
pub const DEVICE_CORE_VERSION: u32 = 1;
pub const DEVICE_ASYNC: u32 = 0x0607B0;
pub const DEVICE_ASYNC_VERSION: u32 = 1;

// procedure numbers, Section B.6
#[allow(unused)]
#[repr(u32)]
#[derive(Clone, Copy)]
pub enum Procedure {
    DeviceAbort = 1,
    CreateLink = 10,
    DeviceWrite = 11,
    DeviceRead = 12,
    DeviceReadStb = 13,
    DeviceTrigger = 14,
    DeviceClear = 15,
    DeviceRemote = 16,
    DeviceLocal = 17,
    DeviceLock = 18,
    DeviceUnlock = 19,
    DeviceEnableSrq = 20,
    DeviceDoCmd = 22,
    DestroyLink = 23,
    CreateIntrChan = 25,
    DestroyIntrChan = 26,
    DeviceIntrSrq = 30,
}

// device_read termination reasons, Section B.5.4
pub const REASON_REQCNT: u32 = 1 << 0;
pub const REASON_CHR: u32 = 1 << 1;
pub const REASON_END: u32 = 1 << 2;

/// Additional information concerning how a request is carried out,
/// Section B.5.3.
#[derive(Clone, Copy, Debug, Default)]
pub struct OperationFlags {
    /// Wait for the lock even if the lock timeout elapses
    pub wait_lock: bool,
    /// On a write, send the last byte with the END indicator
    pub end: bool,
    /// On a read, terminate on the requested termination character
    pub termchr_set: bool,
}
impl XdrPack for OperationFlags {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        let mut flags = 0u32;
        if self.wait_lock {
            flags |= 1 << 0;
        }
        if self.end {
            flags |= 1 << 3;
        }
        if self.termchr_set {
            flags |= 1 << 7;
        }
        flags.pack_xdr(out);
    }
}

/// Map the leading error field of a VXI-11 reply, Table B.2. An I/O
/// timeout (code 15) surfaces as a timeout so it stays recoverable.
pub fn check_error(reader: &mut XdrReader<'_>) -> Result<()> {
    let error = reader.u32()?;
    let text = match error {
        0 => return Ok(()),
        1 => "Syntax error",
        3 => "Device not accessible",
        4 => "Invalid link identifier",
        5 => "Parameter error",
        6 => "Channel not established",
        8 => "Operation not supported",
        9 => "Out of resources",
        11 => "Device locked by another link",
        12 => "No lock held by this link",
        15 => return Err(Error::Timeout("I/O timeout [error=15]".to_string())),
        17 => "I/O error",
        21 => "Invalid address",
        23 => "Abort",
        29 => "Channel already established",
        _ => "Undefined error",
    };
    Err(Error::Protocol(format!("{text} [error={error}]")))
}

pub struct CreateLinkRequest<'a> {
    pub client_id: i32,
    pub lock_device: bool,
    /// Time, in milliseconds, to wait on a lock
    pub lock_timeout: u32,
    /// Name of the device to link with, e.g. `inst0`
    pub device: &'a str,
}
impl XdrPack for CreateLinkRequest<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.client_id.pack_xdr(out);
        self.lock_device.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.device.pack_xdr(out);
    }
}

#[derive(Debug)]
pub struct CreateLinkResponse {
    pub link_id: i32,
    /// Port of the Device Async program used for `device_abort`
    pub abort_port: u16,
    /// Largest data size the device accepts on a `device_write`
    pub max_recv_size: u32,
}
impl CreateLinkResponse {
    pub fn unpack(reply: &[u8]) -> Result<Self> {
        let mut reader = XdrReader::new(reply);
        check_error(&mut reader)?;
        Ok(Self {
            link_id: reader.i32()?,
            abort_port: reader.u16()?,
            max_recv_size: reader.u32()?,
        })
    }
}

pub struct DeviceWriteRequest<'a> {
    pub link_id: i32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub data: &'a [u8],
}
impl XdrPack for DeviceWriteRequest<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.link_id.pack_xdr(out);
        self.io_timeout.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.flags.pack_xdr(out);
        self.data.pack_xdr(out);
    }
}

/// The number of bytes the device accepted.
pub fn unpack_device_write(reply: &[u8]) -> Result<usize> {
    let mut reader = XdrReader::new(reply);
    check_error(&mut reader)?;
    Ok(reader.u32()? as usize)
}

pub struct DeviceReadRequest {
    pub link_id: i32,
    pub request_size: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub term_char: u8,
}
impl XdrPack for DeviceReadRequest {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.link_id.pack_xdr(out);
        self.request_size.pack_xdr(out);
        self.io_timeout.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.flags.pack_xdr(out);
        (self.term_char as u32).pack_xdr(out);
    }
}

#[derive(Debug)]
pub struct DeviceReadResponse {
    /// Bitmap of `REASON_*` values describing why the read finished
    pub reason: u32,
    pub data: Vec<u8>,
}
impl DeviceReadResponse {
    pub fn unpack(reply: &[u8]) -> Result<Self> {
        let mut reader = XdrReader::new(reply);
        check_error(&mut reader)?;
        Ok(Self {
            reason: reader.u32()?,
            data: reader.opaque()?.to_vec(),
        })
    }
}

/// The shared argument tuple of `device_clear`, `device_remote`,
/// `device_local` and `device_trigger`.
pub struct GenericParams {
    pub link_id: i32,
    pub flags: OperationFlags,
    pub lock_timeout: u32,
    pub io_timeout: u32,
}
impl XdrPack for GenericParams {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.link_id.pack_xdr(out);
        self.flags.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.io_timeout.pack_xdr(out);
    }
}

/// The status byte returned by `device_readstb`.
pub fn unpack_read_stb(reply: &[u8]) -> Result<u8> {
    let mut reader = XdrReader::new(reply);
    check_error(&mut reader)?;
    Ok(reader.u32()? as u8)
}

pub struct DeviceLockRequest {
    pub link_id: i32,
    pub flags: OperationFlags,
    pub lock_timeout: u32,
}
impl XdrPack for DeviceLockRequest {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.link_id.pack_xdr(out);
        self.flags.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
    }
}

pub struct DeviceEnableSrqRequest<'a> {
    pub link_id: i32,
    pub enable: bool,
    /// Host-specific data, at most 40 bytes
    pub handle: &'a [u8],
}
impl XdrPack for DeviceEnableSrqRequest<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.link_id.pack_xdr(out);
        self.enable.pack_xdr(out);
        self.handle.pack_xdr(out);
    }
}

pub struct DeviceDoCmdRequest<'a> {
    pub link_id: i32,
    pub flags: OperationFlags,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub cmd: i32,
    pub network_order: bool,
    /// Size of an individual data element
    pub datasize: i32,
    pub data_in: &'a [u8],
}
impl XdrPack for DeviceDoCmdRequest<'_> {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.link_id.pack_xdr(out);
        self.flags.pack_xdr(out);
        self.io_timeout.pack_xdr(out);
        self.lock_timeout.pack_xdr(out);
        self.cmd.pack_xdr(out);
        self.network_order.pack_xdr(out);
        self.datasize.pack_xdr(out);
        self.data_in.pack_xdr(out);
    }
}

pub fn unpack_docmd(reply: &[u8]) -> Result<Vec<u8>> {
    let mut reader = XdrReader::new(reply);
    check_error(&mut reader)?;
    Ok(reader.opaque()?.to_vec())
}

pub struct CreateIntrChanRequest {
    pub host_addr: u32,
    pub host_port: u32,
    pub prog_num: u32,
    pub prog_vers: u32,
    pub prog_family: u32,
}
impl XdrPack for CreateIntrChanRequest {
    fn pack_xdr(self, out: &mut Vec<u8>) {
        self.host_addr.pack_xdr(out);
        self.host_port.pack_xdr(out);
        self.prog_num.pack_xdr(out);
        self.prog_vers.pack_xdr(out);
        self.prog_family.pack_xdr(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_flag_bits() {
        let mut out = vec![];
        OperationFlags {
            wait_lock: true,
            end: true,
            termchr_set: true,
        }
        .pack_xdr(&mut out);
        assert_eq!(out, [0, 0, 0, 0x89]);

        let mut out = vec![];
        OperationFlags::default().pack_xdr(&mut out);
        assert_eq!(out, [0, 0, 0, 0]);
    }

    #[test]
    fn device_read_args_layout() {
        let mut out = vec![];
        DeviceReadRequest {
            link_id: 619,
            request_size: 1500,
            io_timeout: 5000,
            lock_timeout: 0,
            flags: OperationFlags {
                termchr_set: true,
                ..Default::default()
            },
            term_char: 0x0A,
        }
        .pack_xdr(&mut out);

        let mut reader = XdrReader::new(&out);
        assert_eq!(reader.i32().unwrap(), 619);
        assert_eq!(reader.u32().unwrap(), 1500);
        assert_eq!(reader.u32().unwrap(), 5000);
        assert_eq!(reader.u32().unwrap(), 0);
        assert_eq!(reader.u32().unwrap(), 0x80);
        assert_eq!(reader.u32().unwrap(), 0x0A);
    }

    #[test]
    fn create_link_response() {
        let mut reply = vec![];
        0u32.pack_xdr(&mut reply); // no error
        619i32.pack_xdr(&mut reply);
        0u32.pack_xdr(&mut reply);
        1500u32.pack_xdr(&mut reply);

        let response = CreateLinkResponse::unpack(&reply).unwrap();
        assert_eq!(response.link_id, 619);
        assert_eq!(response.abort_port, 0);
        assert_eq!(response.max_recv_size, 1500);
    }

    #[test]
    fn error_codes() {
        let mut reply = vec![];
        11u32.pack_xdr(&mut reply);
        let err = check_error(&mut XdrReader::new(&reply)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.to_string().contains("locked by another link"));

        let mut reply = vec![];
        15u32.pack_xdr(&mut reply);
        let err = check_error(&mut XdrReader::new(&reply)).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
