//! GPIB communication through a platform `ib*` library (linux-gpib,
//! NI-488.2 or compatible).
//!
//! The library is loaded once per process. Set the `GPIB_LIBRARY`
//! environment variable to load a specific file, otherwise a list of
//! well-known names is tried.

use std::{
    env,
    ffi::CString,
    os::raw::{c_char, c_int, c_long, c_short},
    sync::OnceLock,
};

use async_trait::async_trait;
use libloading::Library;
use log::debug;

use crate::{
    address::Address,
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings},
    protocol::RenMode,
};

// ibsta status bits
pub const ERR: c_int = 1 << 15;
pub const TIMO: c_int = 1 << 14;
pub const END: c_int = 1 << 13;
pub const SRQI: c_int = 1 << 12;
pub const RQS: c_int = 1 << 11;
pub const CMPL: c_int = 1 << 8;

// ibconfig/ibask options
const IBA_PAD: c_int = 0x1;
const IBA_TMO: c_int = 0x3;
const IBA_SC: c_int = 0xA;
const IBC_SRE: c_int = 0xB;

/// The discrete timeout values supported by `ibtmo`, in seconds, indexed
/// by the timeout constant (T10us = 1 .. T1000s = 17; 0 disables it).
const TIMEOUTS: [f64; 18] = [
    0.0, 10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0,
    30.0, 100.0, 300.0, 1000.0,
];

/// Convert a timeout in seconds into the nearest-not-shorter `ibtmo`
/// constant. `None` or a non-positive value disables the timeout.
fn convert_timeout(value: Option<f64>) -> c_int {
    let Some(value) = value else { return 0 };
    if value <= 0.0 {
        return 0;
    }
    if let Some(index) = TIMEOUTS.iter().position(|&t| t == value) {
        return index as c_int;
    }
    let index = TIMEOUTS.partition_point(|&t| t <= value);
    index.min(TIMEOUTS.len() - 1) as c_int
}

type IbHandleFn = unsafe extern "C" fn(c_int) -> c_int;

/// The resolved symbols of the platform GPIB library.
pub struct GpibLibrary {
    _library: Library,
    ibask: unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int,
    ibclr: IbHandleFn,
    ibcmd: unsafe extern "C" fn(c_int, *const c_char, c_long) -> c_int,
    ibconfig: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    ibdev: unsafe extern "C" fn(c_int, c_int, c_int, c_int, c_int, c_int) -> c_int,
    ibfind: Option<unsafe extern "C" fn(*const c_char) -> c_int>,
    ibln: unsafe extern "C" fn(c_int, c_int, c_int, *mut c_short) -> c_int,
    ibloc: IbHandleFn,
    ibonl: unsafe extern "C" fn(c_int, c_int) -> c_int,
    ibpct: IbHandleFn,
    ibrd: unsafe extern "C" fn(c_int, *mut c_char, c_long) -> c_int,
    ibrsp: unsafe extern "C" fn(c_int, *mut c_char) -> c_int,
    ibsic: IbHandleFn,
    ibtrg: IbHandleFn,
    ibwait: unsafe extern "C" fn(c_int, c_int) -> c_int,
    ibwrt: unsafe extern "C" fn(c_int, *const c_char, c_long) -> c_int,
    thread_iberr: unsafe extern "C" fn() -> c_int,
    thread_ibcnt: unsafe extern "C" fn() -> c_long,
}

// the ib* entry points are thread-safe in every supported implementation
unsafe impl Send for GpibLibrary {}
unsafe impl Sync for GpibLibrary {}

impl GpibLibrary {
    fn candidates() -> Vec<String> {
        if let Ok(library) = env::var("GPIB_LIBRARY") {
            return vec![library];
        }
        let names: &[&str] = if cfg!(target_os = "windows") {
            &["ni4882.dll", "gpib-32.dll"]
        } else if cfg!(target_os = "macos") {
            &[
                "/Library/Frameworks/NI4882.framework/NI4882",
                "libgpib.0.dylib",
            ]
        } else {
            &["libgpib.so.0", "/usr/local/lib/libgpib.so.0", "gpib-32.so"]
        };
        names.iter().map(|n| n.to_string()).collect()
    }

    fn open() -> Result<GpibLibrary> {
        let candidates = Self::candidates();
        let mut last_error = String::new();
        for candidate in &candidates {
            match unsafe { Library::new(candidate) } {
                Ok(library) => return Self::resolve(library),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(Error::Connection(format!(
            "cannot load a GPIB library from {candidates:?} ({last_error}); \
             set the GPIB_LIBRARY environment variable to the library path"
        )))
    }

    fn resolve(library: Library) -> Result<GpibLibrary> {
        macro_rules! symbol {
            ($name:literal) => {
                unsafe {
                    *library.get($name).map_err(|e| {
                        Error::Connection(format!("the GPIB library has no {:?} symbol: {e}", $name))
                    })?
                }
            };
        }

        // ThreadIbcntl is preferred, older libraries only export ThreadIbcnt
        type CountFn = unsafe extern "C" fn() -> c_long;
        let thread_ibcnt = unsafe {
            library
                .get::<CountFn>(b"ThreadIbcntl\0")
                .or_else(|_| library.get::<CountFn>(b"ThreadIbcnt\0"))
                .map(|symbol| *symbol)
                .map_err(|e| {
                    Error::Connection(format!("the GPIB library has no byte counter symbol: {e}"))
                })?
        };
        type FindFn = unsafe extern "C" fn(*const c_char) -> c_int;
        let ibfind = unsafe { library.get::<FindFn>(b"ibfind\0").map(|symbol| *symbol).ok() };

        Ok(GpibLibrary {
            ibask: symbol!(b"ibask\0"),
            ibclr: symbol!(b"ibclr\0"),
            ibcmd: symbol!(b"ibcmd\0"),
            ibconfig: symbol!(b"ibconfig\0"),
            ibdev: symbol!(b"ibdev\0"),
            ibfind,
            ibln: symbol!(b"ibln\0"),
            ibloc: symbol!(b"ibloc\0"),
            ibonl: symbol!(b"ibonl\0"),
            ibpct: symbol!(b"ibpct\0"),
            ibrd: symbol!(b"ibrd\0"),
            ibrsp: symbol!(b"ibrsp\0"),
            ibsic: symbol!(b"ibsic\0"),
            ibtrg: symbol!(b"ibtrg\0"),
            ibwait: symbol!(b"ibwait\0"),
            ibwrt: symbol!(b"ibwrt\0"),
            thread_iberr: symbol!(b"ThreadIberr\0"),
            thread_ibcnt,
            _library: library,
        })
    }
}

/// The process-wide GPIB library.
pub fn gpib_library() -> Result<&'static GpibLibrary> {
    static LIBRARY: OnceLock<Result<GpibLibrary, String>> = OnceLock::new();
    LIBRARY
        .get_or_init(|| GpibLibrary::open().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| Error::Connection(e.clone()))
}

fn iberr_message(iberr: c_int) -> &'static str {
    match iberr {
        0 => "A system call has failed",
        1 => "Your interface board needs to be controller-in-charge, but is not",
        2 => "You have attempted to communicate with a raw device handle",
        3 => "Invalid argument to a function call",
        4 => "Board pointed to by a device descriptor is not system controller",
        5 => "Nonexistent board or no access permission",
        6 => "A read or write of data bytes has been aborted",
        7 => "The GPIB interface board does not exist or its driver is not loaded",
        10 => "Function requires the board to be the system controller",
        11 => "No capability for the requested operation",
        12 => "File system error",
        14 => "An attempt to write command bytes to the bus has timed out",
        15 => "Serial poll status byte lost",
        16 => "SRQ remains asserted",
        20 => "The return buffer is full",
        21 => "Address or board is locked",
        _ => "Unknown error",
    }
}

/// A GPIB board or device behind the platform library.
pub struct GpibProtocol {
    settings: MessageSettings,
    board: u16,
    pad: Option<u8>,
    sad: Option<u8>,
    name: Option<String>,
    /// Assert EOI with the last byte of a write
    pub send_eoi: bool,
    /// End-of-string mode passed to `ibdev`
    pub eos_mode: c_int,
    handle: c_int,
    /// Whether the handle refers to a board (INTFC) rather than a device
    is_board: bool,
}

impl GpibProtocol {
    pub fn new(board: u16, pad: Option<u8>, sad: Option<u8>, name: Option<&str>) -> Self {
        let mut settings = MessageSettings::default();
        // a device signals end-of-message with EOI, termination is opt-in
        settings.read_termination = None;
        Self {
            settings,
            board,
            pad,
            sad,
            name: name.map(str::to_string),
            send_eoi: true,
            eos_mode: 0,
            handle: -1,
            is_board: false,
        }
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        match address {
            Address::Gpib {
                board,
                pad,
                sad,
                name,
            } => Ok(Self::new(*board, *pad, *sad, name.as_deref())),
            _ => Err(Error::AddressParse(format!(
                "{address:?} is not a GPIB address"
            ))),
        }
    }

    pub fn handle(&self) -> c_int {
        self.handle
    }

    /// Check an `ibsta` value, mapping TIMO to a timeout and ERR to a
    /// connection error described by `ThreadIberr`.
    fn check_status(&self, status: c_int, function: &str) -> Result<c_int> {
        debug!("gpib.{function} -> 0x{status:x}");
        if status & TIMO != 0 {
            return Err(Error::Timeout(format!(
                "{function} timed out; if the device does not assert EOI \
                 you may need a read_termination character"
            )));
        }
        if status & ERR != 0 {
            let library = gpib_library()?;
            let iberr = unsafe { (library.thread_iberr)() };
            return Err(Error::Connection(format!(
                "{} [{function}, ibsta:0x{status:x}, iberr:0x{iberr:x}]",
                iberr_message(iberr)
            )));
        }
        Ok(status)
    }

    /// The byte count of the most recent transfer on this thread.
    fn count(&self) -> Result<usize> {
        let library = gpib_library()?;
        Ok(unsafe { (library.thread_ibcnt)() }.max(0) as usize)
    }

    /// Get a configuration value, the `ibask` function.
    pub fn ask(&self, option: c_int) -> Result<c_int> {
        let library = gpib_library()?;
        let mut value: c_int = 0;
        let status = unsafe { (library.ibask)(self.handle, option, &mut value) };
        let _ = self.check_status(status, "ibask")?;
        Ok(value)
    }

    /// Change a configuration value, the `ibconfig` function.
    pub fn config(&self, option: c_int, value: c_int) -> Result<c_int> {
        let library = gpib_library()?;
        let status = unsafe { (library.ibconfig)(self.handle, option, value) };
        self.check_status(status, "ibconfig")
    }

    /// Write GPIB command bytes (ATN asserted), the `ibcmd` function.
    pub fn command(&self, data: &[u8]) -> Result<c_int> {
        let library = gpib_library()?;
        let status =
            unsafe { (library.ibcmd)(self.handle, data.as_ptr().cast(), data.len() as c_long) };
        self.check_status(status, "ibcmd")
    }

    /// Send the Selected Device Clear message, the `ibclr` function.
    pub fn clear(&self) -> Result<c_int> {
        let library = gpib_library()?;
        let status = unsafe { (library.ibclr)(self.handle) };
        self.check_status(status, "ibclr")
    }

    /// Assert interface clear for at least 150 us, the `ibsic` function.
    pub fn interface_clear(&self) -> Result<c_int> {
        let library = gpib_library()?;
        let status = unsafe { (library.ibsic)(self.handle) };
        self.check_status(status, "ibsic")
    }

    /// Go to local mode, the `ibloc` function.
    pub fn local(&self) -> Result<c_int> {
        let library = gpib_library()?;
        let status = unsafe { (library.ibloc)(self.handle) };
        self.check_status(status, "ibloc")
    }

    /// Assert or deassert the Remote Enable line.
    pub fn remote_enable(&self, state: bool) -> Result<c_int> {
        self.config(IBC_SRE, c_int::from(state))
    }

    /// Serial poll this device, the `ibrsp` function.
    pub fn serial_poll(&self) -> Result<u8> {
        let library = gpib_library()?;
        let mut status_byte: c_char = 0;
        let status = unsafe { (library.ibrsp)(self.handle, &mut status_byte) };
        let _ = self.check_status(status, "ibrsp")?;
        Ok(status_byte as u8)
    }

    /// Trigger this device, the `ibtrg` function.
    pub fn trigger(&self) -> Result<c_int> {
        let library = gpib_library()?;
        let status = unsafe { (library.ibtrg)(self.handle) };
        self.check_status(status, "ibtrg")
    }

    /// Wait for one of the events in `mask`, the `ibwait` function.
    pub fn wait(&self, mask: c_int) -> Result<c_int> {
        let library = gpib_library()?;
        let status = unsafe { (library.ibwait)(self.handle, mask) };
        self.check_status(status, "ibwait")
    }

    /// Control the Remote Enable line and the remote/local state.
    pub fn control_ren(&self, mode: RenMode) -> Result<()> {
        use RenMode::*;
        match mode {
            Deassert => {
                let _ = self.remote_enable(false)?;
            }
            Assert | AssertAddress => {
                let _ = self.remote_enable(true)?;
            }
            DeassertGtl => {
                let _ = self.command(b"\x01")?; // GTL
                let _ = self.remote_enable(false)?;
            }
            AssertLlo | AssertAddressLlo => {
                let _ = self.remote_enable(true)?;
                let _ = self.command(b"\x11")?; // LLO
            }
            AddressGtl => {
                let _ = self.command(b"\x01")?; // GTL
            }
        }
        Ok(())
    }

    fn apply_timeout(&mut self) -> Result<()> {
        if self.is_board {
            return Ok(());
        }
        let timeout = self.settings.timeout.map(|t| t.as_secs_f64());
        let _ = self.config(IBA_TMO, convert_timeout(timeout))?;
        // read back the discrete value actually applied
        let index = self.ask(IBA_TMO)? as usize;
        self.settings.timeout = TIMEOUTS
            .get(index)
            .filter(|&&t| t > 0.0)
            .map(|&t| std::time::Duration::from_secs_f64(t));
        Ok(())
    }
}

#[async_trait]
impl Interface for GpibProtocol {
    async fn connect(&mut self) -> Result<()> {
        if self.handle != -1 {
            return Err(Error::Connection("already connected".into()));
        }
        let library = gpib_library()?;

        if let Some(name) = &self.name {
            // a board or device object named in a gpib.conf file
            let Some(ibfind) = library.ibfind else {
                return Err(Error::NotSupported(
                    "the GPIB library has no ibfind symbol".to_string(),
                ));
            };
            let name_c = CString::new(name.as_str())
                .map_err(|_| Error::AddressParse(format!("invalid GPIB name {name:?}")))?;
            let handle = unsafe { ibfind(name_c.as_ptr()) };
            if handle < 0 {
                return Err(Error::Connection(format!(
                    "cannot acquire a handle for the GPIB board/device named {name:?}"
                )));
            }
            self.handle = handle;
        } else if let Some(pad) = self.pad {
            // a device object
            let mut sad = c_int::from(self.sad.unwrap_or(0));
            if sad != 0 && sad < 0x60 {
                sad += 0x60;
            }
            let timeout = convert_timeout(self.settings.timeout.map(|t| t.as_secs_f64()));
            let handle = unsafe {
                (library.ibdev)(
                    c_int::from(self.board),
                    c_int::from(pad),
                    sad,
                    timeout,
                    c_int::from(self.send_eoi),
                    self.eos_mode,
                )
            };
            if handle < 0 {
                return Err(Error::Connection(format!(
                    "cannot acquire a handle for GPIB{}::{pad}",
                    self.board
                )));
            }
            self.handle = handle;
        } else {
            // a board object with the given board number
            self.handle = c_int::from(self.board);
        }

        // asking IbaSC of a device raises EHDL, which identifies a device
        self.is_board = matches!(self.ask(IBA_SC), Ok(value) if value != 0);
        self.apply_timeout()?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.handle == -1 {
            return Ok(());
        }
        // take the handle offline; board handles stay online
        if self.name.is_some() || self.pad.is_some() {
            let library = gpib_library()?;
            let status = unsafe { (library.ibonl)(self.handle, 0) };
            let _ = self.check_status(status, "ibonl");
        }
        self.handle = -1;
        Ok(())
    }
}

#[async_trait]
impl MessageBased for GpibProtocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        const CHUNK_SIZE: usize = 20 * 1024;
        let library = gpib_library()?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut message = vec![];
        loop {
            let status = unsafe {
                (library.ibrd)(self.handle, chunk.as_mut_ptr().cast(), CHUNK_SIZE as c_long)
            };
            let status = self.check_status(status, "ibrd")?;
            message.extend_from_slice(&chunk[..self.count()?.min(CHUNK_SIZE)]);

            if message.len() > self.settings.max_read_size {
                return Err(Error::Connection(format!(
                    "received {} bytes exceeds max_read_size [{}]",
                    message.len(),
                    self.settings.max_read_size
                )));
            }
            // always read until END so the next read starts at a message
            // boundary, then truncate to the requested size
            if status & END != 0 {
                break;
            }
        }
        if let Some(size) = size {
            message.truncate(size);
        }
        Ok(message)
    }

    async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
        let library = gpib_library()?;
        let status = unsafe {
            (library.ibwrt)(
                self.handle,
                message.as_ptr().cast(),
                message.len() as c_long,
            )
        };
        let _ = self.check_status(status, "ibwrt")?;
        self.count()
    }
}

/// Scan every board for devices that answer at a primary (and optionally
/// secondary) GPIB address.
pub fn find_listeners(include_sad: bool) -> Vec<String> {
    let mut devices = vec![];
    let Ok(library) = gpib_library() else {
        return devices;
    };

    for board in 0..16 {
        let mut own_pad: c_int = 0;
        if unsafe { (library.ibask)(board, IBA_PAD, &mut own_pad) } & ERR != 0 {
            continue;
        }

        // the board must be controller-in-charge for ibln to succeed
        let handle = unsafe { (library.ibdev)(board, own_pad, 0, 8, 1, 0) };
        if handle < 0 || unsafe { (library.ibpct)(handle) } & ERR != 0 {
            continue;
        }

        let mut exists: c_short = 0;
        for pad in 0..31 {
            if pad == own_pad {
                continue;
            }
            if unsafe { (library.ibln)(board, pad, 0, &mut exists) } & ERR != 0 {
                continue;
            }
            if exists != 0 {
                devices.push(format!("GPIB{board}::{pad}::INSTR"));
            }
            if include_sad {
                for sad in 96..127 {
                    if unsafe { (library.ibln)(board, pad, sad, &mut exists) } & ERR != 0 {
                        continue;
                    }
                    if exists != 0 {
                        devices.push(format!("GPIB{board}::{pad}::{sad}::INSTR"));
                    }
                }
            }
        }

        unsafe {
            let _ = (library.ibonl)(handle, 0);
        }
    }
    devices
}
