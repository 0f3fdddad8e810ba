//! Prologix GPIB-USB and GPIB-ETHERNET controller support.
//!
//! One Prologix controller multiplexes up to 31 GPIB instruments behind a
//! single serial or TCP channel. All instrument connections in the
//! process that use the same controller share one transport and one lock;
//! the GPIB address the controller has selected is tracked next to the
//! transport so an instrument re-addresses the bus only when needed.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use log::debug;

use crate::{
    address::Address,
    error::{Error, Result},
    message::{Interface, MessageBased, MessageSettings},
    protocol::{serial::SerialProtocol, socket::SocketProtocol},
    transport::SerialConfig,
};

const ESC: u8 = 0x1B;

/// Controller-level settings written during initialisation. The
/// controller applies them to every instrument it addresses.
#[derive(Clone, Debug)]
pub struct PrologixConfig {
    /// 1 = CONTROLLER, 0 = DEVICE
    pub mode: u8,
    /// Assert EOI with the last byte of a write
    pub eoi: bool,
    /// GPIB termination appended by the controller: 0 CR+LF, 1 CR, 2 LF,
    /// 3 none
    pub eos: u8,
    /// Character appended to replies when `eot_enable` is set and EOI was
    /// detected
    pub eot_char: u8,
    pub eot_enable: bool,
    /// Inter-character timeout, in milliseconds, for read and spoll;
    /// must be within [1, 3000]
    pub read_tmo_ms: u16,
    pub serial: SerialConfig,
}
impl Default for PrologixConfig {
    fn default() -> Self {
        Self {
            mode: 1,
            eoi: true,
            eos: 3,
            eot_char: 0,
            eot_enable: false,
            read_tmo_ms: 100,
            serial: SerialConfig::default(),
        }
    }
}

/// The transport of one controller together with the GPIB address it has
/// currently selected. Guarded by one lock so a select-then-write pair is
/// never interleaved with another instrument.
struct ControllerState {
    inner: Box<dyn MessageBased>,
    /// The most recent `++addr` command, empty when unknown
    selected: Vec<u8>,
    initialized: bool,
}

type SharedController = Arc<tokio::sync::Mutex<ControllerState>>;

/// All Prologix controllers in use by this process, keyed by their
/// hardware address.
fn registry() -> &'static Mutex<HashMap<String, SharedController>> {
    static CONTROLLERS: OnceLock<Mutex<HashMap<String, SharedController>>> = OnceLock::new();
    CONTROLLERS.get_or_init(Mutex::default)
}

fn controller_for(
    hw_address: &str,
    enet_port: Option<u16>,
    config: &PrologixConfig,
) -> SharedController {
    let key = match enet_port {
        Some(port) => format!("{hw_address}:{port}"),
        None => hw_address.to_string(),
    };
    let mut registry = registry().lock().expect("controller registry poisoned");
    registry
        .entry(key)
        .or_insert_with(|| {
            let inner: Box<dyn MessageBased> = match enet_port {
                Some(port) => Box::new(SocketProtocol::new(hw_address, port, false)),
                None => Box::new(SerialProtocol::new(hw_address, config.serial.clone())),
            };
            Arc::new(tokio::sync::Mutex::new(ControllerState {
                inner,
                selected: vec![],
                initialized: false,
            }))
        })
        .clone()
}

/// Prefix every `LF`, `CR`, `ESC` and `+` byte with `ESC` so the
/// controller forwards them to the instrument instead of consuming them.
fn escape(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len());
    for &byte in message {
        if matches!(byte, b'\n' | b'\r' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(byte);
    }
    out
}

/// A connection to one GPIB instrument behind a Prologix controller.
pub struct PrologixProtocol {
    hw_address: String,
    enet_port: Option<u16>,
    pad: u8,
    sad: Option<u8>,
    /// The `++addr` command that selects this instrument
    addr_command: Vec<u8>,
    config: PrologixConfig,
    /// Termination for the instrument, distinct from the controller's
    /// unescaped `\n` message terminator
    instrument_termination: Option<Vec<u8>>,
    escape_characters: bool,
    /// `None` sends `++read eoi`, otherwise `++read <char>`
    read_char: Option<u8>,
    settings: MessageSettings,
    controller: Option<SharedController>,
}

impl PrologixProtocol {
    pub fn new(hw_address: &str, enet_port: Option<u16>, pad: u8, sad: Option<u8>) -> Self {
        let addr_command = match sad {
            Some(sad) => format!("++addr {pad} {sad}\n").into_bytes(),
            None => format!("++addr {pad}\n").into_bytes(),
        };
        let mut settings = MessageSettings::default();
        // termination is handled here, not by the shared write helper:
        // instrument termination must be escaped, the controller's must not
        settings.write_termination = None;

        Self {
            hw_address: hw_address.to_string(),
            enet_port,
            pad,
            sad,
            addr_command,
            config: PrologixConfig::default(),
            instrument_termination: Some(b"\r\n".to_vec()),
            escape_characters: true,
            read_char: None,
            settings,
            controller: None,
        }
    }

    pub fn from_address(address: &Address) -> Result<Self> {
        match address {
            Address::Prologix {
                hw_address,
                enet_port,
                pad,
                sad,
            } => Ok(Self::new(hw_address, *enet_port, *pad, *sad)),
            _ => Err(Error::AddressParse(format!(
                "{address:?} is not a Prologix address"
            ))),
        }
    }

    pub fn pad(&self) -> u8 {
        self.pad
    }

    pub fn sad(&self) -> Option<u8> {
        self.sad
    }

    pub fn config_mut(&mut self) -> &mut PrologixConfig {
        &mut self.config
    }

    /// Whether `LF`, `CR`, `ESC` and `+` bytes are escaped before a write.
    pub fn set_escape_characters(&mut self, enable: bool) {
        self.escape_characters = enable;
    }

    /// Termination appended for the instrument (escaped on the wire).
    pub fn set_instrument_termination(&mut self, termination: Option<&[u8]>) {
        self.instrument_termination = termination.map(<[u8]>::to_vec);
    }

    /// The character used by the `++read` command; `None` reads until EOI.
    pub fn set_read_char(&mut self, char: Option<u8>) {
        self.read_char = char;
    }

    fn controller(&self) -> Result<SharedController> {
        self.controller
            .clone()
            .ok_or_else(|| Error::Connection("disconnected from the Prologix controller".into()))
    }

    /// Copy the per-instrument read settings onto the shared controller
    /// connection before using it.
    fn apply_settings(&self, state: &mut ControllerState) {
        let inner = state.inner.settings_mut();
        inner.timeout = self.settings.timeout;
        inner.read_termination = self.settings.read_termination.clone();
        inner.max_read_size = self.settings.max_read_size;
        inner.encoding = self.settings.encoding;
        // the controller consumes an unescaped LF as its own terminator
        inner.write_termination = Some(b"\n".to_vec());
    }

    /// Select this instrument on the bus if another one is selected.
    async fn ensure_selected(&self, state: &mut ControllerState) -> Result<()> {
        if state.selected != self.addr_command {
            debug!("selecting {}", String::from_utf8_lossy(&self.addr_command).trim_end());
            state.selected = self.addr_command.clone();
            let command = self.addr_command.clone();
            let _ = (state.inner.as_mut() as &mut dyn MessageBased)
                .write(command)
                .await?;
        }
        Ok(())
    }

    /// Send a `++` command straight to the controller, bypassing address
    /// selection. A trailing `\n` is added when missing.
    pub async fn write_controller(&mut self, command: &[u8]) -> Result<usize> {
        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        let mut command = command.to_vec();
        if !command.ends_with(b"\n") {
            command.push(b'\n');
        }
        (state.inner.as_mut() as &mut dyn MessageBased).write(command).await
    }

    /// Send a `++` command and read the controller's reply.
    pub async fn query_controller(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        self.ensure_selected(&mut state).await?;
        let mut command = command.to_vec();
        if !command.ends_with(b"\n") {
            command.push(b'\n');
        }
        (state.inner.as_mut() as &mut dyn MessageBased)
            .query(command, None)
            .await
    }

    /// Send the Selected Device Clear command to this instrument.
    pub async fn clear(&mut self) -> Result<()> {
        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        self.ensure_selected(&mut state).await?;
        let _ = (state.inner.as_mut() as &mut dyn MessageBased)
            .write(b"++clr\n".to_vec())
            .await?;
        Ok(())
    }

    /// Enable front-panel operation of this instrument.
    pub async fn local(&mut self) -> Result<()> {
        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        self.ensure_selected(&mut state).await?;
        let _ = (state.inner.as_mut() as &mut dyn MessageBased)
            .write(b"++loc\n".to_vec())
            .await?;
        Ok(())
    }

    /// `true` sends the instrument to remote mode with local lockout,
    /// `false` returns it to local mode.
    pub async fn remote_enable(&mut self, state_on: bool) -> Result<()> {
        if !state_on {
            return self.local().await;
        }
        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        self.ensure_selected(&mut state).await?;
        let _ = (state.inner.as_mut() as &mut dyn MessageBased)
            .write(b"++llo\n".to_vec())
            .await?;
        Ok(())
    }

    /// Assert the interface-clear line, resetting the GPIB bus.
    pub async fn interface_clear(&mut self) -> Result<()> {
        let _ = self.write_controller(b"++ifc").await?;
        Ok(())
    }

    /// Power-on reset of the controller. It takes about five seconds for
    /// the hardware to reboot.
    pub async fn reset_controller(&mut self) -> Result<()> {
        let _ = self.write_controller(b"++rst").await?;
        Ok(())
    }

    /// Trigger this instrument.
    pub async fn trigger(&mut self) -> Result<()> {
        let command = match self.sad {
            Some(sad) => format!("++trg {} {sad}", self.pad),
            None => format!("++trg {}", self.pad),
        };
        let _ = self.write_controller(command.as_bytes()).await?;
        Ok(())
    }

    /// Send a Group Execute Trigger to up to 15 addresses. With no
    /// address the currently-addressed instrument is triggered.
    pub async fn group_execute_trigger(&mut self, addresses: &[u8]) -> Result<()> {
        if addresses.len() > 15 {
            return Err(Error::Protocol(format!(
                "at most 15 addresses may be triggered, got {}",
                addresses.len()
            )));
        }
        let mut command = String::from("++trg");
        for address in addresses {
            command.push(' ');
            command.push_str(&address.to_string());
        }
        let _ = self.write_controller(command.as_bytes()).await?;
        Ok(())
    }

    /// Read the status byte of this instrument (serial poll).
    pub async fn serial_poll(&mut self) -> Result<u8> {
        let command = match self.sad {
            Some(sad) => format!("++spoll {} {sad}", self.pad),
            None => format!("++spoll {}", self.pad),
        };
        let reply = self.query_controller(command.as_bytes()).await?;
        let text = String::from_utf8_lossy(&reply);
        text.trim()
            .parse()
            .map_err(|_| Error::Protocol(format!("cannot parse the serial-poll reply {text:?}")))
    }

    /// Poll the SRQ line until it is asserted, then serial poll. `delay`
    /// is the pause between polls and `timeout` bounds the whole wait.
    pub async fn wait_for_srq(&mut self, delay: Duration, timeout: Option<Duration>) -> Result<u8> {
        let budget = crate::message::TimeBudget::new(timeout);
        loop {
            let _ = budget.remaining()?;
            let reply = self.query_controller(b"++srq").await?;
            if String::from_utf8_lossy(&reply).trim() == "1" {
                return self.serial_poll().await;
            }
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Interface for PrologixProtocol {
    async fn connect(&mut self) -> Result<()> {
        let controller = controller_for(&self.hw_address, self.enet_port, &self.config);
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);

        if !state.initialized {
            state.inner.connect().await?;

            let config = self.config.clone();
            let inner = state.inner.as_mut() as &mut dyn MessageBased;
            let _ = inner.write(format!("++mode {}", config.mode)).await?;
            let _ = inner.write(format!("++eoi {}", u8::from(config.eoi))).await?;
            let _ = inner.write(format!("++eos {}", config.eos)).await?;
            let _ = inner.write(format!("++eot_char {}", config.eot_char)).await?;
            let _ = inner
                .write(format!("++eot_enable {}", u8::from(config.eot_enable)))
                .await?;
            if config.mode == 1 {
                let _ = inner
                    .write(format!("++read_tmo_ms {}", config.read_tmo_ms))
                    .await?;
            }
            state.initialized = true;
        }

        self.ensure_selected(&mut state).await?;
        drop(state);
        self.controller = Some(controller);
        Ok(())
    }

    /// Forget the controller handle. The underlying serial or TCP
    /// connection stays open because other instruments may still be
    /// attached to the same controller.
    async fn disconnect(&mut self) -> Result<()> {
        let _ = self.controller.take();
        Ok(())
    }
}

#[async_trait]
impl MessageBased for PrologixProtocol {
    fn settings(&self) -> &MessageSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut MessageSettings {
        &mut self.settings
    }

    async fn raw_read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let command: Vec<u8> = match self.read_char {
            None => b"++read eoi\n".to_vec(),
            Some(char) => format!("++read {char}\n").into_bytes(),
        };

        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        self.ensure_selected(&mut state).await?;
        let inner = state.inner.as_mut() as &mut dyn MessageBased;
        let _ = inner.write(command).await?;
        inner.read(size).await
    }

    async fn raw_write(&mut self, message: &[u8]) -> Result<usize> {
        if message.starts_with(b"++") {
            return self.write_controller(message).await;
        }

        let mut message = message.to_vec();
        if let Some(termination) = &self.instrument_termination {
            if !termination.is_empty() && !message.ends_with(termination.as_slice()) {
                message.extend_from_slice(termination);
            }
        }
        if self.escape_characters {
            message = escape(&message);
        }

        let controller = self.controller()?;
        let mut state = controller.lock().await;
        self.apply_settings(&mut state);
        self.ensure_selected(&mut state).await?;
        // an unescaped LF tells the controller the message is complete
        message.push(b'\n');
        (state.inner.as_mut() as &mut dyn MessageBased).write(message).await
    }
}

impl PrologixProtocol {
    /// Read a message from this instrument. A `++read eoi|<char>` command
    /// is issued first so the controller starts listening.
    pub async fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        (self as &mut dyn MessageBased).read(size).await
    }

    /// Write a message to this instrument, appending the instrument
    /// termination and escaping control bytes.
    pub async fn write(&mut self, message: &[u8]) -> Result<usize> {
        (self as &mut dyn MessageBased).write(message).await
    }

    /// A write followed by a read.
    pub async fn query(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let _ = self.write(message).await?;
        self.read(None).await
    }
}
