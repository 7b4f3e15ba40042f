//! Protocol session: sequencing, sign-on and device modes.
//!
//! ## Modes
//!
//! ```text
//!            reset()                 sign_off()
//!   None ------------> Firmware  -------------->  Sketch
//!                        ^   |  <--------------
//!                        |   |      reset()
//!  set_firmware_mode()   |   | set_service_mode()
//!                        |   v
//!                       Service
//! ```
//!
//! Block, flash, EEPROM and RAM commands need Firmware mode and a signed-on
//! device. A command issued while signed out, after a failed exchange, or
//! after the device sat idle longer than [`STK500_DEVICE_TIMEOUT`] resets
//! the device and signs on again first.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::fs::BlockDevice;
use crate::fs::volume::{BLOCK_SIZE, Volume};
use crate::port::Port;
use crate::protocol::command::{Command, FLASH_PAGE_SIZE, MAX_TRANSFER, SERVICE_ECHO, ServiceCommand};
use crate::protocol::frame::{MAX_BODY_LEN, ResponseScanner, encode_request};

/// A read that sees no data for this long fails the command.
pub const STK500_READ_TIMEOUT: Duration = Duration::from_millis(2000);

/// Idle time after which the device has left command mode.
pub const STK500_DEVICE_TIMEOUT: Duration = Duration::from_millis(300);

/// Minimum spacing of idle polls by the task engine.
pub const STK500_CMD_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Input drain window after a reset pulse.
pub const RESET_SETTLE: Duration = Duration::from_millis(250);

/// Device operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// Not reset since the port was opened.
    None,
    /// Bootloader command mode.
    Firmware,
    /// The sketch runs; only the raw byte pipe is available.
    Sketch,
    /// Firmware self-reflash protocol.
    Service,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Firmware => "firmware",
            Self::Sketch => "sketch",
            Self::Service => "service",
        })
    }
}

/// Session timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Per-read timeout while waiting for a response.
    pub read_timeout: Duration,
    /// Idle window after which the device is considered timed out.
    pub device_timeout: Duration,
    /// Input drain window after reset.
    pub reset_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_timeout: STK500_READ_TIMEOUT,
            device_timeout: STK500_DEVICE_TIMEOUT,
            reset_settle: RESET_SETTLE,
        }
    }
}

/// One device connection.
pub struct Session {
    port: Box<dyn Port>,
    config: SessionConfig,
    seq: u8,
    mode: Mode,
    signed_on: bool,
    reset_delayed: bool,
    last_exchange: Option<Instant>,
    address: Option<u32>,
    volume: Option<Volume>,
    device_name: Option<String>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("port", &self.port.name())
            .field("seq", &self.seq)
            .field("mode", &self.mode)
            .field("signed_on", &self.signed_on)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap an open port. Nothing is sent until the first command.
    pub fn new(port: Box<dyn Port>, config: SessionConfig) -> Self {
        Self {
            port,
            config,
            seq: 0,
            mode: Mode::None,
            signed_on: false,
            reset_delayed: false,
            last_exchange: None,
            address: None,
            volume: None,
            device_name: None,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Timing in use.
    pub fn config(&self) -> SessionConfig {
        self.config
    }

    /// Name reported by the last sign-on.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// The volume from the last card initialisation.
    pub fn cached_volume(&self) -> Option<Volume> {
        self.volume
    }

    /// Sequence number of the last request.
    pub fn sequence(&self) -> u8 {
        self.seq
    }

    /// The port, for raw access in sketch mode.
    pub fn port_mut(&mut self) -> &mut dyn Port {
        self.port.as_mut()
    }

    /// Change the link speed.
    pub fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        debug!("Switching {} to {baud} baud", self.port.name());
        self.port.set_baud_rate(baud)?;
        self.port.clear_buffers()
    }

    /// Whether a sign-on handshake succeeded since the last reset.
    pub fn is_signed_on(&self) -> bool {
        self.signed_on
    }

    /// Whether the device sat idle long enough to leave command mode.
    pub fn is_timeout(&self) -> bool {
        self.last_exchange
            .is_none_or(|at| at.elapsed() > self.config.device_timeout)
    }

    /// Pulse the reset line and find out which mode the device booted into.
    pub fn reset(&mut self) -> Result<()> {
        debug!("Resetting device on {}", self.port.name());
        self.port.pulse_reset()?;
        let boot = self.port.read_all(self.config.reset_settle)?;
        trace!("Boot output: {boot:02X?}");

        self.mode = if boot
            .windows(SERVICE_ECHO.len())
            .any(|w| w == SERVICE_ECHO)
        {
            Mode::Service
        } else {
            Mode::Firmware
        };
        self.signed_on = false;
        self.reset_delayed = false;
        self.last_exchange = None;
        self.address = None;
        self.volume = None;
        debug!("Device booted into {} mode", self.mode);
        Ok(())
    }

    /// Perform the sign-on handshake.
    pub fn sign_on(&mut self) -> Result<String> {
        let reply = self.exchange(Command::SignOn.code(), &[])?;
        let name = String::from_utf8_lossy(&reply)
            .trim_end_matches('\0')
            .to_string();
        if !self.signed_on {
            info!("Signed on to {name}");
        }
        self.signed_on = true;
        self.device_name = Some(name.clone());
        Ok(name)
    }

    /// Reset and sign on unless the device is ready for commands.
    pub fn ensure_signed_on(&mut self) -> Result<()> {
        if self.mode == Mode::Firmware && self.signed_on && !self.reset_delayed && !self.is_timeout() {
            return Ok(());
        }
        if self.mode == Mode::Service {
            return Err(Error::Unsupported(
                "device is in service mode; leave it before sending commands".into(),
            ));
        }
        self.reset()?;
        if self.mode == Mode::Service {
            return Err(Error::Unsupported("device booted into service mode".into()));
        }
        self.sign_on()?;
        Ok(())
    }

    /// Keep-alive: exchange a sign-on while the device is still in command
    /// mode. A timed-out device has fallen back to the sketch, so nothing is
    /// sent and the next command resets it. A failed ping drops the sign-on
    /// the same way.
    pub fn ping(&mut self) -> Result<()> {
        if self.mode != Mode::Firmware || !self.signed_on {
            return Ok(());
        }
        if self.is_timeout() {
            debug!("Device timed out; keep-alive skipped");
            self.signed_on = false;
            return Ok(());
        }
        self.sign_on().map(|_| ()).inspect_err(|_| {
            self.signed_on = false;
        })
    }

    /// Leave command mode; the sketch starts running.
    pub fn sign_off(&mut self) -> Result<()> {
        if self.mode == Mode::Firmware && self.signed_on {
            self.exchange(Command::LeaveProgmode.code(), &[])?;
        }
        self.signed_on = false;
        self.address = None;
        self.volume = None;
        self.mode = Mode::Sketch;
        info!("Device left command mode");
        Ok(())
    }

    /// Run the sketch, leaving only the raw byte pipe.
    pub fn set_sketch_mode(&mut self) -> Result<()> {
        match self.mode {
            Mode::Sketch => Ok(()),
            Mode::Service => {
                self.set_firmware_mode()?;
                self.sign_off()
            },
            Mode::None | Mode::Firmware => {
                self.ensure_signed_on()?;
                self.sign_off()
            },
        }
    }

    /// Reboot into service mode.
    ///
    /// The request is stored in the settings block; the device sees it on
    /// boot and announces service mode with its echo.
    pub fn set_service_mode(&mut self) -> Result<()> {
        if self.mode == Mode::Service {
            return Ok(());
        }
        self.ensure_signed_on()?;
        let mut settings = crate::settings::DeviceSettings::read(self)?;
        settings.service_requested = true;
        settings.write(self)?;
        self.reset()?;
        if self.mode != Mode::Service {
            return Err(Error::Protocol("device did not enter service mode".into()));
        }
        info!("Device in service mode");
        Ok(())
    }

    /// Write one firmware page while in service mode.
    pub fn service_program(&mut self, address: u32, page: &[u8]) -> Result<()> {
        if self.mode != Mode::Service {
            return Err(Error::Unsupported("not in service mode".into()));
        }
        if page.len() > FLASH_PAGE_SIZE {
            return Err(Error::Unsupported(format!(
                "page of {} bytes exceeds {FLASH_PAGE_SIZE}",
                page.len()
            )));
        }
        let mut payload = Vec::with_capacity(4 + page.len());
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(page);
        self.exchange(ServiceCommand::Program.code(), &payload)
            .map(|_| ())
    }

    /// Leave service mode and boot back into firmware mode.
    pub fn set_firmware_mode(&mut self) -> Result<()> {
        if self.mode == Mode::Service {
            self.exchange(ServiceCommand::Exit.code(), &[])?;
            self.reset()?;
            if self.mode == Mode::Service {
                return Err(Error::Protocol("device stayed in service mode".into()));
            }
        }
        self.ensure_signed_on()
    }

    /// Send one raw frame and wait for its response.
    fn exchange(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let frame = encode_request(seq, cmd, payload);
        trace!("TX seq={seq} cmd=0x{cmd:02X} len={}", payload.len());

        let result = self.transact(seq, cmd, &frame);
        match &result {
            Ok(_) => self.last_exchange = Some(Instant::now()),
            Err(e) => {
                warn!("Command 0x{cmd:02X} failed: {e}");
                self.reset_delayed = true;
            },
        }
        result
    }

    fn transact(&mut self, seq: u8, cmd: u8, frame: &[u8]) -> Result<Vec<u8>> {
        self.port.write_all_bytes(frame)?;
        let mut scanner = ResponseScanner::new(seq, cmd);
        let mut buf = [0u8; MAX_BODY_LEN + 8];
        let deadline = Instant::now() + self.config.read_timeout * 4;
        loop {
            let n = self.port.read_timeout(&mut buf, self.config.read_timeout)?;
            if n == 0 || Instant::now() > deadline {
                return Err(scanner.failure());
            }
            if let Some(result) = scanner.push(&buf[..n]) {
                if let Ok(reply) = &result {
                    trace!("RX seq={seq} cmd=0x{cmd:02X} len={}", reply.len());
                }
                return result;
            }
        }
    }

    /// Send a firmware-mode command, signing on first when needed.
    pub fn command(&mut self, cmd: Command, payload: &[u8]) -> Result<Vec<u8>> {
        self.ensure_signed_on()?;
        self.exchange(cmd.code(), payload)
    }

    /// Set the device address register, skipping the command when the
    /// cached value already matches.
    pub fn load_address(&mut self, address: u32) -> Result<()> {
        self.ensure_signed_on()?;
        if self.address == Some(address) {
            return Ok(());
        }
        self.address = None;
        self.command(Command::LoadAddress, &address.to_be_bytes())?;
        self.address = Some(address);
        Ok(())
    }

    fn sized(&mut self, cmd: Command, address: u32, step: u32, payload: &[u8]) -> Result<Vec<u8>> {
        self.load_address(address)?;
        let result = self.command(cmd, payload);
        self.address = match (&result, self.address) {
            (Ok(_), Some(at)) if cmd.advances_address() => Some(at.wrapping_add(step)),
            _ => None,
        };
        result
    }

    fn check_len(len: usize) -> Result<u16> {
        if len == 0 || len > MAX_TRANSFER {
            return Err(Error::Unsupported(format!(
                "transfer of {len} bytes (limit {MAX_TRANSFER})"
            )));
        }
        Ok(len as u16)
    }

    fn read_sized(&mut self, cmd: Command, address: u32, len: usize) -> Result<Vec<u8>> {
        let size = Self::check_len(len)?;
        let data = self.sized(cmd, address, u32::from(size), &size.to_be_bytes())?;
        if data.len() != len {
            self.reset_delayed = true;
            return Err(Error::Protocol(format!(
                "expected {len} bytes from command 0x{:02X}, got {}",
                cmd.code(),
                data.len()
            )));
        }
        Ok(data)
    }

    fn write_sized(&mut self, cmd: Command, address: u32, data: &[u8], extra: &[u8]) -> Result<()> {
        let size = Self::check_len(data.len())?;
        let mut payload = Vec::with_capacity(2 + data.len() + extra.len());
        payload.extend_from_slice(&size.to_be_bytes());
        payload.extend_from_slice(data);
        payload.extend_from_slice(extra);
        self.sized(cmd, address, u32::from(size), &payload)
            .map(|_| ())
    }

    /// Initialise the card and read its geometry.
    pub fn sd_init(&mut self) -> Result<Volume> {
        let record = self.command(Command::SdInit, &[])?;
        let volume = Volume::decode(&record)?;
        debug!("Card initialised: {volume:?}");
        self.volume = Some(volume);
        Ok(volume)
    }

    fn ensure_card(&mut self) -> Result<()> {
        self.ensure_signed_on()?;
        if self.volume.is_none() {
            self.sd_init()?;
        }
        Ok(())
    }

    /// Read one card block.
    pub fn sd_read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.ensure_card()?;
        let data = self.sized(Command::SdRead, block, 1, &[])?;
        if data.len() != BLOCK_SIZE {
            self.reset_delayed = true;
            return Err(Error::Protocol(format!(
                "short block read ({} bytes)",
                data.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    /// Write one card block.
    pub fn sd_write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.ensure_card()?;
        self.sized(Command::SdWrite, block, 1, buf)
            .map(|_| ())
    }

    /// Read `len` bytes of flash.
    pub fn flash_read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.read_sized(Command::ReadFlash, address, len)
    }

    /// Program one flash page at `address`.
    pub fn flash_write_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if data.len() > FLASH_PAGE_SIZE {
            return Err(Error::Unsupported(format!(
                "page of {} bytes exceeds {FLASH_PAGE_SIZE}",
                data.len()
            )));
        }
        self.write_sized(Command::ProgramFlash, address, data, &[])
    }

    /// Read EEPROM bytes.
    pub fn eeprom_read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.read_sized(Command::ReadEeprom, address, len)
    }

    /// Write EEPROM bytes.
    pub fn eeprom_write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.write_sized(Command::ProgramEeprom, address, data, &[])
    }

    /// Read RAM bytes.
    pub fn ram_read(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        self.read_sized(Command::RamRead, address, len)
    }

    /// Write RAM bits selected by `mask` (one mask byte per data byte).
    pub fn ram_write(&mut self, address: u32, data: &[u8], mask: &[u8]) -> Result<()> {
        if mask.len() != data.len() {
            return Err(Error::Unsupported("RAM write mask length differs from data".into()));
        }
        self.write_sized(Command::RamWrite, address, data, mask)
    }

    /// Sample analog pin `pin` (10-bit).
    pub fn analog_read(&mut self, pin: u8) -> Result<u16> {
        let reply = self.command(Command::AnalogRead, &[pin])?;
        match reply.as_slice() {
            [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
            other => Err(Error::Protocol(format!(
                "analog reply of {} bytes",
                other.len()
            ))),
        }
    }

    /// Clock `tx` out over SPI and return what came back.
    pub fn spi_transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>> {
        let len = u8::try_from(tx.len())
            .map_err(|_| Error::Unsupported("SPI transfer longer than 255 bytes".into()))?;
        let mut payload = Vec::with_capacity(1 + tx.len());
        payload.push(len);
        payload.extend_from_slice(tx);
        let rx = self.command(Command::SpiMulti, &payload)?;
        if rx.len() != tx.len() {
            return Err(Error::Protocol(format!(
                "SPI returned {} bytes for {}",
                rx.len(),
                tx.len()
            )));
        }
        Ok(rx)
    }

    /// The three signature bytes, read with ISP `0x30` instructions.
    pub fn device_signature(&mut self) -> Result<[u8; 3]> {
        let mut signature = [0u8; 3];
        for (i, byte) in signature.iter_mut().enumerate() {
            let rx = self.spi_transfer(&[0x30, 0x00, i as u8, 0x00])?;
            *byte = rx[3];
        }
        Ok(signature)
    }

    /// Sign off and release the port.
    pub fn close(&mut self) -> Result<()> {
        if self.mode == Mode::Firmware && self.signed_on {
            if let Err(e) = self.sign_off() {
                debug!("Sign-off on close failed: {e}");
            }
        }
        self.mode = Mode::None;
        self.port.close()
    }
}

impl BlockDevice for Session {
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.sd_read_block(block, buf)
    }

    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.sd_write_block(block, buf)
    }

    fn init_volume(&mut self) -> Result<Volume> {
        self.ensure_signed_on()?;
        self.sd_init()
    }

    fn recover(&mut self) -> Result<()> {
        self.reset_delayed = true;
        self.ensure_card()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::memory::{FormatOptions, MemoryCard};
    use crate::port::VirtualDevice;
    use crate::protocol::frame::{encode_response, STATUS_CMD_OK};

    fn fast() -> SessionConfig {
        SessionConfig {
            read_timeout: Duration::from_millis(200),
            device_timeout: Duration::from_secs(60),
            reset_settle: Duration::from_millis(30),
        }
    }

    fn session() -> (Session, VirtualDevice) {
        let device = VirtualDevice::new(MemoryCard::format(&FormatOptions::fat16(2048, 1)));
        (Session::new(Box::new(device.clone()), fast()), device)
    }

    #[test]
    fn test_first_command_resets_and_signs_on() {
        let (mut session, _device) = session();
        assert_eq!(session.mode(), Mode::None);
        session.ensure_signed_on().unwrap();
        assert_eq!(session.mode(), Mode::Firmware);
        assert!(session.is_signed_on());
        assert_eq!(session.device_name(), Some("SDLINK_1"));
    }

    #[test]
    fn test_load_address_is_cached() {
        let (mut session, device) = session();
        session.eeprom_write(0x40, &[1, 2, 3, 4]).unwrap();
        let loads = device.stats().address_loads;
        // The device advanced to 0x44; continuing there needs no load.
        session.eeprom_write(0x44, &[5, 6]).unwrap();
        assert_eq!(device.stats().address_loads, loads);
        session.eeprom_write(0x40, &[9]).unwrap();
        assert_eq!(device.stats().address_loads, loads + 1);
        assert_eq!(session.eeprom_read(0x40, 6).unwrap(), vec![9, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_block_roundtrip() {
        let (mut session, _device) = session();
        let mut block = [0u8; BLOCK_SIZE];
        block[..5].copy_from_slice(b"block");
        session.sd_write_block(300, &block).unwrap();
        let mut back = [0u8; BLOCK_SIZE];
        session.sd_read_block(300, &mut back).unwrap();
        assert_eq!(&back[..5], b"block");
        assert_eq!(session.cached_volume().map(|v| v.data_start_block), Some(49));
    }

    #[test]
    fn test_sequence_wraps() {
        let (mut session, _device) = session();
        session.ensure_signed_on().unwrap();
        for _ in 0..300 {
            session.analog_read(0).unwrap();
        }
        // One sign-on plus 300 reads.
        assert_eq!(session.sequence(), (301 % 256) as u8);
    }

    #[test]
    fn test_stale_sequence_is_rejected() {
        let (mut session, device) = session();
        session.ensure_signed_on().unwrap();
        let next = session.sequence().wrapping_add(1);
        // A well-formed answer for the wrong sequence number arrives first.
        device.inject_response(encode_response(next.wrapping_sub(1), Command::SignOn.code(), STATUS_CMD_OK, b"X"));
        device.drop_next_response();
        let err = session.sign_on().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)), "{err}");
        assert!(err.to_string().contains("sequence"));

        // The failure schedules a reset, after which commands work again.
        session.analog_read(1).unwrap();
    }

    #[test]
    fn test_device_error_status() {
        let (mut session, _device) = session();
        let err = session.analog_read(200).unwrap_err();
        assert!(matches!(err, Error::Device { command: 0xA5, .. }));
    }

    #[test]
    fn test_masked_ram_write() {
        let (mut session, _device) = session();
        session.ram_write(0x100, &[0xFF, 0xFF], &[0xFF, 0xFF]).unwrap();
        session.ram_write(0x100, &[0x00, 0x0F], &[0xF0, 0x0F]).unwrap();
        assert_eq!(session.ram_read(0x100, 2).unwrap(), vec![0x0F, 0xFF]);
    }

    #[test]
    fn test_signature_and_spi() {
        let (mut session, _device) = session();
        assert_eq!(session.device_signature().unwrap(), [0x1E, 0x98, 0x01]);
    }

    #[test]
    fn test_sketch_mode_blocks_until_reset() {
        let (mut session, device) = session();
        session.set_sketch_mode().unwrap();
        assert_eq!(session.mode(), Mode::Sketch);
        assert!(device.sketch_running());
        // Commands bring the device back through a reset.
        session.analog_read(0).unwrap();
        assert_eq!(session.mode(), Mode::Firmware);
    }

    #[test]
    fn test_service_mode_roundtrip() {
        let (mut session, device) = session();
        session.set_service_mode().unwrap();
        assert_eq!(session.mode(), Mode::Service);
        assert!(matches!(session.analog_read(0), Err(Error::Unsupported(_))));

        session.service_program(0, &[0xAB; 16]).unwrap();
        session.set_firmware_mode().unwrap();
        assert_eq!(session.mode(), Mode::Firmware);
        assert_eq!(&device.firmware()[..16], &[0xAB; 16]);
    }

    #[test]
    fn test_recover_reinitialises_card() {
        let (mut session, _device) = session();
        let mut buf = [0u8; BLOCK_SIZE];
        session.sd_read_block(0, &mut buf).unwrap();
        session.recover().unwrap();
        assert!(session.cached_volume().is_some());
    }
    /// Two sessions on one device; the second puts the sketch back in charge.
    fn fallen_back(device_timeout: Duration) -> (Session, VirtualDevice) {
        let (mut session, device) = session();
        session.config.device_timeout = device_timeout;
        session.ensure_signed_on().unwrap();
        let mut other = Session::new(Box::new(device.clone()), fast());
        other.set_sketch_mode().unwrap();
        assert!(device.sketch_running());
        (session, device)
    }

    #[test]
    fn test_ping_after_timeout_sends_nothing() {
        let (mut session, device) = fallen_back(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(80));
        assert!(session.is_timeout());

        let commands = device.stats().commands;
        for _ in 0..3 {
            session.ping().unwrap();
        }
        assert!(!session.is_signed_on());
        assert_eq!(device.stats().commands, commands);
        assert!(device.sketch_running());

        // The next command resets the device back into command mode.
        session.analog_read(0).unwrap();
        assert!(session.is_signed_on());
        assert!(!device.sketch_running());
    }

    #[test]
    fn test_failed_ping_drops_sign_on() {
        let (mut session, device) = fallen_back(Duration::from_secs(60));
        assert!(session.ping().is_err());
        assert!(!session.is_signed_on());

        // Later pings stay quiet until a command signs on again.
        let resets = device.stats().resets;
        session.ping().unwrap();
        assert_eq!(device.stats().resets, resets);
        session.analog_read(0).unwrap();
        assert_eq!(device.stats().resets, resets + 1);
    }
}
