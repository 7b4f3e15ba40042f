//! In-process device emulator.
//!
//! [`VirtualDevice`] implements [`Port`] and answers framed requests the way
//! the board's bootloader does, over a [`MemoryCard`] and plain flash,
//! EEPROM and RAM arrays. Clones share the same device, so a test can keep
//! one clone to inspect state while a session owns another.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::error::Result;
use crate::fs::memory::MemoryCard;
use crate::fs::volume::BLOCK_SIZE;
use crate::fs::{BlockDevice, FatFs};
use crate::port::Port;
use crate::protocol::command::{Command, SERVICE_ECHO, ServiceCommand};
use crate::protocol::frame::{
    RawFrame, RequestScanner, STATUS_CMD_FAILED, STATUS_CMD_OK, STATUS_CMD_UNKNOWN,
    encode_response,
};
use crate::settings::{DeviceSettings, SETTINGS_ADDRESS, SETTINGS_LEN};

/// Name returned by sign-on.
pub const DEVICE_NAME: &str = "SDLINK_1";

/// Signature bytes reported over SPI.
pub const DEVICE_SIGNATURE: [u8; 3] = [0x1E, 0x98, 0x01];

const FLASH_SIZE: usize = 256 * 1024;
const EEPROM_SIZE: usize = 4096;
const RAM_SIZE: usize = 0x2200;
const FIRMWARE_SIZE: usize = 8 * 1024;

/// Granularity of simulated read timeouts.
const POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Bootloader,
    Sketch,
    Service,
}

/// Counters exposed for tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualStats {
    /// Reset pulses seen.
    pub resets: u64,
    /// Frames handled.
    pub commands: u64,
    /// `LOAD_ADDRESS` commands handled.
    pub address_loads: u64,
}

#[derive(Debug)]
struct Inner {
    state: State,
    card: MemoryCard,
    flash: Vec<u8>,
    eeprom: Vec<u8>,
    ram: Vec<u8>,
    firmware: Vec<u8>,
    address: u32,
    input: RequestScanner,
    output: VecDeque<u8>,
    drop_responses: usize,
    stats: VirtualStats,
    baud_rate: u32,
    timeout: Duration,
    dtr: bool,
    open: bool,
    latency: Duration,
}

/// Emulated board. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    inner: Arc<Mutex<Inner>>,
}

impl VirtualDevice {
    /// A board with `card` inserted and blank memories.
    pub fn new(card: MemoryCard) -> Self {
        let inner = Inner {
            state: State::Sketch,
            card,
            flash: vec![0xFF; FLASH_SIZE],
            eeprom: vec![0xFF; EEPROM_SIZE],
            ram: vec![0; RAM_SIZE],
            firmware: vec![0xFF; FIRMWARE_SIZE],
            address: 0,
            input: RequestScanner::new(),
            output: VecDeque::new(),
            drop_responses: 0,
            stats: VirtualStats::default(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(100),
            dtr: true,
            open: true,
            latency: Duration::ZERO,
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Counters.
    pub fn stats(&self) -> VirtualStats {
        self.lock().stats
    }

    /// Run `f` against the inserted card.
    pub fn with_card<T>(&self, f: impl FnOnce(&mut MemoryCard) -> T) -> T {
        f(&mut self.lock().card)
    }

    /// Copy of the card image.
    pub fn card_image(&self) -> Vec<u8> {
        self.lock()
            .card
            .image()
            .to_vec()
    }

    /// Copy of flash.
    pub fn flash(&self) -> Vec<u8> {
        self.lock().flash.clone()
    }

    /// Copy of the firmware region written in service mode.
    pub fn firmware(&self) -> Vec<u8> {
        self.lock().firmware.clone()
    }

    /// Current settings block.
    pub fn settings(&self) -> DeviceSettings {
        let inner = self.lock();
        let at = SETTINGS_ADDRESS as usize;
        DeviceSettings::decode(&inner.eeprom[at..at + SETTINGS_LEN])
    }

    /// Whether the user program is running.
    pub fn sketch_running(&self) -> bool {
        self.lock().state == State::Sketch
    }

    /// Queue raw bytes for the host, ahead of anything the device sends.
    pub fn inject_response(&self, bytes: Vec<u8>) {
        self.lock()
            .output
            .extend(bytes);
    }

    /// Swallow the response to the next request.
    pub fn drop_next_response(&self) {
        self.lock().drop_responses += 1;
    }

    /// Delay every write by `latency`, like a slow link would.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Bytes the running sketch prints.
    pub fn sketch_print(&self, bytes: &[u8]) {
        let mut inner = self.lock();
        if inner.state == State::Sketch {
            inner
                .output
                .extend(bytes);
        }
    }
}

impl Inner {
    fn reset(&mut self) {
        self.stats.resets += 1;
        self.input.clear();
        self.output.clear();
        self.address = 0;
        let settings = self.settings();
        if settings.service_requested {
            self.state = State::Service;
            self.output
                .extend(SERVICE_ECHO);
        } else {
            self.state = State::Bootloader;
        }
        debug!("Virtual device reset into {:?}", self.state);
    }

    fn settings(&self) -> DeviceSettings {
        let at = SETTINGS_ADDRESS as usize;
        DeviceSettings::decode(&self.eeprom[at..at + SETTINGS_LEN])
    }

    fn store_settings(&mut self, settings: &DeviceSettings) {
        let at = SETTINGS_ADDRESS as usize;
        self.eeprom[at..at + SETTINGS_LEN].copy_from_slice(&settings.encode());
    }

    fn receive(&mut self, data: &[u8]) {
        if self.state == State::Sketch {
            // The sketch echoes its serial input.
            self.output
                .extend(data);
            return;
        }
        self.input.push(data);
        while let Some(frame) = self.input.next_frame() {
            self.stats.commands += 1;
            let (status, payload) = match self.state {
                State::Service => self.handle_service(&frame),
                _ => self.handle(&frame),
            };
            trace!(
                "Virtual device seq={} cmd=0x{:02X} status=0x{status:02X}",
                frame.seq,
                frame.command()
            );
            if self.drop_responses > 0 {
                self.drop_responses -= 1;
            } else {
                self.output
                    .extend(encode_response(frame.seq, frame.command(), status, &payload));
            }
            if self.state == State::Sketch {
                self.input.clear();
                return;
            }
        }
    }

    fn handle(&mut self, frame: &RawFrame) -> (u8, Vec<u8>) {
        let Some(cmd) = Command::from_code(frame.command()) else {
            return (STATUS_CMD_UNKNOWN, Vec::new());
        };
        match self.execute(cmd, frame.payload()) {
            Some(reply) => (STATUS_CMD_OK, reply),
            None => (STATUS_CMD_FAILED, Vec::new()),
        }
    }

    fn execute(&mut self, cmd: Command, payload: &[u8]) -> Option<Vec<u8>> {
        match cmd {
            Command::SignOn => Some(DEVICE_NAME.as_bytes().to_vec()),
            Command::LoadAddress => {
                let bytes: [u8; 4] = payload.try_into().ok()?;
                self.address = u32::from_be_bytes(bytes);
                self.stats.address_loads += 1;
                Some(Vec::new())
            },
            Command::LeaveProgmode => {
                self.start_sketch();
                Some(Vec::new())
            },
            Command::ReadFlash => read_sized(&self.flash, &mut self.address, payload),
            Command::ReadEeprom => read_sized(&self.eeprom, &mut self.address, payload),
            Command::RamRead => read_sized(&self.ram, &mut self.address, payload),
            Command::ProgramFlash => write_sized(&mut self.flash, &mut self.address, payload, false),
            Command::ProgramEeprom => write_sized(&mut self.eeprom, &mut self.address, payload, false),
            Command::RamWrite => write_sized(&mut self.ram, &mut self.address, payload, true),
            Command::SpiMulti => {
                let (&len, tx) = payload.split_first()?;
                if usize::from(len) != tx.len() {
                    return None;
                }
                let mut rx = vec![0u8; tx.len()];
                if let [0x30, _, index, _] = tx {
                    rx[1] = 0x30;
                    rx[3] = *DEVICE_SIGNATURE.get(usize::from(*index))?;
                }
                Some(rx)
            },
            Command::SdInit => self
                .card
                .init_volume()
                .ok()
                .map(|v| v.encode().to_vec()),
            Command::SdRead => {
                let mut buf = [0u8; BLOCK_SIZE];
                self.card
                    .read_block(self.address, &mut buf)
                    .ok()?;
                self.address += 1;
                Some(buf.to_vec())
            },
            Command::SdWrite => {
                let buf: &[u8; BLOCK_SIZE] = payload.try_into().ok()?;
                self.card
                    .write_block(self.address, buf)
                    .ok()?;
                self.address += 1;
                Some(Vec::new())
            },
            Command::AnalogRead => {
                let &[pin] = payload else { return None };
                (pin < 16).then(|| (u16::from(pin) * 64 + 3).to_be_bytes().to_vec())
            },
        }
    }

    fn handle_service(&mut self, frame: &RawFrame) -> (u8, Vec<u8>) {
        match ServiceCommand::from_code(frame.command()) {
            Some(ServiceCommand::Program) => {
                let payload = frame.payload();
                let Some((addr, data)) = payload.split_first_chunk::<4>() else {
                    return (STATUS_CMD_FAILED, Vec::new());
                };
                let at = u32::from_be_bytes(*addr) as usize;
                match self.firmware.get_mut(at..at + data.len()) {
                    Some(dst) => {
                        dst.copy_from_slice(data);
                        (STATUS_CMD_OK, Vec::new())
                    },
                    None => (STATUS_CMD_FAILED, Vec::new()),
                }
            },
            Some(ServiceCommand::Exit) => {
                let mut settings = self.settings();
                settings.service_requested = false;
                self.store_settings(&settings);
                (STATUS_CMD_OK, Vec::new())
            },
            None => (STATUS_CMD_UNKNOWN, Vec::new()),
        }
    }

    /// Leave the bootloader, first loading a queued sketch from the card.
    fn start_sketch(&mut self) {
        let mut settings = self.settings();
        if settings.load_sketch {
            settings.load_sketch = false;
            if let Some(name) = settings.sketch_to_load_name() {
                match self.load_from_card(&name) {
                    Some(size) => {
                        settings.current_sketch = settings.sketch_to_load;
                        settings.sketch_size = size;
                        debug!("Virtual device loaded {name} ({size} bytes)");
                    },
                    None => debug!("Virtual device could not load {name}"),
                }
            }
            self.store_settings(&settings);
        }
        self.state = State::Sketch;
    }

    fn load_from_card(&mut self, name: &str) -> Option<u32> {
        let card = std::mem::replace(&mut self.card, MemoryCard::blank(1));
        let mut fs = FatFs::new(card);
        let mut image = Vec::new();
        let loaded = fs
            .root_pointer()
            .and_then(|root| fs.find(root, name))
            .ok()
            .flatten()
            .and_then(|info| {
                fs.read_file(&info, &mut image, &mut |_| Ok(()))
                    .ok()
            });
        self.card = fs.into_device();
        let size = loaded?;
        let len = image.len().min(self.flash.len());
        self.flash[..len].copy_from_slice(&image[..len]);
        u32::try_from(size).ok()
    }
}

fn read_sized(mem: &[u8], address: &mut u32, payload: &[u8]) -> Option<Vec<u8>> {
    let &[hi, lo] = payload else { return None };
    let len = usize::from(u16::from_be_bytes([hi, lo]));
    let at = *address as usize;
    let data = mem.get(at..at + len)?.to_vec();
    *address += len as u32;
    Some(data)
}

fn write_sized(mem: &mut [u8], address: &mut u32, payload: &[u8], masked: bool) -> Option<Vec<u8>> {
    let (size, rest) = payload.split_first_chunk::<2>()?;
    let len = usize::from(u16::from_be_bytes(*size));
    let expected = if masked { len * 2 } else { len };
    if rest.len() != expected {
        return None;
    }
    let at = *address as usize;
    let dst = mem.get_mut(at..at + len)?;
    let (data, mask) = rest.split_at(len);
    if masked {
        for ((old, new), m) in dst.iter_mut().zip(data).zip(mask) {
            *old = (*old & !m) | (new & m);
        }
    } else {
        dst.copy_from_slice(data);
    }
    *address += len as u32;
    Some(Vec::new())
}

impl Read for VirtualDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = {
            let mut inner = self.lock();
            if !inner.output.is_empty() {
                let n = buf.len().min(inner.output.len());
                for (slot, b) in buf.iter_mut().zip(inner.output.drain(..n)) {
                    *slot = b;
                }
                return Ok(n);
            }
            inner.timeout
        };
        thread::sleep(timeout.min(POLL));
        Err(io::Error::new(io::ErrorKind::TimedOut, "virtual device idle"))
    }
}

impl Write for VirtualDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let latency = {
            let mut inner = self.lock();
            if !inner.open {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "virtual device closed"));
            }
            inner.receive(buf);
            inner.latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for VirtualDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.lock().timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.lock().timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.lock().baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.lock().baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let mut inner = self.lock();
        inner.output.clear();
        inner.input.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "virtual"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        let mut inner = self.lock();
        // Auto-reset circuit: a falling DTR edge resets the MCU.
        if inner.dtr && !level {
            inner.reset();
        }
        inner.dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lock().open = false;
        Ok(())
    }

    fn pulse_reset(&mut self) -> Result<()> {
        self.set_dtr(false)?;
        self.set_dtr(true)
    }
}
