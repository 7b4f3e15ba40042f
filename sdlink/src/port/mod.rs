//! Port abstraction for the byte-stream link to the device.
//!
//! The protocol layer never talks to a serial port directly. It works against
//! the [`Port`] trait, which is implemented by:
//!
//! - [`NativePort`]: a real serial port via the `serialport` crate
//! - [`VirtualDevice`]: an in-process device emulator backed by a
//!   [`MemoryCard`](crate::fs::MemoryCard), used by tests and `--virtual`
//!
//! ```text
//! +------------------+
//! | Protocol Session |
//! +--------+---------+
//!          |
//!          v
//! +--------+---------+
//! |    Port trait    |
//! +--------+---------+
//!          |
//!    +-----+------+
//!    v            v
//! NativePort  VirtualDevice
//! ```

#[cfg(feature = "native")]
pub mod native;
pub mod virtual_device;

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use crate::error::Result;

/// Time the reset line is held low.
const RESET_PULSE: Duration = Duration::from_millis(20);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(100),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Product string (if available).
    pub product: Option<String>,
}

/// Byte-stream link to a device.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) pin state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) pin state.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Close the port and release resources.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        Write::write_all(self, buf)?;
        Write::flush(self)?;
        Ok(())
    }

    /// Toggle the hardware reset line (DTR/RTS low, then high).
    fn pulse_reset(&mut self) -> Result<()> {
        self.set_dtr(false)?;
        self.set_rts(false)?;
        thread::sleep(RESET_PULSE);
        self.set_dtr(true)?;
        self.set_rts(true)?;
        Ok(())
    }

    /// Read whatever arrives within `timeout`. Returns 0 on timeout.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.timeout() != timeout {
            self.set_timeout(timeout)?;
        }
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(0)
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Read until the line stays idle for `timeout`.
    fn read_all(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = self.read_timeout(&mut buf, timeout)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

/// Trait for listing available serial ports.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator};
pub use virtual_device::VirtualDevice;
