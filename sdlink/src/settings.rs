//! Device settings and register codecs.
//!
//! ## Settings block
//!
//! The bootloader keeps a small record in EEPROM at [`SETTINGS_ADDRESS`]:
//!
//! ```text
//! +-------+---------+-------+---------------+----------------+-------------+------+
//! | MAGIC | VERSION | FLAGS | SKETCH_TO_LOAD| CURRENT_SKETCH | SKETCH_SIZE | RSVD |
//! +-------+---------+-------+---------------+----------------+-------------+------+
//! |   2   |    1    |   1   |      11       |       11       |   4 (LE)    |  2   |
//! +-------+---------+-------+---------------+----------------+-------------+------+
//! ```
//!
//! A block with the wrong magic reads as the default (no sketch, no flags).

use std::fmt;

use crate::error::{Error, Result};
use crate::fs::entry::short_name_to_string;
use crate::protocol::session::Session;

/// EEPROM address of the settings block.
pub const SETTINGS_ADDRESS: u32 = 0x3C0;

/// Encoded size of the settings block.
pub const SETTINGS_LEN: usize = 32;

const MAGIC: [u8; 2] = *b"SL";
const VERSION: u8 = 1;

const FLAG_LOAD_SKETCH: u8 = 0x01;
const FLAG_SERVICE_REQUESTED: u8 = 0x02;

/// Blank 8.3 name.
const NO_SKETCH: [u8; 11] = [b' '; 11];

/// The EEPROM settings block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceSettings {
    /// Load `sketch_to_load` from the card on the next sign-off.
    pub load_sketch: bool,
    /// Boot into service mode on the next reset.
    pub service_requested: bool,
    /// Raw short name of the sketch to load.
    pub sketch_to_load: [u8; 11],
    /// Raw short name of the sketch in flash.
    pub current_sketch: [u8; 11],
    /// Size of the sketch in flash.
    pub sketch_size: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            load_sketch: false,
            service_requested: false,
            sketch_to_load: NO_SKETCH,
            current_sketch: NO_SKETCH,
            sketch_size: 0,
        }
    }
}

impl DeviceSettings {
    /// Decode a settings block.
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < SETTINGS_LEN || data[0..2] != MAGIC {
            return Self::default();
        }
        let mut sketch_to_load = [0u8; 11];
        sketch_to_load.copy_from_slice(&data[4..15]);
        let mut current_sketch = [0u8; 11];
        current_sketch.copy_from_slice(&data[15..26]);
        Self {
            load_sketch: data[3] & FLAG_LOAD_SKETCH != 0,
            service_requested: data[3] & FLAG_SERVICE_REQUESTED != 0,
            sketch_to_load,
            current_sketch,
            sketch_size: u32::from_le_bytes([data[26], data[27], data[28], data[29]]),
        }
    }

    /// Encode the settings block.
    pub fn encode(&self) -> [u8; SETTINGS_LEN] {
        let mut out = [0u8; SETTINGS_LEN];
        out[0..2].copy_from_slice(&MAGIC);
        out[2] = VERSION;
        let mut flags = 0;
        if self.load_sketch {
            flags |= FLAG_LOAD_SKETCH;
        }
        if self.service_requested {
            flags |= FLAG_SERVICE_REQUESTED;
        }
        out[3] = flags;
        out[4..15].copy_from_slice(&self.sketch_to_load);
        out[15..26].copy_from_slice(&self.current_sketch);
        out[26..30].copy_from_slice(&self.sketch_size.to_le_bytes());
        out
    }

    /// Read the block from the device.
    pub fn read(session: &mut Session) -> Result<Self> {
        let data = session.eeprom_read(SETTINGS_ADDRESS, SETTINGS_LEN)?;
        Ok(Self::decode(&data))
    }

    /// Write the block to the device.
    pub fn write(&self, session: &mut Session) -> Result<()> {
        session.eeprom_write(SETTINGS_ADDRESS, &self.encode())
    }

    /// Display name of the sketch in flash, if any.
    pub fn current_sketch_name(&self) -> Option<String> {
        (self.current_sketch != NO_SKETCH && self.current_sketch[0] != 0)
            .then(|| short_name_to_string(&self.current_sketch, 0))
    }

    /// Display name of the sketch queued for loading, if any.
    pub fn sketch_to_load_name(&self) -> Option<String> {
        (self.sketch_to_load != NO_SKETCH && self.sketch_to_load[0] != 0)
            .then(|| short_name_to_string(&self.sketch_to_load, 0))
    }
}

impl fmt::Display for DeviceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "current sketch:  {}",
            self.current_sketch_name()
                .as_deref()
                .unwrap_or("-")
        )?;
        writeln!(f, "sketch size:     {} bytes", self.sketch_size)?;
        writeln!(
            f,
            "sketch to load:  {}",
            self.sketch_to_load_name()
                .as_deref()
                .unwrap_or("-")
        )?;
        writeln!(f, "load on exit:    {}", self.load_sketch)?;
        write!(f, "service pending: {}", self.service_requested)
    }
}

/// One named RAM register.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Register {
    /// Register name.
    pub name: String,
    /// RAM address.
    pub address: u32,
    /// Width in bytes (1, 2 or 4; little-endian).
    pub len: u8,
}

impl Register {
    /// Create a register.
    pub fn new(name: impl Into<String>, address: u32, len: u8) -> Self {
        Self {
            name: name.into(),
            address,
            len,
        }
    }
}

/// A decoded register value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisterValue {
    /// Register name.
    pub name: String,
    /// RAM address.
    pub address: u32,
    /// Current value.
    pub value: u32,
}

/// Masked RAM write produced by [`RegisterSet::encode_changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterWrite {
    /// First address covered.
    pub address: u32,
    /// New bytes.
    pub data: Vec<u8>,
    /// `0xFF` where a byte changed, `0x00` elsewhere.
    pub mask: Vec<u8>,
}

impl RegisterWrite {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.mask
            .iter()
            .all(|&m| m == 0)
    }
}

/// A set of registers read and written as one RAM span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet {
    registers: Vec<Register>,
}

impl RegisterSet {
    /// Build a set; registers may be given in any order.
    pub fn new(mut registers: Vec<Register>) -> Result<Self> {
        if registers.is_empty() {
            return Err(Error::Config("register set is empty".into()));
        }
        if let Some(bad) = registers
            .iter()
            .find(|r| !matches!(r.len, 1 | 2 | 4))
        {
            return Err(Error::Config(format!(
                "register {} has unsupported width {}",
                bad.name, bad.len
            )));
        }
        registers.sort_by_key(|r| r.address);
        Ok(Self { registers })
    }

    /// The memory-mapped I/O registers of an ATmega-class part.
    pub fn standard() -> Self {
        let registers = [
            ("PINB", 0x23, 1),
            ("DDRB", 0x24, 1),
            ("PORTB", 0x25, 1),
            ("PINC", 0x26, 1),
            ("DDRC", 0x27, 1),
            ("PORTC", 0x28, 1),
            ("PIND", 0x29, 1),
            ("DDRD", 0x2A, 1),
            ("PORTD", 0x2B, 1),
            ("TCCR0A", 0x44, 1),
            ("TCCR0B", 0x45, 1),
            ("TCNT0", 0x46, 1),
            ("OCR0A", 0x47, 1),
            ("OCR0B", 0x48, 1),
            ("SP", 0x5D, 2),
            ("SREG", 0x5F, 1),
        ]
        .into_iter()
        .map(|(name, address, len)| Register::new(name, address, len))
        .collect();
        Self { registers }
    }

    /// Registers in address order.
    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Register> {
        self.registers
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// `(first address, length)` of the span covering every register.
    pub fn span(&self) -> (u32, usize) {
        let start = self.registers[0].address;
        let end = self
            .registers
            .iter()
            .map(|r| r.address + u32::from(r.len))
            .max()
            .unwrap_or(start);
        (start, (end - start) as usize)
    }

    fn value_at(reg: &Register, base: u32, span: &[u8]) -> Result<u32> {
        let at = (reg.address - base) as usize;
        let bytes = span
            .get(at..at + usize::from(reg.len))
            .ok_or_else(|| Error::Protocol(format!("register {} outside read span", reg.name)))?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u32, |acc, &b| (acc << 8) | u32::from(b)))
    }

    /// Decode the values from a snapshot of [`span`](Self::span).
    pub fn decode(&self, span: &[u8]) -> Result<Vec<RegisterValue>> {
        let (base, _) = self.span();
        self.registers
            .iter()
            .map(|reg| {
                Ok(RegisterValue {
                    name: reg.name.clone(),
                    address: reg.address,
                    value: Self::value_at(reg, base, span)?,
                })
            })
            .collect()
    }

    /// Apply `updates` to the snapshot `current` and produce a write whose
    /// mask selects only the bytes that change.
    pub fn encode_changes(&self, current: &[u8], updates: &[(String, u32)]) -> Result<RegisterWrite> {
        let (base, len) = self.span();
        if current.len() < len {
            return Err(Error::Protocol(format!(
                "register snapshot of {} bytes, expected {len}",
                current.len()
            )));
        }
        let mut data = current[..len].to_vec();
        for (name, value) in updates {
            let reg = self
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("register {name}")))?;
            if reg.len < 4 && *value >> (u32::from(reg.len) * 8) != 0 {
                return Err(Error::Config(format!(
                    "value 0x{value:X} does not fit {} ({} bytes)",
                    reg.name, reg.len
                )));
            }
            let at = (reg.address - base) as usize;
            let bytes = value.to_le_bytes();
            data[at..at + usize::from(reg.len)].copy_from_slice(&bytes[..usize::from(reg.len)]);
        }
        let mask = data
            .iter()
            .zip(current)
            .map(|(new, old)| if new == old { 0x00 } else { 0xFF })
            .collect();
        Ok(RegisterWrite {
            address: base,
            data,
            mask,
        })
    }
}

impl Default for RegisterSet {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_encode_decode() {
        let settings = DeviceSettings {
            load_sketch: true,
            service_requested: false,
            sketch_to_load: *b"BLINK   HEX",
            current_sketch: *b"SNAKE   HEX",
            sketch_size: 12_345,
        };
        let bytes = settings.encode();
        assert_eq!(&bytes[..3], b"SL\x01");
        assert_eq!(bytes[3], 0x01);
        assert_eq!(DeviceSettings::decode(&bytes), settings);
        assert_eq!(settings.current_sketch_name().as_deref(), Some("SNAKE.HEX"));
    }

    #[test]
    fn test_blank_eeprom_reads_default() {
        let settings = DeviceSettings::decode(&[0xFF; SETTINGS_LEN]);
        assert_eq!(settings, DeviceSettings::default());
        assert_eq!(settings.current_sketch_name(), None);
    }

    #[test]
    fn test_register_span_and_decode() {
        let set = RegisterSet::new(vec![
            Register::new("B", 0x12, 2),
            Register::new("A", 0x10, 1),
        ])
        .unwrap();
        assert_eq!(set.span(), (0x10, 4));
        let values = set.decode(&[0x7F, 0x00, 0x34, 0x12]).unwrap();
        assert_eq!(values[0].name, "A");
        assert_eq!(values[0].value, 0x7F);
        assert_eq!(values[1].value, 0x1234);
    }

    #[test]
    fn test_encode_changes_masks_only_changed_bytes() {
        let set = RegisterSet::new(vec![
            Register::new("A", 0x10, 1),
            Register::new("B", 0x12, 2),
        ])
        .unwrap();
        let current = [0x01, 0x99, 0x34, 0x12];
        let write = set
            .encode_changes(&current, &[("b".into(), 0x1256)])
            .unwrap();
        assert_eq!(write.address, 0x10);
        assert_eq!(write.data, vec![0x01, 0x99, 0x56, 0x12]);
        assert_eq!(write.mask, vec![0, 0, 0xFF, 0]);

        let same = set
            .encode_changes(&current, &[("A".into(), 0x01)])
            .unwrap();
        assert!(same.is_empty());
    }

    #[test]
    fn test_encode_changes_rejects_bad_input() {
        let set = RegisterSet::standard();
        let (_, len) = set.span();
        let current = vec![0u8; len];
        assert!(matches!(
            set.encode_changes(&current, &[("NOPE".into(), 1)]),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            set.encode_changes(&current, &[("PORTB".into(), 0x100)]),
            Err(Error::Config(_))
        ));
    }
}
