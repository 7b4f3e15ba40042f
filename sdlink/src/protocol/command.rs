//! Command codes.
//!
//! The first block follows STK500v2; the `0xA0` range is the board's
//! extension for card, RAM and analog access. Service mode uses its own
//! small command set.

/// Commands understood in firmware mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Handshake; answers with the device name.
    SignOn = 0x01,
    /// Set the address used by the next sized transfer.
    LoadAddress = 0x06,
    /// Leave command mode and start the sketch.
    LeaveProgmode = 0x11,
    /// Write a flash page.
    ProgramFlash = 0x13,
    /// Read flash.
    ReadFlash = 0x14,
    /// Write EEPROM.
    ProgramEeprom = 0x15,
    /// Read EEPROM.
    ReadEeprom = 0x16,
    /// Raw SPI transfer.
    SpiMulti = 0x1D,
    /// Initialise the card; answers with the volume record.
    SdInit = 0xA0,
    /// Read one card block.
    SdRead = 0xA1,
    /// Write one card block.
    SdWrite = 0xA2,
    /// Read RAM.
    RamRead = 0xA3,
    /// Masked RAM write.
    RamWrite = 0xA4,
    /// Sample an analog pin.
    AnalogRead = 0xA5,
}

impl Command {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::SignOn,
            0x06 => Self::LoadAddress,
            0x11 => Self::LeaveProgmode,
            0x13 => Self::ProgramFlash,
            0x14 => Self::ReadFlash,
            0x15 => Self::ProgramEeprom,
            0x16 => Self::ReadEeprom,
            0x1D => Self::SpiMulti,
            0xA0 => Self::SdInit,
            0xA1 => Self::SdRead,
            0xA2 => Self::SdWrite,
            0xA3 => Self::RamRead,
            0xA4 => Self::RamWrite,
            0xA5 => Self::AnalogRead,
            _ => return None,
        })
    }

    /// Whether the device advances its address register after this command.
    pub fn advances_address(self) -> bool {
        matches!(
            self,
            Self::ProgramFlash
                | Self::ReadFlash
                | Self::ProgramEeprom
                | Self::ReadEeprom
                | Self::SdRead
                | Self::SdWrite
                | Self::RamRead
                | Self::RamWrite
        )
    }
}

/// Commands understood in service mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceCommand {
    /// Write one page of the firmware region: `ADDR(4, BE) DATA`.
    Program = 0xB0,
    /// Leave service mode; the device reboots into firmware mode.
    Exit = 0xB1,
}

impl ServiceCommand {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0xB0 => Some(Self::Program),
            0xB1 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// Text the device prints when it boots into service mode.
pub const SERVICE_ECHO: &[u8] = b"HELLO";

/// Flash page size.
pub const FLASH_PAGE_SIZE: usize = 256;

/// Largest payload of a single sized read or write.
pub const MAX_TRANSFER: usize = 512;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_lookup() {
        for cmd in [
            Command::SignOn,
            Command::LoadAddress,
            Command::LeaveProgmode,
            Command::ProgramFlash,
            Command::ReadFlash,
            Command::ProgramEeprom,
            Command::ReadEeprom,
            Command::SpiMulti,
            Command::SdInit,
            Command::SdRead,
            Command::SdWrite,
            Command::RamRead,
            Command::RamWrite,
            Command::AnalogRead,
        ] {
            assert_eq!(Command::from_code(cmd.code()), Some(cmd));
        }
        assert_eq!(Command::SdRead.code(), 0xA1);
        assert_eq!(Command::from_code(0x42), None);
        assert_eq!(ServiceCommand::from_code(0xB1), Some(ServiceCommand::Exit));
    }

    #[test]
    fn test_address_advance() {
        assert!(Command::SdRead.advances_address());
        assert!(!Command::LoadAddress.advances_address());
        assert!(!Command::AnalogRead.advances_address());
    }
}
