//! Error types for sdlink.

use std::io;
use thiserror::Error;

/// Result type for sdlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sdlink operations.
///
/// Every variant renders a message suitable for showing to the user as-is.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, host file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Malformed or mismatched frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The device answered with a non-OK status byte.
    #[error("Device reported failure for command 0x{command:02X} (status 0x{status:02X})")]
    Device {
        /// Command that failed.
        command: u8,
        /// Status byte returned by the device.
        status: u8,
    },

    /// Filesystem structure error (corrupt chain, unexpected end of directory).
    #[error("Filesystem error: {0}")]
    Filesystem(String),

    /// A file or directory could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The card has no free cluster left.
    #[error("No space left on the card")]
    NoSpace,

    /// Operation not valid in the current device mode.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The task was cancelled.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error originates from the link rather than from the
    /// filesystem logic. Only these are worth a reset-and-retry.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::Protocol(_) | Self::Device { .. } => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::Timeout("no data".into()).is_transport());
        assert!(Error::Protocol("checksum".into()).is_transport());
        assert!(
            Error::Device {
                command: 0xA1,
                status: 0xC0
            }
            .is_transport()
        );
        assert!(!Error::NoSpace.is_transport());
        assert!(!Error::NotFound("a.txt".into()).is_transport());
        assert!(!Error::Cancelled.is_transport());
    }

    #[test]
    fn test_device_error_message() {
        let err = Error::Device {
            command: 0x13,
            status: 0x80,
        };
        assert_eq!(
            err.to_string(),
            "Device reported failure for command 0x13 (status 0x80)"
        );
    }
}
