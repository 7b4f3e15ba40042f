//! Configuration file support for sdlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SDLINK_*)
//! 3. Local config file (./sdlink.toml)
//! 4. Global config file (<config dir>/sdlink/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use sdlink::{EngineConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "sdlink.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Command-mode baud rate.
    pub baud: Option<u32>,
}

/// Port configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Protocol timing overrides, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Response timeout per command.
    pub read_timeout_ms: Option<u64>,
    /// Settle time after a reset pulse.
    pub reset_settle_ms: Option<u64>,
    /// Idle keep-alive interval.
    pub keep_alive_ms: Option<u64>,
}

/// Serial monitor defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Baud rate of the user program.
    pub baud: Option<u32>,
    /// Prefix lines with a timestamp.
    #[serde(default)]
    pub timestamps: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Protocol timing.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Monitor defaults.
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "sdlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.port.connection.serial.is_some() {
            self.port.connection.serial = other.port.connection.serial;
        }
        if other.port.connection.baud.is_some() {
            self.port.connection.baud = other.port.connection.baud;
        }
        for device in other.port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        let timing = other.timing;
        if timing.read_timeout_ms.is_some() {
            self.timing.read_timeout_ms = timing.read_timeout_ms;
        }
        if timing.reset_settle_ms.is_some() {
            self.timing.reset_settle_ms = timing.reset_settle_ms;
        }
        if timing.keep_alive_ms.is_some() {
            self.timing.keep_alive_ms = timing.keep_alive_ms;
        }

        if other.monitor.baud.is_some() {
            self.monitor.baud = other.monitor.baud;
        }
        if other.monitor.timestamps {
            self.monitor.timestamps = true;
        }
    }

    /// Engine settings for a link at `baud`.
    pub fn engine_config(&self, baud: u32) -> EngineConfig {
        let defaults = SessionConfig::default();
        let ms = |value: Option<u64>, fallback: Duration| value.map_or(fallback, Duration::from_millis);
        let base = EngineConfig::default();
        EngineConfig {
            baud_rate: baud,
            keep_alive: ms(self.timing.keep_alive_ms, base.keep_alive),
            session: SessionConfig {
                read_timeout: ms(self.timing.read_timeout_ms, defaults.read_timeout),
                reset_settle: ms(self.timing.reset_settle_ms, defaults.reset_settle),
                ..defaults
            },
            ..base
        }
    }

    /// Remember the serial port in the local config file.
    pub fn save_port(&mut self, serial: &str, usb: Option<UsbDevice>) -> anyhow::Result<()> {
        self.port.connection.serial = Some(serial.to_string());
        if let Some(device) = usb {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        let path = Path::new(LOCAL_CONFIG);
        let mut on_disk = Self::load_from_file(path).unwrap_or_default();
        on_disk.port = self.port.clone();
        fs::write(path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved port configuration to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(!config.monitor.timestamps);
    }

    #[test]
    fn test_config_merge_overrides_only_set_fields() {
        let mut base = Config::default();
        base.port.connection.serial = Some("/dev/ttyUSB0".into());
        base.port.connection.baud = Some(57_600);

        let mut other = Config::default();
        other.port.connection.baud = Some(115_200);
        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.port.connection.baud, Some(115_200));
    }

    #[test]
    fn test_config_merge_usb_devices_deduplicated() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbDevice { vid: 0x2341, pid: 0x0043 });
        let mut other = Config::default();
        other.port.usb_device.push(UsbDevice { vid: 0x2341, pid: 0x0043 });
        other.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });
        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let config: Config = toml::from_str(
            r#"
            [port.connection]
            serial = "COM3"
            baud = 115200

            [[port.usb_device]]
            vid = 0x2341
            pid = 0x0043

            [timing]
            read_timeout_ms = 500

            [monitor]
            baud = 9600
            timestamps = true
            "#,
        )
        .unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("COM3"));
        assert!(config.port.usb_device[0].matches(0x2341, 0x0043));
        assert_eq!(config.timing.read_timeout_ms, Some(500));
        assert_eq!(config.monitor.baud, Some(9600));
        assert!(config.monitor.timestamps);
    }

    #[test]
    fn test_engine_config_applies_timing() {
        let mut config = Config::default();
        config.timing.read_timeout_ms = Some(750);
        let engine = config.engine_config(57_600);
        assert_eq!(engine.baud_rate, 57_600);
        assert_eq!(engine.session.read_timeout, Duration::from_millis(750));
        assert_eq!(engine.session.reset_settle, SessionConfig::default().reset_settle);
        assert_eq!(engine.keep_alive, EngineConfig::default().keep_alive);
    }

    #[test]
    fn test_load_from_path_valid_and_invalid() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.toml");
        fs::write(&good, "[port.connection]\nserial = \"/dev/ttyACM0\"\n").unwrap();
        let config = Config::load_from_path(&good);
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));

        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "not [[[ toml").unwrap();
        assert!(Config::load_from_path(&bad).port.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path_is_some() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }
}
