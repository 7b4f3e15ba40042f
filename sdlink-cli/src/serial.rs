//! Serial port selection.
//!
//! - Explicit `--port` or the configured port wins
//! - Otherwise ports with a recognised USB bridge are preferred
//! - Interactive selection via dialoguer, never in non-interactive mode
//! - The chosen port can be remembered in `sdlink.toml`

use {
    crate::{
        CliError,
        config::{Config, UsbDevice},
    },
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    sdlink::{NativePortEnumerator, PortEnumerator, PortInfo},
    std::{cmp::Ordering, io::IsTerminal},
};

/// USB-serial bridges found on boards of this family.
const KNOWN_BRIDGES: &[(u16, u16, &str)] = &[
    (0x2341, 0x0043, "Arduino Uno"),
    (0x2341, 0x0010, "Arduino Mega"),
    (0x2341, 0x0042, "Arduino Mega 2560"),
    (0x1A86, 0x7523, "CH340"),
    (0x0403, 0x6001, "FTDI FT232"),
    (0x10C4, 0xEA60, "CP210x"),
];

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection.
#[derive(Debug, Clone)]
pub struct SelectedPort {
    /// The selected port.
    pub port: PortInfo,
    /// Whether this port matched a known or configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Name of the built-in bridge behind `port`, if any.
pub fn bridge_name(port: &PortInfo) -> Option<&'static str> {
    let (vid, pid) = (port.vid?, port.pid?);
    KNOWN_BRIDGES
        .iter()
        .find(|(v, p, _)| *v == vid && *p == pid)
        .map(|(_, _, name)| *name)
}

/// Check if a port matches a known device (built-in or configured).
pub fn is_known_device(port: &PortInfo, config: &Config) -> bool {
    if bridge_name(port).is_some() {
        return true;
    }
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid)),
        _ => false,
    }
}

pub(crate) fn discover_ports() -> Vec<PortInfo> {
    match NativePortEnumerator::list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            debug!("Port enumeration failed: {e}");
            Vec::new()
        },
    }
}

fn find_port_by_name(name: &str) -> PortInfo {
    discover_ports()
        .into_iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name))
        .unwrap_or_else(|| PortInfo {
            name: name.to_string(),
            vid: None,
            pid: None,
            product: None,
        })
}

/// Select a serial port.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        let port = find_port_by_name(name);
        return Ok(SelectedPort {
            is_known: true,
            port,
        });
    }

    if let Some(name) = &config.port.connection.serial {
        debug!("Using port from config: {name}");
        let port = find_port_by_name(name);
        return Ok(SelectedPort {
            is_known: true,
            port,
        });
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err("No serial ports found. Connect the board or pass --port."));
    }

    let known: Vec<PortInfo> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    if options.non_interactive {
        return match candidates.len().cmp(&1) {
            Ordering::Equal => {
                let port = candidates
                    .into_iter()
                    .next()
                    .ok_or_else(|| usage_err("No serial ports available."))?;
                Ok(SelectedPort {
                    is_known: is_known_device(&port, config),
                    port,
                })
            },
            Ordering::Greater => Err(usage_err(
                "Found multiple serial ports; pass --port in non-interactive mode.",
            )),
            Ordering::Less => Err(usage_err("No serial ports available.")),
        };
    }

    if candidates.len() == 1 {
        let port = candidates
            .into_iter()
            .next()
            .ok_or_else(|| usage_err("No serial ports available."))?;
        if is_known_device(&port, config) {
            info!("Auto-selected port: {}", port.name);
            return Ok(SelectedPort {
                port,
                is_known: true,
            });
        }
        ensure_interactive_terminal()?;
        return confirm_single_port(port);
    }

    ensure_interactive_terminal()?;
    select_port_interactive(candidates, config)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port instead.",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("Port selection cancelled".into()).into()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Prompt failed: {io_err}")),
    }
}

/// One line of the selection menu.
fn port_label(port: &PortInfo, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };
    let device = match (bridge_name(port), port.vid, port.pid) {
        (Some(bridge), ..) => format!(" [{}]", style(bridge).yellow()),
        (None, Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{name}{device}{product}")
}

fn select_port_interactive(mut ports: Vec<PortInfo>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    ports.sort_by_key(|p| !is_known_device(p, config));

    let width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p, config), width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the board's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let Some(index) = selection else {
        return Err(CliError::Cancelled("Port selection cancelled".into()).into());
    };
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

fn confirm_single_port(port: PortInfo) -> Result<SelectedPort> {
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("Port selection cancelled".into()).into())
    }
}

/// Offer to remember an unrecognised port.
pub fn ask_remember_port(port: &PortInfo, config: &mut Config) -> Result<()> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for next time?", port.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if confirmed {
        let usb = port.vid.zip(port.pid).map(|(vid, pid)| UsbDevice { vid, pid });
        if let Err(e) = config.save_port(&port.name, usb) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(vid: Option<u16>, pid: Option<u16>) -> PortInfo {
        PortInfo {
            name: "/dev/ttyUSB0".into(),
            vid,
            pid,
            product: Some("USB Serial".into()),
        }
    }

    #[test]
    fn test_builtin_bridge_is_known() {
        let config = Config::default();
        assert_eq!(bridge_name(&port(Some(0x1A86), Some(0x7523))), Some("CH340"));
        assert!(is_known_device(&port(Some(0x2341), Some(0x0043)), &config));
        assert!(!is_known_device(&port(Some(0x1234), Some(0x5678)), &config));
        assert!(!is_known_device(&port(None, None), &config));
    }

    #[test]
    fn test_configured_device_is_known() {
        let mut config = Config::default();
        config.port.usb_device.push(UsbDevice { vid: 0x1234, pid: 0x5678 });
        assert!(is_known_device(&port(Some(0x1234), Some(0x5678)), &config));
    }

    #[test]
    fn test_explicit_port_bypasses_discovery() {
        let options = SerialOptions {
            port: Some("NOT_A_REAL_PORT".into()),
            non_interactive: true,
        };
        let selected = select_serial_port(&options, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "NOT_A_REAL_PORT");
    }

    #[test]
    fn test_label_mentions_bridge() {
        console::set_colors_enabled(false);
        let label = port_label(&port(Some(0x0403), Some(0x6001)), &Config::default());
        assert!(label.contains("FTDI"));
        assert!(label.contains("USB Serial"));
    }
}
