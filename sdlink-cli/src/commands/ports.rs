//! `list-ports` command.

use console::style;

use crate::config::Config;
use crate::serial::{bridge_name, discover_ports, is_known_device};

/// `list-ports` command. JSON goes to stdout, the listing to stderr.
pub(crate) fn cmd_list_ports(config: &Config, json: bool) {
    let ports = discover_ports();

    if json {
        let items: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": bridge_name(p),
                    "known": is_known_device(p, config),
                    "vid": p.vid,
                    "pid": p.pid,
                    "product": p.product,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string())
        );
        return;
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for port in &ports {
        let device_type = match bridge_name(port) {
            Some(name) => format!(" [{}]", style(name).yellow()),
            None if is_known_device(port, config) => format!(" [{}]", style("configured").yellow()),
            None => String::new(),
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }

    if let Some(port) = ports.iter().find(|p| is_known_device(p, config)) {
        eprintln!(
            "\n{} Default choice: {}",
            style("→").green().bold(),
            style(&port.name).cyan().bold()
        );
    }
}
