//! Device commands: regs, settings, info.

use anyhow::Result;
use console::style;
use sdlink::task::catalog::{
    DeviceInfoTask, ReadRegistersTask, ReadSettingsTask, UpdateRegistersTask, WriteSettingsTask,
};
use sdlink::{DeviceSettings, RegisterSet};

use crate::link::Link;
use crate::{Cli, CliError};

fn signature_hex(signature: &[u8; 3]) -> String {
    signature
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `regs read` command.
pub(crate) fn cmd_regs_read(link: &Link, names: &[String], json: bool) -> Result<()> {
    let set = RegisterSet::standard();
    if let Some(unknown) = names.iter().find(|n| set.get(n).is_none()) {
        return Err(CliError::Usage(format!("Unknown register '{unknown}'")).into());
    }

    let task = ReadRegistersTask::new(set);
    let output = task.output();
    link.run(task)?;
    let values: Vec<_> = output
        .take()
        .unwrap_or_default()
        .into_iter()
        .filter(|v| names.is_empty() || names.iter().any(|n| n.eq_ignore_ascii_case(&v.name)))
        .collect();

    if json {
        let items: Vec<serde_json::Value> = values
            .iter()
            .map(|v| {
                serde_json::json!({
                    "name": v.name,
                    "address": v.address,
                    "value": v.value,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for value in &values {
        println!(
            "{:<8} {}  0x{:02X} ({})",
            value.name,
            style(format!("@0x{:04X}", value.address)).dim(),
            value.value,
            value.value
        );
    }
    Ok(())
}

/// `regs write` command.
pub(crate) fn cmd_regs_write(cli: &Cli, link: &Link, assignments: Vec<(String, u32)>) -> Result<()> {
    let set = RegisterSet::standard();
    if let Some((unknown, _)) = assignments.iter().find(|(n, _)| set.get(n).is_none()) {
        return Err(CliError::Usage(format!("Unknown register '{unknown}'")).into());
    }
    let task = UpdateRegistersTask::new(set, assignments);
    let changed = task.output();
    link.run(task)?;
    if !cli.quiet {
        match changed.take().unwrap_or(0) {
            0 => eprintln!("{} Registers already hold these values", style("✓").green()),
            n => eprintln!("{} Wrote {n} byte(s)", style("✓").green()),
        }
    }
    Ok(())
}

/// `settings` command. With `reset`, the defaults are written first.
pub(crate) fn cmd_settings(cli: &Cli, link: &Link, json: bool, reset: bool) -> Result<()> {
    if reset {
        link.run(WriteSettingsTask::new(DeviceSettings::default()))?;
        if !cli.quiet {
            eprintln!("{} Settings reset", style("✓").green());
        }
    }

    let task = ReadSettingsTask::new();
    let output = task.output();
    link.run(task)?;
    let settings = output.take().unwrap_or_default();

    if json {
        let value = serde_json::json!({
            "load_sketch": settings.load_sketch,
            "service_requested": settings.service_requested,
            "sketch_to_load": settings.sketch_to_load_name(),
            "current_sketch": settings.current_sketch_name(),
            "sketch_size": settings.sketch_size,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{settings}");
    }
    Ok(())
}

/// `info` command.
pub(crate) fn cmd_info(link: &Link, json: bool) -> Result<()> {
    let task = DeviceInfoTask::new();
    let output = task.output();
    link.run(task)?;
    let Some(info) = output.take() else {
        return Err(sdlink::Error::Protocol("device info not reported".into()).into());
    };

    if json {
        let volume = info.volume.as_ref().map(|v| {
            serde_json::json!({
                "fat_type": format!("{:?}", v.fat_type),
                "cluster_bytes": v.cluster_bytes(),
                "clusters": v.cluster_last.saturating_sub(1),
                "fat_count": v.fat_count,
            })
        });
        let value = serde_json::json!({
            "name": info.name,
            "signature": signature_hex(&info.signature),
            "volume": volume,
            "label": info.label,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{:<10} {}", "Device:", style(&info.name).green().bold());
    println!("{:<10} {}", "Signature:", signature_hex(&info.signature));
    match &info.volume {
        Some(v) => {
            println!(
                "{:<10} {:?}, {} clusters of {} bytes",
                "Card:",
                v.fat_type,
                v.cluster_last.saturating_sub(1),
                v.cluster_bytes()
            );
        },
        None => println!("{:<10} {}", "Card:", style("not mounted").yellow()),
    }
    if let Some(label) = &info.label {
        println!("{:<10} {label}", "Label:");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_hex() {
        assert_eq!(signature_hex(&[0x1E, 0x98, 0x01]), "1E 98 01");
    }
}
