//! Sketch commands: sketches, icon, launch.

use anyhow::{Context, Result};
use console::style;
use sdlink::task::catalog::{LaunchSketchTask, ListSketchesTask, LoadIconTask};
use std::path::Path;

use super::human_size;
use crate::link::Link;
use crate::{Cli, CliError};

/// `sketches` command.
pub(crate) fn cmd_sketches(link: &Link, json: bool) -> Result<()> {
    let task = ListSketchesTask::new();
    let output = task.output();
    link.run(task)?;
    let sketches = output.take().unwrap_or_default();

    if json {
        let items: Vec<serde_json::Value> = sketches
            .iter()
            .map(|s| {
                serde_json::json!({
                    "name": s.name,
                    "file": s.file_name,
                    "size": s.size,
                    "icon": s.icon,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if sketches.is_empty() {
        eprintln!("  {}", style("No sketches on the card").dim());
    }
    for sketch in &sketches {
        let icon = if sketch.icon.is_some() { " [icon]" } else { "" };
        println!(
            "{:<12} {:>10}{}",
            sketch.name,
            human_size(u64::from(sketch.size)),
            style(icon).dim()
        );
    }
    Ok(())
}

/// `icon` command.
pub(crate) fn cmd_icon(cli: &Cli, link: &Link, sketch: &str, output: &Path) -> Result<()> {
    let task = LoadIconTask::new(sketch);
    let icon = task.output();
    link.run(task)?;
    let Some(bytes) = icon.take().flatten() else {
        return Err(CliError::Usage(format!("Sketch {sketch} has no icon")).into());
    };
    std::fs::write(output, &bytes).with_context(|| format!("Failed to write {}", output.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Saved {} bytes to {}",
            style("✓").green(),
            bytes.len(),
            style(output.display()).cyan()
        );
    }
    Ok(())
}

/// `launch` command.
pub(crate) fn cmd_launch(cli: &Cli, link: &Link, sketch: &str) -> Result<()> {
    link.run(LaunchSketchTask::new(sketch))?;
    if !cli.quiet {
        eprintln!("{} Launched {}", style("🚀").green(), style(sketch).cyan());
    }
    Ok(())
}
