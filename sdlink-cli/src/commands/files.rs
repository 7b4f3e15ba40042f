//! Card file commands: ls, import, export, rm, mv, label, format.

use anyhow::{Context, Result};
use console::style;
use sdlink::task::catalog::{
    DeleteTask, DeviceInfoTask, ExportFileTask, ExportFolderTask, ImportFileTask, ImportFolderTask,
    ListDirectoryTask, RenameTask, RenameVolumeTask,
};
use sdlink::{DirectoryInfo, FormatOptions, MemoryCard, Task};
use std::path::{Path, PathBuf};

use super::human_size;
use crate::link::Link;
use crate::{Cli, CliError};

fn list(link: &Link, path: &str) -> Result<Vec<DirectoryInfo>> {
    let task = ListDirectoryTask::new(path);
    let entries = task.output();
    link.run(task)?;
    Ok(entries.take().unwrap_or_default())
}

/// Split a card path into its parent directory and last component.
fn split_card_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    Some(match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("/", trimmed),
    })
}

/// Whether the card path names a directory.
fn is_card_directory(link: &Link, path: &str) -> Result<bool> {
    let Some((parent, name)) = split_card_path(path) else {
        return Ok(true);
    };
    list(link, parent)?
        .iter()
        .find(|e| e.name.eq_ignore_ascii_case(name) || e.short_name().eq_ignore_ascii_case(name))
        .map(DirectoryInfo::is_directory)
        .ok_or_else(|| sdlink::Error::NotFound(path.to_string()).into())
}

/// `ls` command.
pub(crate) fn cmd_ls(link: &Link, path: &str, json: bool) -> Result<()> {
    let entries = list(link, path)?;

    if json {
        let items: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "name": e.name,
                    "short_name": e.short_name(),
                    "size": e.size(),
                    "directory": e.is_directory(),
                    "first_cluster": e.first_cluster(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for entry in &entries {
        if entry.is_directory() {
            println!("{:>10}  {}/", "<dir>", style(&entry.name).blue().bold());
        } else {
            println!("{:>10}  {}", human_size(u64::from(entry.size())), entry.name);
        }
    }
    Ok(())
}

/// `import` command.
pub(crate) fn cmd_import(cli: &Cli, link: &Link, sources: &[PathBuf], dest: &str) -> Result<()> {
    let mut tasks: Vec<Box<dyn Task>> = Vec::with_capacity(sources.len());
    for source in sources {
        let meta = std::fs::metadata(source).with_context(|| format!("Cannot read {}", source.display()))?;
        if meta.is_dir() {
            tasks.push(Box::new(ImportFolderTask::new(source, dest)));
        } else {
            tasks.push(Box::new(ImportFileTask::new(source, dest)));
        }
    }
    link.run_all(tasks)?;
    if !cli.quiet {
        eprintln!(
            "{} Imported {} item(s) into {}",
            style("✓").green(),
            sources.len(),
            style(dest).cyan()
        );
    }
    Ok(())
}

/// `export` command.
pub(crate) fn cmd_export(cli: &Cli, link: &Link, sources: &[String], dest: &Path) -> Result<()> {
    if sources.len() > 1 || dest.is_dir() {
        std::fs::create_dir_all(dest).with_context(|| format!("Cannot create {}", dest.display()))?;
    }
    let mut tasks: Vec<Box<dyn Task>> = Vec::with_capacity(sources.len());
    for source in sources {
        if is_card_directory(link, source)? {
            std::fs::create_dir_all(dest).with_context(|| format!("Cannot create {}", dest.display()))?;
            tasks.push(Box::new(ExportFolderTask::new(source, dest)));
        } else {
            tasks.push(Box::new(ExportFileTask::new(source, dest)));
        }
    }
    link.run_all(tasks)?;
    if !cli.quiet {
        eprintln!(
            "{} Exported {} item(s) to {}",
            style("✓").green(),
            sources.len(),
            style(dest.display()).cyan()
        );
    }
    Ok(())
}

/// `rm` command. Confirmation happens before the link is opened.
pub(crate) fn cmd_rm(cli: &Cli, link: &Link, paths: &[String]) -> Result<()> {
    link.run(DeleteTask::new(paths.to_vec()))?;
    if !cli.quiet {
        eprintln!("{} Deleted {} item(s)", style("✓").green(), paths.len());
    }
    Ok(())
}

/// `mv` command.
pub(crate) fn cmd_mv(cli: &Cli, link: &Link, path: &str, new_name: &str) -> Result<()> {
    if new_name.contains('/') {
        return Err(CliError::Usage(format!("'{new_name}' must be a plain name, not a path")).into());
    }
    let task = RenameTask::new(path, new_name);
    let renamed = task.output();
    link.run(task)?;
    if !cli.quiet {
        let name = renamed.take().map_or_else(|| new_name.to_string(), |info| info.name);
        eprintln!("{} Renamed {path} to {}", style("✓").green(), style(name).cyan());
    }
    Ok(())
}

/// `label` command.
pub(crate) fn cmd_label(cli: &Cli, link: &Link, name: Option<&str>) -> Result<()> {
    if let Some(name) = name {
        link.run(RenameVolumeTask::new(name))?;
        if !cli.quiet {
            eprintln!("{} Volume label set", style("✓").green());
        }
        return Ok(());
    }
    let task = DeviceInfoTask::new();
    let info = task.output();
    link.run(task)?;
    match info.take().and_then(|i| i.label) {
        Some(label) => println!("{label}"),
        None => {
            if !cli.quiet {
                eprintln!("{}", style("(no label)").dim());
            }
        },
    }
    Ok(())
}

/// Arguments of `format`.
pub(crate) struct FormatRequest<'a> {
    pub image: &'a Path,
    pub size_mb: u32,
    pub fat16: bool,
    pub cluster_blocks: u8,
    pub label: Option<&'a str>,
    pub force: bool,
}

/// `format` command: create an image for `--virtual`.
pub(crate) fn cmd_format(cli: &Cli, request: &FormatRequest<'_>) -> Result<()> {
    if request.image.exists() && !request.force {
        return Err(CliError::Usage(format!(
            "{} already exists (use --force to overwrite)",
            request.image.display()
        ))
        .into());
    }
    if request.size_mb == 0 || !request.cluster_blocks.is_power_of_two() {
        return Err(CliError::Usage(
            "size must be non-zero and blocks per cluster a power of two".into(),
        )
        .into());
    }
    let blocks = request
        .size_mb
        .checked_mul(2048)
        .ok_or_else(|| CliError::Usage(format!("{} MiB is too large", request.size_mb)))?;
    let mut options = if request.fat16 {
        FormatOptions::fat16(blocks, request.cluster_blocks)
    } else {
        FormatOptions::fat32(blocks, request.cluster_blocks)
    };
    if let Some(label) = request.label {
        options = options.with_label(label);
    }
    MemoryCard::format(&options)
        .save(request.image)
        .with_context(|| format!("Failed to write {}", request.image.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Created {} ({} MiB, {})",
            style("✓").green(),
            style(request.image.display()).cyan(),
            request.size_mb,
            if request.fat16 { "FAT16" } else { "FAT32" }
        );
    }
    Ok(())
}
