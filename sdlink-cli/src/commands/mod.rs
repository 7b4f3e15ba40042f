//! Command implementations.
//!
//! Each group of subcommands is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod files;
pub(crate) mod monitor;
pub(crate) mod ports;
pub(crate) mod program;
pub(crate) mod sketch;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;
use std::io::IsTerminal;
use std::path::Path;

use crate::{Cli, CliError};

/// Ask before a destructive operation. `--yes` skips the prompt; without it
/// non-interactive runs fail.
pub(crate) fn confirm(cli: &Cli, yes: bool, prompt: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    if cli.non_interactive || !std::io::stdin().is_terminal() {
        return Err(CliError::Usage(format!("{prompt} Pass --yes to confirm.")).into());
    }
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Usage(format!("Prompt failed: {e}")))?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("Aborted".into()).into())
    }
}

/// Read a host image file.
pub(crate) fn read_image(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", path.display())).into());
    }
    Ok(data)
}

/// `1.2 KiB` style size.
pub(crate) fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1300), "1.3 KiB");
        assert_eq!(human_size(64 * 1024 * 1024), "64.0 MiB");
    }
}
