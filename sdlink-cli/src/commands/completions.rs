//! Shell completion scripts.

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;
use std::env;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};

use crate::Cli;

const BIN: &str = "sdlink";
const ZSH_FPATH: &str = "fpath=(~/.zfunc $fpath)";

fn script(shell: Shell, out: &mut dyn io::Write) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, out);
}

/// Print the completion script for `shell`.
pub(crate) fn cmd_completions(shell: Shell) {
    script(shell, &mut io::stdout());
}

/// Shell named by a binary path such as `/usr/bin/zsh`.
fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path).file_name()?.to_str()?;
    match name {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

fn detect_shell_type() -> Option<Shell> {
    if let Ok(path) = env::var("SHELL") {
        return shell_from_path(&path);
    }
    (cfg!(windows) && env::var("PSModulePath").is_ok()).then_some(Shell::PowerShell)
}

/// Where `shell` looks for user completion scripts.
fn install_path(shell: Shell, dirs: &BaseDirs) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => dirs
            .data_dir()
            .join("bash-completion/completions")
            .join(BIN),
        Shell::Zsh => dirs.home_dir().join(".zfunc").join(format!("_{BIN}")),
        Shell::Fish => dirs
            .config_dir()
            .join("fish/completions")
            .join(format!("{BIN}.fish")),
        Shell::Elvish => dirs
            .config_dir()
            .join("elvish/lib")
            .join(format!("{BIN}.elv")),
        Shell::PowerShell => {
            let dir = env::var_os("PROFILE")
                .and_then(|p| PathBuf::from(p).parent().map(Path::to_path_buf))
                .unwrap_or_else(|| dirs.config_dir().join("powershell/completions"));
            dir.join(format!("{BIN}.ps1"))
        },
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

/// Make sure `~/.zshrc` puts `~/.zfunc` on the fpath.
fn ensure_zsh_fpath(home: &Path) -> Result<()> {
    let zshrc = home.join(".zshrc");
    let present = fs::read_to_string(&zshrc).is_ok_and(|content| content.contains(ZSH_FPATH));
    if present {
        return Ok(());
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&zshrc)
        .with_context(|| format!("Failed to update {}", zshrc.display()))?;
    writeln!(file, "\n# {BIN} completions")?;
    writeln!(file, "{ZSH_FPATH}")?;
    writeln!(file, "autoload -Uz compinit && compinit")?;
    eprintln!(
        "{} Added fpath to {}",
        style("✓").green().bold(),
        style(zshrc.display()).yellow()
    );
    Ok(())
}

/// Write the completion script where the shell picks it up.
pub(crate) fn cmd_completions_install(shell: Option<Shell>) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             sdlink completions --install bash",
        )?,
    };
    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, &dirs)?;

    let mut buf = Vec::new();
    script(shell, &mut buf);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(format!("{shell:?}")).cyan(),
        style(path.display()).yellow()
    );

    match shell {
        Shell::Bash => eprintln!(
            "\nCompletions load on new terminals. To activate now: {}",
            style(format!("source {}", path.display())).cyan()
        ),
        Shell::Zsh => {
            ensure_zsh_fpath(dirs.home_dir())?;
            eprintln!("\nRestart your shell or run: {}", style("exec zsh").cyan());
        },
        Shell::PowerShell => eprintln!(
            "\nAdd this to your PowerShell profile: {}",
            style(format!("Import-Module {}", path.display())).cyan()
        ),
        _ => eprintln!("\nCompletions load in new {shell:?} sessions."),
    }
    Ok(())
}
