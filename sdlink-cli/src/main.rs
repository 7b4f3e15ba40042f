//! sdlink CLI - manage the Micro-SD card and program memory of a board.
//!
//! ## Features
//!
//! - Browse, import, export, rename and delete card files
//! - List and launch sketches stored on the card
//! - Upload programs and firmware
//! - Read and write RAM registers and EEPROM settings
//! - Passthrough serial monitor
//! - Offline card images through a virtual device
//! - Shell completion generation

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod link;
mod serial;

use config::Config;
use link::Link;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl+C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing input (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Invalid configuration (exit 3).
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Default command-mode baud rate.
const DEFAULT_BAUD: u32 = 115_200;

/// sdlink - manage the Micro-SD card and program memory of a board.
///
/// Environment variables:
///   SDLINK_PORT              - Default serial port
///   SDLINK_BAUD              - Command-mode baud rate (default: 115200)
///   SDLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "sdlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  sdlink ls /\n  sdlink import photo.bmp notes/ /\n  \
                        sdlink --virtual card.img sketches")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "SDLINK_PORT")]
    port: Option<String>,

    /// Command-mode baud rate.
    #[arg(short, long, global = true, env = "SDLINK_BAUD")]
    baud: Option<u32>,

    /// Work on a card image file through a virtual device instead of a board.
    #[arg(long = "virtual", global = true, value_name = "IMAGE", conflicts_with = "port")]
    virtual_image: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "SDLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List a card directory.
    Ls {
        /// Directory on the card.
        #[arg(default_value = "/")]
        path: String,

        /// Output entries as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Copy host files or folders onto the card.
    Import {
        /// Host files or folders.
        #[arg(required = true, num_args = 1..)]
        sources: Vec<PathBuf>,

        /// Card directory to copy into.
        dest: String,
    },

    /// Copy card files or folders to the host.
    Export {
        /// Card files or folders.
        #[arg(required = true, num_args = 1..)]
        sources: Vec<String>,

        /// Host file or directory.
        dest: PathBuf,
    },

    /// Delete card files or folders.
    Rm {
        /// Card paths.
        #[arg(required = true)]
        paths: Vec<String>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Rename a card entry.
    Mv {
        /// Card path.
        path: String,

        /// New name (no directory part).
        new_name: String,
    },

    /// Show or set the volume label.
    Label {
        /// New label.
        name: Option<String>,
    },

    /// List the sketches on the card.
    Sketches {
        /// Output sketches as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Save a sketch icon to a host file.
    Icon {
        /// Sketch name.
        sketch: String,

        /// Output file.
        output: PathBuf,
    },

    /// Load a sketch from the card and start it.
    Launch {
        /// Sketch name, with or without extension.
        sketch: String,
    },

    /// Write a flat binary into program flash.
    UploadProgram {
        /// Program image.
        image: PathBuf,

        /// Start address in flash (page aligned).
        #[arg(short, long, default_value = "0", value_parser = parse_hex_u32)]
        address: u32,

        /// Skip reading the pages back.
        #[arg(long)]
        no_verify: bool,
    },

    /// Reflash the device firmware through service mode.
    UploadFirmware {
        /// Firmware image.
        image: PathBuf,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Read or change RAM registers.
    Regs {
        #[command(subcommand)]
        action: RegsAction,
    },

    /// Show the EEPROM settings block.
    Settings {
        /// Output settings as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Restore the factory settings block.
        #[arg(long)]
        reset: bool,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show device name, signature and card summary.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Start the user program and open a serial monitor.
    Monitor {
        /// Baud rate of the user program.
        #[arg(long)]
        monitor_baud: Option<u32>,

        /// Prefix lines with a timestamp.
        #[arg(long)]
        timestamps: bool,

        /// Append received text to a file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Create an empty FAT card image for --virtual.
    Format {
        /// Image file to create.
        image: PathBuf,

        /// Image size in MiB.
        #[arg(long, default_value = "64")]
        size_mb: u32,

        /// Use FAT16 instead of FAT32.
        #[arg(long)]
        fat16: bool,

        /// Blocks per cluster.
        #[arg(long, default_value = "8")]
        cluster_blocks: u8,

        /// Volume label.
        #[arg(long)]
        label: Option<String>,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Register actions.
#[derive(Subcommand)]
enum RegsAction {
    /// Print register values.
    Read {
        /// Only these registers.
        names: Vec<String>,

        /// Output values as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Change register values (NAME=VALUE, hex with 0x).
    Write {
        /// Assignments.
        #[arg(required = true, value_parser = parse_assignment)]
        assignments: Vec<(String, u32)>,
    },
}

/// Parse a number given in decimal or with a 0x prefix.
fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if s.starts_with("0x") || s.starts_with("0X") {
        return parse_hex_u32(s);
    }
    s.replace('_', "")
        .parse()
        .map_err(|e| format!("Invalid number '{s}': {e}"))
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

/// Parse a register assignment `NAME=VALUE`.
fn parse_assignment(s: &str) -> Result<(String, u32), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("Invalid assignment '{s}'. Expected NAME=VALUE (e.g., PORTB=0x20)"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Invalid assignment '{s}': empty register name"));
    }
    Ok((name.to_string(), parse_number(value)?))
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return match cli {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<sdlink::Error>() {
            return match e {
                sdlink::Error::Cancelled => 130,
                sdlink::Error::Config(_) => 3,
                sdlink::Error::Serial(_) | sdlink::Error::Timeout(_) => 4,
                _ => 1,
            };
        }
    }
    1
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install the Ctrl+C handler: {e}");
    }

    debug!(
        "sdlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", console::style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        if !path.exists() {
            return Err(CliError::Config(format!("Config file not found: {}", path.display())).into());
        }
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Ls { path, json } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::files::cmd_ls(&link, path, *json);
            link.finish(result)
        },
        Commands::Import { sources, dest } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::files::cmd_import(cli, &link, sources, dest);
            link.finish(result)
        },
        Commands::Export { sources, dest } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::files::cmd_export(cli, &link, sources, dest);
            link.finish(result)
        },
        Commands::Rm { paths, yes } => {
            commands::confirm(cli, *yes, &format!("Delete {} from the card?", paths.join(", ")))?;
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::files::cmd_rm(cli, &link, paths);
            link.finish(result)
        },
        Commands::Mv { path, new_name } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::files::cmd_mv(cli, &link, path, new_name);
            link.finish(result)
        },
        Commands::Label { name } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::files::cmd_label(cli, &link, name.as_deref());
            link.finish(result)
        },
        Commands::Sketches { json } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::sketch::cmd_sketches(&link, *json);
            link.finish(result)
        },
        Commands::Icon { sketch, output } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::sketch::cmd_icon(cli, &link, sketch, output);
            link.finish(result)
        },
        Commands::Launch { sketch } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::sketch::cmd_launch(cli, &link, sketch);
            link.finish(result)
        },
        Commands::UploadProgram {
            image,
            address,
            no_verify,
        } => {
            let data = commands::read_image(image)?;
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::program::cmd_upload_program(cli, &link, data, *address, !*no_verify);
            link.finish(result)
        },
        Commands::UploadFirmware { image, yes } => {
            let data = commands::read_image(image)?;
            commands::confirm(
                cli,
                *yes,
                "Reflash the device firmware? Do not disconnect the board until it finishes.",
            )?;
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::program::cmd_upload_firmware(cli, &link, data);
            link.finish(result)
        },
        Commands::Regs { action } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = match action {
                RegsAction::Read { names, json } => commands::device::cmd_regs_read(&link, names, *json),
                RegsAction::Write { assignments } => {
                    commands::device::cmd_regs_write(cli, &link, assignments.clone())
                },
            };
            link.finish(result)
        },
        Commands::Settings { json, reset, yes } => {
            if *reset {
                commands::confirm(cli, *yes, "Restore the factory settings block?")?;
            }
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::device::cmd_settings(cli, &link, *json, *reset);
            link.finish(result)
        },
        Commands::Info { json } => {
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::device::cmd_info(&link, *json);
            link.finish(result)
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(&config, *json);
            Ok(())
        },
        Commands::Monitor {
            monitor_baud,
            timestamps,
            log_file,
        } => {
            let baud = monitor_baud
                .or(config.monitor.baud)
                .unwrap_or(commands::monitor::DEFAULT_MONITOR_BAUD);
            let timestamps = *timestamps || config.monitor.timestamps;
            let mut link = Link::open(cli, &mut config)?;
            let result = commands::monitor::cmd_monitor(cli, &link, baud, timestamps, log_file.as_deref());
            link.finish(result)
        },
        Commands::Format {
            image,
            size_mb,
            fat16,
            cluster_blocks,
            label,
            force,
        } => commands::files::cmd_format(
            cli,
            &commands::files::FormatRequest {
                image,
                size_mb: *size_mb,
                fat16: *fat16,
                cluster_blocks: *cluster_blocks,
                label: label.as_deref(),
                force: *force,
            },
        ),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: sdlink completions bash \
                         (or use sdlink completions --install)"
                            .into(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// Command-mode baud rate from the command line, config or default.
pub(crate) fn baud_rate(cli: &Cli, config: &Config) -> u32 {
    cli.baud
        .or(config.port.connection.baud)
        .unwrap_or(DEFAULT_BAUD)
}
