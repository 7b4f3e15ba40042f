//! Connection to a board or a card image, and task execution with progress.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, warn};
use sdlink::task::BatchProgress;
use sdlink::{MemoryCard, NativePort, SerialConfig, Task, TaskEngine, VirtualDevice};
use std::fs;
use std::path::PathBuf;

use crate::config::Config;
use crate::{Cli, CliError, baud_rate, get_port, use_fancy_output, was_interrupted};

/// An open task engine.
pub(crate) struct Link {
    engine: TaskEngine,
    image: Option<(VirtualDevice, PathBuf)>,
    quiet: bool,
}

impl Link {
    /// Open the board on the selected port, or the `--virtual` image.
    pub(crate) fn open(cli: &Cli, config: &mut Config) -> Result<Self> {
        let baud = baud_rate(cli, config);
        let engine_config = config.engine_config(baud);

        if let Some(path) = &cli.virtual_image {
            let card = MemoryCard::load(path)
                .with_context(|| format!("Failed to load card image {}", path.display()))?;
            let device = VirtualDevice::new(card);
            debug!("Virtual device on {}", path.display());
            let engine = TaskEngine::open(Box::new(device.clone()), engine_config)?;
            return Ok(Self {
                engine,
                image: Some((device, path.clone())),
                quiet: cli.quiet,
            });
        }

        let port_name = get_port(cli, config)?;
        if !cli.quiet {
            eprintln!(
                "{} Using {} at {baud} baud",
                style("🔌").cyan(),
                style(&port_name).green()
            );
        }
        let port = NativePort::open(&SerialConfig::new(&port_name, baud))
            .with_context(|| format!("Failed to open serial port {port_name}"))?;
        let engine = TaskEngine::open(Box::new(port), engine_config)?;
        Ok(Self {
            engine,
            image: None,
            quiet: cli.quiet,
        })
    }

    /// The engine.
    pub(crate) fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Run one task to completion.
    pub(crate) fn run(&self, task: impl Task + 'static) -> Result<()> {
        self.run_all(vec![Box::new(task)])
    }

    /// Run tasks as one synchronous batch with a progress bar. Ctrl+C
    /// cancels the batch.
    pub(crate) fn run_all(&self, tasks: Vec<Box<dyn Task>>) -> Result<()> {
        let pb = progress_bar(self.quiet)?;
        let mut cancelled = false;
        let handles = self
            .engine
            .execute_all_with_progress(tasks, &mut |p: &BatchProgress| {
                if was_interrupted() && !cancelled {
                    cancelled = true;
                    pb.set_message("cancelling");
                    self.engine.cancel_tasks();
                }
                pb.set_position((p.fraction * 100.0).round() as u64);
                if !cancelled {
                    let message = if p.status.is_empty() { &p.title } else { &p.status };
                    pb.set_message(message.clone());
                }
            });
        pb.finish_and_clear();

        if let Some(error) = handles.iter().find_map(|h| h.take_error()) {
            return Err(error.into());
        }
        if was_interrupted() || handles.iter().any(|h| h.cancel_requested()) {
            return Err(CliError::Cancelled("Operation cancelled".into()).into());
        }
        Ok(())
    }

    /// Close the engine and save the card image, then hand back `result`.
    pub(crate) fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.engine.close();
        if let Some((device, path)) = self.image.take() {
            let saved = fs::write(&path, device.card_image())
                .with_context(|| format!("Failed to save card image {}", path.display()));
            match (&result, saved) {
                (_, Ok(())) => debug!("Saved card image {}", path.display()),
                (Ok(_), Err(e)) => return Err(e),
                (Err(_), Err(e)) => warn!("{e:#}"),
            }
        }
        result
    }
}

/// Progress bar on stderr, hidden when quiet or not a terminal.
fn progress_bar(quiet: bool) -> Result<ProgressBar> {
    if quiet || !use_fancy_output() {
        return Ok(ProgressBar::hidden());
    }
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    Ok(pb)
}
