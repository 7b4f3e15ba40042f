//! Serial monitor over the task engine's pipe.
//!
//! The sketch is started and the pipe opened at the monitor baud rate.
//! Board output goes to the terminal and keystrokes go back to the board.

use anyhow::{Context, Result};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;
use sdlink::{LineFormatter, TaskEngine, TextDecoder};
use std::fs::File;
use std::io::{self, IsTerminal, Write as _};
use std::path::Path;
use std::time::Duration;

use crate::link::Link;
use crate::{Cli, clear_interrupted_flag, was_interrupted};

/// Monitor baud rate when neither the flag nor the config sets one.
pub(crate) const DEFAULT_MONITOR_BAUD: u32 = 9600;

const POLL: Duration = Duration::from_millis(20);

/// Where monitor text goes. With a terminal on both streams everything is
/// written to stderr so status lines and data never interleave mid-line;
/// otherwise data goes to stdout and status to stderr.
struct Output {
    tty_mode: bool,
    decoder: TextDecoder,
    formatter: LineFormatter,
    log: Option<File>,
}

impl Output {
    fn status(&mut self, message: &str) {
        if self.tty_mode {
            let prefix = if self.formatter.at_line_start() { "" } else { "\r\n" };
            eprint!("{prefix}\r\x1b[2K{message}\r\n");
            // The next chunk starts on a fresh line.
            self.formatter.format("\n");
        } else {
            eprintln!("{message}");
        }
        io::stderr().flush().ok();
    }

    fn data(&mut self, bytes: &[u8]) {
        let text = self.decoder.push(bytes);
        if text.is_empty() {
            return;
        }
        if let Some(log) = &mut self.log {
            let _ = log.write_all(text.as_bytes());
        }
        let shown = self.formatter.format(&text);
        if self.tty_mode {
            eprint!("{shown}");
            io::stderr().flush().ok();
        } else {
            print!("{shown}");
            io::stdout().flush().ok();
        }
    }
}

/// Move whatever the pipe holds to the terminal.
fn drain(engine: &TaskEngine, out: &mut Output) {
    let mut buf = [0u8; 512];
    loop {
        let n = engine.read(&mut buf);
        if n == 0 {
            break;
        }
        out.data(&buf[..n]);
    }
}

/// Bytes a key press sends, if any.
fn key_bytes(code: KeyCode, modifiers: KeyModifiers) -> Option<Vec<u8>> {
    match (code, modifiers) {
        (KeyCode::Enter, _) => Some(b"\r\n".to_vec()),
        (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
            let mut buf = [0u8; 4];
            Some(c.encode_utf8(&mut buf).as_bytes().to_vec())
        },
        (KeyCode::Backspace, _) => Some(vec![0x08]),
        (KeyCode::Tab, _) => Some(vec![0x09]),
        (KeyCode::Esc, _) => Some(vec![0x1B]),
        _ => None,
    }
}

/// Run the serial monitor.
///
/// - Ctrl+C: exit
/// - Ctrl+R: restart the sketch
/// - Ctrl+T: toggle timestamps
///
/// Without a terminal on stdin the monitor only prints board output until
/// interrupted.
pub(crate) fn cmd_monitor(
    cli: &Cli,
    link: &Link,
    baud: u32,
    timestamps: bool,
    log_file: Option<&Path>,
) -> Result<()> {
    let engine = link.engine();
    let tty_mode = io::stdout().is_terminal() && io::stderr().is_terminal();
    let interactive = io::stdin().is_terminal() && !cli.non_interactive;

    let log = match log_file {
        Some(path) => Some(
            File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?,
        ),
        None => None,
    };
    let mut out = Output {
        tty_mode,
        decoder: TextDecoder::new(),
        formatter: LineFormatter::new(timestamps),
        log,
    };

    out.status(&format!(
        "{} Monitoring at {baud} baud",
        style("📡").cyan()
    ));
    if let Some(path) = log_file {
        out.status(&format!("{} Logging to {}", style("📝").cyan(), path.display()));
    }
    if interactive {
        out.status(&style("Ctrl+C exit, Ctrl+R restart, Ctrl+T timestamps").dim().to_string());
    }

    engine.open_serial(baud);

    let _raw_guard = if interactive {
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Some(RawModeGuard)
    } else {
        None
    };

    loop {
        if was_interrupted() {
            break;
        }
        drain(engine, &mut out);

        if !interactive {
            std::thread::sleep(POLL);
            continue;
        }
        if !event::poll(POLL)? {
            continue;
        }
        let Event::Key(KeyEvent {
            code, modifiers, ..
        }) = event::read()?
        else {
            continue;
        };
        match (code, modifiers) {
            (KeyCode::Char('c'), KeyModifiers::CONTROL) => break,
            (KeyCode::Char('r'), KeyModifiers::CONTROL) => {
                out.status(&format!("{} Restarting sketch", style("🔄").cyan()));
                engine.close_serial();
                engine.open_serial(baud);
            },
            (KeyCode::Char('t'), KeyModifiers::CONTROL) => {
                let on = !out.formatter.timestamps();
                out.formatter.set_timestamps(on);
                let state = if on { "Timestamps on" } else { "Timestamps off" };
                out.status(&format!("{} {state}", style("⏱").cyan()));
            },
            (code, modifiers) => {
                if let Some(bytes) = key_bytes(code, modifiers) {
                    engine.write(&bytes);
                }
            },
        }
    }

    drain(engine, &mut out);
    engine.close_serial();
    out.status(&format!("{} Monitor closed", style("👋").cyan()));
    clear_interrupted_flag();
    Ok(())
}

/// Restores the terminal mode on drop.
struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_sends_crlf() {
        assert_eq!(key_bytes(KeyCode::Enter, KeyModifiers::NONE), Some(b"\r\n".to_vec()));
    }

    #[test]
    fn test_characters_are_utf8() {
        assert_eq!(key_bytes(KeyCode::Char('a'), KeyModifiers::NONE), Some(b"a".to_vec()));
        assert_eq!(key_bytes(KeyCode::Char('A'), KeyModifiers::SHIFT), Some(b"A".to_vec()));
        assert_eq!(
            key_bytes(KeyCode::Char('é'), KeyModifiers::NONE),
            Some("é".as_bytes().to_vec())
        );
    }

    #[test]
    fn test_control_chords_send_nothing() {
        assert_eq!(key_bytes(KeyCode::Char('x'), KeyModifiers::CONTROL), None);
        assert_eq!(key_bytes(KeyCode::F(1), KeyModifiers::NONE), None);
    }

    #[test]
    fn test_special_keys() {
        assert_eq!(key_bytes(KeyCode::Backspace, KeyModifiers::NONE), Some(vec![0x08]));
        assert_eq!(key_bytes(KeyCode::Tab, KeyModifiers::NONE), Some(vec![0x09]));
        assert_eq!(key_bytes(KeyCode::Esc, KeyModifiers::NONE), Some(vec![0x1B]));
    }
}
