//! Text handling for the serial pipe.
//!
//! Sketch output arrives in arbitrary chunks. [`TextDecoder`] turns it into
//! text without splitting multi-byte characters, and [`LineFormatter`]
//! prepares it for a raw-mode terminal.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

/// Incremental lossy UTF-8 decoder.
#[derive(Debug, Default)]
pub struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` after whatever was held back from the last call.
    ///
    /// Invalid sequences become `U+FFFD`; an incomplete character at the end
    /// is kept for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending
            .extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;
        for chunk in self.pending.utf8_chunks() {
            out.push_str(chunk.valid());
            consumed += chunk.valid().len();
            let invalid = chunk.invalid();
            if invalid.is_empty() {
                continue;
            }
            let tail = consumed + invalid.len() == self.pending.len();
            // A short trailing sequence may still be completed.
            if tail && invalid.len() < 4 && (0xC2..=0xF4).contains(&invalid[0]) {
                break;
            }
            out.push(char::REPLACEMENT_CHARACTER);
            consumed += invalid.len();
        }
        self.pending
            .drain(..consumed);
        out
    }

    /// Bytes held back.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }
}

/// Normalises line endings and optionally stamps each line.
#[derive(Debug)]
pub struct LineFormatter {
    timestamps: bool,
    at_line_start: bool,
}

impl LineFormatter {
    /// New formatter.
    pub fn new(timestamps: bool) -> Self {
        Self {
            timestamps,
            at_line_start: true,
        }
    }

    /// Toggle timestamps.
    pub fn set_timestamps(&mut self, on: bool) {
        self.timestamps = on;
    }

    /// Whether timestamps are on.
    pub fn timestamps(&self) -> bool {
        self.timestamps
    }

    /// Whether the next character starts a line.
    pub fn at_line_start(&self) -> bool {
        self.at_line_start
    }

    /// Convert `text` for the terminal: any of `\r`, `\n`, `\r\n` becomes
    /// `\r\n`, other control characters except tab are dropped.
    pub fn format(&mut self, text: &str) -> String {
        let stamp = self
            .timestamps
            .then(clock_stamp);
        let mut out = String::with_capacity(text.len() + 16);
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\r' | '\n' => {
                    if c == '\r' && chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    out.push_str("\r\n");
                    self.at_line_start = true;
                },
                '\t' => self.push_visible(&mut out, c, stamp.as_deref()),
                _ if c.is_control() => {},
                _ => self.push_visible(&mut out, c, stamp.as_deref()),
            }
        }
        out
    }

    fn push_visible(&mut self, out: &mut String, c: char, stamp: Option<&str>) {
        if self.at_line_start {
            if let Some(stamp) = stamp {
                out.push_str(stamp);
            }
            self.at_line_start = false;
        }
        out.push(c);
    }
}

/// `HH:MM:SS.mmm` (UTC) in dim grey.
fn clock_stamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let mut s = String::with_capacity(24);
    let _ = write!(
        s,
        "\x1b[90m[{:02}:{:02}:{:02}.{:03}]\x1b[0m ",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        now.subsec_millis()
    );
    s
}
