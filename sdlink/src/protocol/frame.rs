//! STK500v2-style message framing.
//!
//! ## Frame Format
//!
//! ```text
//! +-------+-----+--------+-------+----------------------+----------+
//! | START | SEQ | LENGTH | TOKEN |         BODY         | CHECKSUM |
//! +-------+-----+--------+-------+----------------------+----------+
//! |   1   |  1  | 2 (BE) |   1   |        LENGTH        |    1     |
//! +-------+-----+--------+-------+----------------------+----------+
//! | 0x1B  | seq |  len   | 0x0E  | request:  CMD DATA   | XOR of   |
//! |       |     |        |       | response: CMD ST DATA| all prev |
//! +-------+-----+--------+-------+----------------------+----------+
//! ```
//!
//! The checksum is self-inverting: XOR over a complete frame is zero.

use crate::error::{Error, Result};
use log::trace;

/// First byte of every frame.
pub const MESSAGE_START: u8 = 0x1B;

/// Fixed token byte following the length field.
pub const TOKEN: u8 = 0x0E;

/// Response status for success.
pub const STATUS_CMD_OK: u8 = 0x00;

/// Generic failure status.
pub const STATUS_CMD_FAILED: u8 = 0xC0;

/// Status returned for an unknown command.
pub const STATUS_CMD_UNKNOWN: u8 = 0xC9;

/// START + SEQ + LEN(2) + TOKEN.
pub const HEADER_LEN: usize = 5;

/// Largest body accepted by either side.
pub const MAX_BODY_LEN: usize = 1024 + 8;

/// XOR of all bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0, |acc, b| acc ^ b)
}

fn encode(seq: u8, body: &[u8]) -> Vec<u8> {
    let len = body.len() as u16;
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len() + 1);
    buf.push(MESSAGE_START);
    buf.push(seq);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.push(TOKEN);
    buf.extend_from_slice(body);
    buf.push(checksum(&buf));
    buf
}

/// Build a request frame: `CMD PAYLOAD` inside the envelope.
pub fn encode_request(seq: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + payload.len());
    body.push(command);
    body.extend_from_slice(payload);
    encode(seq, &body)
}

/// Build a response frame: `CMD STATUS PAYLOAD` inside the envelope.
pub fn encode_response(seq: u8, command: u8, status: u8, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(2 + payload.len());
    body.push(command);
    body.push(status);
    body.extend_from_slice(payload);
    encode(seq, &body)
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Sequence number.
    pub seq: u8,
    /// Body bytes (command first).
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Command byte.
    pub fn command(&self) -> u8 {
        self.body
            .first()
            .copied()
            .unwrap_or(0)
    }

    /// Bytes following the command.
    pub fn payload(&self) -> &[u8] {
        self.body
            .get(1..)
            .unwrap_or(&[])
    }
}

/// Decode exactly one frame occupying all of `data`.
pub fn decode_frame(data: &[u8]) -> Result<RawFrame> {
    if data.len() < HEADER_LEN + 1 {
        return Err(Error::Protocol("frame too short".into()));
    }
    if data[0] != MESSAGE_START || data[4] != TOKEN {
        return Err(Error::Protocol("bad frame header".into()));
    }
    let len = usize::from(u16::from_be_bytes([data[2], data[3]]));
    if data.len() != HEADER_LEN + len + 1 {
        return Err(Error::Protocol("frame length mismatch".into()));
    }
    if checksum(data) != 0 {
        return Err(Error::Protocol("checksum mismatch".into()));
    }
    Ok(RawFrame {
        seq: data[1],
        body: data[HEADER_LEN..HEADER_LEN + len].to_vec(),
    })
}

/// How close the best candidate frame came to being accepted.
///
/// Ordered from worst to best so `max` keeps the most informative one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchLevel {
    /// Nothing was received.
    NoData,
    /// Bytes arrived but no complete header.
    TooShort,
    /// A header arrived with another sequence number.
    Sequence,
    /// Sequence matched, but length, token or command did not.
    Header,
    /// Checksum of an otherwise matching frame with an OK status failed.
    /// Frames with a failure status never reach this level.
    Checksum,
}

enum Candidate {
    Incomplete,
    Rejected(MatchLevel),
    Accepted(Result<Vec<u8>>),
}

/// Incrementally searches incoming bytes for the response to one request.
#[derive(Debug)]
pub struct ResponseScanner {
    seq: u8,
    command: u8,
    buf: Vec<u8>,
    best: MatchLevel,
}

impl ResponseScanner {
    /// Look for a response with this sequence number and command echo.
    pub fn new(seq: u8, command: u8) -> Self {
        Self {
            seq,
            command,
            buf: Vec::new(),
            best: MatchLevel::NoData,
        }
    }

    /// Best match level seen so far.
    pub fn best(&self) -> MatchLevel {
        self.best
    }

    /// Feed received bytes.
    ///
    /// Returns `Some` once a frame for this request is complete: its payload
    /// (after the status byte) on success, or the device error.
    pub fn push(&mut self, data: &[u8]) -> Option<Result<Vec<u8>>> {
        if data.is_empty() {
            return None;
        }
        self.buf
            .extend_from_slice(data);
        self.note(MatchLevel::TooShort);

        let mut start = 0;
        while start < self.buf.len() {
            let Some(offset) = self.buf[start..]
                .iter()
                .position(|&b| b == MESSAGE_START)
            else {
                start = self.buf.len();
                break;
            };
            start += offset;

            match self.inspect(start) {
                Candidate::Incomplete => break,
                Candidate::Rejected(level) => {
                    self.note(level);
                    start += 1;
                },
                Candidate::Accepted(result) => {
                    self.buf.clear();
                    return Some(result);
                },
            }
        }
        self.buf
            .drain(..start);
        None
    }

    fn note(&mut self, level: MatchLevel) {
        self.best = self.best.max(level);
    }

    fn inspect(&self, at: usize) -> Candidate {
        let frame = &self.buf[at..];
        if frame.len() < HEADER_LEN {
            return Candidate::Incomplete;
        }
        if frame[1] != self.seq {
            return Candidate::Rejected(MatchLevel::Sequence);
        }
        let len = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
        if frame[4] != TOKEN || !(2..=MAX_BODY_LEN).contains(&len) {
            return Candidate::Rejected(MatchLevel::Header);
        }
        if frame.len() < HEADER_LEN + len + 1 {
            return Candidate::Incomplete;
        }
        let body = &frame[HEADER_LEN..HEADER_LEN + len];
        if body[0] != self.command {
            return Candidate::Rejected(MatchLevel::Header);
        }
        // A failure status is reported before the checksum is looked at.
        let status = body[1];
        if status != STATUS_CMD_OK {
            return Candidate::Accepted(Err(Error::Device {
                command: self.command,
                status,
            }));
        }
        if checksum(&frame[..=HEADER_LEN + len]) != 0 {
            trace!("Checksum mismatch in response seq={}", self.seq);
            return Candidate::Rejected(MatchLevel::Checksum);
        }
        Candidate::Accepted(Ok(body[2..].to_vec()))
    }

    /// Error describing why no frame was accepted.
    pub fn failure(&self) -> Error {
        let cmd = self.command;
        match self.best {
            MatchLevel::NoData => {
                Error::Timeout(format!("no response from device (command 0x{cmd:02X})"))
            },
            MatchLevel::TooShort => {
                Error::Protocol(format!("incomplete response to command 0x{cmd:02X}"))
            },
            MatchLevel::Sequence => Error::Protocol(format!(
                "response sequence mismatch (expected {}, command 0x{cmd:02X})",
                self.seq
            )),
            MatchLevel::Header => Error::Protocol(format!(
                "response length, token or command mismatch (command 0x{cmd:02X})"
            )),
            MatchLevel::Checksum => {
                Error::Protocol(format!("response checksum mismatch (command 0x{cmd:02X})"))
            },
        }
    }
}

/// Device-side frame splitter: extracts complete request frames.
#[derive(Debug, Default)]
pub struct RequestScanner {
    buf: Vec<u8>,
}

impl RequestScanner {
    /// Create an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf
            .extend_from_slice(data);
    }

    /// Bytes not yet consumed by a frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Drop buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next valid frame, discarding garbage in front of it.
    pub fn next_frame(&mut self) -> Option<RawFrame> {
        loop {
            let at = self.buf
                .iter()
                .position(|&b| b == MESSAGE_START)?;
            self.buf
                .drain(..at);
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len = usize::from(u16::from_be_bytes([self.buf[2], self.buf[3]]));
            if self.buf[4] != TOKEN || len == 0 || len > MAX_BODY_LEN {
                self.buf
                    .drain(..1);
                continue;
            }
            let total = HEADER_LEN + len + 1;
            if self.buf.len() < total {
                return None;
            }
            match decode_frame(&self.buf[..total]) {
                Ok(frame) => {
                    self.buf
                        .drain(..total);
                    return Some(frame);
                },
                Err(_) => {
                    self.buf
                        .drain(..1);
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let data = encode_request(7, 0x01, &[]);
        assert_eq!(data, vec![0x1B, 0x07, 0x00, 0x01, 0x0E, 0x01, 0x1B ^ 0x07 ^ 0x01 ^ 0x0E ^ 0x01]);
        assert_eq!(checksum(&data), 0);
    }

    #[test]
    fn test_decode_roundtrip_fields() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01];
        let data = encode_request(200, 0x14, &payload);
        let frame = decode_frame(&data).unwrap();
        assert_eq!(frame.seq, 200);
        assert_eq!(frame.command(), 0x14);
        assert_eq!(frame.payload(), &payload);
    }

    #[test]
    fn test_any_single_byte_flip_is_rejected() {
        let data = encode_request(42, 0xA1, &[1, 2, 3, 4, 5]);
        for i in 0..data.len() {
            for bit in 0..8 {
                let mut corrupt = data.clone();
                corrupt[i] ^= 1 << bit;
                assert!(decode_frame(&corrupt).is_err(), "flip at {i}/{bit} accepted");
            }
        }
    }

    #[test]
    fn test_scanner_accepts_response() {
        let mut scanner = ResponseScanner::new(3, 0x06);
        let frame = encode_response(3, 0x06, STATUS_CMD_OK, &[9, 8]);
        assert_eq!(scanner.push(&frame).unwrap().unwrap(), vec![9, 8]);
    }

    #[test]
    fn test_scanner_handles_split_delivery_and_garbage() {
        let mut scanner = ResponseScanner::new(5, 0xA1);
        let mut stream = vec![0x00, 0xFF, 0x1B];
        stream.extend(encode_response(5, 0xA1, STATUS_CMD_OK, &[1, 2, 3]));
        let (a, b) = stream.split_at(6);
        assert!(scanner.push(a).is_none());
        assert_eq!(scanner.push(b).unwrap().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_scanner_rejects_wrong_sequence() {
        let mut scanner = ResponseScanner::new(10, 0x01);
        let stale = encode_response(9, 0x01, STATUS_CMD_OK, &[]);
        assert!(scanner.push(&stale).is_none());
        assert_eq!(scanner.best(), MatchLevel::Sequence);
        assert!(matches!(scanner.failure(), Error::Protocol(_)));
    }

    #[test]
    fn test_scanner_skips_stale_then_accepts() {
        let mut scanner = ResponseScanner::new(1, 0x01);
        let mut stream = encode_response(0, 0x01, STATUS_CMD_OK, &[]);
        stream.extend(encode_response(1, 0x01, STATUS_CMD_OK, &[0x55]));
        assert_eq!(scanner.push(&stream).unwrap().unwrap(), vec![0x55]);
    }

    #[test]
    fn test_scanner_reports_device_status() {
        let mut scanner = ResponseScanner::new(2, 0xA2);
        let frame = encode_response(2, 0xA2, STATUS_CMD_FAILED, &[]);
        let err = scanner.push(&frame).unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Device {
                command: 0xA2,
                status: STATUS_CMD_FAILED
            }
        ));
    }

    #[test]
    fn test_scanner_status_wins_over_checksum() {
        let mut scanner = ResponseScanner::new(3, 0xA1);
        let mut frame = encode_response(3, 0xA1, STATUS_CMD_FAILED, &[0x55]);
        let last = frame.len() - 1;
        frame[last] ^= 0x80;
        let err = scanner.push(&frame).unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Device {
                command: 0xA1,
                status: STATUS_CMD_FAILED
            }
        ));
    }

    #[test]
    fn test_scanner_checksum_level() {
        let mut scanner = ResponseScanner::new(4, 0x01);
        let mut frame = encode_response(4, 0x01, STATUS_CMD_OK, &[1]);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(scanner.push(&frame).is_none());
        assert_eq!(scanner.best(), MatchLevel::Checksum);
    }

    #[test]
    fn test_scanner_no_data_is_timeout() {
        let scanner = ResponseScanner::new(0, 0x01);
        assert_eq!(scanner.best(), MatchLevel::NoData);
        assert!(matches!(scanner.failure(), Error::Timeout(_)));
    }

    #[test]
    fn test_request_scanner_splits_frames() {
        let mut scanner = RequestScanner::new();
        scanner.push(b"HEL");
        scanner.push(&encode_request(1, 0x01, &[]));
        scanner.push(&encode_request(2, 0x06, &[0, 0, 0, 4]));
        let a = scanner.next_frame().unwrap();
        let b = scanner.next_frame().unwrap();
        assert_eq!((a.seq, a.command()), (1, 0x01));
        assert_eq!((b.seq, b.payload()), (2, &[0u8, 0, 0, 4][..]));
        assert!(scanner.next_frame().is_none());
    }
}
