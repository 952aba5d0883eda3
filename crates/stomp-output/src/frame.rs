//! STOMP frames and their wire encoding.
//!
//! Wire format:
//! ```text
//! COMMAND\n
//! name:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! Header names and values are escaped per STOMP 1.2 on every frame except
//! CONNECT and CONNECTED. Bare EOLs between frames are heart-beats.

use crate::config::BrokerEndpoint;
use crate::error::{StompError, StompResult};
use std::fmt;

pub const CONNECT: &str = "CONNECT";
pub const CONNECTED: &str = "CONNECTED";
pub const SEND: &str = "SEND";
pub const BEGIN: &str = "BEGIN";
pub const COMMIT: &str = "COMMIT";
pub const ABORT: &str = "ABORT";
pub const DISCONNECT: &str = "DISCONNECT";
pub const RECEIPT: &str = "RECEIPT";
pub const ERROR: &str = "ERROR";
pub const MESSAGE: &str = "MESSAGE";

/// Largest frame accepted from the broker, head and body together.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Headers never overridden by user-configured message headers.
const RESERVED_SEND_HEADERS: &[&str] = &["destination", "transaction", "receipt", "content-length"];

/// A single STOMP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Replace the value of `name`, appending it if absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self.headers.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// First value of header `name`. Repeated headers keep the first
    /// occurrence, as STOMP 1.2 requires.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// CONNECT frame for `endpoint`.
    pub fn connect(endpoint: &BrokerEndpoint) -> Self {
        Frame::new(CONNECT)
            .header("accept-version", "1.0,1.1,1.2")
            .header("host", endpoint.virtual_host())
            .header("login", &endpoint.login)
            .header("passcode", endpoint.passcode.expose())
            .header("heart-beat", "0,0")
    }

    pub fn begin(transaction: &str) -> Self {
        Frame::new(BEGIN).header("transaction", transaction)
    }

    pub fn commit(transaction: &str) -> Self {
        Frame::new(COMMIT).header("transaction", transaction)
    }

    pub fn abort(transaction: &str) -> Self {
        Frame::new(ABORT).header("transaction", transaction)
    }

    /// SEND frame inside `transaction`.
    ///
    /// User headers follow the protocol headers; any that would clobber
    /// `destination`, `transaction` or `receipt` are dropped.
    pub fn send(
        destination: &str,
        transaction: &str,
        headers: &[(String, String)],
        body: Vec<u8>,
    ) -> Self {
        let mut frame = Frame::new(SEND)
            .header("destination", destination)
            .header("transaction", transaction)
            .header("content-type", "application/json");
        for (name, value) in headers {
            if RESERVED_SEND_HEADERS.contains(&name.as_str()) {
                continue;
            }
            frame.set_header(name, value);
        }
        frame.with_body(body)
    }

    pub fn disconnect(receipt_id: &str) -> Self {
        Frame::new(DISCONNECT).header("receipt", receipt_id)
    }

    fn escapes_headers(&self) -> bool {
        self.command != CONNECT && self.command != CONNECTED
    }

    /// Encode the frame for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let escape = self.escapes_headers();
        let mut buf = Vec::with_capacity(self.command.len() + 64 + self.body.len());

        buf.extend_from_slice(self.command.as_bytes());
        buf.push(b'\n');

        for (name, value) in &self.headers {
            if name == "content-length" {
                continue;
            }
            push_header_part(&mut buf, name, escape);
            buf.push(b':');
            push_header_part(&mut buf, value, escape);
            buf.push(b'\n');
        }
        if !self.body.is_empty() {
            buf.extend_from_slice(format!("content-length:{}\n", self.body.len()).as_bytes());
        }

        buf.push(b'\n');
        buf.extend_from_slice(&self.body);
        buf.push(0);
        buf
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.command)?;
        for (name, value) in &self.headers {
            if name == "passcode" {
                write!(f, " {}=<redacted>", name)?;
            } else {
                write!(f, " {}={}", name, value)?;
            }
        }
        write!(f, " ({} bytes)", self.body.len())
    }
}

fn push_header_part(buf: &mut Vec<u8>, part: &str, escape: bool) {
    if !escape {
        buf.extend_from_slice(part.as_bytes());
        return;
    }
    for byte in part.bytes() {
        match byte {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            b':' => buf.extend_from_slice(b"\\c"),
            other => buf.push(other),
        }
    }
}

fn unescape(raw: &str) -> StompResult<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(StompError::Protocol(format!(
                    "invalid header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )))
            }
        }
    }
    Ok(out)
}

/// Parse one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes consumed, or `None` when
/// `buf` does not yet hold a complete frame. Leading heart-beat EOLs are
/// consumed silently; a buffer holding only heart-beats yields `None`.
///
/// A frame larger than [`MAX_FRAME_SIZE`], declared or still unterminated,
/// is a protocol error.
pub fn parse_frame(buf: &[u8]) -> StompResult<Option<(Frame, usize)>> {
    let start = buf
        .iter()
        .position(|b| *b != b'\n' && *b != b'\r')
        .unwrap_or(buf.len());
    let data = &buf[start..];

    let Some(head_end) = find_head_end(data) else {
        return incomplete(data);
    };
    let (head, body_start) = head_end;

    let head = std::str::from_utf8(&data[..head])
        .map_err(|_| StompError::Protocol("frame head is not UTF-8".to_string()))?;
    let mut lines = head.lines().map(|l| l.strip_suffix('\r').unwrap_or(l));

    let command = lines
        .next()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| StompError::Protocol("missing frame command".to_string()))?
        .to_string();
    let escaped = command != CONNECT && command != CONNECTED;

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| StompError::Protocol(format!("malformed header line: {}", line)))?;
        if escaped {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| StompError::Protocol(format!("invalid content-length: {}", v)))
        })
        .transpose()?;

    let rest = &data[body_start..];
    let (body, consumed) = match content_length {
        Some(len) => {
            let framed = len
                .checked_add(1)
                .filter(|n| body_start.saturating_add(*n) <= MAX_FRAME_SIZE)
                .ok_or_else(|| {
                    StompError::Protocol(format!("content-length {} exceeds frame limit", len))
                })?;
            if rest.len() < framed {
                return Ok(None);
            }
            if rest[len] != 0 {
                return Err(StompError::Protocol(
                    "frame body not terminated by NUL".to_string(),
                ));
            }
            (rest[..len].to_vec(), framed)
        }
        None => match rest.iter().position(|b| *b == 0) {
            Some(nul) => (rest[..nul].to_vec(), nul + 1),
            None => return incomplete(data),
        },
    };

    let frame = Frame {
        command,
        headers,
        body,
    };
    Ok(Some((frame, start + body_start + consumed)))
}

fn incomplete(data: &[u8]) -> StompResult<Option<(Frame, usize)>> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(StompError::Protocol(format!(
            "unterminated frame exceeds {} bytes",
            MAX_FRAME_SIZE
        )));
    }
    Ok(None)
}

/// Locate the blank line ending the frame head. Returns the head length
/// and the offset where the body begins.
fn find_head_end(data: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\n' {
            if data.get(i + 1) == Some(&b'\n') {
                return Some((i, i + 2));
            }
            if data.get(i + 1) == Some(&b'\r') && data.get(i + 2) == Some(&b'\n') {
                return Some((i, i + 3));
            }
        }
        i += 1;
    }
    None
}
