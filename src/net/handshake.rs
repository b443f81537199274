//! HTTP upgrade handshake: request detection/parsing and response text.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::net::framing::compute_accept_token;

const CRLF: &str = "\r\n";

/// Status line sent when the application refuses an upgrade. Kept verbatim
/// for wire compatibility with existing peers, even though it is not a
/// conforming HTTP status line.
pub const REJECT_STATUS_LINE: &str = "HTTP/1.1 101 404 Not Found";

/// Most bytes buffered while waiting for the blank line that ends a request
/// head. Past this the head is judged on what has arrived.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// What the first bytes of a connection turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Looks like the start of an upgrade request; wait for more bytes.
    Incomplete,
    /// A request head spanning the first `head_len` bytes.
    Request {
        request: HandshakeRequest,
        head_len: usize,
    },
    /// Anything else: a plain byte stream.
    Plain,
}

/// Classifies the bytes received on a fresh connection.
///
/// A head is complete at the first blank line. While it is not, bytes that
/// could still grow into a request (a `GET ` line, or a three-token request
/// line followed only by header lines) are `Incomplete`.
pub fn detect(raw: &[u8]) -> Detection {
    let (head, complete) = match head_len(raw) {
        Some(len) => (&raw[..len], true),
        None => (raw, raw.len() >= MAX_HEAD_LEN),
    };
    if !head.is_ascii() {
        return Detection::Plain;
    }
    let Ok(text) = std::str::from_utf8(head) else {
        return Detection::Plain;
    };
    if !complete && is_partial_request(text) {
        return Detection::Incomplete;
    }

    match HandshakeRequest::parse(text) {
        Some(request) => Detection::Request {
            request,
            head_len: head.len(),
        },
        None => Detection::Plain,
    }
}

/// Length up to and including the first blank line, if one has arrived.
fn head_len(raw: &[u8]) -> Option<usize> {
    raw.iter().enumerate().find_map(|(i, &byte)| {
        if byte != b'\n' {
            return None;
        }
        let rest = &raw[i + 1..];
        if rest.starts_with(b"\n") {
            Some(i + 2)
        } else if rest.starts_with(b"\r\n") {
            Some(i + 3)
        } else {
            None
        }
    })
}

fn is_partial_request(text: &str) -> bool {
    let Some((first, rest)) = text.split_once('\n') else {
        return "GET ".starts_with(text) || text.starts_with("GET ");
    };
    if split_trimmed(first.trim_end_matches('\r'), ' ').len() < 3 {
        return false;
    }

    // The text after the last newline is a line still arriving
    let complete = rest.rsplit_once('\n').map_or("", |(done, _)| done);
    complete
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .all(|line| line.contains(':'))
}

/// A parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Lower-cased keys, raw values. When a key repeats, the first line wins.
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Parses `text` as `METHOD PATH VERSION` followed by `Key: Value` lines.
    ///
    /// Returns `None` when the first line has fewer than three space
    /// separated tokens. Header lines that do not split into exactly one key
    /// and one value around `:` are skipped.
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));

        let parts = split_trimmed(lines.next()?, ' ');
        if parts.len() < 3 {
            return None;
        }

        let mut headers = HashMap::new();
        for line in lines {
            let kv = split_trimmed(line, ':');
            if kv.len() != 2 {
                continue;
            }
            headers
                .entry(kv[0].to_ascii_lowercase())
                .or_insert_with(|| kv[1].to_string());
        }

        Some(Self {
            method: parts[0].to_string(),
            path: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup. The value is returned raw, including
    /// any whitespace that followed the colon.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }
}

/// Outcome of the accept-decision hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeDecision {
    /// Upgrade, appending `headers` after the standard response headers.
    Accept { headers: Vec<(String, String)> },
    Reject,
}

impl HandshakeDecision {
    pub fn accept() -> Self {
        HandshakeDecision::Accept { headers: Vec::new() }
    }
}

impl Default for HandshakeDecision {
    fn default() -> Self {
        Self::accept()
    }
}

/// Builds the `101 Switching Protocols` response, or `None` when the request
/// carries no `Sec-WebSocket-Key`.
pub fn accept_response(request: &HandshakeRequest, extra: &[(String, String)]) -> Option<String> {
    let key = request.header("sec-websocket-key")?;

    let mut out = String::with_capacity(160);
    out.push_str("HTTP/1.1 101 Switching Protocols");
    out.push_str(CRLF);
    out.push_str("Upgrade: websocket");
    out.push_str(CRLF);
    out.push_str("Connection: Upgrade");
    out.push_str(CRLF);
    push_header(&mut out, "Sec-WebSocket-Accept", &compute_accept_token(key));
    if let Some(protocol) = request.header("sec-websocket-protocol") {
        push_header(&mut out, "Sec-WebSocket-Protocol", protocol.trim());
    }
    for (name, value) in extra {
        push_header(&mut out, name, value);
    }
    out.push_str(CRLF);
    Some(out)
}

pub fn reject_response() -> String {
    format!("{REJECT_STATUS_LINE}{CRLF}{CRLF}")
}

fn push_header(out: &mut String, name: &str, value: &str) {
    // Writing into a String cannot fail
    let _ = write!(out, "{name}: {value}{CRLF}");
}

/// `str::split` with trailing empty fields dropped.
fn split_trimmed(s: &str, sep: char) -> Vec<&str> {
    let mut parts: Vec<&str> = s.split(sep).collect();
    while parts.last() == Some(&"") {
        parts.pop();
    }
    parts
}
