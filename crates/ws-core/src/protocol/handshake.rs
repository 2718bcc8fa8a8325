//! WebSocket opening handshake (RFC 6455 §4).
//!
//! The client opens with an HTTP/1.1 `GET` carrying `Upgrade: websocket`,
//! `Connection: Upgrade` and a random `Sec-WebSocket-Key`.  The server proves
//! it understood the request by hashing the key together with a fixed GUID
//! and returning the result in `Sec-WebSocket-Accept`.
//!
//! This module works on raw request bytes so that it can be exercised without
//! a socket.  Reading the bytes off the transport is the caller's job; see
//! [`find_request_end`] for detecting where the request head stops.

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

// ── Protocol constants ────────────────────────────────────────────────────────

/// GUID appended to the client key before hashing (RFC 6455 §1.3).
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Request heads larger than this are rejected without parsing.
pub const MAX_REQUEST_SIZE: usize = 8 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons an upgrade request is refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The request head exceeded [`MAX_REQUEST_SIZE`].
    #[error("request head exceeds 8192 bytes")]
    RequestTooLarge,

    /// The head is not valid UTF-8 or the request line is malformed.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The request method is not `GET`.
    #[error("method {0} not allowed for upgrade")]
    MethodNotAllowed(String),

    /// No `Upgrade` header listing the `websocket` token.
    #[error("missing Upgrade: websocket header")]
    MissingUpgrade,

    /// No `Connection` header listing the `upgrade` token.
    #[error("missing Connection: Upgrade header")]
    MissingConnectionUpgrade,

    /// `Sec-WebSocket-Key` absent or empty.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    /// `Sec-WebSocket-Version` present but not `13`.
    #[error("unsupported Sec-WebSocket-Version: {0}")]
    UnsupportedVersion(String),
}

/// A validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target, e.g. `/` or `/chat?room=1`.
    pub path: String,
    /// Value of `Sec-WebSocket-Key`, trimmed.
    pub key: String,
    /// All headers in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Returns the first header value whose name matches case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Value the server must return in `Sec-WebSocket-Accept`.
    pub fn accept_key(&self) -> String {
        accept_key(&self.key)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Returns the length of the request head (including the blank line) if
/// `buf` contains a complete one.
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEAD_TERMINATOR.len())
        .position(|w| w == HEAD_TERMINATOR)
        .map(|pos| pos + HEAD_TERMINATOR.len())
}

/// Parses and validates a complete request head.
///
/// `raw` must end at the blank line; bytes after it belong to the frame
/// stream and must not be passed in.
///
/// # Errors
///
/// Returns [`HandshakeError`] describing the first requirement the request
/// fails.
pub fn parse_upgrade_request(raw: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    if raw.len() > MAX_REQUEST_SIZE {
        return Err(HandshakeError::RequestTooLarge);
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| HandshakeError::Malformed("request head is not UTF-8".to_string()))?;

    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| HandshakeError::Malformed("empty request".to_string()))?;
    let mut parts = request_line.split(' ');
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) => (m, p, v),
        _ => {
            return Err(HandshakeError::Malformed(format!(
                "bad request line: {request_line:?}"
            )))
        }
    };
    if version != "HTTP/1.1" {
        return Err(HandshakeError::Malformed(format!(
            "unsupported HTTP version {version}"
        )));
    }
    if method != "GET" {
        return Err(HandshakeError::MethodNotAllowed(method.to_string()));
    }

    let mut headers = Vec::new();
    for line in lines.take_while(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("bad header line: {line:?}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    if !has_token(&headers, "upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgrade);
    }
    if !has_token(&headers, "connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    let key = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, v)| v.clone())
        .filter(|v| !v.is_empty())
        .ok_or(HandshakeError::MissingKey)?;
    if let Some((_, v)) = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("sec-websocket-version"))
    {
        if v != WEBSOCKET_VERSION {
            return Err(HandshakeError::UnsupportedVersion(v.clone()));
        }
    }

    Ok(UpgradeRequest {
        path: path.to_string(),
        key,
        headers,
    })
}

/// Computes `base64(SHA-1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Builds the `101 Switching Protocols` response for `key`.
pub fn accept_response(key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
    .into_bytes()
}

/// Builds a bodiless error response that also closes the connection.
pub fn reject_response(status: u16, reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\
         Content-Length: 0\r\n\r\n"
    )
    .into_bytes()
}

// Matches a comma-separated token list across every header with `name`.
fn has_token(headers: &[(String, String)], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case(name))
        .flat_map(|(_, v)| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
