//! HTTP CONNECT negotiation with the upstream proxy.

use crate::config::ServerAddr;
use crate::error::ProxyError;
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use std::fmt;
use zeroize::Zeroizing;

/// Matched case-insensitively anywhere inside the response header block.
pub const SUCCESS_MARKER: &[u8] = b"200 Connection established";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Basic credentials for the upstream proxy.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Result<Self, ProxyError> {
        if username.is_empty() {
            return Err(ProxyError::Auth("proxy username is empty".to_string()));
        }
        if username.contains(':') {
            return Err(ProxyError::Auth("proxy username must not contain ':'".to_string()));
        }
        Ok(Self {
            username: username.to_string(),
            password: Zeroizing::new(password.to_string()),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    fn basic_token(&self) -> Zeroizing<String> {
        let plain = Zeroizing::new(format!("{}:{}", self.username, self.password.as_str()));
        Zeroizing::new(general_purpose::STANDARD.encode(plain.as_bytes()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Request sent once the upstream connection is up.
pub fn build_connect_request(dest: &ServerAddr, credentials: Option<&Credentials>) -> Zeroizing<String> {
    let mut request = Zeroizing::new(format!("CONNECT {dest} HTTP/1.1\r\nHost: {dest}\r\n"));
    if let Some(credentials) = credentials {
        request.push_str("Proxy-Authorization: Basic ");
        request.push_str(&credentials.basic_token());
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    request
}

#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// No complete header block yet.
    Incomplete,
    /// Tunnel is up. `trailing` holds bytes that followed the header block.
    Established { trailing: Bytes },
    Rejected { status_line: String },
}

/// Fixed-capacity accumulator for the proxy's response header.
pub struct ResponseBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl ResponseBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Fails without storing anything when `data` does not fit.
    pub fn append(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        if data.len() > self.capacity - self.buf.len() {
            return Err(ProxyError::HeaderOverflow { capacity: self.capacity });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn parse(&self) -> HandshakeOutcome {
        let Some(pos) = find(&self.buf, HEADER_TERMINATOR) else {
            return HandshakeOutcome::Incomplete;
        };
        let header_end = pos + HEADER_TERMINATOR.len();
        let header = &self.buf[..header_end];

        if contains_ignore_ascii_case(header, SUCCESS_MARKER) {
            HandshakeOutcome::Established {
                trailing: Bytes::copy_from_slice(&self.buf[header_end..]),
            }
        } else {
            HandshakeOutcome::Rejected {
                status_line: status_line(header),
            }
        }
    }
}

/// Numeric status of a response line such as `HTTP/1.1 407 Proxy ...`.
pub fn status_code(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}

fn status_line(header: &[u8]) -> String {
    let end = find(header, b"\r\n").unwrap_or(header.len());
    String::from_utf8_lossy(&header[..end]).into_owned()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn contains_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}
