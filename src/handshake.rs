//! WebSocket handshake implementation
//!
//! Client side of the HTTP/1.1 upgrade: target URL parsing, the request
//! headers with a fresh `Sec-WebSocket-Key`, and validation of the server's
//! `101 Switching Protocols` response against that key.

use std::fmt;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, HandshakeError, Result};
use crate::mask::fill_random;

/// Maximum HTTP header size (8KB should be enough for any reasonable response)
pub const MAX_HEADER_SIZE: usize = 8192;

/// Parsed `ws://` or `wss://` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `wss` scheme (TLS-wrapped transport)
    pub secure: bool,
    /// Host name or address, without brackets for IPv6
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Request path including any query string
    pub path: String,
}

impl Endpoint {
    /// Parse a `ws://host[:port][/path]` or `wss://...` URL
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or(Error::InvalidUrl("missing scheme"))?;

        let (secure, default_port) = match scheme.to_ascii_lowercase().as_str() {
            "ws" => (false, 80u16),
            "wss" => (true, 443u16),
            _ => return Err(Error::InvalidUrl("expected ws or wss scheme")),
        };

        // Split host:port from path
        let (host_port, path) = rest
            .find(['/', '?'])
            .map(|i| (&rest[..i], &rest[i..]))
            .unwrap_or((rest, "/"));

        let path = if path.starts_with('?') {
            format!("/{path}")
        } else {
            path.to_string()
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or(Error::InvalidUrl("unterminated IPv6 literal"))?;
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| Error::InvalidUrl("invalid port"))?,
                None if after.is_empty() => default_port,
                None => return Err(Error::InvalidUrl("invalid authority")),
            };
            (host, port)
        } else if let Some((host, port)) = host_port.rsplit_once(':') {
            let port = port.parse().map_err(|_| Error::InvalidUrl("invalid port"))?;
            (host, port)
        } else {
            (host_port, default_port)
        };

        if host.is_empty() {
            return Err(Error::InvalidUrl("missing host"));
        }

        Ok(Self {
            secure,
            host: host.to_string(),
            port,
            path,
        })
    }

    /// Value for the `Host` header; the port is omitted when it is the scheme default
    pub fn authority(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{}://{}{}", scheme, self.authority(), self.path)
    }
}

/// Client nonce and the accept value a conforming server must answer with
///
/// Generated fresh for every connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeKey {
    key: String,
    expected_accept: String,
}

impl HandshakeKey {
    /// Generate a random 16-byte key, base64 encoded
    pub fn generate() -> Self {
        let mut nonce = [0u8; 16];
        fill_random(&mut nonce);
        Self::from_key(base64::engine::general_purpose::STANDARD.encode(nonce))
    }

    /// Build a key pair from an existing `Sec-WebSocket-Key` value
    pub fn from_key(key: impl Into<String>) -> Self {
        let key = key.into();
        let expected_accept = generate_accept_key(&key);
        Self {
            key,
            expected_accept,
        }
    }

    /// The `Sec-WebSocket-Key` header value
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The `Sec-WebSocket-Accept` value the server must return
    pub fn expected_accept(&self) -> &str {
        &self.expected_accept
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Headers of the upgrade request, in send order
pub fn request_headers(
    endpoint: &Endpoint,
    key: &HandshakeKey,
    protocol: Option<&str>,
) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("Host", endpoint.authority()),
        ("Upgrade", "websocket".to_string()),
        ("Connection", "Upgrade".to_string()),
        ("Sec-WebSocket-Key", key.key().to_string()),
        ("Sec-WebSocket-Version", "13".to_string()),
    ];

    if let Some(proto) = protocol {
        headers.push(("Sec-WebSocket-Protocol", proto.to_string()));
    }

    headers
}

/// Build the upgrade request bytes
pub fn build_request(path: &str, headers: &[(&'static str, String)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"GET ");
    buf.put_slice(path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");

    for (name, value) in headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// WebSocket handshake response (client-side parsing)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// HTTP status code
    pub status: u16,
    /// The Upgrade header
    pub upgrade: Option<String>,
    /// The Connection header
    pub connection: Option<String>,
    /// The Sec-WebSocket-Accept header
    pub accept: Option<String>,
    /// The Sec-WebSocket-Protocol header
    pub protocol: Option<String>,
    /// The Sec-WebSocket-Extensions header
    pub extensions: Option<String>,
}

/// Parse a WebSocket upgrade response
///
/// Returns the response and the number of bytes the header block used, or
/// `None` if `buf` does not hold the complete header block yet. Bytes past the
/// header block belong to the frame stream.
pub fn parse_response(
    buf: &[u8],
) -> std::result::Result<Option<(HandshakeResponse, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let mut response = HandshakeResponse {
                status: res.code.unwrap_or(0),
                ..Default::default()
            };

            for header in res.headers.iter() {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| HandshakeError::Malformed("invalid header value"))?
                    .trim()
                    .to_string();

                match header.name.to_ascii_lowercase().as_str() {
                    "upgrade" => response.upgrade = Some(value),
                    "connection" => response.connection = Some(value),
                    "sec-websocket-accept" => response.accept = Some(value),
                    "sec-websocket-protocol" => response.protocol = Some(value),
                    "sec-websocket-extensions" => response.extensions = Some(value),
                    _ => {}
                }
            }

            Ok(Some((response, len)))
        }
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(HandshakeError::ResponseTooLarge);
            }
            Ok(None)
        }
        Err(httparse::Error::TooManyHeaders) => Err(HandshakeError::ResponseTooLarge),
        Err(_) => Err(HandshakeError::Malformed("failed to parse HTTP response")),
    }
}

/// Validate the server's upgrade response against the key we sent
pub fn validate_response(
    response: &HandshakeResponse,
    key: &HandshakeKey,
    requested_protocol: Option<&str>,
) -> std::result::Result<(), HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::BadStatus(response.status));
    }

    match response.upgrade.as_deref() {
        Some(v) if v.eq_ignore_ascii_case("websocket") => {}
        _ => return Err(HandshakeError::BadUpgradeHeader),
    }

    let connection_upgrade = response
        .connection
        .as_deref()
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    if !connection_upgrade {
        return Err(HandshakeError::BadConnectionHeader);
    }

    let accepted = response
        .accept
        .as_deref()
        .is_some_and(|accept| validate_accept_key(key.key(), accept));
    if !accepted {
        return Err(HandshakeError::BadAcceptKey);
    }

    if let Some(selected) = response.protocol.as_deref() {
        let offered = requested_protocol
            .is_some_and(|offer| offer.split(',').any(|p| p.trim() == selected));
        if !offered {
            return Err(HandshakeError::UnexpectedProtocol);
        }
    }

    // No extensions are offered, so the server may not enable any
    if let Some(extensions) = response.extensions.as_deref() {
        if !extensions.is_empty() {
            return Err(HandshakeError::UnexpectedExtension(extensions.to_string()));
        }
    }

    Ok(())
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> bool {
    generate_accept_key(sent_key) == received_accept
}
