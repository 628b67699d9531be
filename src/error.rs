//! Error types for the WebSocket client
//!
//! Nothing here is process-fatal. Transport and handshake failures feed the
//! reconnect cycle, protocol errors tear down the current connection only, and
//! buffer-capacity errors are returned to the caller without touching state.

use std::io;
use std::time::Duration;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket client error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connect, send or receive failure on the underlying stream
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The server's upgrade response was rejected
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// The server sent bytes that violate RFC 6455
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// An outgoing frame does not fit in the output buffer
    #[error("frame of {needed} bytes exceeds output buffer capacity ({capacity} bytes)")]
    BufferCapacity {
        /// Bytes the buffer would have to hold
        needed: usize,
        /// Configured output buffer capacity
        capacity: usize,
    },
    /// No pong or other traffic arrived after a ping
    #[error("keepalive timeout: no traffic for {0:?} after ping")]
    KeepaliveTimeout(Duration),
    /// Target URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(&'static str),
    /// Operation requires an open connection
    #[error("connection is not open")]
    NotConnected,
    /// Operation is not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// TLS configuration or session failure
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Reasons the upgrade handshake can fail
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// Status line was not `101 Switching Protocols`
    #[error("expected status 101, got {0}")]
    BadStatus(u16),
    /// `Upgrade` header missing or not `websocket`
    #[error("missing or invalid Upgrade header")]
    BadUpgradeHeader,
    /// `Connection` header missing or without the `upgrade` token
    #[error("missing or invalid Connection header")]
    BadConnectionHeader,
    /// `Sec-WebSocket-Accept` missing or not derived from our key
    #[error("Sec-WebSocket-Accept does not match the request key")]
    BadAcceptKey,
    /// Server selected a subprotocol we did not offer
    #[error("server selected a subprotocol that was not requested")]
    UnexpectedProtocol,
    /// Server enabled an extension; none are offered
    #[error("server enabled an extension that was not requested: {0}")]
    UnexpectedExtension(String),
    /// Response could not be parsed as HTTP/1.1
    #[error("malformed HTTP response: {0}")]
    Malformed(&'static str),
    /// Response header block exceeded the size limit
    #[error("response headers too large")]
    ResponseTooLarge,
    /// No complete response within the handshake timeout
    #[error("timed out waiting for the upgrade response")]
    Timeout,
}

/// RFC 6455 framing violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Opcode is not one of the six defined values
    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),
    /// RSV1-3 set without a negotiated extension
    #[error("reserved bits set")]
    ReservedBits,
    /// Declared payload length exceeds the configured maximum
    #[error("frame payload of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Declared payload length
        len: u64,
        /// Configured maximum
        max: u64,
    },
    /// Extended length not minimally encoded or most significant bit set
    #[error("malformed payload length")]
    MalformedLength,
    /// Control frame without FIN
    #[error("control frame must not be fragmented")]
    FragmentedControlFrame,
    /// Control frame payload above 125 bytes
    #[error("control frame payload too large")]
    ControlFrameTooLarge,
    /// Continuation frame with no message in progress
    #[error("unexpected continuation frame")]
    UnexpectedContinuation,
    /// New data frame while a fragmented message is in progress
    #[error("expected continuation frame")]
    ExpectedContinuation,
    /// Reassembled message exceeds the configured maximum
    #[error("message too large")]
    MessageTooLarge,
    /// Close frame with a one-byte payload or non UTF-8 reason
    #[error("invalid close frame payload")]
    InvalidClosePayload,
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure without a reason string
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }
}

impl Error {
    /// Whether the error ends the current connection and should enter the
    /// reconnect cycle, as opposed to being reported to the caller only.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            Error::BufferCapacity { .. }
                | Error::InvalidUrl(_)
                | Error::NotConnected
                | Error::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = Error::from(HandshakeError::BadStatus(404));
        assert_eq!(err.to_string(), "handshake failed: expected status 101, got 404");

        let err = Error::from(ProtocolError::ReservedOpcode(3));
        assert_eq!(err.to_string(), "protocol error: reserved opcode 0x3");
    }

    #[test]
    fn test_connection_fatal_classification() {
        let io = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_connection_fatal());
        assert!(Error::from(ProtocolError::MalformedLength).is_connection_fatal());
        assert!(
            !Error::BufferCapacity {
                needed: 10,
                capacity: 4
            }
            .is_connection_fatal()
        );
        assert!(!Error::NotConnected.is_connection_fatal());
    }
}
