//! # ws-tether: event-driven WebSocket client
//!
//! An RFC 6455 client built around a resumable frame codec and a sans-I/O
//! connection state machine, driven by a single-threaded scheduler.
//!
//! ## Features
//!
//! - **Incremental decoding**: frames parse correctly no matter how the
//!   transport chunks the byte stream
//! - **Masked output**: every client frame carries a fresh random mask key
//! - **Keepalive**: periodic pings, connection declared dead when nothing
//!   comes back in time
//! - **Reconnection**: fixed (or multiplied) delay between attempts, with an
//!   optional cap on consecutive failures
//! - **TLS**: `wss://` over rustls (feature `tls`)
//!
//! ## Example
//!
//! ```no_run
//! use ws_tether::{Callbacks, Config, OpCode, WsClient};
//! use ws_tether::scheduler::{TokioScheduler, dispatch_forever};
//! use ws_tether::transport::TcpConnector;
//!
//! dispatch_forever(|| {
//!     let client = WsClient::new(TcpConnector::default(), TokioScheduler, Config::default());
//!     let callbacks = Callbacks::new(
//!         |opcode, payload| println!("{opcode:?}: {}", String::from_utf8_lossy(payload)),
//!         || println!("disconnected"),
//!     );
//!     let _ = client.connect("ws://127.0.0.1:9001/", callbacks);
//!     client
//! })
//! .unwrap();
//! ```

pub mod client;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod keepalive;
pub mod mask;
pub mod protocol;
pub mod reconnect;
pub mod scheduler;
pub mod transport;

#[cfg(feature = "tls")]
pub mod tls;

use std::time::Duration;

pub use client::{Callbacks, WeakClient, WsClient};
pub use connection::{Connection, ConnectionState, Event};
pub use error::{CloseReason, Error, HandshakeError, ProtocolError, Result};
pub use frame::{Frame, FrameDecoder, OpCode};
pub use protocol::Message;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};

/// Default receive buffer size (64KB per read)
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Default output buffer capacity (1MB)
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Small message threshold (< 126 bytes uses the 7-bit length form)
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Medium message threshold (< 64KB uses the 16-bit length form)
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Configuration for client connections
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_tether::Config;
///
/// let config = Config::builder()
///     .ping_interval(Duration::from_secs(10))
///     .reconnect_delay(Duration::from_secs(2))
///     .max_reconnect_attempts(5)
///     .build();
/// assert_eq!(config.max_reconnect_attempts, 5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Maximum single frame payload (default: 16MB)
    pub max_frame_size: usize,
    /// Output buffer capacity (default: 1MB)
    /// Sending a frame that does not fit fails with `BufferCapacity`
    pub write_buffer_size: usize,
    /// Bytes pulled per transport read (default: 64KB)
    pub read_buffer_size: usize,
    /// Send pings automatically to keep connection alive (default: true)
    pub auto_ping: bool,
    /// Ping interval, zero disables keepalive (default: 20s)
    pub ping_interval: Duration,
    /// How long to wait for any traffic after a ping (default: 20s)
    pub pong_timeout: Duration,
    /// Delay before the first reconnect attempt (default: 5s)
    pub reconnect_delay: Duration,
    /// Factor applied to the delay after each failed attempt (default: 1.0, fixed delay)
    pub reconnect_multiplier: f64,
    /// Upper bound for the reconnect delay (default: 5min)
    pub max_reconnect_delay: Duration,
    /// Consecutive failed attempts before giving up (default: 0 = unlimited)
    pub max_reconnect_attempts: u32,
    /// Time allowed for the upgrade response (default: 10s)
    pub handshake_timeout: Duration,
    /// Time allowed for the server's Close echo (default: 5s)
    pub close_timeout: Duration,
    /// TCP connect timeout (default: 10s)
    pub connect_timeout: Duration,
    /// Subprotocol offered in `Sec-WebSocket-Protocol` (default: none)
    pub subprotocol: Option<String>,
    /// Reassemble fragmented messages (default: true)
    /// When disabled, a continuation frame is a protocol error
    pub reassemble_fragments: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            read_buffer_size: RECV_BUFFER_SIZE,
            auto_ping: true,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(5),
            reconnect_multiplier: 1.0,
            max_reconnect_delay: Duration::from_secs(300),
            max_reconnect_attempts: 0,
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            subprotocol: None,
            reassemble_fragments: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Reconnect settings as a policy configuration
    pub fn reconnect(&self) -> ReconnectConfig {
        ReconnectConfig {
            delay: self.reconnect_delay,
            multiplier: self.reconnect_multiplier,
            max_delay: self.max_reconnect_delay,
            max_attempts: self.max_reconnect_attempts,
        }
    }
}

/// Builder for client configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set output buffer capacity
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set bytes pulled per read
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size.max(1);
        self
    }

    /// Enable or disable auto ping
    pub fn auto_ping(mut self, enabled: bool) -> Self {
        self.config.auto_ping = enabled;
        self
    }

    /// Set ping interval; zero disables keepalive
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// Set how long to wait for traffic after a ping
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = timeout;
        self
    }

    /// Set the reconnect delay
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the reconnect delay multiplier
    pub fn reconnect_multiplier(mut self, multiplier: f64) -> Self {
        self.config.reconnect_multiplier = multiplier;
        self
    }

    /// Set the reconnect delay ceiling
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.max_reconnect_delay = delay;
        self
    }

    /// Set the consecutive failure cap (0 = unlimited)
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.max_reconnect_attempts = attempts;
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the close handshake timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Offer a subprotocol during the handshake
    pub fn subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.config.subprotocol = Some(protocol.into());
        self
    }

    /// Enable or disable continuation reassembly
    pub fn reassemble_fragments(mut self, enabled: bool) -> Self {
        self.config.reassemble_fragments = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{Callbacks, WeakClient, WsClient};
    pub use crate::connection::ConnectionState;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::OpCode;
    pub use crate::scheduler::{Scheduler, TokioScheduler, dispatch_forever, dispatch_until};
    pub use crate::transport::{Connector, TcpConnector, Transport};
    pub use crate::{Config, ConfigBuilder};

    #[cfg(feature = "tls")]
    pub use crate::tls::TlsConnector;
}
