//! Connection state machine
//!
//! Sans-I/O: the connection never touches a socket or a timer. The caller
//! feeds it received bytes and clock ticks, drains its output buffer into the
//! transport, and reacts to the [`Event`]s it returns.
//!
//! ```text
//! Disconnected --start_handshake--> Handshaking --101 + valid accept--> Open
//!      ^                                 |                              |
//!      |                                 | bad response                 | close() / server Close
//!      +------------ reset() ------------+----------------- Closing <---+
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::Config;
use crate::error::{CloseReason, Error, ProtocolError, Result};
use crate::frame::{FrameDecoder, OpCode, encode_frame};
use crate::handshake::{
    Endpoint, HandshakeKey, build_request, parse_response, request_headers, validate_response,
};
use crate::keepalive::{Heartbeat, HeartbeatAction};
use crate::mask::generate_mask;
use crate::protocol::{Message, MessageAssembler, close_payload};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport, or transport being torn down
    Disconnected,
    /// Upgrade request sent, waiting for the server's response
    Handshaking,
    /// Handshake complete, frames flowing
    Open,
    /// Close frame sent or received, waiting for teardown
    Closing,
}

/// Something the caller has to act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed
    Open {
        /// Subprotocol the server selected
        protocol: Option<String>,
    },
    /// A complete text or binary message
    Message {
        /// `Text` or `Binary`
        opcode: OpCode,
        /// Message payload
        payload: Bytes,
    },
    /// The close handshake finished or the server initiated one; the
    /// transport should be flushed and closed
    Closed(Option<CloseReason>),
}

/// One WebSocket connection's protocol state
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    key: Option<HandshakeKey>,
    subprotocol: Option<String>,
    response: BytesMut,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    heartbeat: Heartbeat,
    outbound: BytesMut,
    write_capacity: usize,
}

impl Connection {
    /// Create a disconnected connection
    pub fn new(config: &Config, now: Instant) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            key: None,
            subprotocol: config.subprotocol.clone(),
            response: BytesMut::new(),
            decoder: FrameDecoder::new(config.max_frame_size),
            assembler: MessageAssembler::new(config.max_message_size, config.reassemble_fragments),
            heartbeat: Heartbeat::new(config.pong_timeout, now),
            outbound: BytesMut::new(),
            write_capacity: config.write_buffer_size,
        }
    }

    /// Current state
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether frames can be sent
    #[inline]
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Key of the handshake in progress, if any
    pub fn handshake_key(&self) -> Option<&HandshakeKey> {
        self.key.as_ref()
    }

    /// Begin an attempt: queue the upgrade request with a fresh key
    pub fn start_handshake(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::InvalidState("handshake already started"));
        }

        self.reset();
        let key = HandshakeKey::generate();
        let headers = request_headers(endpoint, &key, self.subprotocol.as_deref());
        let request = build_request(&endpoint.path, &headers);

        self.outbound.extend_from_slice(&request);
        self.key = Some(key);
        self.state = ConnectionState::Handshaking;
        debug!(endpoint = %endpoint, "sent upgrade request");
        Ok(())
    }

    /// Feed bytes read from the transport
    ///
    /// Any error is fatal to this connection; the caller must flush what it
    /// can and [`reset`](Self::reset). Frames after a Close are ignored.
    pub fn receive(&mut self, mut chunk: &[u8], now: Instant) -> Result<Vec<Event>> {
        let mut events = Vec::new();

        if self.state == ConnectionState::Handshaking {
            if let Some((event, leftover)) = self.receive_handshake(chunk, now)? {
                events.push(event);
                if !leftover.is_empty() {
                    events.extend(self.receive(&leftover, now)?);
                }
            }
            return Ok(events);
        }

        if self.state == ConnectionState::Disconnected {
            return Err(Error::NotConnected);
        }

        while !chunk.is_empty() && self.accepts_frames(&events) {
            let (consumed, frame) = match self.decoder.decode_slice(chunk) {
                Ok(decoded) => decoded,
                Err(err) => return Err(self.protocol_failure(err)),
            };
            chunk = &chunk[consumed..];
            if let Some(frame) = frame {
                self.heartbeat.record_traffic(now);
                let message = match self.assembler.push(frame) {
                    Ok(message) => message,
                    Err(err) => return Err(self.protocol_failure(err)),
                };
                if let Some(message) = message {
                    self.handle_message(message, &mut events);
                }
            }
        }

        Ok(events)
    }

    fn receive_handshake(&mut self, chunk: &[u8], now: Instant) -> Result<Option<(Event, Bytes)>> {
        self.response.extend_from_slice(chunk);

        let Some((response, len)) = parse_response(&self.response)? else {
            trace!(buffered = self.response.len(), "partial upgrade response");
            return Ok(None);
        };

        let key = self
            .key
            .as_ref()
            .ok_or(Error::InvalidState("no handshake key"))?;
        validate_response(&response, key, self.subprotocol.as_deref())?;

        let leftover = self.response.split_off(len).freeze();
        self.response = BytesMut::new();
        self.state = ConnectionState::Open;
        self.heartbeat.reset(now);
        debug!(protocol = ?response.protocol, "handshake complete");

        Ok(Some((
            Event::Open {
                protocol: response.protocol,
            },
            leftover,
        )))
    }

    fn accepts_frames(&self, events: &[Event]) -> bool {
        !matches!(events.last(), Some(Event::Closed(_)))
    }

    fn handle_message(&mut self, message: Message, events: &mut Vec<Event>) {
        match message {
            Message::Text(payload) => events.push(Event::Message {
                opcode: OpCode::Text,
                payload,
            }),
            Message::Binary(payload) => events.push(Event::Message {
                opcode: OpCode::Binary,
                payload,
            }),
            Message::Ping(payload) => {
                if self.state == ConnectionState::Open {
                    trace!(len = payload.len(), "ping received, queueing pong");
                    self.queue_control(OpCode::Pong, &payload);
                }
            }
            Message::Pong(_) => trace!("pong received"),
            Message::Close(reason) => {
                if self.state == ConnectionState::Open {
                    // Echo the status code back
                    let echo = reason.as_ref().map(|r| CloseReason::new(r.code, ""));
                    self.queue_control(OpCode::Close, &close_payload(echo.as_ref()));
                    self.state = ConnectionState::Closing;
                    debug!(code = ?reason.as_ref().map(|r| r.code), "server initiated close");
                } else {
                    debug!("close handshake complete");
                }
                events.push(Event::Closed(reason));
            }
        }
    }

    /// Queue a best-effort close frame for a framing violation
    fn protocol_failure(&mut self, err: ProtocolError) -> Error {
        let code = match err {
            ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooLarge => {
                CloseReason::TOO_BIG
            }
            _ => CloseReason::PROTOCOL_ERROR,
        };
        if self.state == ConnectionState::Open {
            self.queue_control(
                OpCode::Close,
                &close_payload(Some(&CloseReason::new(code, ""))),
            );
        }
        self.state = ConnectionState::Closing;
        self.decoder.reset();
        self.assembler.reset();
        Error::Protocol(err)
    }

    fn queue_control(&mut self, opcode: OpCode, payload: &[u8]) {
        let result = encode_frame(
            &mut self.outbound,
            self.write_capacity,
            opcode,
            payload,
            Some(generate_mask()),
        );
        if let Err(err) = result {
            warn!(?opcode, error = %err, "dropping control frame");
        }
    }

    /// Queue a data or ping/pong frame
    ///
    /// Fails with `BufferCapacity` without side effects when the frame does
    /// not fit next to what is still waiting to be written.
    pub fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Open => {}
            ConnectionState::Closing => return Err(Error::InvalidState("connection is closing")),
            _ => return Err(Error::NotConnected),
        }

        match opcode {
            OpCode::Continuation => {
                return Err(Error::InvalidState("outgoing messages are never fragmented"));
            }
            OpCode::Close => return Err(Error::InvalidState("use close() to send a close frame")),
            op if op.is_control() && payload.len() > crate::SMALL_MESSAGE_THRESHOLD => {
                return Err(Error::Protocol(ProtocolError::ControlFrameTooLarge));
            }
            _ => {}
        }

        encode_frame(
            &mut self.outbound,
            self.write_capacity,
            opcode,
            payload,
            Some(generate_mask()),
        )
    }

    /// Start the closing handshake
    pub fn close(&mut self, reason: CloseReason) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::NotConnected);
        }

        let payload = close_payload(Some(&reason));
        encode_frame(
            &mut self.outbound,
            self.write_capacity,
            OpCode::Close,
            &payload,
            Some(generate_mask()),
        )?;
        self.state = ConnectionState::Closing;
        debug!(code = reason.code, "close frame queued");
        Ok(())
    }

    /// Drive the keepalive at time `now`
    ///
    /// Queues a ping when one is due; fails with `KeepaliveTimeout` when the
    /// outstanding ping went unanswered for too long.
    pub fn keepalive_tick(&mut self, now: Instant) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }

        match self.heartbeat.poll(now) {
            HeartbeatAction::SendPing => {
                self.queue_control(OpCode::Ping, &[]);
                self.heartbeat.mark_ping_sent(now);
                trace!("ping queued");
                Ok(())
            }
            HeartbeatAction::Wait => Ok(()),
            HeartbeatAction::Timeout(elapsed) => {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "keepalive timeout");
                Err(Error::KeepaliveTimeout(elapsed))
            }
        }
    }

    /// Whether a ping is outstanding
    pub fn awaiting_pong(&self) -> bool {
        self.heartbeat.is_waiting()
    }

    /// Bytes waiting to be written to the transport
    #[inline]
    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    /// Drop `n` bytes the transport accepted
    #[inline]
    pub fn consume_output(&mut self, n: usize) {
        self.outbound.advance(n.min(self.outbound.len()));
    }

    /// Whether output is waiting
    #[inline]
    pub fn has_pending_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Return to `Disconnected`, discarding any partial frame, partial
    /// message, buffered response and unsent output
    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.key = None;
        self.response = BytesMut::new();
        self.decoder.reset();
        self.assembler.reset();
        self.outbound = BytesMut::new();
        self.heartbeat.reset(self.heartbeat.last_seen());
    }
}
