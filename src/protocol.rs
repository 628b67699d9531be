//! WebSocket message layer
//!
//! This module turns decoded frames into messages:
//! - Message fragmentation and reassembly
//! - Close payload parsing and encoding
//! - Control frames passed through between fragments

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, ProtocolError};
use crate::frame::{Frame, OpCode};

/// WebSocket message (complete, possibly assembled from fragments)
///
/// Text payloads are not UTF-8 validated; [`as_text`](Message::as_text)
/// checks on access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message
    Close(Option<CloseReason>),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Opcode this message travels under
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
            Message::Ping(_) => OpCode::Ping,
            Message::Pong(_) => OpCode::Pong,
            Message::Close(_) => OpCode::Close,
        }
    }

    /// Check if this is a control message
    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Message::Ping(_) | Message::Pong(_) | Message::Close(_)
        )
    }

    /// Get message as text, if it is a text message holding valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get message as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) => b,
            Message::Binary(b) => b,
            Message::Ping(b) => b,
            Message::Pong(b) => b,
            Message::Close(_) => &[],
        }
    }

    /// Convert to binary data
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) => b,
            Message::Binary(b) => b,
            Message::Ping(b) => b,
            Message::Pong(b) => b,
            Message::Close(_) => Bytes::new(),
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

/// Parse a close frame payload
///
/// Empty payloads carry no status. A single byte, or a reason that is not
/// UTF-8, is invalid.
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>, ProtocolError> {
    match payload {
        [] => Ok(None),
        [_] => Err(ProtocolError::InvalidClosePayload),
        [hi, lo, reason @ ..] => {
            let code = u16::from_be_bytes([*hi, *lo]);
            let reason =
                std::str::from_utf8(reason).map_err(|_| ProtocolError::InvalidClosePayload)?;
            Ok(Some(CloseReason::new(code, reason)))
        }
    }
}

/// Encode a close payload (status code + reason)
pub fn close_payload(reason: Option<&CloseReason>) -> Bytes {
    match reason {
        Some(r) => {
            let mut p = BytesMut::with_capacity(2 + r.reason.len());
            p.put_u16(r.code);
            p.extend_from_slice(r.reason.as_bytes());
            p.freeze()
        }
        None => Bytes::new(),
    }
}

/// Turns frames into messages, reassembling fragmented data messages
#[derive(Debug)]
pub struct MessageAssembler {
    fragment_opcode: Option<OpCode>,
    fragment_buf: BytesMut,
    max_message_size: usize,
    reassemble: bool,
}

impl MessageAssembler {
    /// Create an assembler bounded by `max_message_size`
    ///
    /// With `reassemble` off, fragmented data frames are a protocol error.
    pub fn new(max_message_size: usize, reassemble: bool) -> Self {
        Self {
            fragment_opcode: None,
            fragment_buf: BytesMut::new(),
            max_message_size,
            reassemble,
        }
    }

    /// Drop any partially assembled message
    pub fn reset(&mut self) {
        self.fragment_opcode = None;
        self.fragment_buf = BytesMut::new();
    }

    /// Whether a fragmented message is in progress
    pub fn in_progress(&self) -> bool {
        self.fragment_opcode.is_some()
    }

    /// Feed one frame; returns a message once one is complete
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match frame.opcode {
            OpCode::Continuation => self.handle_continuation(frame),
            OpCode::Text | OpCode::Binary => self.handle_data(frame),
            OpCode::Close => Ok(Some(Message::Close(parse_close_payload(&frame.payload)?))),
            OpCode::Ping => Ok(Some(Message::Ping(frame.payload))),
            OpCode::Pong => Ok(Some(Message::Pong(frame.payload))),
        }
    }

    fn handle_data(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        if self.fragment_opcode.is_some() {
            return Err(ProtocolError::ExpectedContinuation);
        }
        if frame.payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge);
        }

        if frame.fin {
            // Complete message in one frame (fast path)
            return Ok(Some(data_message(frame.opcode, frame.payload)));
        }

        if !self.reassemble {
            return Err(ProtocolError::UnexpectedContinuation);
        }

        // Start of fragmented message
        self.fragment_opcode = Some(frame.opcode);
        self.fragment_buf.clear();
        self.fragment_buf.extend_from_slice(&frame.payload);
        Ok(None)
    }

    fn handle_continuation(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        let opcode = self
            .fragment_opcode
            .ok_or(ProtocolError::UnexpectedContinuation)?;

        if self.fragment_buf.len() + frame.payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge);
        }
        self.fragment_buf.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(None);
        }

        self.fragment_opcode = None;
        let data = self.fragment_buf.split().freeze();
        Ok(Some(data_message(opcode, data)))
    }
}

fn data_message(opcode: OpCode, payload: Bytes) -> Message {
    if opcode == OpCode::Text {
        Message::Text(payload)
    } else {
        Message::Binary(payload)
    }
}
