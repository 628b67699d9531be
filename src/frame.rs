//! WebSocket frame parsing and serialization
//!
//! This module implements the RFC 6455 frame layout with:
//! - A resumable decoder that tolerates arbitrary read chunking, including
//!   chunk boundaries inside multi-byte length or mask fields
//! - An encoder that picks the 1/2/8-byte length form and masks every frame
//!   with a caller-supplied key
//!
//! No I/O happens here; the decoder holds the state of a single in-flight frame.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ProtocolError, Result};
use crate::mask::apply_mask_offset;
use crate::{MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of a byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete WebSocket frame as it appeared on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag
    pub masked: bool,
    /// Masking key (all zero when unmasked)
    pub mask_key: [u8; 4],
    /// Payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a final, unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            mask_key: [0; 4],
            payload: payload.into(),
        }
    }

    /// Logical payload length
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }
}

/// Total encoded size of a frame carrying `payload_len` bytes
#[inline]
pub fn encoded_len(payload_len: usize, masked: bool) -> usize {
    let ext = if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    };
    2 + ext + if masked { 4 } else { 0 } + payload_len
}

/// Encode a final frame into `buf`
///
/// FIN is always set; outgoing messages are never fragmented. When `mask` is
/// present the mask bit is set, the key follows the length field and every
/// payload byte is XORed with `mask[i % 4]`.
///
/// Fails with [`Error::BufferCapacity`] if `buf` would grow past `capacity`;
/// `buf` is left untouched in that case.
pub fn encode_frame(
    buf: &mut BytesMut,
    capacity: usize,
    opcode: OpCode,
    payload: &[u8],
    mask: Option<[u8; 4]>,
) -> Result<()> {
    let payload_len = payload.len();
    let needed = buf.len() + encoded_len(payload_len, mask.is_some());
    if needed > capacity {
        return Err(Error::BufferCapacity { needed, capacity });
    }

    buf.reserve(needed - buf.len());

    // First byte: FIN + opcode
    buf.put_u8(0x80 | opcode as u8);

    // Second byte: mask flag + length
    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask_offset(&mut buf[start..], m, 0);
    } else {
        buf.put_slice(payload);
    }

    Ok(())
}

/// Result of feeding bytes to the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// The frame is not complete yet
    NeedMore,
    /// A frame finished with the last byte consumed
    Frame(Frame),
}

/// Decoder phase, the resumable part of the parse cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for FIN/RSV/opcode byte
    Opcode,
    /// Waiting for mask bit + 7-bit length
    Length,
    /// Accumulating a 2- or 8-byte big-endian length
    ExtendedLength { total: u8, consumed: u8 },
    /// Accumulating the 4 mask bytes
    Mask { consumed: u8 },
    /// Filling the payload buffer
    Payload,
}

/// Incremental frame decoder (the per-connection parse cursor)
///
/// Bytes can be fed one at a time with [`decode`](Self::decode) or a read
/// chunk at a time with [`decode_slice`](Self::decode_slice); both produce the
/// same frames regardless of how the stream was split. The cursor resets
/// itself when it hands out a completed frame.
#[derive(Debug)]
pub struct FrameDecoder {
    phase: Phase,
    fin: bool,
    opcode: OpCode,
    masked: bool,
    mask_key: [u8; 4],
    payload_len: u64,
    payload: BytesMut,
    max_frame_size: u64,
}

impl FrameDecoder {
    /// Create a decoder rejecting payloads above `max_frame_size`
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            phase: Phase::Opcode,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            mask_key: [0; 4],
            payload_len: 0,
            payload: BytesMut::new(),
            max_frame_size: max_frame_size as u64,
        }
    }

    /// Discard any partially parsed frame and return to the initial phase
    pub fn reset(&mut self) {
        self.phase = Phase::Opcode;
        self.fin = false;
        self.opcode = OpCode::Continuation;
        self.masked = false;
        self.mask_key = [0; 4];
        self.payload_len = 0;
        self.payload = BytesMut::new();
    }

    /// Whether the cursor sits between frames
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Opcode
    }

    /// Advance the cursor by one byte
    ///
    /// O(1) per byte and never looks ahead. After an error the cursor must be
    /// [`reset`](Self::reset) before reuse.
    pub fn decode(&mut self, byte: u8) -> std::result::Result<Decode, ProtocolError> {
        match self.phase {
            Phase::Opcode => {
                if byte & 0x70 != 0 {
                    return Err(ProtocolError::ReservedBits);
                }
                let opcode = OpCode::from_u8(byte & 0x0F)
                    .ok_or(ProtocolError::ReservedOpcode(byte & 0x0F))?;
                let fin = byte & 0x80 != 0;

                if opcode.is_control() && !fin {
                    return Err(ProtocolError::FragmentedControlFrame);
                }

                self.fin = fin;
                self.opcode = opcode;
                self.phase = Phase::Length;
                Ok(Decode::NeedMore)
            }

            Phase::Length => {
                self.masked = byte & 0x80 != 0;
                match byte & 0x7F {
                    126 => {
                        self.phase = Phase::ExtendedLength {
                            total: 2,
                            consumed: 0,
                        };
                        Ok(Decode::NeedMore)
                    }
                    127 => {
                        self.phase = Phase::ExtendedLength {
                            total: 8,
                            consumed: 0,
                        };
                        Ok(Decode::NeedMore)
                    }
                    len => self.length_known(len as u64),
                }
            }

            Phase::ExtendedLength { total, consumed } => {
                self.payload_len = (self.payload_len << 8) | byte as u64;
                let consumed = consumed + 1;

                if consumed < total {
                    self.phase = Phase::ExtendedLength { total, consumed };
                    return Ok(Decode::NeedMore);
                }

                let len = self.payload_len;
                let minimal = if total == 2 {
                    len > SMALL_MESSAGE_THRESHOLD as u64
                } else {
                    len > MEDIUM_MESSAGE_THRESHOLD as u64 && len >> 63 == 0
                };
                if !minimal {
                    return Err(ProtocolError::MalformedLength);
                }
                self.length_known(len)
            }

            Phase::Mask { consumed } => {
                self.mask_key[consumed as usize] = byte;
                let consumed = consumed + 1;

                if consumed < 4 {
                    self.phase = Phase::Mask { consumed };
                    return Ok(Decode::NeedMore);
                }
                self.enter_payload()
            }

            Phase::Payload => {
                let index = self.payload.len();
                self.payload.put_u8(byte ^ self.mask_key[index & 3]);
                if self.payload.len() as u64 == self.payload_len {
                    return Ok(Decode::Frame(self.take_frame()));
                }
                Ok(Decode::NeedMore)
            }
        }
    }

    /// Consume bytes from `input` until one frame completes or input runs out
    ///
    /// Returns the number of bytes consumed and the completed frame, if any.
    /// Header bytes go through [`decode`](Self::decode); payload runs are
    /// copied and unmasked in bulk.
    pub fn decode_slice(
        &mut self,
        input: &[u8],
    ) -> std::result::Result<(usize, Option<Frame>), ProtocolError> {
        let mut pos = 0;

        while pos < input.len() {
            if self.phase == Phase::Payload {
                let index = self.payload.len();
                let remaining = (self.payload_len - index as u64) as usize;
                let take = remaining.min(input.len() - pos);

                self.payload.extend_from_slice(&input[pos..pos + take]);
                apply_mask_offset(&mut self.payload[index..], self.mask_key, index);
                pos += take;

                if take == remaining {
                    return Ok((pos, Some(self.take_frame())));
                }
                continue;
            }

            let byte = input[pos];
            pos += 1;
            if let Decode::Frame(frame) = self.decode(byte)? {
                return Ok((pos, Some(frame)));
            }
        }

        Ok((pos, None))
    }

    /// Decode every complete frame in `input`, keeping any trailing partial frame
    pub fn decode_all(&mut self, mut input: &[u8]) -> std::result::Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();
        while !input.is_empty() {
            let (consumed, frame) = self.decode_slice(input)?;
            input = &input[consumed..];
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        Ok(frames)
    }

    /// Length fully known: validate, allocate, and pick the next phase
    fn length_known(&mut self, len: u64) -> std::result::Result<Decode, ProtocolError> {
        if self.opcode.is_control() && len > SMALL_MESSAGE_THRESHOLD as u64 {
            return Err(ProtocolError::ControlFrameTooLarge);
        }
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        self.payload_len = len;
        self.payload = BytesMut::with_capacity(len as usize);

        if self.masked {
            self.phase = Phase::Mask { consumed: 0 };
            return Ok(Decode::NeedMore);
        }
        self.enter_payload()
    }

    fn enter_payload(&mut self) -> std::result::Result<Decode, ProtocolError> {
        if self.payload_len == 0 {
            return Ok(Decode::Frame(self.take_frame()));
        }
        self.phase = Phase::Payload;
        Ok(Decode::NeedMore)
    }

    fn take_frame(&mut self) -> Frame {
        let frame = Frame {
            fin: self.fin,
            opcode: self.opcode,
            masked: self.masked,
            mask_key: self.mask_key,
            payload: std::mem::take(&mut self.payload).freeze(),
        };
        self.reset();
        frame
    }
}
