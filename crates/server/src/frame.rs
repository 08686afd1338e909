//! Channel frame codec.
//!
//! Server frames are always single, unmasked, FIN=1 frames. Inbound frames
//! go through [`FrameDecoder`], which buffers partial reads, unmasks client
//! payloads and stitches fragmented messages back together.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LEN_MASK: u8 = 0x7F;
const LEN_16: u8 = 126;
const LEN_64: u8 = 127;
const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Errors that end the connection they occur on
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds the {limit} byte limit")]
    TooLarge { len: u64, limit: usize },

    #[error("control frame is fragmented or longer than 125 bytes")]
    InvalidControlFrame,

    #[error("data frame started while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("failed to serialize outbound message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    fn from_bits(bits: u8) -> Self {
        match bits & OPCODE_MASK {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(bits) => bits & OPCODE_MASK,
        }
    }

    /// Close, ping and pong. Reserved opcodes in the control range are not
    /// held to control-frame limits since they are skipped unread.
    fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One decoded frame with its payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

/// What the connection has to act on after decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A complete text or binary message, as UTF-8 text
    Text(String),
    /// Peer pinged; answer with a pong carrying the same payload
    Ping(Bytes),
    /// Peer is closing; payload holds the optional status code and reason
    Close(Bytes),
}

/// Encode a single unmasked frame with FIN set.
pub fn encode_frame(opcode: OpCode, payload: &[u8]) -> Bytes {
    let len = payload.len();
    let mut frame = BytesMut::with_capacity(len + 10);
    frame.put_u8(FIN_BIT | opcode.bits());
    if len < LEN_16 as usize {
        frame.put_u8(len as u8);
    } else if len <= u16::MAX as usize {
        frame.put_u8(LEN_16);
        frame.put_u16(len as u16);
    } else {
        frame.put_u8(LEN_64);
        frame.put_u64(len as u64);
    }
    frame.extend_from_slice(payload);
    frame.freeze()
}

pub fn encode_text(text: &str) -> Bytes {
    encode_frame(OpCode::Text, text.as_bytes())
}

/// Serialize `msg` as JSON and wrap it in a text frame.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Bytes, FrameError> {
    let json = serde_json::to_string(msg)?;
    Ok(encode_text(&json))
}

pub fn encode_pong(payload: &[u8]) -> Bytes {
    let len = payload.len().min(MAX_CONTROL_PAYLOAD as usize);
    encode_frame(OpCode::Pong, &payload[..len])
}

/// Close frame echoing the peer's status code, if it sent one.
pub fn encode_close(peer_payload: &[u8]) -> Bytes {
    let code = if peer_payload.len() >= 2 {
        &peer_payload[..2]
    } else {
        &[][..]
    };
    encode_frame(OpCode::Close, code)
}

pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Parse one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete, otherwise the frame and
/// the number of bytes it occupied. The declared length is checked against
/// `max_payload` before any payload bytes are required, so an oversized frame
/// is rejected without buffering it.
pub fn parse_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN_BIT != 0;
    let opcode = OpCode::from_bits(buf[0]);
    let masked = buf[1] & MASK_BIT != 0;

    let (len, mut offset) = match buf[1] & LEN_MASK {
        LEN_16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        LEN_64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        short => (short as u64, 2),
    };

    if opcode.is_control() && (len > MAX_CONTROL_PAYLOAD || !fin) {
        return Err(FrameError::InvalidControlFrame);
    }
    if len > max_payload as u64 {
        return Err(FrameError::TooLarge {
            len,
            limit: max_payload,
        });
    }

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            buf[offset],
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let len = len as usize;
    if buf.len() < offset + len {
        return Ok(None);
    }

    let mut payload = buf[offset..offset + len].to_vec();
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload: Bytes::from(payload),
        },
        offset + len,
    )))
}

/// Incremental decoder for one connection's inbound byte stream
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: usize,
    fragments: Option<BytesMut>,
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
            fragments: None,
        }
    }

    /// Append bytes from a socket read.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next message the connection must act on, or `None` once the buffered
    /// bytes are exhausted. Pongs, reserved opcodes and stray continuation
    /// frames are consumed silently.
    pub fn next_message(&mut self) -> Result<Option<Inbound>, FrameError> {
        loop {
            let Some((frame, consumed)) = parse_frame(&self.buf, self.max_payload)? else {
                return Ok(None);
            };
            self.buf.advance(consumed);

            match frame.opcode {
                OpCode::Close => return Ok(Some(Inbound::Close(frame.payload))),
                OpCode::Ping => return Ok(Some(Inbound::Ping(frame.payload))),
                OpCode::Pong => continue,
                OpCode::Reserved(bits) => {
                    debug!(
                        component = "frame",
                        event = "frame.opcode.ignored",
                        opcode = bits,
                        "Ignoring frame with reserved opcode"
                    );
                    continue;
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragments.is_some() {
                        return Err(FrameError::InterleavedMessage);
                    }
                    if frame.fin {
                        return Ok(Some(Inbound::Text(into_text(&frame.payload))));
                    }
                    self.fragments = Some(BytesMut::from(&frame.payload[..]));
                }
                OpCode::Continuation => {
                    let Some(partial) = self.fragments.as_mut() else {
                        debug!(
                            component = "frame",
                            event = "frame.continuation.orphaned",
                            "Ignoring continuation frame with no message in progress"
                        );
                        continue;
                    };
                    let total = partial.len() + frame.payload.len();
                    if total > self.max_payload {
                        return Err(FrameError::TooLarge {
                            len: total as u64,
                            limit: self.max_payload,
                        });
                    }
                    partial.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let message = self.fragments.take().unwrap_or_default();
                        return Ok(Some(Inbound::Text(into_text(&message))));
                    }
                }
            }
        }
    }
}

fn into_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).into_owned()
}
