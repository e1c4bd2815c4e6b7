//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! the atomic unit of transmission carrying both payload and protocol metadata.
//!
//! ### Frame Binary Format
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `OpCode::Text` (UTF-8 text), `OpCode::Binary` (raw
//!   bytes), and `OpCode::Continuation` (further fragments of either).
//! - **Control Frames**: `OpCode::Close`, `OpCode::Ping`, and `OpCode::Pong`;
//!   always final and at most 125 payload bytes.
//!
//! The serialized header always chooses the smallest length encoding that
//! fits the payload: the 7-bit inline length up to 125 bytes, the 16-bit
//! extended length up to 65535 bytes, and the 64-bit extended length beyond.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{close::CloseCode, WebSocketError};

/// Largest possible frame header: 2 fixed bytes, an 8-byte extended length,
/// and a 4-byte masking key.
pub(crate) const MAX_HEADER_SIZE: usize = 2 + 8 + 4;

/// WebSocket operation code (OpCode) that determines the semantic meaning and
/// handling of a frame.
///
/// The numeric values are defined in
/// [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// Continuation = 0x0, Text = 0x1, Binary = 0x2, Close = 0x8, Ping = 0x9,
/// Pong = 0xA. The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected
/// during parsing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`,
    /// `Ping`, or `Pong`).
    ///
    /// Control frames manage the connection state and have special
    /// constraints: they cannot be fragmented and their payload must not
    /// exceed 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for the message-starting data opcodes, `Text` and
    /// `Binary`.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Attempts to convert a byte value into an `OpCode`. Reserved opcodes
    /// (0x3-0x7 and 0xB-0xF) are reported as a protocol violation.
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::Protocol(format!("bad opcode {value}"))),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Represents a WebSocket frame, encapsulating the data and metadata for
/// message transmission.
///
/// **Note: this low-level struct should rarely be used directly.** Most users
/// interact with [`WebSocket`](crate::WebSocket) message operations instead;
/// frames surface when driving the codec by hand.
///
/// # Fields
/// - `fin`: Final fragment flag. When `true`, this frame completes a message.
/// - `opcode`: Defines the frame type (text, binary, control, ...).
/// - `mask`: Optional 4-byte XOR masking key; present on client-to-server
///   frames.
/// - `payload`: Frame payload bytes, already unmasked if the frame arrived
///   masked.
#[derive(Debug)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key for the frame, if any.
    pub(crate) mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: Bytes,
}

impl Frame {
    /// Creates a new WebSocket `Frame` from its parts.
    pub(crate) fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame with the given payload.
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, None, payload)
    }

    /// Creates a final binary frame with the given payload.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, None, payload)
    }

    /// Creates a continuation frame carrying a further fragment of the
    /// current message. Combine with [`Frame::with_fin`] for non-final
    /// fragments.
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Continuation, None, payload)
    }

    /// Creates a ping frame with the given payload.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Ping, None, payload)
    }

    /// Creates a pong frame with the given payload.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Pong, None, payload)
    }

    /// Creates a close frame from a close code and reason. The payload is the
    /// big-endian code followed by the reason bytes.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let code16 = u16::from(code);
        let reason = reason.as_ref();
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code16.to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with a raw payload, without enforcing the
    /// code/reason structure. Used to echo a peer's close payload verbatim.
    pub fn close_raw(payload: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Close, None, payload)
    }

    /// Sets the FIN bit, consuming and returning the frame.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Extracts the close code from a close frame's payload.
    ///
    /// Returns `None` if the payload is too short to contain a code.
    pub fn close_code(&self) -> Option<CloseCode> {
        let code = CloseCode::from(u16::from_be_bytes(self.payload.get(0..2)?.try_into().ok()?));
        Some(code)
    }

    /// Extracts the close reason from a close frame's payload.
    ///
    /// Returns `Ok(None)` when the payload carries no reason text, and
    /// `Err(WebSocketError::InvalidUTF8)` when the reason bytes are not valid
    /// UTF-8.
    pub fn close_reason(&self) -> crate::Result<Option<&str>> {
        match self.payload.get(2..) {
            None | Some([]) => Ok(None),
            Some(reason) => std::str::from_utf8(reason)
                .map(Some)
                .map_err(|_| WebSocketError::InvalidUTF8),
        }
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Ensures a masking key is present, generating a fresh random one when
    /// the frame does not carry one yet.
    pub(crate) fn set_random_mask_if_not_set(&mut self) {
        if self.mask.is_none() {
            self.mask = Some(crate::mask::generate_mask());
        }
    }

    /// Serializes the frame header into `dst`: FIN and opcode, the MASK bit,
    /// the smallest length encoding that fits the payload, and the masking
    /// key when present. The payload itself is not written.
    pub(crate) fn write_head(&self, dst: &mut BytesMut) {
        dst.put_u8((self.fin as u8) << 7 | u8::from(self.opcode));

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0 };
        let len = self.payload.len();
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len < 65536 {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if let Some(mask) = self.mask {
            dst.extend_from_slice(&mask);
        }
    }
}

/// Converts a `Frame` into a tuple of `(OpCode, Bytes)`, discarding the
/// framing metadata.
impl From<Frame> for (OpCode, Bytes) {
    fn from(val: Frame) -> Self {
        (val.opcode, val.payload)
    }
}

/// Constructs a final, unmasked `Frame` from an opcode and payload.
impl From<(OpCode, Bytes)> for Frame {
    fn from((opcode, payload): (OpCode, Bytes)) -> Self {
        Self::new(true, opcode, None, payload)
    }
}
