//! WebSocket connection and message state machine.
//!
//! [`WebSocket`] owns a framed stream over the raw transport and drives the
//! protocol above the frame level: assembling possibly-fragmented messages,
//! dispatching control frames inline, answering pings, echoing closes, and
//! enforcing the message-size and UTF-8 rules. The read path and the write
//! path each assume a single caller at a time; the only writer-side state a
//! connection tracks is the one in-flight [`MessageWriter`].
//!
//! Messages flow linearly: bytes → frame decoder → message state machine →
//! application, and application → message writer → bytes. Control frames are
//! siphoned off inside [`WebSocket::read_message`] and never reach the
//! application; a peer close surfaces as a typed [`CloseError`].

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    close::{format_close_message, CloseCode, CloseError},
    codec::{Codec, Decoder, Encoder},
    frame::{Frame, MAX_HEADER_SIZE, OpCode},
    mask, Result, WebSocketError,
};

/// Default ceiling on an assembled message, 1 MiB.
///
/// Messages larger than this are rejected with close code 1009 to keep a
/// hostile peer from exhausting memory. Override with
/// [`Options::with_max_message_size`].
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size of the streaming writer's output buffer, excluding the header
/// reserve.
const WRITE_BUFFER_SIZE: usize = 1024;

/// The role a WebSocket endpoint is taking.
///
/// The role drives three behaviors: clients mask every outgoing frame and
/// require unmasked input, servers do the opposite; and the role selects
/// which handshake path built the connection. It is fixed for the
/// connection's lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Configuration options for a WebSocket connection.
///
/// ```rust
/// use websock::Options;
///
/// let options = Options::default()
///     .with_max_message_size(64 * 1024) // refuse messages over 64 KiB
///     .without_utf8(); // skip text-frame UTF-8 validation
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    pub(crate) max_message_size: usize,
    pub(crate) check_utf8: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            check_utf8: true,
        }
    }
}

impl Options {
    /// Sets the maximum size of an assembled incoming message. A message
    /// exceeding the limit fails the read with a close frame carrying code
    /// 1009.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Disables UTF-8 validation of incoming text messages and close
    /// reasons. Validation is on by default, as RFC 6455 requires.
    pub fn without_utf8(mut self) -> Self {
        self.check_utf8 = false;
        self
    }
}

/// A WebSocket connection for either endpoint role.
///
/// Created by the handshake paths: [`WebSocket::connect`] and
/// [`WebSocket::handshake`] for clients, [`WebSocket::upgrade`] and
/// [`WebSocket::accept`] for servers.
///
/// The connection exchanges whole messages. [`read_message`] assembles
/// fragments and handles control frames transparently; [`write_message`]
/// sends a complete message; [`next_writer`] opens a streaming writer that
/// fragments a large message across several frames with bounded buffering.
///
/// Neither path is safe for concurrent callers; serialize access per
/// connection. Separate connections are independent.
///
/// [`read_message`]: WebSocket::read_message
/// [`write_message`]: WebSocket::write_message
/// [`next_writer`]: WebSocket::next_writer
pub struct WebSocket<S> {
    stream: Framed<S, Codec>,
    role: Role,
    /// A `MessageWriter` has been handed out and not yet closed.
    writer_open: bool,
    max_message_size: usize,
    check_utf8: bool,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a connection over an already-upgraded stream.
    ///
    /// `read_buf` carries bytes the peer sent immediately after the
    /// handshake, which the handshake exchange read but did not consume;
    /// they are replayed to the frame decoder before the stream is read
    /// again.
    pub(crate) fn new(role: Role, stream: S, read_buf: Bytes, opts: &Options) -> Self {
        let decoder = Decoder::new(role, opts.max_message_size);
        let encoder = Encoder::new(role);

        let mut parts = FramedParts::new(stream, Codec::from((decoder, encoder)));
        parts.read_buf = BytesMut::from(&read_buf[..]);

        Self {
            stream: Framed::from_parts(parts),
            role,
            writer_open: false,
            max_message_size: opts.max_message_size,
            check_utf8: opts.check_utf8,
        }
    }

    /// The role this endpoint took during the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Reads the next application message, returning its opcode (text or
    /// binary) and assembled payload.
    ///
    /// Control frames never surface here: pings are answered with an
    /// identical pong, pongs are dropped, and a close frame is echoed back
    /// and returned as [`WebSocketError::Close`] carrying the peer's code
    /// and reason. A protocol violation sends a close frame with code 1002
    /// and the violation report before failing the read; a stream that ends
    /// without a close frame fails with close code 1006.
    pub async fn read_message(&mut self) -> Result<(OpCode, Bytes)> {
        let mut message_type: Option<OpCode> = None;
        let mut assembled = BytesMut::new();

        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Err(self.fail(err).await),
                None => return Err(WebSocketError::Close(CloseError::abnormal())),
            };

            match frame.opcode {
                OpCode::Ping => {
                    self.write_control(OpCode::Pong, frame.payload).await?;
                }
                OpCode::Pong => {}
                OpCode::Close => return Err(self.on_close(frame).await),
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if frame.opcode != OpCode::Continuation {
                        message_type = Some(frame.opcode);
                    }

                    if assembled.len() + frame.payload.len() > self.max_message_size {
                        return Err(self.fail(WebSocketError::MessageTooLarge).await);
                    }
                    assembled.extend_from_slice(&frame.payload);

                    if frame.fin {
                        // Unreachable through the decoder's fragment rules
                        // unless a previous read failed mid-message.
                        let Some(opcode) = message_type else {
                            return Err(self
                                .fail(WebSocketError::Protocol(
                                    "continuation after FIN".to_owned(),
                                ))
                                .await);
                        };
                        if opcode == OpCode::Text
                            && self.check_utf8
                            && std::str::from_utf8(&assembled).is_err()
                        {
                            return Err(self.fail(WebSocketError::InvalidUTF8).await);
                        }
                        return Ok((opcode, assembled.freeze()));
                    }
                }
            }
        }
    }

    /// Writes a complete message with the given opcode.
    ///
    /// The message goes out as a single frame with the smallest header that
    /// fits it, masked when this endpoint is a client. Fails with
    /// [`WebSocketError::UnclosedWriter`] while a [`MessageWriter`] from
    /// [`WebSocket::next_writer`] is outstanding.
    pub async fn write_message(&mut self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        if self.writer_open {
            return Err(WebSocketError::UnclosedWriter);
        }
        if !opcode.is_data() {
            return Err(WebSocketError::BadMessageCode);
        }

        self.stream.send(Frame::new(true, opcode, None, payload)).await
    }

    /// Opens a streaming writer for a message with the given opcode.
    ///
    /// The writer owns a fixed-size output buffer and emits a frame whenever
    /// the buffer fills, so a large message is transmitted as a fragment
    /// sequence without being held in memory whole. Only one writer may be
    /// open at a time; the slot is released by [`MessageWriter::close`].
    pub fn next_writer(&mut self, opcode: OpCode) -> Result<MessageWriter<'_, S>> {
        if self.writer_open {
            return Err(WebSocketError::UnclosedWriter);
        }
        if !opcode.is_data() {
            return Err(WebSocketError::BadMessageCode);
        }

        self.writer_open = true;
        Ok(MessageWriter {
            conn: self,
            buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE + MAX_HEADER_SIZE),
            message_opcode: opcode,
            frame_opcode: opcode,
            fin: false,
        })
    }

    /// Sends a single control frame (close, ping, or pong), bypassing any
    /// in-flight message writer's buffer.
    ///
    /// The payload must not exceed 125 bytes; that bound is the caller's
    /// obligation, violating it is a programming error.
    pub async fn write_control(&mut self, opcode: OpCode, payload: impl Into<Bytes>) -> Result<()> {
        if !opcode.is_control() {
            return Err(WebSocketError::BadMessageCode);
        }

        let payload = payload.into();
        debug_assert!(
            payload.len() <= 125,
            "control frame payload exceeds 125 bytes"
        );

        self.stream.send(Frame::new(true, opcode, None, payload)).await
    }

    /// Closes the connection by shutting down the underlying stream.
    ///
    /// Consumes the connection, so the stream is closed exactly once. Any
    /// operation in flight on another clone of the transport fails with a
    /// stream error; that is the only cancellation mechanism.
    pub async fn close(mut self) -> Result<()> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }

    /// Handles a close frame from the peer: validates the payload, echoes
    /// the close, and produces the error the read returns.
    async fn on_close(&mut self, frame: Frame) -> WebSocketError {
        let payload = frame.payload;

        let (code, reason) = match payload.len() {
            0 => (u16::from(CloseCode::Status), String::new()),
            1 => {
                return self
                    .fail(WebSocketError::Protocol("bad close payload".to_owned()))
                    .await
            }
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseCode::from(code).is_allowed() {
                    return self
                        .fail(WebSocketError::Protocol("bad close code".to_owned()))
                        .await;
                }

                match std::str::from_utf8(&payload[2..]) {
                    Ok(reason) => (code, reason.to_owned()),
                    Err(_) if self.check_utf8 => {
                        return self.fail(WebSocketError::InvalidUTF8).await
                    }
                    Err(_) => (code, String::from_utf8_lossy(&payload[2..]).into_owned()),
                }
            }
        };

        let _ = self
            .write_control(OpCode::Close, format_close_message(code, &reason))
            .await;

        WebSocketError::Close(CloseError::new(code, reason))
    }

    /// Answers an error on the read path with the mandated close frame, best
    /// effort, and hands the error back for the caller to return.
    async fn fail(&mut self, err: WebSocketError) -> WebSocketError {
        let close = match &err {
            WebSocketError::Protocol(report) => Some(Frame::close(CloseCode::Protocol, report)),
            WebSocketError::MessageTooLarge => {
                Some(Frame::close(CloseCode::Size, "message too big"))
            }
            WebSocketError::InvalidUTF8 => Some(Frame::close(CloseCode::Invalid, "invalid UTF-8")),
            _ => None,
        };

        if let Some(frame) = close {
            let _ = self.stream.send(frame).await;
        }

        err
    }
}

/// Streaming writer for one WebSocket message.
///
/// Obtained from [`WebSocket::next_writer`]. Payload handed to
/// [`write`](MessageWriter::write) accumulates in a fixed-size buffer with
/// [`MAX_HEADER_SIZE`] bytes reserved at the front of every frame, so the
/// header, whose width depends on how much payload the frame ends up
/// carrying, can be chosen once the frame is full. When a shorter length
/// encoding suffices, the unused reserve bytes are handed back to the
/// payload budget.
///
/// The first frame carries the message opcode, every following frame is a
/// continuation, and the frame completing the message has FIN set. In
/// client role each frame is masked with a fresh random key.
///
/// Call [`close`](MessageWriter::close) to flush remaining bytes and release
/// the connection's writer slot; a writer that is dropped instead keeps the
/// slot occupied and subsequent [`WebSocket::next_writer`] calls fail.
pub struct MessageWriter<'a, S> {
    conn: &'a mut WebSocket<S>,
    buf: BytesMut,
    message_opcode: OpCode,
    frame_opcode: OpCode,
    fin: bool,
}

impl<S> MessageWriter<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Writes one message's payload, splitting it into as many frames as
    /// the output buffer dictates. The final chunk is sent with FIN set.
    pub async fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.frame_opcode = self.message_opcode;

        let mut rest = payload;
        loop {
            let n = self.next_chunk(rest.len()).await?;
            self.put_frame(&rest[..n]);
            rest = &rest[n..];
            self.frame_opcode = OpCode::Continuation;
            if rest.is_empty() {
                break;
            }
        }

        self.fin = false;
        Ok(())
    }

    /// Flushes buffered frames and releases the connection's writer slot.
    pub async fn close(mut self) -> Result<()> {
        self.conn.writer_open = false;
        self.flush().await
    }

    /// Determines how many payload bytes the next frame may carry, flushing
    /// the buffer first when no room remains, and marks the frame final
    /// when the rest of the message fits.
    async fn next_chunk(&mut self, remaining: usize) -> Result<usize> {
        let mut free = self.buf.capacity() - self.buf.len();
        if free <= MAX_HEADER_SIZE {
            self.flush().await?;
            free = self.buf.capacity() - self.buf.len();
        }

        let mut available = free - MAX_HEADER_SIZE;
        // A payload this small takes a shorter length encoding than the
        // reserve assumes; hand the difference back.
        if available < 126 - 8 {
            available += 8;
        } else if available < 65536 - 6 {
            available += 6;
        }

        if available >= remaining {
            self.fin = true;
            available = remaining;
        }

        Ok(available)
    }

    /// Appends one frame to the output buffer: header with the smallest
    /// length encoding that fits, then the payload, masked in place after
    /// the copy when this endpoint is a client.
    fn put_frame(&mut self, payload: &[u8]) {
        self.buf
            .put_u8((self.fin as u8) << 7 | u8::from(self.frame_opcode));

        let mask_bit = if self.conn.role == Role::Client { 0x80 } else { 0 };
        let len = payload.len();
        if len < 126 {
            self.buf.put_u8(mask_bit | len as u8);
        } else if len < 65536 {
            self.buf.put_u8(mask_bit | 126);
            self.buf.put_u16(len as u16);
        } else {
            self.buf.put_u8(mask_bit | 127);
            self.buf.put_u64(len as u64);
        }

        if self.conn.role == Role::Client {
            let mask = mask::generate_mask();
            self.buf.extend_from_slice(&mask);

            let start = self.buf.len();
            self.buf.extend_from_slice(payload);
            mask::apply_mask(&mut self.buf[start..], mask);
        } else {
            self.buf.extend_from_slice(payload);
        }
    }

    /// Writes the buffered frames to the underlying stream.
    async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.conn.stream.get_mut().write_all(&self.buf).await?;
            self.buf.clear();
        }
        Ok(())
    }
}
