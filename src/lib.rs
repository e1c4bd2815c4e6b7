//! Minimal WebSocket (RFC 6455) endpoint library.
//!
//! `websock` is a protocol engine that takes over a TCP byte stream after an
//! HTTP/1.1 Upgrade handshake and exchanges framed messages with a peer. The
//! same [`WebSocket`] type serves both roles: clients mask outgoing frames and
//! send the upgrade request, servers unmask incoming frames and answer the
//! upgrade.
//!
//! # Connecting
//!
//! ```no_run
//! use websock::{OpCode, WebSocket};
//!
//! #[tokio::main]
//! async fn main() -> websock::Result<()> {
//!     let mut ws = WebSocket::connect("wss://echo.websocket.org".parse()?).await?;
//!     ws.write_message(OpCode::Text, "hello").await?;
//!     let (opcode, payload) = ws.read_message().await?;
//!     assert_eq!(opcode, OpCode::Text);
//!     println!("{}", String::from_utf8_lossy(&payload));
//!     Ok(())
//! }
//! ```
//!
//! # Accepting
//!
//! Servers either hand a hyper request to [`WebSocket::upgrade`] and await the
//! returned future, or run the handshake directly on a raw stream with
//! [`WebSocket::accept`].
//!
//! Control frames are handled inside [`WebSocket::read_message`]: pings are
//! answered with pongs, pongs are dropped, and a peer close is echoed and
//! surfaced as a [`CloseError`] carrying the close code and reason.

pub mod close;
pub mod codec;
pub mod frame;

mod conn;
mod handshake;
mod mask;
mod stream;

use thiserror::Error;

pub use close::{format_close_message, CloseCode, CloseError};
pub use conn::{MessageWriter, Options, Role, WebSocket, DEFAULT_MAX_MESSAGE_SIZE};
pub use frame::{Frame, OpCode};
pub use handshake::{derive_accept_key, HttpResponse, HttpWebSocket, TcpWebSocket, UpgradeFut};
pub use stream::MaybeTlsStream;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur during WebSocket operations.
///
/// The variants fall into five groups:
///
/// - Handshake failures (bad URL, header mismatches, wrong status)
/// - Stream failures (I/O errors from the underlying transport)
/// - Protocol errors (frame-level validation failures on received frames)
/// - A close frame received from the peer, surfaced as [`CloseError`]
/// - Misuse of the API (unclosed writer, wrong opcode for an operation)
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// One or more frame-level protocol violations detected on a received
    /// frame. The message lists every violated rule for that frame; the same
    /// text is sent to the peer in a close frame with code 1002.
    #[error("websocket: {0}")]
    Protocol(String),

    /// The peer sent a close frame (or the stream ended abnormally). Carries
    /// the close code and reason. The close frame has already been echoed
    /// back by the time this error is returned.
    #[error(transparent)]
    Close(#[from] CloseError),

    /// A text message or a close reason contains invalid UTF-8.
    /// The peer is sent a close frame with code 1007 before this is returned.
    #[error("invalid UTF-8")]
    InvalidUTF8,

    /// An assembled message exceeded [`Options::max_message_size`].
    /// The peer is sent a close frame with code 1009 before this is returned.
    #[error("message too big")]
    MessageTooLarge,

    /// A new message writer was requested while the previous one was never
    /// closed.
    #[error("websocket: unclosed previous writer")]
    UnclosedWriter,

    /// The opcode does not fit the operation: a control opcode was passed to
    /// a message write, or a data opcode to [`WebSocket::write_control`].
    #[error("websocket: bad message code")]
    BadMessageCode,

    /// The URL given to [`WebSocket::connect`] is not a `ws://` or `wss://`
    /// URL with a host.
    #[error("websocket: bad ws or wss url")]
    BadUrl,

    /// The handshake exchange was malformed beyond a specific header
    /// problem, e.g. an unparseable upgrade request.
    #[error("websocket: bad handshake: {0}")]
    BadHandshake(&'static str),

    /// The server answered the upgrade request with a status other than
    /// `101 Switching Protocols`.
    #[error("invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The `Upgrade` header is missing or does not contain `websocket`.
    #[error("invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The `Connection` header is missing or does not contain `upgrade`.
    #[error("invalid connection header")]
    InvalidConnectionHeader,

    /// The `Sec-WebSocket-Version` header is not `13`.
    #[error("Sec-WebSocket-Version must be 13")]
    InvalidSecWebsocketVersion,

    /// The upgrade request lacks a `Sec-WebSocket-Key` header.
    #[error("Sec-WebSocket-Key header is missing")]
    MissingSecWebSocketKey,

    /// The server's `Sec-WebSocket-Accept` header does not match the
    /// challenge key sent in the request.
    #[error("invalid Sec-WebSocket-Accept header")]
    InvalidSecWebSocketAccept,

    /// The upgrade request used a method other than GET.
    #[error("handshake request is not a GET")]
    InvalidMethod,

    /// The peer transmitted data after its upgrade request but before the
    /// handshake was accepted.
    #[error("websocket: client sent data before handshake completion")]
    DataBeforeHandshake,

    /// Wraps errors from URL parsing.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps I/O errors from the underlying stream.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Wraps errors from the hyper HTTP library during the handshake.
    #[error(transparent)]
    HTTPError(#[from] hyper::Error),
}
