//! Close codes and the close protocol.
//!
//! A close frame payload is either empty, reported as code 1005 (no status
//! received), or at least two bytes: a big-endian status code followed by a
//! UTF-8 reason. Codes 1005, 1006 and 1015 are sentinel values that must
//! never appear on the wire; the 3000-3999 range is IANA-registered and
//! 4000-4999 is reserved for applications, both accepted on receipt.
//!
//! The close-code classification is adapted from tungstenite.

use std::fmt;

use bytes::Bytes;

use self::CloseCode::*;

/// Status codes representing the reasons why an endpoint is closing the
/// WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Normal closure; the purpose for which the connection was established
    /// has been fulfilled.
    Normal,
    /// The endpoint is going away, such as a server shutting down or a
    /// browser navigating away from a page.
    Away,
    /// A protocol error led the endpoint to terminate the connection.
    Protocol,
    /// The endpoint received a type of data it cannot accept.
    Unsupported,
    /// No status code was present in the close frame. Never sent on the wire.
    Status,
    /// The connection was dropped without a close frame. Never sent on the
    /// wire.
    Abnormal,
    /// The received message data was inconsistent with its type, e.g.
    /// non-UTF-8 data in a text message.
    Invalid,
    /// A generic policy violation when no more specific code applies.
    Policy,
    /// The message is too large for the endpoint to process.
    Size,
    /// The client expected an extension the server did not negotiate.
    Extension,
    /// An unexpected condition prevented the server from fulfilling the
    /// request.
    Error,
    /// The server is restarting; the client may reconnect.
    Restart,
    /// The server is overloaded; the client should try again later.
    Again,
    /// A TLS handshake failure. Never sent on the wire.
    Tls,
    #[doc(hidden)]
    /// Reserved status codes, not valid on receipt.
    Reserved(u16),
    #[doc(hidden)]
    /// IANA-registered codes (3000-3999), accepted on receipt.
    Iana(u16),
    #[doc(hidden)]
    /// Application codes (4000-4999), accepted on receipt.
    Library(u16),
    #[doc(hidden)]
    /// Codes outside the acceptable WebSocket ranges.
    Bad(u16),
}

impl CloseCode {
    /// Check if this `CloseCode` is allowed in a close frame received from
    /// the peer.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Tls)
    }

    /// Human-readable name of the code, when it has one.
    pub fn label(self) -> Option<&'static str> {
        match self {
            Normal => Some("normal"),
            Away => Some("going away"),
            Protocol => Some("protocol error"),
            Unsupported => Some("unsupported data"),
            Status => Some("no status"),
            Abnormal => Some("abnormal closure"),
            Invalid => Some("invalid payload data"),
            Policy => Some("policy violation"),
            Size => Some("message too big"),
            Extension => Some("mandatory extension missing"),
            Error => Some("internal server error"),
            Restart => Some("service restart"),
            Again => Some("try again later"),
            Tls => Some("TLS handshake error"),
            Reserved(_) | Iana(_) | Library(_) | Bad(_) => None,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1015 => Tls,
            1..=999 => Bad(code),
            1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Tls => 1015,
            Reserved(code) => code,
            Iana(code) => code,
            Library(code) => code,
            Bad(code) => code,
        }
    }
}

/// Error returned when the peer closes the connection.
///
/// Carries the close code and the UTF-8 reason from the peer's close frame.
/// A connection dropped without a close frame is reported with code 1006
/// (abnormal closure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    /// The close status code.
    pub code: u16,
    /// The UTF-8 reason text, empty when the peer sent none.
    pub reason: String,
}

impl CloseError {
    /// Creates a new `CloseError` from a code and reason.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// The error reported when the underlying stream ends mid-conversation.
    pub(crate) fn abnormal() -> Self {
        Self::new(u16::from(Abnormal), "unexpected EOF")
    }
}

impl fmt::Display for CloseError {
    /// Formats as `websocket: close <code> (<label>): <text>`, dropping the
    /// label for unrecognized codes and the text when empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket: close {}", self.code)?;
        if let Some(label) = CloseCode::from(self.code).label() {
            write!(f, " ({label})")?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

/// Formats a close frame payload from a code and reason text.
///
/// Code 1005 (no status received) yields an empty payload, since that code
/// must never be written to the wire; any other code is encoded big-endian
/// and followed by the reason bytes.
pub fn format_close_message(code: u16, text: &str) -> Bytes {
    if code == u16::from(Status) {
        return Bytes::new();
    }

    let mut buf = Vec::with_capacity(2 + text.len());
    buf.extend_from_slice(&code.to_be_bytes());
    buf.extend_from_slice(text.as_bytes());
    buf.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 1012, 1013] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
            assert!(CloseCode::from(code).is_allowed());
        }
    }

    #[test]
    fn test_sentinel_codes_not_allowed() {
        assert!(!CloseCode::from(1005).is_allowed());
        assert!(!CloseCode::from(1006).is_allowed());
        assert!(!CloseCode::from(1015).is_allowed());
    }

    #[test]
    fn test_unassigned_and_reserved_codes() {
        // 1004 is unassigned and must be rejected, as must sub-1000 codes and
        // the reserved 1016-2999 range.
        assert!(!CloseCode::from(1004).is_allowed());
        assert!(!CloseCode::from(999).is_allowed());
        assert!(!CloseCode::from(1016).is_allowed());
        assert!(!CloseCode::from(2999).is_allowed());
    }

    #[test]
    fn test_application_ranges_allowed() {
        assert!(CloseCode::from(3000).is_allowed());
        assert!(CloseCode::from(3999).is_allowed());
        assert!(CloseCode::from(4000).is_allowed());
        assert!(CloseCode::from(4999).is_allowed());
        assert!(!CloseCode::from(5000).is_allowed());
    }

    #[test]
    fn test_close_error_display() {
        let err = CloseError::new(1000, "bye");
        assert_eq!(err.to_string(), "websocket: close 1000 (normal): bye");

        let err = CloseError::new(1006, "unexpected EOF");
        assert_eq!(
            err.to_string(),
            "websocket: close 1006 (abnormal closure): unexpected EOF"
        );

        let err = CloseError::new(1001, "");
        assert_eq!(err.to_string(), "websocket: close 1001 (going away)");

        let err = CloseError::new(4001, "app specific");
        assert_eq!(err.to_string(), "websocket: close 4001: app specific");
    }

    #[test]
    fn test_format_close_message() {
        assert!(format_close_message(1005, "ignored").is_empty());

        let payload = format_close_message(1000, "bye");
        assert_eq!(&payload[..2], &1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"bye");

        let payload = format_close_message(1002, "");
        assert_eq!(&payload[..], &1002u16.to_be_bytes());
    }
}
