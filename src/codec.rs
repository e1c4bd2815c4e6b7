//! WebSocket frame codec.
//!
//! The lowest layer of the stack: a [`tokio_util::codec`] decoder/encoder
//! pair that turns raw bytes into [`Frame`]s and back. The decoder is a
//! staged parser over an untrusted stream; it consumes nothing until a full
//! header is buffered, validates every frame against the protocol rules, and
//! unmasks client-to-server payloads in place. The encoder serializes the
//! header with the smallest length encoding that fits and, in client role,
//! masks a fresh copy of the payload so caller buffers are never mutated.
//!
//! Per-frame validation covers, in order:
//!
//! 1. RSV1/2/3 must be zero (no extensions are negotiated).
//! 2. The opcode must be one of {0, 1, 2, 8, 9, 10}.
//! 3. Control frames must be final and carry at most 125 payload bytes.
//! 4. Text and binary frames may only start a new message.
//! 5. Continuation frames may only appear mid-message.
//! 6. The MASK bit must match the peer's role: servers require masked
//!    input, clients require unmasked input.
//!
//! Every rule a frame violates is collected into a single
//! [`WebSocketError::Protocol`] report, which the connection layer answers
//! with a close frame carrying code 1002.
//!
//! The decoder does not assemble fragments or dispatch control frames; that
//! is the message state machine in [`WebSocket`](crate::WebSocket).

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    close::CloseError,
    conn::Role,
    frame::{Frame, MAX_HEADER_SIZE, OpCode},
    WebSocketError,
};

/// Header fields of a frame whose payload has not fully arrived yet.
struct PartialFrame {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec providing both encoding and decoding of WebSocket
/// frames, for use with Tokio's [`Framed`](tokio_util::codec::Framed)
/// streams.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }

    #[inline]
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// Tracks the parse position across calls (header accepted, payload
/// outstanding) and whether the stream is mid-message, which rules 4 and 5
/// of the frame validation depend on.
pub struct Decoder {
    role: Role,
    /// Header of the frame whose payload is still arriving.
    state: Option<PartialFrame>,
    /// A data frame with FIN=0 was accepted and its message is not complete.
    mid_message: bool,
    /// Ceiling on a single frame's payload length.
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a new `Decoder` for the given connection role.
    ///
    /// `max_frame_size` bounds a single frame's declared payload length;
    /// larger frames are rejected before any payload is buffered.
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            state: None,
            mid_message: false,
            max_frame_size,
        }
    }

    /// Runs the per-frame validation rules against a parsed first header
    /// pair, returning the opcode on success and the collected violation
    /// report on failure.
    fn validate(
        &self,
        fin: bool,
        rsv: u8,
        opcode_bits: u8,
        masked: bool,
        length_code: u8,
    ) -> Result<OpCode, WebSocketError> {
        let mut violations: Vec<String> = Vec::new();

        if rsv != 0 {
            violations.push("RSV bits set".to_owned());
        }

        let opcode = match OpCode::try_from(opcode_bits) {
            Ok(opcode) => Some(opcode),
            Err(_) => {
                violations.push(format!("bad opcode {opcode_bits}"));
                None
            }
        };

        match opcode {
            Some(opcode) if opcode.is_control() => {
                if length_code > 125 {
                    violations.push("len > 125 for control".to_owned());
                }
                if !fin {
                    violations.push("FIN not set on control".to_owned());
                }
            }
            Some(OpCode::Text) | Some(OpCode::Binary) => {
                if self.mid_message {
                    violations.push("data before FIN".to_owned());
                }
            }
            Some(OpCode::Continuation) => {
                if !self.mid_message {
                    violations.push("continuation after FIN".to_owned());
                }
            }
            _ => {}
        }

        // The peer of a server is a client and must mask; and vice versa.
        if masked != (self.role == Role::Server) {
            violations.push("bad MASK".to_owned());
        }

        match opcode {
            Some(opcode) if violations.is_empty() => Ok(opcode),
            _ => Err(WebSocketError::Protocol(violations.join(", "))),
        }
    }

    /// Unmasks (in server role) and detaches a completed payload from `src`.
    fn take_payload(&self, src: &mut BytesMut, len: usize, mask: Option<[u8; 4]>) -> bytes::Bytes {
        if self.role == Role::Server {
            // Rule 6 guarantees the mask is present here.
            if let Some(mask) = mask {
                crate::mask::apply_mask(&mut src[..len], mask);
            }
        }
        src.split_to(len).freeze()
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes one WebSocket frame from `src`, maintaining state across
    /// calls.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))`: a fully decoded, validated, unmasked frame.
    /// - `Ok(None)`: more data is needed.
    /// - `Err(WebSocketError)`: a protocol violation was detected.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Finish a frame whose header was already accepted.
        if let Some(state) = self.state.take() {
            if src.remaining() < state.payload_len {
                self.state = Some(state);
                return Ok(None);
            }

            let payload = self.take_payload(src, state.payload_len, state.mask);
            return Ok(Some(Frame::new(state.fin, state.opcode, state.mask, payload)));
        }

        if src.remaining() < 2 {
            return Ok(None);
        }

        let fin = src[0] & 0b1000_0000 != 0;
        let rsv = src[0] & 0b0111_0000;
        let opcode_bits = src[0] & 0b0000_1111;
        let masked = src[1] & 0b1000_0000 != 0;
        let length_code = src[1] & 0x7F;

        // Validation needs only the first two bytes and runs before the
        // extended header is awaited, so a violating frame is reported even
        // if the peer never sends the rest of it.
        let opcode = self.validate(fin, rsv, opcode_bits, masked, length_code)?;

        let extra = match length_code {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + extra + masked as usize * 4;
        if src.remaining() < header_size {
            return Ok(None);
        }
        src.advance(2);

        let payload_len: usize = match extra {
            0 => usize::from(length_code),
            2 => src.get_u16() as usize,
            #[cfg(target_pointer_width = "64")]
            8 => src.get_u64() as usize,
            #[cfg(any(target_pointer_width = "16", target_pointer_width = "32"))]
            8 => match usize::try_from(src.get_u64()) {
                Ok(length) => length,
                Err(_) => return Err(WebSocketError::MessageTooLarge),
            },
            _ => unreachable!(),
        };

        let mask = if masked {
            Some(src.get_u32().to_be_bytes())
        } else {
            None
        };

        if payload_len > self.max_frame_size {
            return Err(WebSocketError::MessageTooLarge);
        }

        // The frame is accepted; data frames move the fragment state.
        match opcode {
            OpCode::Text | OpCode::Binary => self.mid_message = !fin,
            OpCode::Continuation if fin => self.mid_message = false,
            _ => {}
        }

        if src.remaining() < payload_len {
            self.state = Some(PartialFrame {
                fin,
                opcode,
                mask,
                payload_len,
            });
            return Ok(None);
        }

        let payload = self.take_payload(src, payload_len, mask);
        Ok(Some(Frame::new(fin, opcode, mask, payload)))
    }

    /// Called when the underlying stream reaches EOF. An EOF in the middle
    /// of a frame is an abnormal closure (close code 1006).
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.state.is_none() => Ok(None),
            None => Err(WebSocketError::Close(CloseError::abnormal())),
        }
    }
}

/// WebSocket frame encoder.
///
/// Serializes a [`Frame`] header and payload into the output buffer. In
/// client role every frame is given a fresh random masking key, and the
/// payload is masked after being copied into the buffer, leaving the
/// caller's bytes untouched.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    /// Creates a new `Encoder` for the given connection role.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.role == Role::Client {
            frame.set_random_mask_if_not_set();
        }

        dst.reserve(MAX_HEADER_SIZE + frame.payload.len());
        frame.write_head(dst);

        let index = dst.len();
        dst.extend_from_slice(&frame.payload);

        if let Some(mask) = frame.mask {
            crate::mask::apply_mask(&mut dst[index..], mask);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::apply_mask;
    use bytes::Bytes;
    use tokio_util::codec::{Decoder as _, Encoder as _};

    fn server_decoder() -> Decoder {
        Decoder::new(Role::Server, crate::DEFAULT_MAX_MESSAGE_SIZE)
    }

    fn client_decoder() -> Decoder {
        Decoder::new(Role::Client, crate::DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// A masked client-to-server frame with the given header byte and
    /// payload.
    fn masked_frame(b0: u8, mask: [u8; 4], payload: &[u8]) -> BytesMut {
        assert!(payload.len() <= 125);
        let mut raw = BytesMut::new();
        raw.extend_from_slice(&[b0, 0x80 | payload.len() as u8]);
        raw.extend_from_slice(&mask);
        let start = raw.len();
        raw.extend_from_slice(payload);
        apply_mask(&mut raw[start..], mask);
        raw
    }

    fn protocol_report(err: WebSocketError) -> String {
        match err {
            WebSocketError::Protocol(report) => report,
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_masked_text_frame() {
        let mask = [0x37, 0xFA, 0x21, 0x3D];
        let mut raw = masked_frame(0x81, mask, b"hello");

        let frame = server_decoder().decode(&mut raw).unwrap().expect("frame");
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
        assert!(raw.is_empty());
    }

    #[test]
    fn test_decode_unmasked_frame_from_server() {
        let mut raw = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let frame = client_decoder().decode(&mut raw).unwrap().expect("frame");
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn test_decode_needs_full_header() {
        let mut decoder = client_decoder();

        // 16-bit length announced but not yet present.
        let mut raw = BytesMut::from(&[0x82, 126][..]);
        assert!(decoder.decode(&mut raw).unwrap().is_none());

        raw.extend_from_slice(&200u16.to_be_bytes());
        assert!(decoder.decode(&mut raw).unwrap().is_none());

        raw.extend_from_slice(&vec![7u8; 200]);
        let frame = decoder.decode(&mut raw).unwrap().expect("frame");
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), 200);
    }

    #[test]
    fn test_decode_staged_payload() {
        let mask = [1, 2, 3, 4];
        let raw = masked_frame(0x82, mask, &[9u8; 100]);
        let mut decoder = server_decoder();

        let mut partial = BytesMut::from(&raw[..raw.len() - 60]);
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&raw[raw.len() - 60..]);
        let frame = decoder.decode(&mut partial).unwrap().expect("frame");
        assert_eq!(frame.payload, Bytes::from(vec![9u8; 100]));
    }

    #[test]
    fn test_rsv_bits_rejected() {
        for b0 in [0xC1u8, 0xA1, 0x91] {
            let mut raw = masked_frame(b0, [0; 4], b"x");
            let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
            assert!(report.contains("RSV bits set"), "report: {report}");
        }
    }

    #[test]
    fn test_bad_opcode_rejected() {
        let mut raw = masked_frame(0x83, [0; 4], b"");
        let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
        assert_eq!(report, "bad opcode 3");
    }

    #[test]
    fn test_control_frame_too_long_rejected() {
        // Ping announcing a 16-bit extended length.
        let mut raw = BytesMut::from(&[0x89u8, 0x80 | 126][..]);
        let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
        assert!(report.contains("len > 125 for control"), "report: {report}");
    }

    #[test]
    fn test_fragmented_control_frame_rejected() {
        // Ping without FIN.
        let mut raw = masked_frame(0x09, [0; 4], b"abc");
        let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
        assert!(report.contains("FIN not set on control"), "report: {report}");
    }

    #[test]
    fn test_data_frame_interrupting_message_rejected() {
        let mut decoder = server_decoder();

        // Begin a fragmented text message.
        let mut raw = masked_frame(0x01, [0; 4], b"frag");
        decoder.decode(&mut raw).unwrap().expect("first fragment");

        // A fresh text frame mid-message is invalid.
        let mut raw = masked_frame(0x81, [0; 4], b"oops");
        let report = protocol_report(decoder.decode(&mut raw).unwrap_err());
        assert!(report.contains("data before FIN"), "report: {report}");
    }

    #[test]
    fn test_stray_continuation_rejected() {
        let mut raw = masked_frame(0x80, [0; 4], b"tail");
        let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
        assert!(report.contains("continuation after FIN"), "report: {report}");
    }

    #[test]
    fn test_control_frames_do_not_touch_fragment_state() {
        let mut decoder = server_decoder();

        let mut raw = masked_frame(0x01, [0; 4], b"frag");
        decoder.decode(&mut raw).unwrap().expect("first fragment");

        let mut raw = masked_frame(0x89, [0; 4], b"ping");
        decoder.decode(&mut raw).unwrap().expect("interleaved ping");

        // The message is still open, so a final continuation is accepted.
        let mut raw = masked_frame(0x80, [0; 4], b"ment");
        let frame = decoder.decode(&mut raw).unwrap().expect("continuation");
        assert_eq!(frame.opcode, OpCode::Continuation);
        assert!(frame.fin);
    }

    #[test]
    fn test_mask_direction_enforced() {
        // A server must reject unmasked input.
        let mut raw = BytesMut::from(&[0x81u8, 0x01, b'x'][..]);
        let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
        assert!(report.contains("bad MASK"), "report: {report}");

        // A client must reject masked input.
        let mut raw = masked_frame(0x81, [1, 2, 3, 4], b"x");
        let report = protocol_report(client_decoder().decode(&mut raw).unwrap_err());
        assert!(report.contains("bad MASK"), "report: {report}");
    }

    #[test]
    fn test_violations_collected_into_one_report() {
        // RSV set + bad opcode + unmasked toward a server, all at once.
        let mut raw = BytesMut::from(&[0xC3u8, 0x01, b'x'][..]);
        let report = protocol_report(server_decoder().decode(&mut raw).unwrap_err());
        assert!(report.contains("RSV bits set"), "report: {report}");
        assert!(report.contains("bad opcode 3"), "report: {report}");
        assert!(report.contains("bad MASK"), "report: {report}");
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = Decoder::new(Role::Client, 16);
        let mut raw = BytesMut::from(&[0x82u8, 17][..]);
        raw.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            decoder.decode(&mut raw),
            Err(WebSocketError::MessageTooLarge)
        ));
    }

    #[test]
    fn test_eof_mid_frame_is_abnormal_closure() {
        let mut decoder = client_decoder();

        // Header promises five payload bytes; only two arrive.
        let mut raw = BytesMut::from(&[0x81u8, 0x05, b'h', b'e'][..]);
        assert!(decoder.decode(&mut raw).unwrap().is_none());

        match decoder.decode_eof(&mut raw) {
            Err(WebSocketError::Close(err)) => {
                assert_eq!(err.code, 1006);
                assert_eq!(err.reason, "unexpected EOF");
            }
            other => panic!("expected abnormal closure, got {other:?}"),
        }
    }

    #[test]
    fn test_clean_eof_between_frames() {
        let mut decoder = client_decoder();
        let mut raw = BytesMut::new();
        assert!(decoder.decode_eof(&mut raw).unwrap().is_none());
    }

    #[test]
    fn test_encoder_masks_client_frames() {
        let mut dst = BytesMut::new();
        Encoder::new(Role::Client)
            .encode(Frame::text("hello"), &mut dst)
            .unwrap();

        assert_eq!(dst[0], 0x81);
        assert_eq!(dst[1], 0x80 | 5);

        let mask: [u8; 4] = dst[2..6].try_into().unwrap();
        let mut payload = dst[6..].to_vec();
        apply_mask(&mut payload, mask);
        assert_eq!(&payload, b"hello");
    }

    #[test]
    fn test_encoder_leaves_server_frames_unmasked() {
        let mut dst = BytesMut::new();
        Encoder::new(Role::Server)
            .encode(Frame::text("hello"), &mut dst)
            .unwrap();

        assert_eq!(&dst[..], &[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encoder_does_not_mutate_source_payload() {
        let payload = Bytes::from_static(b"read-only input");
        let frame = Frame::binary(payload.clone());

        let mut dst = BytesMut::new();
        Encoder::new(Role::Client).encode(frame, &mut dst).unwrap();

        assert_eq!(payload, Bytes::from_static(b"read-only input"));
    }

    #[test]
    fn test_encoder_header_sizing() {
        let cases = [(200usize, 0xFEu8, 4usize), (70000, 0xFF, 10)];

        for (len, b1, header_len) in cases {
            let mut dst = BytesMut::new();
            Encoder::new(Role::Server)
                .encode(Frame::binary(vec![1u8; len]), &mut dst)
                .unwrap();

            assert_eq!(dst[0], 0x82);
            assert_eq!(dst[1], b1 & 0x7F);
            assert_eq!(dst.len(), header_len + len);
        }
    }

    #[test]
    fn test_round_trip_through_codec() {
        let mut client_out = BytesMut::new();
        Encoder::new(Role::Client)
            .encode(Frame::binary(vec![5u8; 300]), &mut client_out)
            .unwrap();

        let frame = server_decoder()
            .decode(&mut client_out)
            .unwrap()
            .expect("frame");
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload, Bytes::from(vec![5u8; 300]));
    }
}
