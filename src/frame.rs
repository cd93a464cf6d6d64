//! # Frame
//!
//! The `frame` module implements WebSocket frames as defined in
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2),
//! providing the building blocks the parser and the frame compiler share.
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
//! - **Data frames**: [`OpCode::Text`], [`OpCode::Binary`] and
//!   [`OpCode::Continuation`], carrying application payload.
//! - **Control frames**: [`OpCode::Close`], [`OpCode::Ping`] and
//!   [`OpCode::Pong`], managing the connection. Never fragmented, payload
//!   at most 125 bytes.
//!
//! The ergonomic constructors cover the frames the endpoint builds:
//!
//! ```rust
//! use weft::frame::Frame;
//! use weft::close::CloseCode;
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let ping = Frame::ping("1");
//! let close = Frame::close(CloseCode::Normal, "done");
//! ```

use bytes::BytesMut;

use crate::{close::CloseCode, WebSocketError};

/// WebSocket operation code (OpCode) that determines the semantic meaning
/// and handling of a frame.
///
/// # Data frame OpCodes
/// - `Continuation`: continues a fragmented message started by another data frame
/// - `Text`: contains UTF-8 encoded text data
/// - `Binary`: contains raw binary data
///
/// # Control frame OpCodes
/// - `Close`: initiates or confirms connection closure
/// - `Ping`: tests connection liveness, requiring a `Pong` response
/// - `Pong`: responds to a `Ping` frame
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved; frames carrying them are
/// rejected as invalid per RFC 6455.
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
    /// constraints: they cannot be fragmented, their payload must not exceed
    /// 125 bytes, and they are transmitted ahead of queued data frames.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    /// Attempts to convert a byte value into an `OpCode`, returning an error
    /// for the reserved ranges (0x3-0x7 and 0xB-0xF).
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    /// Converts an `OpCode` into its corresponding byte representation.
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

/// Upper bound for a serialized frame header: 2 base bytes, up to 8 length
/// bytes, 4 mask bytes, rounded up.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// A WebSocket frame descriptor: the payload plus the protocol metadata the
/// compiler needs to serialize it.
///
/// # Fields
/// - `fin`: final-fragment flag. When `true`, this frame completes a message.
/// - `opcode`: frame type and interpretation.
/// - `rsv`: the three reserved header bits (RSV1..3 packed into the low three
///   bits, RSV1 highest). Zero unless a [`FrameTransform`](crate::codec::FrameTransform)
///   in the builder pipeline claims one.
/// - `payload`: frame payload data.
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// RSV1..3, packed into the low three bits. Reserved for extensions.
    pub rsv: u8,
    /// The masking key for the frame, if any.
    mask: Option<[u8; 4]>,
    /// The payload of the frame, containing the actual data.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new WebSocket `Frame`.
    ///
    /// # Parameters
    /// - `fin`: indicates if this frame is the final fragment in a message.
    /// - `opcode`: the operation code of the frame.
    /// - `mask`: optional 4-byte masking key.
    /// - `payload`: the frame payload data.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            rsv: 0,
            mask,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame with the given payload.
    pub fn text(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Text, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a final binary frame with the given payload.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a final continuation frame with the given payload.
    ///
    /// Combine with [`Frame::with_fin`] for the middle fragments of a
    /// fragmented message.
    pub fn continuation(payload: impl AsRef<[u8]>) -> Self {
        Self::new(
            true,
            OpCode::Continuation,
            None,
            BytesMut::from(payload.as_ref()),
        )
    }

    /// Creates a ping frame, used to check connection liveness.
    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a pong frame in response to a ping.
    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, BytesMut::from(payload.as_ref()))
    }

    /// Creates a close frame with a status code and reason.
    ///
    /// The payload is the big-endian `u16` code followed by the reason bytes.
    pub fn close(code: CloseCode, reason: impl AsRef<[u8]>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.extend_from_slice(&u16::from(code).to_be_bytes());
        payload.extend_from_slice(reason);

        Self::new(true, OpCode::Close, None, payload)
    }

    /// Creates a close frame with a raw payload.
    ///
    /// This method does not validate that `payload` is a valid close frame
    /// payload.
    pub fn close_raw(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Close, None, BytesMut::from(payload.as_ref()))
    }

    /// Sets the FIN bit, returning the frame for chaining.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Extracts the close code from a Close frame's payload.
    ///
    /// # Returns
    /// - `Some(CloseCode)` if the payload contains a status code
    /// - `None` if the payload is too short to contain one
    pub fn close_code(&self) -> Option<CloseCode> {
        let bytes = self.payload.get(0..2)?;
        let code = u16::from_be_bytes(bytes.try_into().ok()?);
        Some(CloseCode::from(code))
    }

    /// Extracts the close reason from a Close frame's payload.
    ///
    /// # Returns
    /// - `Some(&str)` with the reason when present and valid UTF-8
    /// - `None` otherwise
    pub fn close_reason(&self) -> Option<&str> {
        std::str::from_utf8(self.payload.get(2..)?).ok()
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        std::str::from_utf8(&self.payload).is_ok()
    }

    /// Masks the payload using a masking key.
    ///
    /// If no masking key is set, a random key is generated and applied.
    pub(crate) fn mask(&mut self) {
        let payload = &mut self.payload;
        if let Some(mask) = self.mask {
            crate::mask::apply_mask(payload, mask);
        } else {
            let mask: [u8; 4] = rand::random();
            crate::mask::apply_mask(payload, mask);
            self.mask = Some(mask);
        }
    }

    /// Formats the frame header into the provided `head` buffer and returns
    /// the total header size.
    ///
    /// # Panics
    /// Panics if `head` is smaller than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | (self.rsv & 0x07) << 4 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_control() {
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());

        assert!(!OpCode::Continuation.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn test_opcode_u8_round_trip() {
        for byte in [0x0u8, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(u8::from(OpCode::try_from(byte).unwrap()), byte);
        }
    }

    #[test]
    fn test_reserved_opcodes_rejected() {
        for &code in &[0x3u8, 0x4, 0x5, 0x6, 0x7, 0xB, 0xC, 0xD, 0xE, 0xF] {
            assert!(OpCode::try_from(code).is_err());
        }
    }

    #[test]
    fn test_close_frame_payload_layout() {
        let frame = Frame::close(CloseCode::Normal, "Goodbye");

        let mut expected = Vec::new();
        expected.extend_from_slice(&1000u16.to_be_bytes());
        expected.extend_from_slice(b"Goodbye");

        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(&frame.payload[..], &expected[..]);
        assert_eq!(frame.close_code(), Some(CloseCode::Normal));
        assert_eq!(frame.close_reason(), Some("Goodbye"));
    }

    #[test]
    fn test_close_code_on_short_payload() {
        let frame = Frame::close_raw(b"");
        assert_eq!(frame.close_code(), None);

        let frame = Frame::close_raw(&[0x03u8][..]);
        assert_eq!(frame.close_code(), None);
    }

    #[test]
    fn test_fmt_head_small_masked() {
        let mask_key = [0xAA, 0xBB, 0xCC, 0xDD];
        let frame = Frame::new(
            true,
            OpCode::Text,
            Some(mask_key),
            BytesMut::from(&b"Header test"[..]),
        );

        let mut head = [0u8; MAX_HEAD_SIZE];
        let head_size = frame.fmt_head(&mut head);

        assert_eq!(head_size, 2 + 4);
        assert_eq!(head[0], 0x81); // FIN=1, RSV=0, opcode=Text
        assert_eq!(head[1], 0x80 | 11); // MASK=1, len=11
        assert_eq!(&head[2..6], &mask_key);
    }

    #[test]
    fn test_fmt_head_extended_lengths() {
        let frame = Frame::new(true, OpCode::Binary, None, BytesMut::from(&[0u8; 300][..]));
        let mut head = [0u8; MAX_HEAD_SIZE];
        assert_eq!(frame.fmt_head(&mut head), 4);
        assert_eq!(head[1], 126);
        assert_eq!(u16::from_be_bytes([head[2], head[3]]), 300);

        let frame = Frame::new(
            false,
            OpCode::Continuation,
            None,
            BytesMut::from(&vec![0u8; 70_000][..]),
        );
        let mut head = [0u8; MAX_HEAD_SIZE];
        assert_eq!(frame.fmt_head(&mut head), 10);
        assert_eq!(head[0], 0x00); // FIN=0, opcode=Continuation
        assert_eq!(head[1], 127);
        assert_eq!(
            u64::from_be_bytes(head[2..10].try_into().unwrap()),
            70_000
        );
    }

    #[test]
    fn test_mask_is_applied_and_recorded() {
        let payload = BytesMut::from(&b"Mask me"[..]);
        let mut frame = Frame::new(true, OpCode::Binary, None, payload.clone());

        frame.mask();
        assert_ne!(frame.payload, payload);

        let mut head = [0u8; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);
        assert_eq!(size, 2 + 4);
        assert_ne!(head[1] & 0x80, 0);

        // Unmasking with the key recorded in the header restores the payload.
        let key: [u8; 4] = head[2..6].try_into().unwrap();
        crate::mask::apply_mask(&mut frame.payload, key);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn test_rsv_bits_in_header() {
        let mut frame = Frame::text("x");
        frame.rsv = 0b100; // RSV1
        let mut head = [0u8; MAX_HEAD_SIZE];
        frame.fmt_head(&mut head);
        assert_eq!(head[0], 0x81 | 0x40);
    }
}
