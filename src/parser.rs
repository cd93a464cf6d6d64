//! Streaming WebSocket frame parser.
//!
//! [`FrameParser`] is a restartable byte-sink: [`FrameParser::feed`] consumes
//! an arbitrary chunk of the TCP stream, drives an emit callback with typed
//! events, and reports how many complete frames it processed out of that
//! chunk. The parser may suspend at any point awaiting more bytes — all
//! header and payload state persists across calls, so the emitted event
//! sequence is independent of how the stream is chunked.
//!
//! Large text and binary messages are not buffered whole. Message bytes
//! accumulate in a pending buffer and are emitted as [`Emit::Data`] slices of
//! the configured emit threshold, with the remainder flushed at every data
//! frame boundary; the slice carrying `fin = true` completes the message and
//! may be empty when an earlier slice already exhausted it. With UTF-8
//! validation enabled, slice boundaries are pulled back to the last whole
//! code point (carrying at most a few trailing bytes) so every emitted text
//! slice is independently valid.
//!
//! After a terminal [`Emit::Error`] the parser enters a zero-consuming idle
//! state and emits nothing further; the endpoint converts the event into a
//! Close frame.

use bytes::{Buf, Bytes, BytesMut};

use crate::{
    close::CloseCode,
    frame::OpCode,
    mask::{apply_mask, apply_mask_offset},
    Options, Role, WebSocketError,
};

/// The longest run of undecodable trailing bytes a text slice may carry into
/// the next emission. A UTF-8 code point is at most 4 bytes; anything beyond
/// this window can never become valid.
const UTF8_CARRY: usize = 7;

/// An event produced by the parser.
#[derive(Debug)]
pub enum Emit {
    /// A fully-assembled control frame (payload at most 125 bytes, fin set).
    Control {
        /// `Close`, `Ping` or `Pong`.
        opcode: OpCode,
        /// The unmasked control payload.
        payload: Bytes,
    },
    /// A slice of a text or binary message, in stream order.
    ///
    /// Intermediate slices carry `fin = false`; exactly one final slice per
    /// message carries `fin = true`, and that final payload may be empty when
    /// a previous slice exhausted the message.
    Data {
        /// The unmasked message bytes.
        payload: Bytes,
        /// Whether this slice completes the message.
        fin: bool,
    },
    /// Terminal failure. The parser consumes and emits nothing afterwards.
    Error {
        /// What went wrong.
        error: WebSocketError,
        /// The RFC 6455 close code the endpoint should close with.
        code: CloseCode,
    },
}

/// Frame header fields decoded from the first two bytes.
struct Header {
    fin: bool,
    opcode: OpCode,
    masked: bool,
    /// The 7-bit length field; 126 and 127 select an extended length.
    length_code: u8,
    /// Size of the extended length field in bytes (0, 2 or 8).
    extra: usize,
}

/// Progress through the current frame's payload.
struct PayloadState {
    fin: bool,
    opcode: OpCode,
    remaining: usize,
    mask: Option<[u8; 4]>,
    /// Bytes of this frame's payload already consumed; keeps the masking key
    /// aligned across partial reads.
    offset: usize,
}

/// Parse position within the current frame.
enum ReadState {
    /// Waiting for the extended length field.
    Length(Header),
    /// Waiting for the 4-byte masking key.
    MaskKey(Header, usize),
    /// Consuming the payload.
    Payload(PayloadState),
}

/// A suspendable parser turning raw socket bytes into frame events.
///
/// Single-consumer: one endpoint read path drives it, feeding chunks as they
/// arrive and handling the emitted events in order.
pub struct FrameParser {
    max_frame_size: usize,
    max_msg_size: usize,
    emit_threshold: usize,
    validate_utf8: bool,
    text_only: bool,
    /// Inbound masking policy derived from the endpoint role.
    require_masked: bool,

    /// Raw bytes received but not yet consumed by the state machine.
    buf: BytesMut,
    /// `None` means the parser is positioned at a frame head.
    state: Option<ReadState>,
    /// Set once a terminal error has been emitted.
    failed: bool,

    /// True while a fragmented message awaits its continuation frames.
    msg_started: bool,
    /// Initial opcode of the in-progress message (Text or Binary).
    msg_opcode: Option<OpCode>,
    /// Bytes of the current message assembled so far.
    msg_bytes: usize,
    /// Assembled message bytes not yet emitted.
    pending: BytesMut,
}

impl FrameParser {
    /// Creates a parser with the limits and policies of `options`.
    pub fn new(options: &Options) -> Self {
        Self {
            max_frame_size: options.max_frame_size,
            max_msg_size: options.max_msg_size,
            emit_threshold: options.emit_threshold.max(1),
            validate_utf8: options.validate_utf8,
            text_only: options.text_only,
            require_masked: options.role == Role::Server,
            buf: BytesMut::new(),
            state: None,
            failed: false,
            msg_started: false,
            msg_opcode: None,
            msg_bytes: 0,
            pending: BytesMut::new(),
        }
    }

    /// Feeds one chunk of the byte stream to the parser.
    ///
    /// Every event the chunk completes is delivered to `emit` before this
    /// returns. The return value is the number of frames whose final byte was
    /// consumed during this call; the endpoint adds it to `frames_read`.
    ///
    /// After a terminal [`Emit::Error`] the call is a no-op returning zero.
    pub fn feed<F>(&mut self, chunk: &[u8], mut emit: F) -> usize
    where
        F: FnMut(Emit),
    {
        if self.failed {
            return 0;
        }

        self.buf.extend_from_slice(chunk);

        let mut frames = 0;
        loop {
            match self.state.take() {
                None => {
                    // Frame head: FIN/RSV/opcode, MASK/len7.
                    if self.buf.len() < 2 {
                        return frames;
                    }

                    let b0 = self.buf[0];
                    let b1 = self.buf[1];

                    if b0 & 0b0111_0000 != 0 {
                        return self.fail(WebSocketError::ReservedBitsNotZero, frames, &mut emit);
                    }

                    let opcode = match OpCode::try_from(b0 & 0b0000_1111) {
                        Ok(opcode) => opcode,
                        Err(err) => return self.fail(err, frames, &mut emit),
                    };

                    let fin = b0 & 0b1000_0000 != 0;
                    let masked = b1 & 0b1000_0000 != 0;
                    let length_code = b1 & 0x7F;
                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    self.buf.advance(2);

                    self.state = Some(ReadState::Length(Header {
                        fin,
                        opcode,
                        masked,
                        length_code,
                        extra,
                    }));
                }
                Some(ReadState::Length(header)) => {
                    if self.buf.len() < header.extra {
                        self.state = Some(ReadState::Length(header));
                        return frames;
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => usize::from(self.buf.get_u16()),
                        _ => {
                            let len = self.buf.get_u64();
                            if len & (1 << 63) != 0 {
                                return self.fail(
                                    WebSocketError::FrameLengthOverflow,
                                    frames,
                                    &mut emit,
                                );
                            }
                            match usize::try_from(len) {
                                Ok(len) => len,
                                Err(_) => {
                                    return self.fail(
                                        WebSocketError::FrameTooLarge,
                                        frames,
                                        &mut emit,
                                    )
                                }
                            }
                        }
                    };

                    if let Err(err) = self.validate(&header, payload_len) {
                        return self.fail(err, frames, &mut emit);
                    }

                    if !header.opcode.is_control() && header.opcode != OpCode::Continuation {
                        self.msg_opcode = Some(header.opcode);
                    }

                    self.state = if header.masked {
                        Some(ReadState::MaskKey(header, payload_len))
                    } else {
                        Some(ReadState::Payload(PayloadState {
                            fin: header.fin,
                            opcode: header.opcode,
                            remaining: payload_len,
                            mask: None,
                            offset: 0,
                        }))
                    };
                }
                Some(ReadState::MaskKey(header, payload_len)) => {
                    if self.buf.len() < 4 {
                        self.state = Some(ReadState::MaskKey(header, payload_len));
                        return frames;
                    }

                    let mask = self.buf.get_u32().to_be_bytes();
                    self.state = Some(ReadState::Payload(PayloadState {
                        fin: header.fin,
                        opcode: header.opcode,
                        remaining: payload_len,
                        mask: Some(mask),
                        offset: 0,
                    }));
                }
                Some(ReadState::Payload(mut payload)) => {
                    if payload.opcode.is_control() {
                        // Control payloads are at most 125 bytes; assemble
                        // them whole.
                        if self.buf.len() < payload.remaining {
                            self.state = Some(ReadState::Payload(payload));
                            return frames;
                        }

                        let mut body = self.buf.split_to(payload.remaining);
                        if let Some(mask) = payload.mask {
                            apply_mask(&mut body, mask);
                        }

                        frames += 1;
                        emit(Emit::Control {
                            opcode: payload.opcode,
                            payload: body.freeze(),
                        });
                        continue;
                    }

                    // Data frame: consume whatever is available, unmasking
                    // aligned to the position within the frame payload.
                    let take = payload.remaining.min(self.buf.len());
                    if take > 0 {
                        let mut span = self.buf.split_to(take);
                        if let Some(mask) = payload.mask {
                            apply_mask_offset(&mut span, mask, payload.offset);
                        }
                        payload.offset += take;
                        payload.remaining -= take;
                        self.msg_bytes += take;
                        self.pending.extend_from_slice(&span);
                    }

                    // Emit threshold-sized slices as the message assembles.
                    while self.pending.len() >= self.emit_threshold {
                        match self.split_slice(self.emit_threshold) {
                            Ok(Some(slice)) => emit(Emit::Data {
                                payload: slice,
                                fin: false,
                            }),
                            Ok(None) => break,
                            Err(err) => return self.fail(err, frames, &mut emit),
                        }
                    }

                    if payload.remaining > 0 {
                        self.state = Some(ReadState::Payload(payload));
                        return frames;
                    }

                    frames += 1;

                    if payload.fin {
                        if self.validate_utf8
                            && self.msg_opcode == Some(OpCode::Text)
                            && std::str::from_utf8(&self.pending).is_err()
                        {
                            return self.fail(WebSocketError::InvalidUtf8, frames, &mut emit);
                        }

                        emit(Emit::Data {
                            payload: self.pending.split().freeze(),
                            fin: true,
                        });
                        self.msg_started = false;
                        self.msg_opcode = None;
                        self.msg_bytes = 0;
                    } else {
                        self.msg_started = true;
                        if !self.pending.is_empty() {
                            match self.split_slice(self.pending.len()) {
                                Ok(Some(slice)) => emit(Emit::Data {
                                    payload: slice,
                                    fin: false,
                                }),
                                Ok(None) => {}
                                Err(err) => return self.fail(err, frames, &mut emit),
                            }
                        }
                    }
                }
            }
        }
    }

    /// Header-time validation, in the order the protocol rules are checked.
    fn validate(&self, header: &Header, payload_len: usize) -> crate::Result<()> {
        if self.require_masked && !header.masked && payload_len > 0 {
            return Err(WebSocketError::UnmaskedFrame);
        }
        if !self.require_masked && header.masked && payload_len > 0 {
            return Err(WebSocketError::MaskedFrame);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload_len > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        } else if header.opcode == OpCode::Continuation {
            if !self.msg_started {
                return Err(WebSocketError::UnexpectedContinuation);
            }
        } else if self.msg_started {
            return Err(WebSocketError::ExpectedContinuation);
        }

        if payload_len > self.max_frame_size {
            return Err(WebSocketError::FrameTooLarge);
        }
        if !header.opcode.is_control() && self.msg_bytes + payload_len > self.max_msg_size {
            return Err(WebSocketError::MessageTooLarge);
        }
        if self.text_only && header.opcode == OpCode::Binary {
            return Err(WebSocketError::BinaryNotAccepted);
        }

        Ok(())
    }

    /// Splits up to `limit` bytes off the pending buffer for emission.
    ///
    /// For text messages under validation, the split point is pulled back to
    /// the last complete code point. Returns `Ok(None)` when nothing can be
    /// emitted yet, and an error when more than [`UTF8_CARRY`] trailing bytes
    /// are undecodable.
    fn split_slice(&mut self, limit: usize) -> crate::Result<Option<Bytes>> {
        let len = limit.min(self.pending.len());

        if !(self.validate_utf8 && self.msg_opcode == Some(OpCode::Text)) {
            return Ok(Some(self.pending.split_to(len).freeze()));
        }

        match std::str::from_utf8(&self.pending[..len]) {
            Ok(_) => Ok(Some(self.pending.split_to(len).freeze())),
            Err(err) => {
                let valid = err.valid_up_to();
                if len - valid > UTF8_CARRY {
                    return Err(WebSocketError::InvalidUtf8);
                }
                if valid == 0 {
                    return Ok(None);
                }
                Ok(Some(self.pending.split_to(valid).freeze()))
            }
        }
    }

    /// Emits the terminal error event and parks the parser.
    fn fail<F>(&mut self, error: WebSocketError, frames: usize, emit: &mut F) -> usize
    where
        F: FnMut(Emit),
    {
        log::debug!("frame parser failed: {error}");

        let code = error.close_code();
        emit(Emit::Error { error, code });

        self.failed = true;
        self.state = None;
        self.buf.clear();
        self.pending.clear();

        frames
    }
}
