//! # weft
//!
//! An RFC 6455 WebSocket endpoint for connections that have already been
//! upgraded by an HTTP layer. Once the upgrade handshake has produced a
//! socket and the negotiated headers, the [`Endpoint`] owns that socket and
//! mediates all further communication: parsing inbound frames into
//! application messages, serializing outbound messages into masked frames,
//! and driving the close handshake.
//!
//! The crate is organized in three layers:
//!
//! - [`parser::FrameParser`] — a restartable byte-sink consuming arbitrary
//!   TCP chunks and emitting typed events (control frames, data slices,
//!   terminal errors), with incremental delivery of large messages.
//! - [`codec::Encoder`] and the write queues — compile logical sends into
//!   masked wire frames and drain them with control frames ahead of data
//!   frames.
//! - [`Endpoint`] — the per-connection state machine wiring parser output to
//!   an [`Application`], tracking statistics, heartbeats and the bounded
//!   close-handshake timeout.
//!
//! The HTTP upgrade itself, TLS, and the application logic are external
//! collaborators; the endpoint consumes a socket and invokes an
//! [`Application`] you supply.

pub mod close;
pub mod codec;
pub mod frame;
mod mask;
pub mod parser;

mod endpoint;

use thiserror::Error;

pub use close::CloseCode;
pub use codec::{FrameTransform, Pipeline};
pub use endpoint::{
    Application, ConnectionInfo, Endpoint, EndpointHandle, Message, Options, Role, SendHandle,
};
pub use frame::{Frame, OpCode};
pub use parser::{Emit, FrameParser};

/// A result type for WebSocket operations, using `WebSocketError` as the
/// error type.
///
/// This type alias simplifies function signatures within the crate by
/// providing a standard result type for operations that may return a
/// `WebSocketError`.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while operating a WebSocket endpoint.
///
/// The variants fall into the taxonomy the protocol itself imposes:
///
/// - Protocol violations (malformed headers, illegal fragmentation, masking
///   mismatches) — surfaced as parser events and converted into Close frames
///   rather than thrown across the endpoint.
/// - Resource exhaustion (frame or message over the configured limits).
/// - Policy rejections (binary data on a text-only endpoint).
/// - Transport failures and client detachment.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A non-empty payload arrived unmasked on an endpoint whose role
    /// requires inbound masking (server role receiving from a client).
    #[error("payload must be masked")]
    UnmaskedFrame,

    /// A payload arrived masked on an endpoint whose role requires inbound
    /// frames to be unmasked (client role receiving from a server).
    #[error("payload must not be masked")]
    MaskedFrame,

    /// Indicates receipt of a frame with an invalid opcode value. RFC 6455
    /// reserves 0x3-0x7 and 0xB-0xF for future protocol revisions.
    #[error("invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// Reserved bits in the frame header are set. No extension is negotiated
    /// on these connections, so RSV1-3 must be zero.
    #[error("reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A control frame (close, ping, or pong) was received with the FIN bit
    /// clear. RFC 6455 forbids fragmenting control frames.
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame declared a payload longer than the 125 bytes RFC 6455
    /// allows for control frames.
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,

    /// A continuation frame arrived without a fragmented message in
    /// progress.
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,

    /// A new text or binary frame arrived while a fragmented message was
    /// still in progress; only continuation frames are legal here.
    #[error("expected a continuation frame")]
    ExpectedContinuation,

    /// A frame's declared payload length exceeds the configured per-frame
    /// limit.
    #[error("frame exceeds maximum frame size")]
    FrameTooLarge,

    /// The cumulative size of the current message exceeds the configured
    /// per-message limit.
    #[error("message exceeds maximum message size")]
    MessageTooLarge,

    /// A binary frame was received on an endpoint configured to accept text
    /// only.
    #[error("binary frames are not accepted")]
    BinaryNotAccepted,

    /// A 64-bit extended payload length had its most significant bit set,
    /// which RFC 6455 forbids.
    #[error("64-bit payload length out of range")]
    FrameLengthOverflow,

    /// A text message (or a close reason) failed UTF-8 validation at an emit
    /// boundary.
    #[error("invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Returned when attempting to use an endpoint whose connection has
    /// already been closed or torn down.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The endpoint unloaded while this operation was outstanding. Queued
    /// frame completions and in-flight message streams fail with this error
    /// when the client detaches.
    #[error("client disconnected")]
    ClientDisconnected,

    /// Endpoint construction requires the negotiated upgrade headers; an
    /// empty header map indicates the handshake never completed.
    #[error("upgrade headers must not be empty")]
    MissingHeaders,

    /// Wraps I/O errors from the underlying socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// The RFC 6455 close code this error maps to when the endpoint converts
    /// it into a Close frame.
    pub fn close_code(&self) -> CloseCode {
        match self {
            WebSocketError::FrameTooLarge | WebSocketError::MessageTooLarge => CloseCode::Size,
            WebSocketError::BinaryNotAccepted => CloseCode::Unsupported,
            WebSocketError::InvalidUtf8 => CloseCode::Invalid,
            WebSocketError::UnmaskedFrame
            | WebSocketError::MaskedFrame
            | WebSocketError::InvalidOpCode(_)
            | WebSocketError::ReservedBitsNotZero
            | WebSocketError::ControlFrameFragmented
            | WebSocketError::ControlFrameTooLarge
            | WebSocketError::UnexpectedContinuation
            | WebSocketError::ExpectedContinuation
            | WebSocketError::FrameLengthOverflow => CloseCode::Protocol,
            WebSocketError::ConnectionClosed
            | WebSocketError::ClientDisconnected
            | WebSocketError::Io(_) => CloseCode::Abnormal,
            WebSocketError::MissingHeaders => CloseCode::Error,
        }
    }
}
