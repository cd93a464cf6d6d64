//! Outbound frame compilation.
//!
//! The [`Encoder`] turns a logical [`Frame`] into its wire representation:
//! the frame first passes through the builder [`Pipeline`], is masked with a
//! fresh random key, and is then serialized (header plus payload) into the
//! destination buffer. The endpoint always masks outbound frames.
//!
//! The [`Pipeline`] is the plug point for frame-rewriting extensions such as
//! permessage-deflate: each [`FrameTransform`] receives the frame descriptor
//! and produces a possibly transformed descriptor. No extension ships with
//! this crate; the default pipeline is the identity.

use bytes::BytesMut;
use tokio_util::codec;

use crate::{
    frame::{Frame, MAX_HEAD_SIZE},
    Result, WebSocketError,
};

/// An ordered transform applied to outbound frame descriptors before
/// serialization.
///
/// Transforms see the whole descriptor (`payload`, `rsv`, `fin`, `opcode`)
/// and may rewrite any of it; an extension claiming an RSV bit sets it here.
pub trait FrameTransform: Send {
    /// Transforms the frame descriptor, or fails the send.
    fn transform(&mut self, frame: Frame) -> Result<Frame>;
}

/// An ordered collection of [`FrameTransform`]s applied in sequence.
///
/// The default pipeline is empty and leaves frames untouched.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn FrameTransform>>,
}

impl Pipeline {
    /// Creates an empty (identity) pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transform to the end of the pipeline.
    pub fn push(&mut self, stage: Box<dyn FrameTransform>) {
        self.stages.push(stage);
    }

    /// Runs the frame through every stage in order.
    pub fn apply(&mut self, frame: Frame) -> Result<Frame> {
        let mut frame = frame;
        for stage in &mut self.stages {
            frame = stage.transform(frame)?;
        }
        Ok(frame)
    }
}

/// WebSocket frame encoder serializing [`Frame`] instances into a buffer.
///
/// `Encoder` runs the builder pipeline, masks the payload, and formats the
/// header and payload into a `BytesMut` ready for transmission.
#[derive(Default)]
pub struct Encoder {
    pipeline: Pipeline,
}

impl Encoder {
    /// Creates an encoder with the identity pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an encoder with the given builder pipeline.
    pub fn with_pipeline(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    /// Encodes a `Frame` into the provided buffer.
    ///
    /// The frame passes through the pipeline, is masked with a fresh random
    /// key, and its header and payload are appended to `dst`.
    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let mut frame = self.pipeline.apply(frame)?;
        frame.mask();

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
