//! The application callback surface and lazy inbound messages.
//!
//! The endpoint core invokes an [`Application`] you supply; it never defines
//! what the connection is *for*. Callbacks are delivered in order on a
//! dedicated event task so a slow consumer never stalls the socket task:
//! `on_open` always completes before the first `on_data`, and message chunks
//! buffer inside the [`Message`] handle while the application catches up.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::sync::{mpsc, oneshot};

use crate::{close::CloseCode, Result};

use super::EndpointHandle;

/// The callbacks the endpoint drives on behalf of a connection.
///
/// One `Application` instance exists per endpoint. Callbacks run sequentially
/// on the endpoint's application task; awaiting inside one delays the
/// following callbacks but never the socket itself.
#[async_trait]
pub trait Application: Send + 'static {
    /// Called once, right after construction, with the proxy handle and the
    /// negotiated upgrade headers. The endpoint does not read from the
    /// socket until this returns; sends issued from here are queued and
    /// flushed as soon as the endpoint loop starts.
    async fn on_open(&mut self, endpoint: EndpointHandle, headers: HeaderMap);

    /// Called once per inbound logical message with a lazy byte-stream
    /// handle. Chunks arrive as the parser emits them and buffer in the
    /// handle until consumed; the stream ends with the message's final
    /// slice, or fails with
    /// [`ClientDisconnected`](crate::WebSocketError::ClientDisconnected)
    /// if the endpoint unloads mid-message.
    async fn on_data(&mut self, message: Message);

    /// Advisory notification that the connection is closing, with the close
    /// code and reason. Does not gate teardown.
    async fn on_close(&mut self, code: CloseCode, reason: String) {
        let _ = (code, reason);
    }
}

/// A lazy handle to one inbound message.
///
/// Implements [`futures::Stream`] over the message's byte chunks, in frame
/// order. Use [`Message::collect`] to assemble the whole payload.
pub struct Message {
    chunks: mpsc::UnboundedReceiver<Result<Bytes>>,
}

impl Message {
    /// Creates the chunk channel for a new inbound message. The sender side
    /// stays with the endpoint's read path.
    pub(crate) fn channel() -> (mpsc::UnboundedSender<Result<Bytes>>, Message) {
        let (tx, chunks) = mpsc::unbounded_channel();
        (tx, Message { chunks })
    }

    /// Assembles the remaining chunks into one contiguous payload.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunks.recv().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }
}

impl futures::Stream for Message {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_recv(cx)
    }
}

/// An ordered callback delivery for the application task.
pub(crate) enum AppEvent {
    /// `on_open`; the ack gates arming the endpoint's read path.
    Open(EndpointHandle, HeaderMap, oneshot::Sender<()>),
    Data(Message),
    Close(CloseCode, String),
}

/// Drains application events in order until the endpoint drops the sender.
pub(crate) async fn run<A>(mut application: A, mut events: mpsc::UnboundedReceiver<AppEvent>)
where
    A: Application,
{
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::Open(endpoint, headers, ack) => {
                application.on_open(endpoint, headers).await;
                let _ = ack.send(());
            }
            AppEvent::Data(message) => application.on_data(message).await,
            AppEvent::Close(code, reason) => application.on_close(code, reason).await,
        }
    }
}
