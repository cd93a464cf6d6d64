//! Outbound write queues and frame completion handles.
//!
//! Compiled frames wait in one of two queues: control frames have strict
//! priority over data frames, but neither preempts the frame currently being
//! drained to the socket. Each queued frame may carry a completion handle
//! that resolves when its last byte leaves the socket, or fails when the
//! endpoint unloads.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::sync::oneshot;

use crate::{Result, WebSocketError};

/// The resolving side of a frame completion, retained by the write queue.
pub(crate) type Completion = oneshot::Sender<Result<()>>;

/// A one-shot awaitable resolved when the associated frame has fully left
/// the socket.
///
/// Returned by [`EndpointHandle::send`](crate::EndpointHandle::send) and
/// friends. Awaiting it yields `Ok(())` once the frame is on the wire, or
/// [`WebSocketError::ClientDisconnected`] if the endpoint unloaded first.
/// Dropping the handle is fine; the frame is sent regardless.
pub struct SendHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl SendHandle {
    /// Creates a completion pair: the sender side goes to the write queue,
    /// the handle to the caller.
    pub(crate) fn channel() -> (Completion, SendHandle) {
        let (tx, rx) = oneshot::channel();
        (tx, SendHandle { rx })
    }
}

impl Future for SendHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WebSocketError::ClientDisconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A fully-serialized frame awaiting transmission.
pub(crate) struct Entry {
    pub(crate) frame: Bytes,
    pub(crate) done: Option<Completion>,
    pub(crate) control: bool,
}

/// The two-priority outbound queue plus the live drain buffer.
pub(crate) struct WriteQueue {
    /// The frame currently being drained, possibly partially written.
    buffer: Bytes,
    /// Completion handle associated with the live buffer.
    deferred: Option<Completion>,
    control: VecDeque<Entry>,
    data: VecDeque<Entry>,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            buffer: Bytes::new(),
            deferred: None,
            control: VecDeque::new(),
            data: VecDeque::new(),
        }
    }

    /// Appends a compiled frame to the queue matching its priority.
    pub(crate) fn enqueue(&mut self, entry: Entry) {
        if entry.control {
            self.control.push_back(entry);
        } else {
            self.data.push_back(entry);
        }
    }

    /// The unwritten remainder of the live frame.
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn buffer_is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Promotes the next queued frame to the live buffer, control frames
    /// first. While the endpoint is closing, data frames are never promoted;
    /// they fail when the endpoint unloads.
    ///
    /// Returns whether the promoted frame is a control frame.
    pub(crate) fn promote(&mut self, closing: bool) -> Option<bool> {
        debug_assert!(self.buffer.is_empty());

        let entry = match self.control.pop_front() {
            Some(entry) => entry,
            None if closing => return None,
            None => self.data.pop_front()?,
        };

        let control = entry.control;
        self.buffer = entry.frame;
        self.deferred = entry.done;
        Some(control)
    }

    /// Records `n` bytes written from the live buffer. Returns `true` when
    /// the frame fully drained, resolving its completion handle.
    pub(crate) fn advance(&mut self, n: usize) -> bool {
        self.buffer.advance(n);
        if !self.buffer.is_empty() {
            return false;
        }
        if let Some(done) = self.deferred.take() {
            let _ = done.send(Ok(()));
        }
        true
    }

    /// Fails every outstanding completion handle. Called once on unload.
    pub(crate) fn fail_all(&mut self) {
        if let Some(done) = self.deferred.take() {
            let _ = done.send(Err(WebSocketError::ClientDisconnected));
        }
        self.buffer = Bytes::new();

        for entry in self.control.drain(..).chain(self.data.drain(..)) {
            if let Some(done) = entry.done {
                let _ = done.send(Err(WebSocketError::ClientDisconnected));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(bytes: &'static [u8], control: bool) -> (Entry, SendHandle) {
        let (done, handle) = SendHandle::channel();
        (
            Entry {
                frame: Bytes::from_static(bytes),
                done: Some(done),
                control,
            },
            handle,
        )
    }

    #[test]
    fn test_control_overtakes_queued_data() {
        let mut queue = WriteQueue::new();

        // A large data frame is mid-drain.
        let (live, _live_handle) = entry(b"data-frame-one", false);
        queue.enqueue(live);
        assert_eq!(queue.promote(false), Some(false));
        assert!(!queue.advance(4)); // partial drain

        // Another data frame is queued, then a ping arrives.
        let (queued_data, _d) = entry(b"data-frame-two", false);
        queue.enqueue(queued_data);
        let (ping, _p) = entry(b"ping", true);
        queue.enqueue(ping);

        // The live buffer finishes first, then the ping overtakes the data.
        assert!(queue.advance(queue.buffer().len()));
        assert_eq!(queue.promote(false), Some(true));
        assert_eq!(queue.buffer(), b"ping");

        assert!(queue.advance(4));
        assert_eq!(queue.promote(false), Some(false));
        assert_eq!(queue.buffer(), b"data-frame-two");
    }

    #[test]
    fn test_closing_skips_data_frames() {
        let mut queue = WriteQueue::new();
        let (data, _d) = entry(b"unsent", false);
        queue.enqueue(data);
        let (close, _c) = entry(b"close", true);
        queue.enqueue(close);

        assert_eq!(queue.promote(true), Some(true));
        assert!(queue.advance(5));
        // Only the data frame remains and the endpoint is closing.
        assert_eq!(queue.promote(true), None);
    }

    #[tokio::test]
    async fn test_completion_resolves_on_full_drain() {
        let mut queue = WriteQueue::new();
        let (frame, handle) = entry(b"abcdef", false);
        queue.enqueue(frame);
        queue.promote(false);

        assert!(!queue.advance(3));
        assert!(queue.advance(3));

        assert!(handle.await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_all_fails_live_and_queued() {
        let mut queue = WriteQueue::new();
        let (live, live_handle) = entry(b"live", false);
        queue.enqueue(live);
        queue.promote(false);
        let (queued, queued_handle) = entry(b"queued", true);
        queue.enqueue(queued);

        queue.fail_all();

        assert!(matches!(
            live_handle.await,
            Err(WebSocketError::ClientDisconnected)
        ));
        assert!(matches!(
            queued_handle.await,
            Err(WebSocketError::ClientDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_dropped_queue_fails_handle() {
        let (done, handle) = SendHandle::channel();
        drop(done);
        assert!(matches!(
            handle.await,
            Err(WebSocketError::ClientDisconnected)
        ));
    }
}
