//! The per-connection endpoint state machine.
//!
//! An [`Endpoint`] takes ownership of a socket after the HTTP upgrade and
//! runs everything for that peer on one logical task: it feeds inbound bytes
//! to the frame parser, dispatches the resulting events to the
//! [`Application`], compiles outbound sends into masked frames, drains the
//! two-priority write queues as the socket accepts bytes, and drives the
//! close handshake under a bounded timeout.
//!
//! ```text
//! socket ──reads──▶ FrameParser ──events──▶ Endpoint ──▶ Application
//! Application ──EndpointHandle::send──▶ Encoder ──▶ WriteQueue ──▶ socket
//! ```
//!
//! Everything the endpoint owns is touched only from its own task; the
//! [`EndpointHandle`] given to the application routes requests in over a
//! command channel and holds nothing that keeps the endpoint alive after
//! teardown.

mod app;
mod writer;

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, oneshot},
    time::{self, Instant, Interval},
};
use tokio_util::codec::Encoder as _;

use crate::{
    close::CloseCode,
    codec::{Encoder, Pipeline},
    frame::{Frame, OpCode},
    parser::{Emit, FrameParser},
    Result, WebSocketError,
};

pub use app::{Application, Message};
pub use writer::SendHandle;

use app::AppEvent;
use writer::{Completion, Entry, WriteQueue};

/// Bytes read from the socket per readiness pass.
const READ_CHUNK: usize = 8 * 1024;

/// The role the endpoint takes on the connection.
///
/// The role determines the inbound masking policy: a server receives masked
/// frames from clients and rejects unmasked payloads, a client expects
/// unmasked frames from servers and rejects masked ones. Outbound frames are
/// always masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Endpoint configuration, immutable after construction.
///
/// ```rust
/// use weft::{Options, Role};
///
/// let options = Options::default()
///     .with_max_msg_size(1 << 20)
///     .with_validate_utf8(true)
///     .with_role(Role::Server);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Outbound messages larger than 1.5x this size are split into frames of
    /// roughly this size.
    pub auto_frame_size: usize,
    /// Inbound frame payload length limit.
    pub max_frame_size: usize,
    /// Inbound cumulative message length limit.
    pub max_msg_size: usize,
    /// Ping cadence while the connection is idle.
    pub heartbeat_period: Duration,
    /// Maximum time to await the peer's close confirmation before forced
    /// teardown.
    pub close_period: Duration,
    /// Validate TEXT payloads as UTF-8 at emit boundaries.
    pub validate_utf8: bool,
    /// Reject binary frames.
    pub text_only: bool,
    /// Outstanding unacknowledged pings tolerated before the peer is
    /// considered dead.
    pub queued_ping_limit: u64,
    /// TEXT/BINARY chunk size the parser emits to the application before the
    /// final slice.
    pub emit_threshold: usize,
    /// Inbound masking policy.
    pub role: Role,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            auto_frame_size: 32 * 1024,
            max_frame_size: 2 * 1024 * 1024,
            max_msg_size: 10 * 1024 * 1024,
            heartbeat_period: Duration::from_secs(10),
            close_period: Duration::from_secs(3),
            validate_utf8: false,
            text_only: false,
            queued_ping_limit: 3,
            emit_threshold: 32 * 1024,
            role: Role::Server,
        }
    }
}

impl Options {
    pub fn with_auto_frame_size(mut self, size: usize) -> Self {
        self.auto_frame_size = size;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    pub fn with_heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn with_close_period(mut self, period: Duration) -> Self {
        self.close_period = period;
        self
    }

    pub fn with_validate_utf8(mut self, validate: bool) -> Self {
        self.validate_utf8 = validate;
        self
    }

    pub fn with_text_only(mut self, text_only: bool) -> Self {
        self.text_only = text_only;
        self
    }

    pub fn with_queued_ping_limit(mut self, limit: u64) -> Self {
        self.queued_ping_limit = limit;
        self
    }

    pub fn with_emit_threshold(mut self, threshold: usize) -> Self {
        self.emit_threshold = threshold;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

/// A snapshot of the endpoint's counters and timestamps.
///
/// Timestamps are Unix seconds at ticker resolution; zero means "never".
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub bytes_read: u64,
    pub bytes_sent: u64,
    pub frames_read: u64,
    pub frames_sent: u64,
    pub messages_read: u64,
    pub messages_sent: u64,
    pub connected_at: u64,
    pub closed_at: u64,
    pub last_read_at: u64,
    pub last_sent_at: u64,
    pub last_data_read_at: u64,
    pub last_data_sent_at: u64,
}

/// Requests routed from an [`EndpointHandle`] to the endpoint task.
enum Command {
    Send {
        payload: Bytes,
        binary: bool,
        done: Completion,
    },
    Close {
        code: CloseCode,
        reason: String,
    },
    Info {
        reply: oneshot::Sender<ConnectionInfo>,
    },
}

/// The proxy handed to the application.
///
/// Clonable and cheap; it holds only a command channel into the endpoint
/// task, so it cannot keep the endpoint alive past teardown. Operations on a
/// torn-down endpoint fail with
/// [`ClientDisconnected`](WebSocketError::ClientDisconnected).
#[derive(Clone)]
pub struct EndpointHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl EndpointHandle {
    /// Queues a text message. The payload must be valid UTF-8.
    ///
    /// Returns the completion handle of the message's final frame; await it
    /// to learn when the bytes have left the socket.
    pub fn send(&self, payload: impl Into<Bytes>) -> SendHandle {
        self.send_inner(payload.into(), false)
    }

    /// Queues a binary message.
    pub fn send_binary(&self, payload: impl Into<Bytes>) -> SendHandle {
        self.send_inner(payload.into(), true)
    }

    fn send_inner(&self, payload: Bytes, binary: bool) -> SendHandle {
        if !binary {
            debug_assert!(
                std::str::from_utf8(&payload).is_ok(),
                "text sends must be valid UTF-8"
            );
        }

        let (done, handle) = SendHandle::channel();
        // A failed send drops `done`, which resolves the handle with
        // ClientDisconnected.
        let _ = self.commands.send(Command::Send {
            payload,
            binary,
            done,
        });
        handle
    }

    /// Initiates the close handshake. Idempotent; a no-op if the endpoint is
    /// already closing.
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Fetches a snapshot of the endpoint statistics.
    pub async fn info(&self) -> Result<ConnectionInfo> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Info { reply })
            .map_err(|_| WebSocketError::ClientDisconnected)?;
        response.await.map_err(|_| WebSocketError::ClientDisconnected)
    }
}

/// Write-direction shutdown progress.
#[derive(PartialEq)]
enum WriteState {
    Open,
    ShuttingDown,
    Shutdown,
}

/// A WebSocket endpoint owning one upgraded connection.
///
/// Construct with [`Endpoint::new`] after the HTTP layer has upgraded the
/// socket, then drive it with [`Endpoint::run`] (typically on its own task):
///
/// ```no_run
/// use weft::{Application, Endpoint, Options};
/// # async fn example<S, A>(socket: S, app: A, headers: http::HeaderMap) -> weft::Result<()>
/// # where
/// #     S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
/// #     A: Application,
/// # {
/// let endpoint = Endpoint::new(socket, app, headers, Options::default())?;
/// tokio::spawn(endpoint.run());
/// # Ok(())
/// # }
/// ```
pub struct Endpoint<S, A> {
    socket: S,
    application: Option<A>,
    headers: HeaderMap,
    options: Options,

    parser: FrameParser,
    encoder: Encoder,
    queue: WriteQueue,

    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    app_events: Option<mpsc::UnboundedSender<AppEvent>>,
    /// Chunk sender of the inbound message currently being delivered.
    current_message: Option<mpsc::UnboundedSender<Result<Bytes>>>,

    info: ConnectionInfo,
    /// Ticker-resolution clock; the only time source deadline logic reads.
    now: Instant,
    now_unix: u64,
    /// Monotonic mirror of `info.last_sent_at` for the heartbeat.
    last_sent_tick: Instant,
    /// Set when the local side initiates (or records) the close.
    closed_at: Option<Instant>,
    close_deadline: Option<Instant>,
    ping_count: u64,
    pong_count: u64,

    read_armed: bool,
    write_state: WriteState,
    unloaded: bool,
}

impl<S, A> Endpoint<S, A>
where
    S: AsyncRead + AsyncWrite + Unpin,
    A: Application,
{
    /// Creates an endpoint over an upgraded socket.
    ///
    /// `headers` are the negotiated upgrade headers; an empty map fails with
    /// [`WebSocketError::MissingHeaders`] since it means the handshake never
    /// completed.
    pub fn new(socket: S, application: A, headers: HeaderMap, options: Options) -> Result<Self> {
        if headers.is_empty() {
            return Err(WebSocketError::MissingHeaders);
        }

        let (command_tx, commands) = mpsc::unbounded_channel();
        let parser = FrameParser::new(&options);
        let now_unix = unix_now();
        let now = Instant::now();

        Ok(Self {
            socket,
            application: Some(application),
            headers,
            parser,
            encoder: Encoder::new(),
            queue: WriteQueue::new(),
            commands,
            command_tx,
            app_events: None,
            current_message: None,
            info: ConnectionInfo {
                connected_at: now_unix,
                ..ConnectionInfo::default()
            },
            now,
            now_unix,
            last_sent_tick: now,
            closed_at: None,
            close_deadline: None,
            ping_count: 0,
            pong_count: 0,
            read_armed: false,
            write_state: WriteState::Open,
            unloaded: false,
            options,
        })
    }

    /// Installs a builder pipeline on the outbound frame compiler. This is
    /// where a frame-rewriting extension would plug in.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.encoder = Encoder::with_pipeline(pipeline);
        self
    }

    /// A proxy handle for this endpoint.
    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            commands: self.command_tx.clone(),
        }
    }

    /// Drives the connection until teardown.
    ///
    /// Delivers `on_open` and waits for it before arming reads, then loops
    /// over commands, the 1 Hz ticker, socket readiness and the write pump
    /// until the endpoint unloads (peer close-ack, close timeout, or
    /// transport failure).
    pub async fn run(mut self) -> Result<()> {
        let application = match self.application.take() {
            Some(application) => application,
            None => return Ok(()),
        };

        let (app_tx, app_rx) = mpsc::unbounded_channel();
        tokio::spawn(app::run(application, app_rx));
        self.app_events = Some(app_tx);

        // Reads stay parked until on_open finishes; commands issued from
        // inside on_open are accepted meanwhile.
        let (ack, mut opened) = oneshot::channel();
        let headers = std::mem::take(&mut self.headers);
        self.send_app_event(AppEvent::Open(self.handle(), headers, ack));
        loop {
            tokio::select! {
                _ = &mut opened => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }

        self.read_armed = true;

        let mut ticker = time::interval(Duration::from_secs(1));
        std::future::poll_fn(|cx| self.poll_drive(&mut ticker, cx)).await;

        Ok(())
    }

    /// One cooperative pass over every event source. Ready when the endpoint
    /// has unloaded.
    fn poll_drive(&mut self, ticker: &mut Interval, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            if self.unloaded {
                return Poll::Ready(());
            }

            let mut progress = false;

            while let Poll::Ready(Some(command)) = self.commands.poll_recv(cx) {
                self.on_command(command);
                progress = true;
            }

            while ticker.poll_tick(cx).is_ready() {
                self.on_tick();
                progress = true;
                if self.unloaded {
                    return Poll::Ready(());
                }
            }

            while self.read_armed && !self.unloaded {
                let mut chunk = [0u8; READ_CHUNK];
                let mut buf = ReadBuf::new(&mut chunk);
                match Pin::new(&mut self.socket).poll_read(cx, &mut buf) {
                    Poll::Pending => break,
                    Poll::Ready(Ok(())) => {
                        progress = true;
                        if buf.filled().is_empty() {
                            self.on_eof();
                            break;
                        }
                        self.on_chunk(buf.filled());
                    }
                    Poll::Ready(Err(err)) => {
                        log::debug!("socket read failed: {err}");
                        progress = true;
                        self.on_eof();
                        break;
                    }
                }
            }

            if self.poll_pump(cx) {
                progress = true;
            }

            if self.unloaded {
                return Poll::Ready(());
            }
            if !progress {
                return Poll::Pending;
            }
        }
    }

    // ================ outbound ====================

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send {
                payload,
                binary,
                done,
            } => self.on_send(payload, binary, done),
            Command::Close { code, reason } => self.begin_close(code, reason),
            Command::Info { reply } => {
                let _ = reply.send(self.info.clone());
            }
        }
    }

    /// Compiles one logical send into frames. Payloads above 1.5x the auto
    /// frame size split into equal-ceiling fragments; the completion handle
    /// tracks the final frame.
    fn on_send(&mut self, payload: Bytes, binary: bool, done: Completion) {
        self.info.messages_sent += 1;

        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        let len = payload.len();
        let auto = self.options.auto_frame_size.max(1);

        if len <= auto + auto / 2 {
            let frame = Frame::new(true, opcode, None, BytesMut::from(&payload[..]));
            self.queue_frame(frame, Some(done));
            return;
        }

        let frame_count = len.div_ceil(auto);
        let width = len.div_ceil(frame_count);

        let mut done = Some(done);
        let mut offset = 0;
        let mut first = true;
        while offset < len {
            let end = (offset + width).min(len);
            let fin = end == len;
            let opcode = if first { opcode } else { OpCode::Continuation };
            let frame = Frame::new(fin, opcode, None, BytesMut::from(&payload[offset..end]));
            let completion = if fin { done.take() } else { None };
            self.queue_frame(frame, completion);
            offset = end;
            first = false;
        }
    }

    /// Serializes a frame and appends it to the queue of its priority class.
    fn queue_frame(&mut self, frame: Frame, done: Option<Completion>) {
        if self.unloaded || self.write_state != WriteState::Open {
            if let Some(done) = done {
                let _ = done.send(Err(WebSocketError::ClientDisconnected));
            }
            return;
        }

        let control = frame.opcode.is_control();
        let mut wire = BytesMut::new();
        if let Err(err) = self.encoder.encode(frame, &mut wire) {
            log::debug!("frame compilation failed: {err}");
            if let Some(done) = done {
                let _ = done.send(Err(err));
            }
            return;
        }

        self.queue.enqueue(Entry {
            frame: wire.freeze(),
            done,
            control,
        });
    }

    /// Drains the write queues while the socket accepts bytes. Returns
    /// whether any progress was made.
    fn poll_pump(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;

        loop {
            if self.unloaded {
                return progress;
            }

            match self.write_state {
                WriteState::Shutdown => return progress,
                WriteState::ShuttingDown => {
                    match Pin::new(&mut self.socket).poll_shutdown(cx) {
                        Poll::Pending => return progress,
                        Poll::Ready(result) => {
                            if let Err(err) = result {
                                log::debug!("write shutdown failed: {err}");
                            }
                            self.write_state = WriteState::Shutdown;
                            return true;
                        }
                    }
                }
                WriteState::Open => {}
            }

            if self.queue.buffer_is_empty() {
                let closing = self.closed_at.is_some();
                match self.queue.promote(closing) {
                    Some(control) => {
                        self.info.last_sent_at = self.now_unix;
                        self.last_sent_tick = self.now;
                        if !control {
                            self.info.last_data_sent_at = self.now_unix;
                        }
                        progress = true;
                    }
                    None if closing => {
                        // Close frame drained and no control frames remain;
                        // the conversation is over in this direction.
                        self.write_state = WriteState::ShuttingDown;
                        progress = true;
                        continue;
                    }
                    None => return progress,
                }
            }

            match Pin::new(&mut self.socket).poll_write(cx, self.queue.buffer()) {
                Poll::Pending => return progress,
                Poll::Ready(Ok(0)) => {
                    self.on_write_dead();
                    return true;
                }
                Poll::Ready(Ok(n)) => {
                    self.info.bytes_sent += n as u64;
                    if self.queue.advance(n) {
                        self.info.frames_sent += 1;
                    }
                    progress = true;
                }
                Poll::Ready(Err(err)) => {
                    log::debug!("socket write failed: {err}");
                    self.on_write_dead();
                    return true;
                }
            }
        }
    }

    fn on_write_dead(&mut self) {
        if self.closed_at.is_none() {
            self.mark_closed();
            self.send_app_event(AppEvent::Close(
                CloseCode::Abnormal,
                "Client closed underlying TCP connection".to_string(),
            ));
        }
        self.unload();
    }

    // ================ inbound ====================

    fn on_chunk(&mut self, chunk: &[u8]) {
        self.info.bytes_read += chunk.len() as u64;
        self.info.last_read_at = self.now_unix;

        let mut events = Vec::new();
        let frames = self.parser.feed(chunk, |emit| events.push(emit));
        self.info.frames_read += frames as u64;

        for emit in events {
            self.on_emit(emit);
        }
    }

    fn on_emit(&mut self, emit: Emit) {
        match emit {
            Emit::Control {
                opcode: OpCode::Ping,
                payload,
            } => {
                // Pong echoes the ping payload, ahead of any queued data.
                self.queue_frame(Frame::pong(payload), None);
            }
            Emit::Control {
                opcode: OpCode::Pong,
                payload,
            } => self.on_pong(&payload),
            Emit::Control {
                opcode: OpCode::Close,
                payload,
            } => self.on_close_frame(&payload),
            Emit::Control { .. } => {}
            Emit::Data { payload, fin } => self.on_data_slice(payload, fin),
            Emit::Error { error, code } => self.on_parse_error(error, code),
        }
    }

    /// The pong payload carries the decimal ping counter; the peer can never
    /// advance acknowledgements past what was actually pinged. Payloads that
    /// do not parse acknowledge everything outstanding, which keeps peers
    /// speaking plain RFC 6455 echo semantics alive.
    fn on_pong(&mut self, payload: &[u8]) {
        let acknowledged = std::str::from_utf8(payload)
            .ok()
            .and_then(|text| text.trim().parse::<u64>().ok())
            .unwrap_or(self.ping_count);
        self.pong_count = self.ping_count.min(acknowledged);
    }

    fn on_close_frame(&mut self, payload: &[u8]) {
        if self.closed_at.is_some() {
            // The peer confirmed our close.
            log::debug!("peer acknowledged close");
            self.close_deadline = None;
            self.unload();
            return;
        }

        if payload.len() < 2 {
            // Too short to carry a status code; ignored, reads stay armed.
            return;
        }

        let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
        let reason = String::from_utf8_lossy(&payload[2..]).into_owned();

        self.read_armed = false;
        self.begin_close(code, reason);
    }

    fn on_data_slice(&mut self, payload: Bytes, fin: bool) {
        self.info.last_data_read_at = self.now_unix;

        if self.current_message.is_none() {
            let (chunks, message) = Message::channel();
            self.current_message = Some(chunks);
            self.send_app_event(AppEvent::Data(message));
        }

        if !payload.is_empty() {
            if let Some(chunks) = &self.current_message {
                let _ = chunks.send(Ok(payload));
            }
        }

        if fin {
            // Dropping the sender ends the chunk stream cleanly.
            self.current_message = None;
            self.info.messages_read += 1;
        }
    }

    fn on_parse_error(&mut self, error: WebSocketError, code: CloseCode) {
        log::debug!("protocol failure: {error} (close code {code})");

        if self.closed_at.is_some() || code == CloseCode::Protocol {
            self.read_armed = false;
        }
        if self.closed_at.is_none() {
            self.begin_close(code, error.to_string());
        }
    }

    fn on_eof(&mut self) {
        self.read_armed = false;
        if self.closed_at.is_none() {
            self.mark_closed();
            self.send_app_event(AppEvent::Close(
                CloseCode::Abnormal,
                "Client closed underlying TCP connection".to_string(),
            ));
        }
        self.unload();
    }

    // ================ close handshake & lifecycle ====================

    /// Initiates the local side of the close handshake. Idempotent; the
    /// endpoint is not unloaded here — that happens on peer ack or deadline.
    fn begin_close(&mut self, code: CloseCode, reason: String) {
        if self.closed_at.is_some() {
            return;
        }

        log::debug!("closing connection: code={code} reason={reason:?}");
        self.mark_closed();
        self.close_deadline = Some(self.now + self.options.close_period);

        self.queue_frame(Frame::close(code, reason.as_bytes()), None);
        self.send_app_event(AppEvent::Close(code, reason));
    }

    fn mark_closed(&mut self) {
        self.closed_at = Some(self.now);
        self.info.closed_at = self.now_unix;
    }

    /// The 1 Hz tick: the single clock read, the close deadline, and the
    /// heartbeat.
    fn on_tick(&mut self) {
        self.now = Instant::now();
        self.now_unix = unix_now();

        if self.closed_at.is_some() {
            if let Some(deadline) = self.close_deadline {
                if deadline < self.now {
                    log::debug!("close handshake timed out");
                    self.close_deadline = None;
                    self.unload();
                }
            }
            return;
        }

        self.heartbeat();
    }

    fn heartbeat(&mut self) {
        let period = self.options.heartbeat_period;
        if period.is_zero() {
            return;
        }

        if self.ping_count - self.pong_count > self.options.queued_ping_limit {
            self.begin_close(CloseCode::Away, "no response to ping".to_string());
            return;
        }

        if self.now.duration_since(self.last_sent_tick) >= period {
            self.ping_count += 1;
            self.queue_frame(Frame::ping(self.ping_count.to_string()), None);
            self.last_sent_tick = self.now;
        }
    }

    /// Tears the endpoint down. Runs exactly once: cancels both watchers,
    /// fails the in-flight message and every queued completion handle, and
    /// releases the application event task.
    fn unload(&mut self) {
        if self.unloaded {
            return;
        }
        self.unloaded = true;

        log::debug!("unloading client");
        self.read_armed = false;

        if let Some(message) = self.current_message.take() {
            let _ = message.send(Err(WebSocketError::ClientDisconnected));
        }
        self.queue.fail_all();
        self.app_events = None;
    }

    fn send_app_event(&self, event: AppEvent) {
        if let Some(events) = &self.app_events {
            let _ = events.send(event);
        }
    }
}

fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Everything the application observes, forwarded to the test body.
    enum TestEvent {
        Open(EndpointHandle),
        Message(Result<Bytes>),
        Closed(CloseCode, String),
    }

    struct TestApp {
        events: mpsc::UnboundedSender<TestEvent>,
    }

    #[async_trait]
    impl Application for TestApp {
        async fn on_open(&mut self, endpoint: EndpointHandle, _headers: HeaderMap) {
            let _ = self.events.send(TestEvent::Open(endpoint));
        }

        async fn on_data(&mut self, message: Message) {
            let _ = self.events.send(TestEvent::Message(message.collect().await));
        }

        async fn on_close(&mut self, code: CloseCode, reason: String) {
            let _ = self.events.send(TestEvent::Closed(code, reason));
        }
    }

    fn upgrade_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", "websocket".parse().expect("header value"));
        headers
    }

    fn spawn_endpoint(
        options: Options,
    ) -> (
        DuplexStream,
        mpsc::UnboundedReceiver<TestEvent>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let (events, event_rx) = mpsc::unbounded_channel();
        let endpoint = Endpoint::new(local, TestApp { events }, upgrade_headers(), options)
            .expect("endpoint");
        let task = tokio::spawn(endpoint.run());
        (peer, event_rx, task)
    }

    async fn opened(events: &mut mpsc::UnboundedReceiver<TestEvent>) -> EndpointHandle {
        match events.recv().await {
            Some(TestEvent::Open(handle)) => handle,
            _ => panic!("expected on_open first"),
        }
    }

    /// Serializes a masked frame the way a client peer would.
    fn masked_frame(opcode: u8, fin: bool, payload: &[u8]) -> Vec<u8> {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut out = Vec::new();
        out.push(u8::from(fin) << 7 | opcode);
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else if len < 65536 {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&key);
        let mut body = payload.to_vec();
        for (i, byte) in body.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
        out.extend_from_slice(&body);
        out
    }

    fn masked_close(code: u16, reason: &[u8]) -> Vec<u8> {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason);
        masked_frame(0x8, true, &payload)
    }

    /// Reads one (masked) frame off the peer side of the duplex.
    async fn read_frame(peer: &mut DuplexStream) -> (u8, bool, Vec<u8>) {
        let mut head = [0u8; 2];
        peer.read_exact(&mut head).await.expect("frame head");
        let fin = head[0] & 0x80 != 0;
        let opcode = head[0] & 0x0F;
        let masked = head[1] & 0x80 != 0;

        let mut len = usize::from(head[1] & 0x7F);
        if len == 126 {
            let mut ext = [0u8; 2];
            peer.read_exact(&mut ext).await.expect("extended length");
            len = usize::from(u16::from_be_bytes(ext));
        } else if len == 127 {
            let mut ext = [0u8; 8];
            peer.read_exact(&mut ext).await.expect("extended length");
            len = u64::from_be_bytes(ext) as usize;
        }

        let mut key = [0u8; 4];
        if masked {
            peer.read_exact(&mut key).await.expect("mask key");
        }

        let mut payload = vec![0u8; len];
        peer.read_exact(&mut payload).await.expect("payload");
        if masked {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
        }

        (opcode, fin, payload)
    }

    /// Long heartbeat so virtual-time tests exercise only what they mean to.
    fn quiet_options() -> Options {
        Options::default().with_heartbeat_period(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_empty_headers_rejected() {
        let (local, _peer) = tokio::io::duplex(1024);
        let (events, _rx) = mpsc::unbounded_channel();
        let result = Endpoint::new(local, TestApp { events }, HeaderMap::new(), Options::default());
        assert!(matches!(result, Err(WebSocketError::MissingHeaders)));
    }

    #[tokio::test]
    async fn test_text_message_delivered_to_application() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let handle = opened(&mut events).await;

        peer.write_all(&masked_frame(0x1, true, b"Hello"))
            .await
            .unwrap();

        match events.recv().await {
            Some(TestEvent::Message(result)) => {
                assert_eq!(result.unwrap(), Bytes::from_static(b"Hello"));
            }
            _ => panic!("expected a message"),
        }

        let info = handle.info().await.unwrap();
        assert_eq!(info.messages_read, 1);
        assert_eq!(info.frames_read, 1);
        assert_eq!(info.bytes_read, 11);
    }

    #[tokio::test]
    async fn test_fragmented_message_reassembles() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let handle = opened(&mut events).await;

        peer.write_all(&masked_frame(0x1, false, b"Hel")).await.unwrap();
        peer.write_all(&masked_frame(0x0, true, b"lo")).await.unwrap();

        match events.recv().await {
            Some(TestEvent::Message(result)) => {
                assert_eq!(result.unwrap(), Bytes::from_static(b"Hello"));
            }
            _ => panic!("expected a message"),
        }

        let info = handle.info().await.unwrap();
        assert_eq!(info.messages_read, 1);
        assert_eq!(info.frames_read, 2);
    }

    #[tokio::test]
    async fn test_send_produces_single_masked_text_frame() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let handle = opened(&mut events).await;

        let send = handle.send("Hi there");
        let (opcode, fin, payload) = read_frame(&mut peer).await;

        assert_eq!(opcode, 0x1);
        assert!(fin);
        assert_eq!(payload, b"Hi there");
        send.await.unwrap();

        let info = handle.info().await.unwrap();
        assert_eq!(info.messages_sent, 1);
        assert_eq!(info.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_send_binary() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let handle = opened(&mut events).await;

        handle.send_binary(vec![0xDEu8, 0xAD, 0xBE, 0xEF]);
        let (opcode, fin, payload) = read_frame(&mut peer).await;

        assert_eq!(opcode, 0x2);
        assert!(fin);
        assert_eq!(payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[tokio::test]
    async fn test_large_send_auto_fragments() {
        let options = Options::default().with_auto_frame_size(8);
        let (mut peer, mut events, _task) = spawn_endpoint(options);
        let handle = opened(&mut events).await;

        let payload: Vec<u8> = (0..30u8).collect();
        let send = handle.send_binary(payload.clone());

        // ceil(30/8) = 4 frames of ceil(30/4) = 8 bytes (last one short).
        let mut assembled = Vec::new();
        for index in 0..4 {
            let (opcode, fin, chunk) = read_frame(&mut peer).await;
            match index {
                0 => {
                    assert_eq!(opcode, 0x2);
                    assert!(!fin);
                }
                3 => {
                    assert_eq!(opcode, 0x0);
                    assert!(fin);
                }
                _ => {
                    assert_eq!(opcode, 0x0);
                    assert!(!fin);
                }
            }
            assert!(chunk.len() <= 8);
            assembled.extend_from_slice(&chunk);
        }
        assert_eq!(assembled, payload);
        send.await.unwrap();

        let info = handle.info().await.unwrap();
        assert_eq!(info.messages_sent, 1);
        assert_eq!(info.frames_sent, 4);
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let _handle = opened(&mut events).await;

        peer.write_all(&masked_frame(0x9, true, b"beat")).await.unwrap();

        let (opcode, fin, payload) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0xA);
        assert!(fin);
        assert_eq!(payload, b"beat");
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_initiated_close() {
        let (mut peer, mut events, task) = spawn_endpoint(quiet_options());
        let _handle = opened(&mut events).await;

        peer.write_all(&masked_close(1000, b"bye")).await.unwrap();

        // The application hears about the close.
        match events.recv().await {
            Some(TestEvent::Closed(code, reason)) => {
                assert_eq!(code, CloseCode::Normal);
                assert_eq!(reason, "bye");
            }
            _ => panic!("expected on_close"),
        }

        // A Close frame with the same code is queued back to the peer.
        let (opcode, _, payload) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0x8);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);
        assert_eq!(&payload[2..], b"bye");

        // The peer never confirms; the close deadline unloads the endpoint.
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_close_acknowledged_by_peer() {
        let (mut peer, mut events, task) = spawn_endpoint(quiet_options());
        let handle = opened(&mut events).await;

        handle.close(CloseCode::Normal, "done");

        let (opcode, _, payload) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0x8);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

        // Peer confirms; the endpoint unloads without waiting for the
        // deadline.
        peer.write_all(&masked_close(1000, b"")).await.unwrap();
        task.await.unwrap().unwrap();

        match events.recv().await {
            Some(TestEvent::Closed(code, _)) => assert_eq!(code, CloseCode::Normal),
            _ => panic!("expected on_close"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_fails_outstanding_sends() {
        let (mut peer, mut events, task) = spawn_endpoint(quiet_options());
        let handle = opened(&mut events).await;

        handle.close(CloseCode::Normal, "");
        // Data queued after close initiation is never transmitted.
        let stranded = handle.send("never sent");

        let (opcode, _, _) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0x8);

        // No ack arrives; the deadline tears the endpoint down.
        task.await.unwrap().unwrap();
        assert!(matches!(
            stranded.await,
            Err(WebSocketError::ClientDisconnected)
        ));

        // The proxy no longer reaches an endpoint.
        assert!(matches!(
            handle.info().await,
            Err(WebSocketError::ClientDisconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_eof_is_abnormal_close() {
        let (peer, mut events, task) = spawn_endpoint(quiet_options());
        let _handle = opened(&mut events).await;

        drop(peer);

        match events.recv().await {
            Some(TestEvent::Closed(code, reason)) => {
                assert_eq!(code, CloseCode::Abnormal);
                assert_eq!(reason, "Client closed underlying TCP connection");
            }
            _ => panic!("expected on_close"),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_closes_with_1002() {
        let (mut peer, mut events, task) = spawn_endpoint(quiet_options());
        let _handle = opened(&mut events).await;

        // An orphan continuation frame is a protocol violation.
        peer.write_all(&masked_frame(0x0, true, b"orphan")).await.unwrap();

        let (opcode, _, payload) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0x8);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

        match events.recv().await {
            Some(TestEvent::Closed(code, _)) => assert_eq!(code, CloseCode::Protocol),
            _ => panic!("expected on_close"),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_close_payload_ignored() {
        let (mut peer, mut events, _task) = spawn_endpoint(quiet_options());
        let handle = opened(&mut events).await;

        // One payload byte cannot carry a status code; the frame is ignored
        // and the connection keeps working.
        peer.write_all(&masked_frame(0x8, true, &[0x03])).await.unwrap();
        peer.write_all(&masked_frame(0x1, true, b"still here"))
            .await
            .unwrap();

        match events.recv().await {
            Some(TestEvent::Message(result)) => {
                assert_eq!(result.unwrap(), Bytes::from_static(b"still here"));
            }
            _ => panic!("expected a message"),
        }
        assert_eq!(handle.info().await.unwrap().frames_read, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_and_gives_up() {
        let (mut peer, mut events, task) = spawn_endpoint(Options::default());
        let _handle = opened(&mut events).await;

        // With nothing sent, pings fire every heartbeat period carrying the
        // running counter.
        for expected in 1..=4u64 {
            let (opcode, _, payload) = read_frame(&mut peer).await;
            assert_eq!(opcode, 0x9);
            assert_eq!(payload, expected.to_string().as_bytes());
        }

        // Four unacknowledged pings exceed the limit of three; the endpoint
        // gives the peer up.
        let (opcode, _, payload) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0x8);
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1001);

        match events.recv().await {
            Some(TestEvent::Closed(code, _)) => assert_eq!(code, CloseCode::Away),
            _ => panic!("expected on_close"),
        }
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let _handle = opened(&mut events).await;

        // Acknowledging each ping keeps the outstanding count at zero, so
        // pings keep flowing well past the unacknowledged limit.
        for expected in 1..=6u64 {
            let (opcode, _, payload) = read_frame(&mut peer).await;
            assert_eq!(opcode, 0x9, "ping {expected}");
            assert_eq!(payload, expected.to_string().as_bytes());

            peer.write_all(&masked_frame(0xA, true, &payload)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_info_snapshot_counters() {
        let (mut peer, mut events, _task) = spawn_endpoint(Options::default());
        let handle = opened(&mut events).await;

        peer.write_all(&masked_frame(0x2, true, &[1, 2, 3])).await.unwrap();
        match events.recv().await {
            Some(TestEvent::Message(result)) => {
                result.unwrap();
            }
            _ => panic!("expected a message"),
        }
        handle.send("pong back").await.unwrap();

        let info = handle.info().await.unwrap();
        assert!(info.connected_at > 0);
        assert_eq!(info.closed_at, 0);
        assert_eq!(info.messages_read, 1);
        assert_eq!(info.messages_sent, 1);
        assert!(info.bytes_read >= 9);
        assert!(info.bytes_sent >= 2 + 4 + 9);
    }

    #[tokio::test]
    async fn test_commands_issued_from_on_open_are_flushed() {
        // An application that speaks first, from inside on_open.
        struct Greeter;

        #[async_trait]
        impl Application for Greeter {
            async fn on_open(&mut self, endpoint: EndpointHandle, _headers: HeaderMap) {
                let _ = endpoint.send("welcome");
            }

            async fn on_data(&mut self, _message: Message) {}
        }

        let (local, mut peer) = tokio::io::duplex(4096);
        let endpoint =
            Endpoint::new(local, Greeter, upgrade_headers(), Options::default()).expect("endpoint");
        let _task = tokio::spawn(endpoint.run());

        let (opcode, fin, payload) = read_frame(&mut peer).await;
        assert_eq!(opcode, 0x1);
        assert!(fin);
        assert_eq!(payload, b"welcome");
    }
}
