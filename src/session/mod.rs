//! Session engine: one instance per connection.
//!
//! The public [`Session`] is a cheap-clone handle. Every operation posts a
//! command to the session task, which exclusively owns the socket read
//! half, the receive buffer, the two send buffers, the state machine, the
//! unbind timer, the per-request expiration index and all user handlers.
//! One task per session is what serializes session state: operations from
//! any thread are applied in arrival order, and nothing else touches the
//! internals.
//!
//! The send side is a two-buffer ping-pong. Encoded PDUs accumulate in the
//! pending buffer; whenever no write is in flight the pending buffer is
//! swapped into flight and handed to the writer task whole. A backpressure
//! controller watches the pending size and pauses reception past the high
//! watermark until draining passes the low one.
//!
//! Sessions start with reception paused; call [`Session::start`] once the
//! handlers are in place.

mod backpressure;
mod config;
mod handler;
mod metrics;
mod state;
mod writer;

pub use backpressure::BackpressureController;
pub use config::SessionConfig;
pub use handler::{
    CloseHandler, ErrorHandler, FnProtocolHandler, LoggingErrorHandler, ProtocolHandler,
    RequestTimeoutHandler, SendBufAvailableHandler, SilentErrorHandler,
};
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use state::SessionState;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::expiry::ExpirationIndex;
use crate::protocol::{
    CommandId, CommandStatus, FlatBuffer, Header, Pdu, Request, Response, HEADER_LENGTH,
};

/// Upper bound of one socket read.
const READ_CHUNK: usize = 64 * 1024;

/// Hard cap of the stack copy fast path.
const SMALL_BODY_STACK: usize = 256;

const STATE_OPEN: u8 = 0;
const STATE_UNBINDING: u8 = 1;
const STATE_CLOSED: u8 = 2;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Next sequence number after `current`: increments, skipping 0 on wrap.
fn bump_sequence(current: u32) -> u32 {
    let next = current.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

struct Shared {
    id: u64,
    peer_addr: Option<SocketAddr>,
    state: AtomicU8,
    close_initiated: AtomicBool,
    sequence_number: AtomicU32,
    metrics: Arc<SessionMetrics>,
    closed_tx: watch::Sender<bool>,
}

impl Shared {
    fn next_sequence_number(&self) -> u32 {
        let prev = self
            .sequence_number
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(bump_sequence(current))
            })
            .expect("sequence update cannot fail");
        bump_sequence(prev)
    }

    fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => SessionState::Open,
            STATE_UNBINDING => SessionState::Unbinding,
            _ => SessionState::Closed,
        }
    }
}

pub(crate) enum Command {
    SendRequest {
        pdu: Request,
        sequence_number: u32,
        timeout: Option<Duration>,
    },
    SendResponse {
        pdu: Response,
        sequence_number: u32,
        status: CommandStatus,
    },
    Unbind,
    Close {
        reason: String,
    },
    PauseReceiving,
    ResumeReceiving,
    SetProtocolHandler(Box<dyn ProtocolHandler>),
    SetErrorHandler(Box<dyn ErrorHandler>),
    SetTimeoutHandler(RequestTimeoutHandler),
    WriteDone {
        result: std::io::Result<usize>,
        buf: Vec<u8>,
    },
}

/// Handle to a running session.
///
/// Clones share the same session. All methods are safe from any thread;
/// mutations are applied on the session task in call order.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Session {
    /// Start building a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Stable identifier of this session.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Remote endpoint, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// False as soon as a close has been initiated.
    pub fn is_open(&self) -> bool {
        !self.shared.close_initiated.load(Ordering::Acquire)
            && self.shared.state() == SessionState::Open
    }

    /// This session's metrics block.
    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.shared.metrics.clone()
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Begin reception. Sessions are constructed paused so handlers can be
    /// installed before the first byte is processed.
    pub fn start(&self) {
        let _ = self.commands.send(Command::ResumeReceiving);
    }

    /// Initiate the graceful unbind handshake. No-op unless open.
    pub fn unbind(&self) {
        let _ = self.commands.send(Command::Unbind);
    }

    /// Close the session. Idempotent; only the first call has any effect.
    pub fn close(&self, reason: &str) {
        if self
            .shared
            .close_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let _ = self.commands.send(Command::Close {
            reason: reason.to_string(),
        });
    }

    /// Stop dispatching received PDUs after the current framing pass.
    pub fn pause_receiving(&self) {
        let _ = self.commands.send(Command::PauseReceiving);
    }

    /// Resume dispatching received PDUs.
    pub fn resume_receiving(&self) {
        let _ = self.commands.send(Command::ResumeReceiving);
    }

    /// Queue a request PDU; returns its assigned sequence number.
    ///
    /// Fails only once the session is closed. A send attempted while
    /// unbinding is rejected asynchronously through the error handler.
    pub fn send_request(&self, pdu: impl Into<Request>) -> Result<u32> {
        self.send_request_inner(pdu.into(), None)
    }

    /// Like [`Session::send_request`], additionally tracking the request in
    /// the session's expiration index. If no matching response arrives
    /// within `timeout`, the request timeout handler fires with the
    /// sequence number and the original PDU.
    pub fn send_request_with_timeout(
        &self,
        pdu: impl Into<Request>,
        timeout: Duration,
    ) -> Result<u32> {
        self.send_request_inner(pdu.into(), Some(timeout))
    }

    fn send_request_inner(&self, pdu: Request, timeout: Option<Duration>) -> Result<u32> {
        if self.shared.close_initiated.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        let sequence_number = self.shared.next_sequence_number();
        self.commands
            .send(Command::SendRequest {
                pdu,
                sequence_number,
                timeout,
            })
            .map_err(|_| Error::SessionClosed)?;
        Ok(sequence_number)
    }

    /// Queue a response PDU at the given sequence number.
    pub fn send_response(
        &self,
        pdu: impl Into<Response>,
        sequence_number: u32,
        status: CommandStatus,
    ) -> Result<()> {
        if self.shared.close_initiated.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        self.commands
            .send(Command::SendResponse {
                pdu: pdu.into(),
                sequence_number,
                status,
            })
            .map_err(|_| Error::SessionClosed)
    }

    /// Replace the protocol handler; the previous one is dropped.
    pub fn set_protocol_handler(&self, handler: impl ProtocolHandler + 'static) {
        let _ = self
            .commands
            .send(Command::SetProtocolHandler(Box::new(handler)));
    }

    /// Replace the error handler.
    pub fn set_error_handler(&self, handler: impl ErrorHandler + 'static) {
        let _ = self.commands.send(Command::SetErrorHandler(Box::new(handler)));
    }

    /// Replace the request timeout handler.
    pub fn set_timeout_handler(&self, handler: impl FnMut(u32, Request) + Send + 'static) {
        let _ = self
            .commands
            .send(Command::SetTimeoutHandler(Box::new(handler)));
    }
}

/// Fluent construction of a [`Session`].
pub struct SessionBuilder {
    config: SessionConfig,
    peer_addr: Option<SocketAddr>,
    protocol_handler: Option<Box<dyn ProtocolHandler>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
    close_handler: Option<CloseHandler>,
    send_buf_available_handler: Option<SendBufAvailableHandler>,
    timeout_handler: Option<RequestTimeoutHandler>,
}

impl SessionBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            peer_addr: None,
            protocol_handler: None,
            error_handler: None,
            close_handler: None,
            send_buf_available_handler: None,
            timeout_handler: None,
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_send_capacity(mut self, size: usize) -> Self {
        self.config.send_buf_capacity = size;
        self
    }

    pub fn with_send_threshold(mut self, size: usize) -> Self {
        self.config.send_buf_threshold = size;
        self
    }

    pub fn with_receive_buffer(mut self, size: usize) -> Self {
        self.config.receive_buf_size = size;
        self
    }

    pub fn with_small_body_size(mut self, size: usize) -> Self {
        self.config.small_body_size = size;
        self
    }

    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.config.max_command_length = size;
        self
    }

    pub fn with_unbind_timeout(mut self, timeout: Duration) -> Self {
        self.config.unbind_timeout = timeout;
        self
    }

    pub fn with_backpressure(mut self, low: usize, high: usize) -> Self {
        self.config.backpressure_low_watermark = low;
        self.config.backpressure_high_watermark = high;
        self
    }

    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_protocol_handler(mut self, handler: impl ProtocolHandler + 'static) -> Self {
        self.protocol_handler = Some(Box::new(handler));
        self
    }

    pub fn with_error_handler(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Box::new(handler));
        self
    }

    pub fn with_close_handler(
        mut self,
        handler: impl FnOnce(Session, Option<String>) + Send + 'static,
    ) -> Self {
        self.close_handler = Some(Box::new(handler));
        self
    }

    pub fn with_send_buf_available_handler(
        mut self,
        handler: impl FnMut() + Send + 'static,
    ) -> Self {
        self.send_buf_available_handler = Some(Box::new(handler));
        self
    }

    pub fn with_timeout_handler(
        mut self,
        handler: impl FnMut(u32, Request) + Send + 'static,
    ) -> Self {
        self.timeout_handler = Some(Box::new(handler));
        self
    }

    /// Validate the configuration and spawn the session over `stream`.
    ///
    /// The session starts with reception paused. Must be called within a
    /// tokio runtime.
    pub fn build<S>(self, stream: S) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.config.validate()?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let metrics = Arc::new(SessionMetrics::new());

        let shared = Arc::new(Shared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr: self.peer_addr,
            state: AtomicU8::new(STATE_OPEN),
            close_initiated: AtomicBool::new(false),
            sequence_number: AtomicU32::new(0),
            metrics: metrics.clone(),
            closed_tx,
        });

        let session = Session {
            shared: shared.clone(),
            commands: cmd_tx.clone(),
        };

        let writer_tx = writer::spawn_writer(write_half, cmd_tx);

        let pending_send_buf = Vec::with_capacity(self.config.send_buf_capacity);
        let spare_send_buf = Vec::with_capacity(self.config.send_buf_capacity);

        let engine = Engine {
            receive_buf: FlatBuffer::new(self.config.receive_buf_size),
            backpressure: BackpressureController::new(
                self.config.backpressure_low_watermark,
                self.config.backpressure_high_watermark,
            ),
            config: self.config,
            shared,
            handle: session.clone(),
            cmd_rx,
            read_half,
            pending_send_buf,
            spare_send_buf,
            write_in_flight: false,
            writer_tx: Some(writer_tx),
            state: SessionState::Open,
            receiving: ReceivingState::Paused,
            unbind_deadline: None,
            pending_requests: ExpirationIndex::new(),
            protocol_handler: self.protocol_handler,
            error_handler: self
                .error_handler
                .or_else(|| Some(Box::new(LoggingErrorHandler))),
            close_handler: self.close_handler,
            send_buf_available_handler: self.send_buf_available_handler,
            timeout_handler: self.timeout_handler,
        };

        tokio::spawn(engine.run());

        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceivingState {
    Receiving,
    PendingPause,
    Paused,
}

enum Wake {
    Command(Option<Command>),
    UnbindTimeout,
    RequestExpiry,
    Read(Result<usize>),
}

struct Engine<R> {
    config: SessionConfig,
    shared: Arc<Shared>,
    handle: Session,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    read_half: R,
    receive_buf: FlatBuffer,
    pending_send_buf: Vec<u8>,
    spare_send_buf: Vec<u8>,
    write_in_flight: bool,
    writer_tx: Option<mpsc::Sender<Vec<u8>>>,
    state: SessionState,
    receiving: ReceivingState,
    backpressure: BackpressureController,
    unbind_deadline: Option<Instant>,
    pending_requests: ExpirationIndex<u32, Request>,
    protocol_handler: Option<Box<dyn ProtocolHandler>>,
    error_handler: Option<Box<dyn ErrorHandler>>,
    close_handler: Option<CloseHandler>,
    send_buf_available_handler: Option<SendBufAvailableHandler>,
    timeout_handler: Option<RequestTimeoutHandler>,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn read_some<R>(reader: &mut R, buf: &mut FlatBuffer, len: usize) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let region = buf.prepare(len)?;
    let n = reader.read(region).await?;
    Ok(n)
}

impl<R> Engine<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn run(mut self) {
        debug!(session_id = self.shared.id, "session task started");

        loop {
            if self.state == SessionState::Closed {
                break;
            }

            self.drain_frames();

            if self.state == SessionState::Closed {
                break;
            }

            let read_len = READ_CHUNK.min(self.receive_buf.available());
            let read_enabled = self.receiving == ReceivingState::Receiving && read_len > 0;
            let unbind_deadline = self.unbind_deadline;
            let expiry_deadline = self.pending_requests.next_deadline();

            let wake = tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => Wake::Command(cmd),
                _ = sleep_until_opt(unbind_deadline), if unbind_deadline.is_some() => Wake::UnbindTimeout,
                _ = sleep_until_opt(expiry_deadline), if expiry_deadline.is_some() => Wake::RequestExpiry,
                result = read_some(&mut self.read_half, &mut self.receive_buf, read_len),
                    if read_enabled => Wake::Read(result),
            };

            match wake {
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Command(None) => self.do_close("session released"),
                Wake::UnbindTimeout => {
                    self.unbind_deadline = None;
                    if self.state == SessionState::Unbinding {
                        self.do_close("unbind timeout");
                    }
                }
                Wake::RequestExpiry => self.fire_expired_requests(),
                Wake::Read(Ok(0)) => self.do_close("connection closed by peer"),
                Wake::Read(Ok(n)) => {
                    self.receive_buf.commit(n);
                    self.metrics()
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    self.metrics()
                        .buffer_compactions
                        .store(self.receive_buf.compactions(), Ordering::Relaxed);
                }
                Wake::Read(Err(e)) => {
                    let message = format!("read failed: {e}");
                    self.report_network_error(&message);
                    self.do_close(&message);
                }
            }
        }

        debug!(session_id = self.shared.id, "session task finished");
    }

    fn metrics(&self) -> &SessionMetrics {
        &self.shared.metrics
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendRequest {
                pdu,
                sequence_number,
                timeout,
            } => {
                if self.enqueue_pdu(&pdu, sequence_number, CommandStatus::Rok)
                    && self.state != SessionState::Closed
                {
                    if let Some(timeout) = timeout {
                        self.pending_requests.add(sequence_number, timeout, pdu);
                    }
                }
            }
            Command::SendResponse {
                pdu,
                sequence_number,
                status,
            } => {
                self.enqueue_pdu(&pdu, sequence_number, status);
            }
            Command::Unbind => self.do_unbind(),
            Command::Close { reason } => self.do_close(&reason),
            Command::PauseReceiving => self.pause_receiving(),
            Command::ResumeReceiving => self.resume_receiving(),
            Command::SetProtocolHandler(handler) => self.protocol_handler = Some(handler),
            Command::SetErrorHandler(handler) => self.error_handler = Some(handler),
            Command::SetTimeoutHandler(handler) => self.timeout_handler = Some(handler),
            Command::WriteDone { result, buf } => self.on_write_done(result, buf),
        }
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    fn drain_frames(&mut self) {
        while self.state != SessionState::Closed
            && self.receiving == ReceivingState::Receiving
            && self.receive_buf.size() >= HEADER_LENGTH
        {
            let mut header_bytes = [0u8; HEADER_LENGTH];
            header_bytes.copy_from_slice(&self.receive_buf.data()[..HEADER_LENGTH]);

            let header = match Header::decode(&header_bytes) {
                Ok(header) => header,
                Err(e) => {
                    self.report_deserialization_error(
                        &e.to_string(),
                        header_bytes[4],
                        &header_bytes,
                    );
                    self.do_close(&format!("malformed header: {e}"));
                    return;
                }
            };

            if header.command_length > self.config.max_command_length {
                let message = format!(
                    "command length {} exceeds max {}",
                    header.command_length, self.config.max_command_length
                );
                self.report_deserialization_error(&message, header.command_id, &header_bytes);
                self.do_close(&message);
                return;
            }

            let command_length = header.command_length as usize;
            if command_length > self.receive_buf.capacity() {
                let message = format!(
                    "command length {} exceeds receive buffer capacity {}",
                    command_length,
                    self.receive_buf.capacity()
                );
                self.report_deserialization_error(&message, header.command_id, &header_bytes);
                self.do_close(&message);
                return;
            }

            if self.receive_buf.size() < command_length {
                break;
            }

            let body_len = command_length - HEADER_LENGTH;
            if body_len == 0 {
                self.receive_buf.consume(command_length);
                self.metrics()
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                self.dispatch(header, &[]);
            } else if body_len <= self.config.small_body_size.min(SMALL_BODY_STACK) {
                let mut stack_buf = [0u8; SMALL_BODY_STACK];
                stack_buf[..body_len]
                    .copy_from_slice(&self.receive_buf.data()[HEADER_LENGTH..command_length]);
                self.receive_buf.consume(command_length);
                self.metrics()
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                self.dispatch(header, &stack_buf[..body_len]);
            } else {
                let body = self.receive_buf.data()[HEADER_LENGTH..command_length].to_vec();
                self.receive_buf.consume(command_length);
                self.metrics()
                    .messages_received
                    .fetch_add(1, Ordering::Relaxed);
                self.dispatch(header, &body);
            }
        }

        if self.receiving == ReceivingState::PendingPause {
            self.receiving = ReceivingState::Paused;
        }
    }

    fn dispatch(&mut self, header: Header, body: &[u8]) {
        if header.is_response() {
            self.handle_response(header, body);
        } else {
            self.handle_request(header, body);
        }
    }

    fn handle_request(&mut self, header: Header, body: &[u8]) {
        let command_id = match CommandId::try_from(header.command_id) {
            Ok(id) => id,
            Err(e) => {
                self.report_deserialization_error(&e.to_string(), header.command_id, body);
                self.do_close(&format!("unknown PDU {:#04x}", header.command_id));
                return;
            }
        };

        match command_id {
            CommandId::EnquireLinkReq => {
                self.send_control(
                    CommandId::EnquireLinkResp,
                    header.sequence_number,
                    CommandStatus::Rok,
                );
            }
            CommandId::UnbindReq => {
                if self.state.can_unbind() {
                    self.transition(SessionState::Unbinding);
                }
                self.send_control(
                    CommandId::UnbindResp,
                    header.sequence_number,
                    CommandStatus::Rok,
                );
                self.do_close("unbind_req received");
            }
            CommandId::BindReq | CommandId::StreamReq => {
                let request = match Request::decode(command_id, body) {
                    Ok(request) => request,
                    Err(e) => {
                        self.report_deserialization_error(&e.to_string(), header.command_id, body);
                        self.do_close(&format!("deserialization failed: {e}"));
                        return;
                    }
                };
                self.deliver_request(request, header.sequence_number);
            }
            other => {
                let message = format!("response id {:#04x} on request path", other.as_u8());
                self.report_deserialization_error(&message, header.command_id, body);
                self.do_close(&message);
            }
        }
    }

    fn handle_response(&mut self, header: Header, body: &[u8]) {
        let command_id = match CommandId::try_from(header.command_id) {
            Ok(id) => id,
            Err(e) => {
                self.report_deserialization_error(&e.to_string(), header.command_id, body);
                self.do_close(&format!("unknown PDU {:#04x}", header.command_id));
                return;
            }
        };

        match command_id {
            CommandId::EnquireLinkResp => {}
            CommandId::UnbindResp => {
                self.unbind_deadline = None;
                self.do_close("unbind_resp received");
            }
            CommandId::BindResp | CommandId::StreamResp => {
                let response = match Response::decode(command_id, body) {
                    Ok(response) => response,
                    Err(e) => {
                        self.report_deserialization_error(&e.to_string(), header.command_id, body);
                        self.do_close(&format!("deserialization failed: {e}"));
                        return;
                    }
                };
                // The matching in-flight entry is resolved before the user
                // sees the response.
                self.pending_requests.remove(&header.sequence_number);
                self.deliver_response(response, header.sequence_number, header.command_status);
            }
            other => {
                let message = format!("request id {:#04x} on response path", other.as_u8());
                self.report_deserialization_error(&message, header.command_id, body);
                self.do_close(&message);
            }
        }
    }

    fn deliver_request(&mut self, request: Request, sequence_number: u32) {
        if !self.state.delivers_user_pdus() {
            return;
        }
        let result = match self.protocol_handler.as_mut() {
            Some(handler) => handler.on_request(request, sequence_number),
            None => return,
        };
        if let Err(e) = result {
            self.metrics().errors.fetch_add(1, Ordering::Relaxed);
            let message = format!("request handler failed: {e}");
            self.report_protocol_error(&message);
            self.do_close(&message);
        }
    }

    fn deliver_response(
        &mut self,
        response: Response,
        sequence_number: u32,
        status: CommandStatus,
    ) {
        if !self.state.delivers_user_pdus() {
            return;
        }
        let result = match self.protocol_handler.as_mut() {
            Some(handler) => handler.on_response(response, sequence_number, status),
            None => return,
        };
        if let Err(e) = result {
            self.metrics().errors.fetch_add(1, Ordering::Relaxed);
            let message = format!("response handler failed: {e}");
            self.report_protocol_error(&message);
            self.do_close(&message);
        }
    }

    fn fire_expired_requests(&mut self) {
        let expired = self.pending_requests.pop_expired(Instant::now());
        for (sequence_number, request) in expired {
            if let Some(handler) = self.timeout_handler.as_mut() {
                handler(sequence_number, request);
            }
        }
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    fn enqueue_pdu(&mut self, pdu: &dyn Pdu, sequence_number: u32, status: CommandStatus) -> bool {
        if !self.state.can_send() {
            let message = Error::StateForbidden(self.state.name()).to_string();
            self.report_protocol_error(&message);
            return false;
        }

        let prev_len = self.pending_send_buf.len();
        self.pending_send_buf.resize(prev_len + HEADER_LENGTH, 0);

        if let Err(e) = pdu.encode_body(&mut self.pending_send_buf) {
            self.pending_send_buf.truncate(prev_len);
            self.report_protocol_error(&format!("encode failed: {e}"));
            return false;
        }

        let command_length = (self.pending_send_buf.len() - prev_len) as u32;
        let header = Header::new(
            command_length,
            pdu.command_id().as_u8(),
            sequence_number,
            status,
        )
        .encode();
        self.pending_send_buf[prev_len..prev_len + HEADER_LENGTH].copy_from_slice(&header);

        self.metrics().messages_sent.fetch_add(1, Ordering::Relaxed);

        if self.backpressure.should_pause(self.pending_send_buf.len()) {
            self.pause_receiving();
        }

        self.flush();
        true
    }

    fn send_control(&mut self, command_id: CommandId, sequence_number: u32, status: CommandStatus) {
        let header = Header::new(
            HEADER_LENGTH as u32,
            command_id.as_u8(),
            sequence_number,
            status,
        )
        .encode();
        self.pending_send_buf.extend_from_slice(&header);
        self.metrics().messages_sent.fetch_add(1, Ordering::Relaxed);
        self.flush();
    }

    fn flush(&mut self) {
        if self.write_in_flight || self.pending_send_buf.is_empty() {
            return;
        }
        let Some(writer_tx) = self.writer_tx.clone() else {
            return;
        };

        let spare = std::mem::take(&mut self.spare_send_buf);
        let outgoing = std::mem::replace(&mut self.pending_send_buf, spare);
        let freed_backlog = outgoing.len() > self.config.send_buf_threshold;

        self.write_in_flight = true;
        if writer_tx.try_send(outgoing).is_err() {
            self.write_in_flight = false;
            self.do_close("write channel closed");
            return;
        }

        if self.backpressure.should_resume(self.pending_send_buf.len()) {
            self.resume_receiving();
            self.notify_send_buf_available();
        } else if freed_backlog {
            self.notify_send_buf_available();
        }
    }

    fn on_write_done(&mut self, result: std::io::Result<usize>, buf: Vec<u8>) {
        self.write_in_flight = false;
        match result {
            Ok(written) => {
                self.metrics()
                    .bytes_sent
                    .fetch_add(written as u64, Ordering::Relaxed);
                self.spare_send_buf = buf;
                if !self.pending_send_buf.is_empty() {
                    self.flush();
                }
            }
            Err(e) => {
                let message = format!("write failed: {e}");
                self.report_network_error(&message);
                self.do_close(&message);
            }
        }
    }

    fn notify_send_buf_available(&mut self) {
        if let Some(handler) = self.send_buf_available_handler.as_mut() {
            handler();
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    fn pause_receiving(&mut self) {
        if self.receiving == ReceivingState::Receiving {
            self.receiving = ReceivingState::PendingPause;
        }
    }

    fn resume_receiving(&mut self) {
        if self.state != SessionState::Closed {
            self.receiving = ReceivingState::Receiving;
        }
    }

    fn transition(&mut self, new_state: SessionState) {
        self.state = new_state;
        let raw = match new_state {
            SessionState::Open => STATE_OPEN,
            SessionState::Unbinding => STATE_UNBINDING,
            SessionState::Closed => STATE_CLOSED,
        };
        self.shared.state.store(raw, Ordering::Release);
    }

    fn do_unbind(&mut self) {
        if !self.state.can_unbind() {
            return;
        }
        self.transition(SessionState::Unbinding);
        let sequence_number = self.shared.next_sequence_number();
        self.send_control(CommandId::UnbindReq, sequence_number, CommandStatus::Rok);
        self.unbind_deadline = Some(Instant::now() + self.config.unbind_timeout);
    }

    fn do_close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        self.shared.close_initiated.store(true, Ordering::Release);

        self.receiving = ReceivingState::Paused;
        self.unbind_deadline = None;
        self.backpressure.reset();

        let err = (self.state == SessionState::Open).then(|| reason.to_string());
        self.transition(SessionState::Closed);
        self.metrics().is_closed.store(true, Ordering::Relaxed);

        // Dropping the channel lets the writer flush what it holds and shut
        // the write half down.
        self.writer_tx = None;

        // Outstanding requests surface as timeouts exactly once.
        let outstanding = self.pending_requests.drain();
        for (sequence_number, request) in outstanding {
            if let Some(handler) = self.timeout_handler.as_mut() {
                handler(sequence_number, request);
            }
        }

        let close_handler = self.close_handler.take();
        self.protocol_handler = None;
        self.error_handler = None;
        self.send_buf_available_handler = None;
        self.timeout_handler = None;

        debug!(session_id = self.shared.id, reason, "session closed");

        if let Some(handler) = close_handler {
            handler(self.handle.clone(), err);
        }

        let _ = self.shared.closed_tx.send(true);
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    fn report_deserialization_error(&mut self, message: &str, command_id: u8, data: &[u8]) {
        self.metrics().errors.fetch_add(1, Ordering::Relaxed);
        if let Some(handler) = self.error_handler.as_mut() {
            handler.on_deserialization_error(message, command_id, data);
        }
    }

    fn report_protocol_error(&mut self, message: &str) {
        if let Some(handler) = self.error_handler.as_mut() {
            handler.on_protocol_error(message);
        }
    }

    fn report_network_error(&mut self, message: &str) {
        self.metrics().errors.fetch_add(1, Ordering::Relaxed);
        if let Some(handler) = self.error_handler.as_mut() {
            handler.on_network_error(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BindResponse, StreamRequest, StreamResponse};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    fn frame(cmd: CommandId, status: CommandStatus, seq: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Header::new(
            (HEADER_LENGTH + body.len()) as u32,
            cmd.as_u8(),
            seq,
            status,
        )
        .encode()
        .to_vec();
        out.extend_from_slice(body);
        out
    }

    async fn read_frame(remote: &mut DuplexStream) -> (Header, Vec<u8>) {
        let mut head = [0u8; HEADER_LENGTH];
        remote.read_exact(&mut head).await.unwrap();
        let header = Header::decode(&head).unwrap();
        let mut body = vec![0u8; header.command_length as usize - HEADER_LENGTH];
        remote.read_exact(&mut body).await.unwrap();
        (header, body)
    }

    struct ChannelErrorHandler(UnboundedSender<String>);

    impl ErrorHandler for ChannelErrorHandler {
        fn on_deserialization_error(&mut self, message: &str, command_id: u8, _data: &[u8]) {
            let _ = self.0.send(format!("deser[{command_id:#04x}]: {message}"));
        }

        fn on_protocol_error(&mut self, message: &str) {
            let _ = self.0.send(format!("protocol: {message}"));
        }

        fn on_network_error(&mut self, message: &str) {
            let _ = self.0.send(format!("network: {message}"));
        }
    }

    fn request_capture() -> (
        impl ProtocolHandler + 'static,
        UnboundedReceiver<(Request, u32)>,
        UnboundedReceiver<(Response, u32, CommandStatus)>,
    ) {
        let (req_tx, req_rx) = unbounded_channel();
        let (resp_tx, resp_rx) = unbounded_channel();
        let handler = FnProtocolHandler::new(
            move |request, seq| {
                let _ = req_tx.send((request, seq));
                Ok(())
            },
            move |response, seq, status| {
                let _ = resp_tx.send((response, seq, status));
                Ok(())
            },
        );
        (handler, req_rx, resp_rx)
    }

    #[test]
    fn test_sequence_generator_never_yields_zero() {
        assert_eq!(bump_sequence(0), 1);
        assert_eq!(bump_sequence(1), 2);
        assert_eq!(bump_sequence(u32::MAX - 1), u32::MAX);
        assert_eq!(bump_sequence(u32::MAX), 1);
    }

    #[tokio::test]
    async fn test_enquire_link_auto_reply() {
        let (local, mut remote) = duplex(4096);
        let session = Session::builder().build(local).unwrap();
        session.start();

        remote
            .write_all(&frame(CommandId::EnquireLinkReq, CommandStatus::Rok, 9, &[]))
            .await
            .unwrap();

        let (header, body) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::EnquireLinkResp.as_u8());
        assert_eq!(header.sequence_number, 9);
        assert!(body.is_empty());
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_request_dispatch_and_response() {
        let (local, mut remote) = duplex(4096);
        let (handler, mut req_rx, _resp_rx) = request_capture();
        let session = Session::builder()
            .with_protocol_handler(handler)
            .build(local)
            .unwrap();
        session.start();

        remote
            .write_all(&frame(
                CommandId::StreamReq,
                CommandStatus::Rok,
                2,
                b"hello",
            ))
            .await
            .unwrap();

        let (request, seq) = req_rx.recv().await.unwrap();
        assert_eq!(request, Request::Stream(StreamRequest::from("hello")));
        assert_eq!(seq, 2);

        session
            .send_response(StreamResponse::from("hello"), seq, CommandStatus::Rok)
            .unwrap();

        let (header, body) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::StreamResp.as_u8());
        assert_eq!(header.sequence_number, 2);
        assert_eq!(header.command_status, CommandStatus::Rok);
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_sequence_numbers_assigned_in_order() {
        let (local, mut remote) = duplex(4096);
        let session = Session::builder().build(local).unwrap();
        session.start();

        let first = session.send_request(StreamRequest::from("a")).unwrap();
        let second = session.send_request(StreamRequest::from("b")).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.sequence_number, 1);
        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.sequence_number, 2);
    }

    #[tokio::test]
    async fn test_response_delivery_with_reserved_status() {
        let (local, mut remote) = duplex(4096);
        let (handler, _req_rx, mut resp_rx) = request_capture();
        let session = Session::builder()
            .with_protocol_handler(handler)
            .build(local)
            .unwrap();
        session.start();

        let seq = session.send_request(StreamRequest::from("ping")).unwrap();
        let _ = read_frame(&mut remote).await;

        remote
            .write_all(&frame(
                CommandId::StreamResp,
                CommandStatus::Reserved(0x2A),
                seq,
                b"pong",
            ))
            .await
            .unwrap();

        let (response, resp_seq, status) = resp_rx.recv().await.unwrap();
        assert_eq!(response, Response::Stream(StreamResponse::from("pong")));
        assert_eq!(resp_seq, seq);
        assert_eq!(status, CommandStatus::Reserved(0x2A));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_fires_with_original_pdu() {
        let (local, mut remote) = duplex(4096);
        let (timeout_tx, mut timeout_rx) = unbounded_channel();
        let session = Session::builder()
            .with_timeout_handler(move |seq, request| {
                let _ = timeout_tx.send((seq, request));
            })
            .build(local)
            .unwrap();
        session.start();

        let seq = session
            .send_request_with_timeout(StreamRequest::from("x"), Duration::from_secs(1))
            .unwrap();
        let _ = read_frame(&mut remote).await;

        let (timed_out_seq, request) = timeout_rx.recv().await.unwrap();
        assert_eq!(timed_out_seq, seq);
        assert_eq!(request, Request::Stream(StreamRequest::from("x")));
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_suppresses_request_timeout() {
        let (local, mut remote) = duplex(4096);
        let (handler, _req_rx, mut resp_rx) = request_capture();
        let (timeout_tx, mut timeout_rx) = unbounded_channel();
        let session = Session::builder()
            .with_protocol_handler(handler)
            .with_timeout_handler(move |seq, request| {
                let _ = timeout_tx.send((seq, request));
            })
            .build(local)
            .unwrap();
        session.start();

        let seq = session
            .send_request_with_timeout(StreamRequest::from("x"), Duration::from_secs(5))
            .unwrap();
        let _ = read_frame(&mut remote).await;

        remote
            .write_all(&frame(CommandId::StreamResp, CommandStatus::Rok, seq, b"y"))
            .await
            .unwrap();
        let _ = resp_rx.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(timeout_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_graceful_unbind_initiator() {
        let (local, mut remote) = duplex(4096);
        let (close_tx, mut close_rx) = unbounded_channel();
        let session = Session::builder()
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        session.unbind();

        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::UnbindReq.as_u8());

        remote
            .write_all(&frame(
                CommandId::UnbindResp,
                CommandStatus::Rok,
                header.sequence_number,
                &[],
            ))
            .await
            .unwrap();

        let reason = close_rx.recv().await.unwrap();
        assert_eq!(reason, None);
        session.closed().await;
        assert!(!session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbind_timeout_forces_close() {
        let (local, mut remote) = duplex(4096);
        let (close_tx, mut close_rx) = unbounded_channel();
        let session = Session::builder()
            .with_unbind_timeout(Duration::from_secs(5))
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        session.unbind();
        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::UnbindReq.as_u8());

        // Peer never answers; the timer fires the close.
        let reason = close_rx.recv().await.unwrap();
        assert_eq!(reason, None);
        session.closed().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_peer_unbind_request_is_answered_then_closed() {
        let (local, mut remote) = duplex(4096);
        let (close_tx, mut close_rx) = unbounded_channel();
        let session = Session::builder()
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        remote
            .write_all(&frame(CommandId::UnbindReq, CommandStatus::Rok, 5, &[]))
            .await
            .unwrap();

        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::UnbindResp.as_u8());
        assert_eq!(header.sequence_number, 5);

        let reason = close_rx.recv().await.unwrap();
        assert_eq!(reason, None);
        session.closed().await;
    }

    #[tokio::test]
    async fn test_oversize_command_is_fatal() {
        let (local, mut remote) = duplex(4096);
        let (err_tx, mut err_rx) = unbounded_channel();
        let (close_tx, mut close_rx) = unbounded_channel();
        let session = Session::builder()
            .with_max_message_size(64)
            .with_error_handler(ChannelErrorHandler(err_tx))
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        let header = Header::new(65, CommandId::StreamReq.as_u8(), 1, CommandStatus::Rok);
        remote.write_all(&header.encode()).await.unwrap();

        let report = err_rx.recv().await.unwrap();
        assert!(report.contains("exceeds max"));

        let reason = close_rx.recv().await.unwrap().unwrap();
        assert!(reason.contains("exceeds max"));
    }

    #[tokio::test]
    async fn test_command_length_at_max_is_accepted() {
        let (local, mut remote) = duplex(4096);
        let (handler, mut req_rx, _resp_rx) = request_capture();
        let session = Session::builder()
            .with_max_message_size(30)
            .with_protocol_handler(handler)
            .build(local)
            .unwrap();
        session.start();

        let body = vec![b'z'; 20];
        remote
            .write_all(&frame(CommandId::StreamReq, CommandStatus::Rok, 1, &body))
            .await
            .unwrap();

        let (request, _) = req_rx.recv().await.unwrap();
        assert_eq!(request, Request::Stream(StreamRequest::from(body)));
    }

    #[tokio::test]
    async fn test_malformed_header_is_fatal() {
        let (local, mut remote) = duplex(4096);
        let (err_tx, mut err_rx) = unbounded_channel();
        let (close_tx, mut close_rx) = unbounded_channel();
        let session = Session::builder()
            .with_error_handler(ChannelErrorHandler(err_tx))
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        // command_length below the header size.
        let header = Header::new(5, CommandId::StreamReq.as_u8(), 1, CommandStatus::Rok);
        remote.write_all(&header.encode()).await.unwrap();

        let report = err_rx.recv().await.unwrap();
        assert!(report.starts_with("deser"));

        let reason = close_rx.recv().await.unwrap().unwrap();
        assert!(reason.contains("malformed header"));
    }

    #[tokio::test]
    async fn test_unknown_command_id_is_fatal() {
        let (local, mut remote) = duplex(4096);
        let (err_tx, mut err_rx) = unbounded_channel();
        let session = Session::builder()
            .with_error_handler(ChannelErrorHandler(err_tx))
            .build(local)
            .unwrap();
        session.start();

        let header = Header::new(10, 0x7F, 1, CommandStatus::Rok);
        remote.write_all(&header.encode()).await.unwrap();

        let report = err_rx.recv().await.unwrap();
        assert!(report.contains("0x7f"));
        session.closed().await;
    }

    #[tokio::test]
    async fn test_small_and_large_bodies_dispatch_identical_content() {
        let (local, mut remote) = duplex(4096);
        let (handler, mut req_rx, _resp_rx) = request_capture();
        let session = Session::builder()
            .with_small_body_size(8)
            .with_protocol_handler(handler)
            .build(local)
            .unwrap();
        session.start();

        let at_threshold = vec![b'a'; 8];
        let over_threshold = vec![b'b'; 9];
        remote
            .write_all(&frame(
                CommandId::StreamReq,
                CommandStatus::Rok,
                1,
                &at_threshold,
            ))
            .await
            .unwrap();
        remote
            .write_all(&frame(
                CommandId::StreamReq,
                CommandStatus::Rok,
                2,
                &over_threshold,
            ))
            .await
            .unwrap();

        let (first, _) = req_rx.recv().await.unwrap();
        let (second, _) = req_rx.recv().await.unwrap();
        assert_eq!(first, Request::Stream(StreamRequest::from(at_threshold)));
        assert_eq!(second, Request::Stream(StreamRequest::from(over_threshold)));
    }

    #[tokio::test]
    async fn test_send_request_after_close_fails() {
        let (local, _remote) = duplex(4096);
        let session = Session::builder().build(local).unwrap();
        session.start();

        session.close("done");
        session.closed().await;

        let result = session.send_request(StreamRequest::from("late"));
        assert!(matches!(result, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_double_close_fires_close_handler_once() {
        let (local, _remote) = duplex(4096);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let (reason_tx, mut reason_rx) = unbounded_channel();
        let session = Session::builder()
            .with_close_handler(move |_session, reason| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
                let _ = reason_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        session.close("first");
        session.close("second");
        session.closed().await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(reason_rx.recv().await.unwrap(), Some("first".to_string()));
    }

    #[tokio::test]
    async fn test_send_while_unbinding_rejected_via_error_handler() {
        let (local, mut remote) = duplex(4096);
        let (err_tx, mut err_rx) = unbounded_channel();
        let session = Session::builder()
            .with_error_handler(ChannelErrorHandler(err_tx))
            .build(local)
            .unwrap();
        session.start();

        session.unbind();
        // Allocated a sequence number, but the engine rejects the send.
        let seq = session.send_request(StreamRequest::from("nope")).unwrap();
        assert!(seq > 0);

        let report = err_rx.recv().await.unwrap();
        assert_eq!(report, "protocol: operation forbidden in state unbinding");

        // Only the unbind request reached the wire.
        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::UnbindReq.as_u8());
    }

    #[tokio::test]
    async fn test_unbind_twice_is_noop() {
        let (local, mut remote) = duplex(4096);
        let session = Session::builder().build(local).unwrap();
        session.start();

        session.unbind();
        session.unbind();

        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::UnbindReq.as_u8());

        // A second unbind_req would be the next frame; instead the session
        // answers an enquire_link probe we can observe ordering with.
        remote
            .write_all(&frame(CommandId::EnquireLinkReq, CommandStatus::Rok, 77, &[]))
            .await
            .unwrap();
        let (header, _) = read_frame(&mut remote).await;
        assert_eq!(header.command_id, CommandId::EnquireLinkResp.as_u8());
        assert_eq!(header.sequence_number, 77);
    }

    #[tokio::test]
    async fn test_handler_error_closes_session() {
        let (local, mut remote) = duplex(4096);
        let (err_tx, mut err_rx) = unbounded_channel();
        let (close_tx, mut close_rx) = unbounded_channel();
        let handler = FnProtocolHandler::new(
            |_request, _seq| Err(Error::Truncated("handler refused".into())),
            |_response, _seq, _status| Ok(()),
        );
        let session = Session::builder()
            .with_protocol_handler(handler)
            .with_error_handler(ChannelErrorHandler(err_tx))
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        remote
            .write_all(&frame(CommandId::StreamReq, CommandStatus::Rok, 1, b"x"))
            .await
            .unwrap();

        let report = err_rx.recv().await.unwrap();
        assert!(report.contains("request handler failed"));

        let reason = close_rx.recv().await.unwrap().unwrap();
        assert!(reason.contains("request handler failed"));
    }

    #[tokio::test]
    async fn test_replace_protocol_handler() {
        let (local, mut remote) = duplex(4096);
        let session = Session::builder().build(local).unwrap();
        session.start();

        // No handler yet: the request is parsed but goes nowhere.
        remote
            .write_all(&frame(CommandId::StreamReq, CommandStatus::Rok, 1, b"lost"))
            .await
            .unwrap();

        let (handler, mut req_rx, _resp_rx) = request_capture();
        session.set_protocol_handler(handler);

        remote
            .write_all(&frame(CommandId::StreamReq, CommandStatus::Rok, 2, b"seen"))
            .await
            .unwrap();

        let (request, seq) = req_rx.recv().await.unwrap();
        assert_eq!(request, Request::Stream(StreamRequest::from("seen")));
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn test_backpressure_pause_and_resume_with_hook() {
        let (local, mut remote) = duplex(32);
        let (hook_tx, mut hook_rx) = unbounded_channel();
        let session = Session::builder()
            .with_send_capacity(4096)
            .with_send_threshold(64)
            .with_backpressure(8, 16)
            .with_send_buf_available_handler(move || {
                let _ = hook_tx.send(());
            })
            .build(local)
            .unwrap();
        session.start();

        // Each request is 10 + 40 bytes; the duplex holds 32, so the first
        // write stalls and later requests pile into the pending buffer past
        // the high watermark.
        for _ in 0..3 {
            session
                .send_request(StreamRequest::from(vec![b'q'; 40]))
                .unwrap();
        }

        for _ in 0..3 {
            let (header, body) = read_frame(&mut remote).await;
            assert_eq!(header.command_id, CommandId::StreamReq.as_u8());
            assert_eq!(body.len(), 40);
        }

        // Draining the backlog resumed reception and fired the hook.
        assert!(hook_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_bind_response_empty_body_delivered_as_default() {
        let (local, mut remote) = duplex(4096);
        let (handler, _req_rx, mut resp_rx) = request_capture();
        let session = Session::builder()
            .with_protocol_handler(handler)
            .build(local)
            .unwrap();
        session.start();

        let seq = session
            .send_request(crate::protocol::BindRequest::new("alice"))
            .unwrap();
        let _ = read_frame(&mut remote).await;

        remote
            .write_all(&frame(CommandId::BindResp, CommandStatus::Rok, seq, &[]))
            .await
            .unwrap();

        let (response, _, status) = resp_rx.recv().await.unwrap();
        assert_eq!(response, Response::Bind(BindResponse::default()));
        assert_eq!(status, CommandStatus::Rok);
    }

    #[tokio::test]
    async fn test_close_on_peer_disconnect() {
        let (local, remote) = duplex(4096);
        let (close_tx, mut close_rx) = unbounded_channel();
        let session = Session::builder()
            .with_close_handler(move |_session, reason| {
                let _ = close_tx.send(reason);
            })
            .build(local)
            .unwrap();
        session.start();

        drop(remote);

        let reason = close_rx.recv().await.unwrap().unwrap();
        assert!(reason.contains("closed by peer"));
        let snapshot = session.metrics().snapshot();
        assert!(snapshot.is_closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_expires_outstanding_requests() {
        let (local, mut remote) = duplex(4096);
        let (timeout_tx, mut timeout_rx) = unbounded_channel();
        let session = Session::builder()
            .with_timeout_handler(move |seq, request| {
                let _ = timeout_tx.send((seq, request));
            })
            .build(local)
            .unwrap();
        session.start();

        let seq = session
            .send_request_with_timeout(StreamRequest::from("orphan"), Duration::from_secs(3600))
            .unwrap();
        let _ = read_frame(&mut remote).await;

        session.close("shutdown");

        let (timed_out_seq, request) = timeout_rx.recv().await.unwrap();
        assert_eq!(timed_out_seq, seq);
        assert_eq!(request, Request::Stream(StreamRequest::from("orphan")));
    }
}
