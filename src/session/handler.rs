//! Handler interfaces owned by a session.
//!
//! A session holds at most one protocol handler, one error handler, one
//! close handler, one send-buffer-available hook and one request-timeout
//! hook. Handlers run synchronously on the session task and must not
//! block; blocking work belongs on the user's own tasks. Handlers must
//! not capture an owning reference cycle back to their session: the
//! session releases all handlers on close, which is what breaks any
//! remaining cycle.

use tracing::{error, warn};

use crate::error::Result;
use crate::protocol::{CommandStatus, Request, Response};
use crate::session::Session;

/// Receives decoded user PDUs.
///
/// Returning an `Err` from either method is treated as a handler failure:
/// it is reported on the error handler's protocol channel and closes the
/// session.
pub trait ProtocolHandler: Send {
    /// A request PDU arrived with the given sequence number.
    fn on_request(&mut self, request: Request, sequence_number: u32) -> Result<()>;

    /// A response PDU arrived for the given sequence number.
    fn on_response(
        &mut self,
        response: Response,
        sequence_number: u32,
        status: CommandStatus,
    ) -> Result<()>;
}

/// Receives error reports from the session, split by channel.
pub trait ErrorHandler: Send {
    /// A PDU failed to decode; `data` is the offending body.
    fn on_deserialization_error(&mut self, message: &str, command_id: u8, data: &[u8]);

    /// A protocol-level violation (handler failure, forbidden send).
    fn on_protocol_error(&mut self, message: &str);

    /// A socket-level failure.
    fn on_network_error(&mut self, message: &str);
}

/// Default error handler: reports through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingErrorHandler;

impl ErrorHandler for LoggingErrorHandler {
    fn on_deserialization_error(&mut self, message: &str, command_id: u8, data: &[u8]) {
        error!(
            command_id = format_args!("{command_id:#04x}"),
            body_len = data.len(),
            "deserialization error: {message}"
        );
    }

    fn on_protocol_error(&mut self, message: &str) {
        warn!("protocol error: {message}");
    }

    fn on_network_error(&mut self, message: &str) {
        error!("network error: {message}");
    }
}

/// Error handler that swallows every report.
#[derive(Debug, Default)]
pub struct SilentErrorHandler;

impl ErrorHandler for SilentErrorHandler {
    fn on_deserialization_error(&mut self, _message: &str, _command_id: u8, _data: &[u8]) {}
    fn on_protocol_error(&mut self, _message: &str) {}
    fn on_network_error(&mut self, _message: &str) {}
}

/// Invoked exactly once when the session closes. The reason is present
/// only when the close interrupted an open session.
pub type CloseHandler = Box<dyn FnOnce(Session, Option<String>) + Send>;

/// Invoked when a swap frees a backed-up pending buffer or backpressure
/// resumes reception.
pub type SendBufAvailableHandler = Box<dyn FnMut() + Send>;

/// Invoked when an outbound request expires unanswered; receives the
/// sequence number and the original request.
pub type RequestTimeoutHandler = Box<dyn FnMut(u32, Request) + Send>;

/// Closure adapter so simple handlers don't need a struct.
pub struct FnProtocolHandler<Req, Resp>
where
    Req: FnMut(Request, u32) -> Result<()> + Send,
    Resp: FnMut(Response, u32, CommandStatus) -> Result<()> + Send,
{
    on_request: Req,
    on_response: Resp,
}

impl<Req, Resp> FnProtocolHandler<Req, Resp>
where
    Req: FnMut(Request, u32) -> Result<()> + Send,
    Resp: FnMut(Response, u32, CommandStatus) -> Result<()> + Send,
{
    /// Build a protocol handler from two closures.
    pub fn new(on_request: Req, on_response: Resp) -> Self {
        Self {
            on_request,
            on_response,
        }
    }
}

impl<Req, Resp> ProtocolHandler for FnProtocolHandler<Req, Resp>
where
    Req: FnMut(Request, u32) -> Result<()> + Send,
    Resp: FnMut(Response, u32, CommandStatus) -> Result<()> + Send,
{
    fn on_request(&mut self, request: Request, sequence_number: u32) -> Result<()> {
        (self.on_request)(request, sequence_number)
    }

    fn on_response(
        &mut self,
        response: Response,
        sequence_number: u32,
        status: CommandStatus,
    ) -> Result<()> {
        (self.on_response)(response, sequence_number, status)
    }
}
