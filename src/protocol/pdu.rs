//! Typed PDU bodies and their deterministic serialization.
//!
//! Body formats:
//! - `bind_req` / `bind_resp`: a single c-octet-string `system_id`
//!   (UTF-8 bytes plus a NUL terminator, at most [`MAX_SYSTEM_ID_LENGTH`]
//!   bytes including the terminator).
//! - `stream_req` / `stream_resp`: the raw remaining bytes.
//! - `unbind_*` and `enquire_link_*` carry no body and no PDU type; the
//!   session emits them as bare headers.
//!
//! Responses with an empty body (`bind_resp`, `stream_resp`) decode to
//! their default value.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::protocol::wire::CommandId;

/// Maximum length of a `system_id` on the wire, NUL terminator included.
pub const MAX_SYSTEM_ID_LENGTH: usize = 20;

/// A PDU with a wire identity and a deterministic body serialization.
pub trait Pdu {
    /// Command id this PDU travels under.
    fn command_id(&self) -> CommandId;

    /// Append the serialized body to `out`.
    ///
    /// On error nothing useful has been appended; the caller truncates
    /// `out` back to its previous length.
    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()>;
}

/// Opens a session: carries the identity of the binding peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindRequest {
    /// Identity of the requesting system.
    pub system_id: String,
}

impl BindRequest {
    /// Create a bind request for the given identity.
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
        }
    }

    /// Decode a bind request body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let (system_id, _) = read_c_octet_str(body, "system_id")?;
        Ok(Self { system_id })
    }
}

impl Pdu for BindRequest {
    fn command_id(&self) -> CommandId {
        CommandId::BindReq
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        write_c_octet_str(out, &self.system_id, "system_id")
    }
}

/// Answers a bind request: carries the identity of the accepting peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindResponse {
    /// Identity of the responding system.
    pub system_id: String,
}

impl BindResponse {
    /// Create a bind response for the given identity.
    pub fn new(system_id: impl Into<String>) -> Self {
        Self {
            system_id: system_id.into(),
        }
    }

    /// Decode a bind response body. An empty body is legal and decodes to
    /// an empty identity.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        let (system_id, _) = read_c_octet_str(body, "system_id")?;
        Ok(Self { system_id })
    }
}

impl Pdu for BindResponse {
    fn command_id(&self) -> CommandId {
        CommandId::BindResp
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        write_c_octet_str(out, &self.system_id, "system_id")
    }
}

/// An application payload request; the body is opaque to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamRequest {
    /// Raw message body.
    pub body: Bytes,
}

impl StreamRequest {
    /// Decode a stream request body (the raw remainder).
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            body: Bytes::copy_from_slice(body),
        })
    }
}

impl Pdu for StreamRequest {
    fn command_id(&self) -> CommandId {
        CommandId::StreamReq
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

impl From<&str> for StreamRequest {
    fn from(value: &str) -> Self {
        Self {
            body: Bytes::copy_from_slice(value.as_bytes()),
        }
    }
}

impl From<Vec<u8>> for StreamRequest {
    fn from(value: Vec<u8>) -> Self {
        Self {
            body: Bytes::from(value),
        }
    }
}

impl From<Bytes> for StreamRequest {
    fn from(body: Bytes) -> Self {
        Self { body }
    }
}

/// An application payload response; may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResponse {
    /// Raw message body.
    pub body: Bytes,
}

impl StreamResponse {
    /// Decode a stream response body (the raw remainder, possibly empty).
    pub fn decode(body: &[u8]) -> Result<Self> {
        Ok(Self {
            body: Bytes::copy_from_slice(body),
        })
    }
}

impl Pdu for StreamResponse {
    fn command_id(&self) -> CommandId {
        CommandId::StreamResp
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.body);
        Ok(())
    }
}

impl From<&str> for StreamResponse {
    fn from(value: &str) -> Self {
        Self {
            body: Bytes::copy_from_slice(value.as_bytes()),
        }
    }
}

impl From<Vec<u8>> for StreamResponse {
    fn from(value: Vec<u8>) -> Self {
        Self {
            body: Bytes::from(value),
        }
    }
}

impl From<Bytes> for StreamResponse {
    fn from(body: Bytes) -> Self {
        Self { body }
    }
}

/// A user-visible request PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Bind(BindRequest),
    Stream(StreamRequest),
}

impl Request {
    /// Decode a request body for the given command id.
    pub fn decode(command_id: CommandId, body: &[u8]) -> Result<Self> {
        match command_id {
            CommandId::BindReq => Ok(Request::Bind(BindRequest::decode(body)?)),
            CommandId::StreamReq => Ok(Request::Stream(StreamRequest::decode(body)?)),
            other => Err(Error::UnknownPdu(other.as_u8())),
        }
    }
}

impl Pdu for Request {
    fn command_id(&self) -> CommandId {
        match self {
            Request::Bind(p) => p.command_id(),
            Request::Stream(p) => p.command_id(),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Request::Bind(p) => p.encode_body(out),
            Request::Stream(p) => p.encode_body(out),
        }
    }
}

impl From<BindRequest> for Request {
    fn from(value: BindRequest) -> Self {
        Request::Bind(value)
    }
}

impl From<StreamRequest> for Request {
    fn from(value: StreamRequest) -> Self {
        Request::Stream(value)
    }
}

/// A user-visible response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bind(BindResponse),
    Stream(StreamResponse),
}

impl Response {
    /// Decode a response body for the given command id.
    pub fn decode(command_id: CommandId, body: &[u8]) -> Result<Self> {
        match command_id {
            CommandId::BindResp => Ok(Response::Bind(BindResponse::decode(body)?)),
            CommandId::StreamResp => Ok(Response::Stream(StreamResponse::decode(body)?)),
            other => Err(Error::UnknownPdu(other.as_u8())),
        }
    }
}

impl Pdu for Response {
    fn command_id(&self) -> CommandId {
        match self {
            Response::Bind(p) => p.command_id(),
            Response::Stream(p) => p.command_id(),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Response::Bind(p) => p.encode_body(out),
            Response::Stream(p) => p.encode_body(out),
        }
    }
}

impl From<BindResponse> for Response {
    fn from(value: BindResponse) -> Self {
        Response::Bind(value)
    }
}

impl From<StreamResponse> for Response {
    fn from(value: StreamResponse) -> Self {
        Response::Stream(value)
    }
}

fn write_c_octet_str(out: &mut Vec<u8>, value: &str, field: &str) -> Result<()> {
    if value.len() + 1 > MAX_SYSTEM_ID_LENGTH {
        return Err(Error::LengthOverflow(format!(
            "{field} exceeds {} bytes including terminator",
            MAX_SYSTEM_ID_LENGTH
        )));
    }
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    Ok(())
}

fn read_c_octet_str<'a>(buf: &'a [u8], field: &str) -> Result<(String, &'a [u8])> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Truncated(format!("{field}: missing NUL terminator")))?;

    if nul + 1 > MAX_SYSTEM_ID_LENGTH {
        return Err(Error::LengthOverflow(format!(
            "{field} exceeds {} bytes including terminator",
            MAX_SYSTEM_ID_LENGTH
        )));
    }

    let value = std::str::from_utf8(&buf[..nul])
        .map_err(|_| Error::Truncated(format!("{field}: invalid UTF-8")))?;

    Ok((value.to_string(), &buf[nul + 1..]))
}
