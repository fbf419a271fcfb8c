//! Wire header encoding and decoding.
//!
//! Implements the fixed 10-byte header format:
//! ```text
//! ┌────────────────┬────────────┬────────────────┬─────────────────┐
//! │ command_length │ command_id │ command_status │ sequence_number │
//! │ 4 bytes        │ 1 byte     │ 1 byte         │ 4 bytes         │
//! │ uint32 BE      │            │                │ uint32 BE       │
//! └────────────────┴────────────┴────────────────┴─────────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. `command_length` counts the
//! header itself, so it is never below 10. Responses carry the top bit of
//! the command id.

use crate::error::{Error, Result};

/// Header size in bytes (fixed, exactly 10).
pub const HEADER_LENGTH: usize = 10;

/// Identifies the kind of a PDU on the wire.
///
/// Response ids mirror their request with the top bit set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    BindReq = 0x01,
    BindResp = 0x81,
    StreamReq = 0x02,
    StreamResp = 0x82,
    UnbindReq = 0x03,
    UnbindResp = 0x83,
    EnquireLinkReq = 0x04,
    EnquireLinkResp = 0x84,
}

impl CommandId {
    /// Raw wire value of this command id.
    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this id names a response PDU.
    #[inline]
    pub fn is_response(self) -> bool {
        is_response(self as u8)
    }
}

impl TryFrom<u8> for CommandId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(CommandId::BindReq),
            0x81 => Ok(CommandId::BindResp),
            0x02 => Ok(CommandId::StreamReq),
            0x82 => Ok(CommandId::StreamResp),
            0x03 => Ok(CommandId::UnbindReq),
            0x83 => Ok(CommandId::UnbindResp),
            0x04 => Ok(CommandId::EnquireLinkReq),
            0x84 => Ok(CommandId::EnquireLinkResp),
            other => Err(Error::UnknownPdu(other)),
        }
    }
}

/// Check whether a raw command id byte marks a response (top bit set).
#[inline]
pub fn is_response(command_id: u8) -> bool {
    command_id & 0x80 != 0
}

/// Status byte of a PDU.
///
/// Only `0x00` (ok) and `0xFF` (fail) are defined; every other value is
/// reserved and forwarded unchanged to user handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// No error.
    Rok,
    /// Failed.
    Rfail,
    /// Reserved wire value, passed through as-is.
    Reserved(u8),
}

impl CommandStatus {
    /// Decode a status byte.
    #[inline]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => CommandStatus::Rok,
            0xFF => CommandStatus::Rfail,
            other => CommandStatus::Reserved(other),
        }
    }

    /// Raw wire value of this status.
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            CommandStatus::Rok => 0x00,
            CommandStatus::Rfail => 0xFF,
            CommandStatus::Reserved(v) => v,
        }
    }

    /// Whether this is the ok status.
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, CommandStatus::Rok)
    }
}

/// Decoded wire header.
///
/// `command_id` is kept as the raw byte at this layer; unknown ids are
/// detected at dispatch so the offending value can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total PDU length in bytes, header included.
    pub command_length: u32,
    /// Raw command id byte.
    pub command_id: u8,
    /// Status byte.
    pub command_status: CommandStatus,
    /// Request/response correlation key.
    pub sequence_number: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(
        command_length: u32,
        command_id: u8,
        sequence_number: u32,
        command_status: CommandStatus,
    ) -> Self {
        Self {
            command_length,
            command_id,
            command_status,
            sequence_number,
        }
    }

    /// Encode the header to its 10-byte wire form (infallible).
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0..4].copy_from_slice(&self.command_length.to_be_bytes());
        buf[4] = self.command_id;
        buf[5] = self.command_status.as_u8();
        buf[6..10].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf
    }

    /// Decode a header from the first 10 bytes of `buf`.
    ///
    /// Fails with [`Error::MalformedHeader`] if the buffer is short or the
    /// encoded `command_length` is below the header size.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::MalformedHeader(format!(
                "need {} bytes, got {}",
                HEADER_LENGTH,
                buf.len()
            )));
        }

        let command_length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if (command_length as usize) < HEADER_LENGTH {
            return Err(Error::MalformedHeader(format!(
                "command_length {} below header size",
                command_length
            )));
        }

        Ok(Self {
            command_length,
            command_id: buf[4],
            command_status: CommandStatus::from_u8(buf[5]),
            sequence_number: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Whether this header carries a response PDU.
    #[inline]
    pub fn is_response(&self) -> bool {
        is_response(self.command_id)
    }
}

/// Encode header fields to wire form (standalone function).
#[inline]
pub fn encode_header(
    command_length: u32,
    command_id: CommandId,
    sequence_number: u32,
    command_status: CommandStatus,
) -> [u8; HEADER_LENGTH] {
    Header::new(
        command_length,
        command_id.as_u8(),
        sequence_number,
        command_status,
    )
    .encode()
}

/// Decode a header from bytes (standalone function).
#[inline]
pub fn decode_header(buf: &[u8]) -> Result<Header> {
    Header::decode(buf)
}
