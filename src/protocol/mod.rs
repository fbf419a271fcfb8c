//! Protocol module - wire format, PDU bodies, and the receive buffer.
//!
//! This module implements the binary protocol layer:
//! - 10-byte header encoding/decoding
//! - Typed PDU bodies with deterministic serialization
//! - Flat receive buffer for accumulating partial reads

mod flat_buffer;
mod pdu;
mod wire;

pub use flat_buffer::FlatBuffer;
pub use pdu::{
    BindRequest, BindResponse, Pdu, Request, Response, StreamRequest, StreamResponse,
    MAX_SYSTEM_ID_LENGTH,
};
pub use wire::{
    decode_header, encode_header, is_response, CommandId, CommandStatus, Header, HEADER_LENGTH,
};
