//! # seqwire
//!
//! A connection-oriented, length-prefixed PDU transport with an explicit
//! bind handshake, sequence-correlated request/response multiplexing,
//! session-level flow control and a per-connection request expiration
//! tracker.
//!
//! ## Architecture
//!
//! - **Wire format**: every PDU starts with a fixed 10-byte big-endian
//!   header (`command_length`, `command_id`, `command_status`,
//!   `sequence_number`), followed by a typed body. Responses are marked by
//!   the top bit of the command id.
//! - **Session**: one per connection. The public [`Session`] handle posts
//!   operations to a per-session task that owns the socket, the receive
//!   buffer, the two send buffers and all handlers, so session state is
//!   never shared across threads.
//! - **Flow control**: a low/high watermark controller pauses reception
//!   while the pending send buffer is backed up and resumes it after
//!   draining.
//! - **Drivers**: [`Client`] connects and runs the bind handshake,
//!   [`Server`] accepts and routes bind requests, and [`SessionManager`]
//!   tracks live sessions with aggregate metrics.
//!
//! ## Example
//!
//! ```ignore
//! use seqwire::{Client, ClientOptions, StreamRequest};
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = Client::new(
//!         "127.0.0.1:7400".parse().unwrap(),
//!         "alice",
//!         ClientOptions::default(),
//!         |bind_resp, session| {
//!             println!("bound to {}", bind_resp.system_id);
//!             session.send_request(StreamRequest::from("hello")).unwrap();
//!         },
//!         |err| eprintln!("client error: {err}"),
//!     );
//!     client.start();
//! }
//! ```

pub mod client;
pub mod error;
pub mod expiry;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tcp;

pub use client::{Client, ClientOptions};
pub use error::{Error, Result};
pub use expiry::{ExpirationIndex, Expirator};
pub use manager::{AggregateMetrics, SessionManager};
pub use protocol::{
    BindRequest, BindResponse, CommandId, CommandStatus, Header, Pdu, Request, Response,
    StreamRequest, StreamResponse, HEADER_LENGTH,
};
pub use server::{Server, ServerOptions};
pub use session::{
    BackpressureController, ErrorHandler, FnProtocolHandler, LoggingErrorHandler, MetricsSnapshot,
    ProtocolHandler, Session, SessionBuilder, SessionConfig, SessionMetrics, SessionState,
    SilentErrorHandler,
};
