//! Per-session metrics block.
//!
//! The session owns one [`SessionMetrics`] and updates it from the engine;
//! external observers hold the same `Arc` and read a consistent-enough
//! [`MetricsSnapshot`]. This block is the only observability surface of
//! the core; nothing global is touched.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Atomic counters for one session.
#[derive(Debug)]
pub struct SessionMetrics {
    /// Bytes acknowledged as written by the socket.
    pub bytes_sent: AtomicU64,
    /// Bytes delivered by the socket.
    pub bytes_received: AtomicU64,
    /// PDUs enqueued for sending.
    pub messages_sent: AtomicU64,
    /// PDUs parsed from the byte stream.
    pub messages_received: AtomicU64,
    /// Deserialization, protocol and network errors.
    pub errors: AtomicU64,
    /// Receive buffer compactions.
    pub buffer_compactions: AtomicU64,
    /// Set once the session is closed.
    pub is_closed: AtomicBool,
    created_at: Instant,
}

impl SessionMetrics {
    pub(crate) fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            buffer_compactions: AtomicU64::new(0),
            is_closed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    /// Milliseconds since the session was constructed.
    pub fn uptime_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// Read all counters at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            buffer_compactions: self.buffer_compactions.load(Ordering::Relaxed),
            is_closed: self.is_closed.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
        }
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub errors: u64,
    pub buffer_compactions: u64,
    pub is_closed: bool,
    pub uptime_ms: u64,
}
