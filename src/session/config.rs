//! Session configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Per-session configuration snapshot.
///
/// Validated at session construction; an invalid configuration never
/// reaches a running session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity reserved for each of the pending and writing send buffers.
    pub send_buf_capacity: usize,
    /// Pending backlog size above which a completed swap notifies the
    /// send-buffer-available hook.
    pub send_buf_threshold: usize,
    /// Capacity of the flat receive buffer.
    pub receive_buf_size: usize,
    /// Bodies at or below this size take the stack copy fast path
    /// (capped at 256 bytes).
    pub small_body_size: usize,
    /// Fatal cap on `command_length`.
    pub max_command_length: u32,
    /// How long to wait for `unbind_resp` before forcing a close.
    pub unbind_timeout: Duration,
    /// Resume reception once the pending buffer drops below this.
    pub backpressure_low_watermark: usize,
    /// Pause reception once the pending buffer grows above this.
    pub backpressure_high_watermark: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buf_capacity: 1024 * 1024,
            send_buf_threshold: 1024 * 1024,
            receive_buf_size: 1024 * 1024,
            small_body_size: 256,
            max_command_length: 10 * 1024 * 1024,
            unbind_timeout: Duration::from_secs(5),
            backpressure_low_watermark: 512 * 1024,
            backpressure_high_watermark: 1024 * 1024,
        }
    }
}

impl SessionConfig {
    /// Validate the configuration.
    ///
    /// Requires `low <= high <= send_buf_capacity`,
    /// `send_buf_threshold <= send_buf_capacity` and positive sizes.
    pub fn validate(&self) -> Result<()> {
        if self.send_buf_capacity == 0 {
            return Err(Error::ConfigInvalid("send_buf_capacity must be positive".into()));
        }
        if self.receive_buf_size == 0 {
            return Err(Error::ConfigInvalid("receive_buf_size must be positive".into()));
        }
        if self.small_body_size == 0 {
            return Err(Error::ConfigInvalid("small_body_size must be positive".into()));
        }
        if self.max_command_length == 0 {
            return Err(Error::ConfigInvalid("max_command_length must be positive".into()));
        }
        if self.unbind_timeout.is_zero() {
            return Err(Error::ConfigInvalid("unbind_timeout must be positive".into()));
        }
        if self.send_buf_threshold > self.send_buf_capacity {
            return Err(Error::ConfigInvalid(
                "send_buf_threshold must not exceed send_buf_capacity".into(),
            ));
        }
        if self.backpressure_low_watermark > self.backpressure_high_watermark {
            return Err(Error::ConfigInvalid(
                "backpressure_low_watermark must not exceed backpressure_high_watermark".into(),
            ));
        }
        if self.backpressure_high_watermark > self.send_buf_capacity {
            return Err(Error::ConfigInvalid(
                "backpressure_high_watermark must not exceed send_buf_capacity".into(),
            ));
        }
        Ok(())
    }
}
