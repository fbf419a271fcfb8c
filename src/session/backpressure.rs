//! Backpressure controller for the send pipeline.
//!
//! Watches the pending send buffer and gates reception with two
//! watermarks: writes that push the buffer above `high` pause reception,
//! and it resumes only once draining brings the buffer below `low`. The
//! hysteresis gap keeps the session from flapping between paused and
//! receiving on every write.

/// Two-watermark pause/resume controller.
#[derive(Debug)]
pub struct BackpressureController {
    low_watermark: usize,
    high_watermark: usize,
    paused: bool,
}

impl BackpressureController {
    /// Create a controller with the given watermarks (`low <= high`).
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        debug_assert!(low_watermark <= high_watermark);
        Self {
            low_watermark,
            high_watermark,
            paused: false,
        }
    }

    /// Evaluate after a write into the pending buffer.
    ///
    /// Returns true exactly when this write crossed the high watermark and
    /// reception should pause.
    pub fn should_pause(&mut self, pending_size: usize) -> bool {
        if !self.paused && pending_size > self.high_watermark {
            self.paused = true;
            return true;
        }
        false
    }

    /// Evaluate after draining the pending buffer.
    ///
    /// Returns true exactly when the buffer dropped below the low
    /// watermark while paused and reception should resume.
    pub fn should_resume(&mut self, pending_size: usize) -> bool {
        if self.paused && pending_size < self.low_watermark {
            self.paused = false;
            return true;
        }
        false
    }

    /// Whether reception is currently gated.
    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Forget any paused state (called on close).
    pub fn reset(&mut self) {
        self.paused = false;
    }

    /// Low watermark in bytes.
    #[inline]
    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    /// High watermark in bytes.
    #[inline]
    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    /// Replace both watermarks.
    pub fn set_watermarks(&mut self, low: usize, high: usize) {
        debug_assert!(low <= high);
        self.low_watermark = low;
        self.high_watermark = high;
    }
}
