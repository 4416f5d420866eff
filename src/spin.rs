//! Bounded spin-wait.
//!
//! The deadtime-critical phase must not block in the kernel, but it also must
//! not wait forever for a module that lost an event. [`SpinDeadline`] is the
//! primitive for that: poll, yield, poll again until a deadline.

use std::time::{Duration, Instant};

/// A deadline for cooperative busy-waiting.
#[derive(Debug, Clone, Copy)]
pub struct SpinDeadline {
    start: Instant,
    timeout: Duration,
}

impl SpinDeadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    /// True once the deadline passed.
    pub fn expired(&self) -> bool {
        self.start.elapsed() > self.timeout
    }

    /// Time spent since the deadline was set.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Give up the CPU once.
    pub fn relax(&self) {
        std::thread::yield_now();
    }
}
