//! Timed waits

use crate::task::Task;
use std::time::Duration;

impl Task {
    /// Wait for `mask` with an optional timeout; returns the bits consumed
    ///
    /// A zero timeout polls and clears without blocking. An empty mask just
    /// sleeps for the timeout. `None` waits without limit.
    pub fn wait_time(&self, timeout: Option<Duration>, mask: u32) -> u32 {
        match timeout {
            Some(timeout) if timeout.is_zero() => self.set_signal(0, mask) & mask,
            Some(timeout) if mask == 0 => {
                std::thread::sleep(timeout);
                0
            }
            Some(timeout) => self.wait_timeout(mask, timeout),
            None => self.wait(mask),
        }
    }
}
