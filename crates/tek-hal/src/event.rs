//! Per-thread signal event
//!
//! An `Event` holds a 32-bit pending-signal word. Any thread may raise bits on
//! any event; only the owning thread is expected to wait on it.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Signal record owned by one thread and targeted by many
pub struct Event {
    /// Pending signal bits
    state: Mutex<u32>,
    /// Woken when a previously clear bit becomes set
    cond: Condvar,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("pending", &format_args!("{:#010x}", *self.state.lock()))
            .finish()
    }
}

impl Event {
    /// Create an event with no pending signals
    pub fn new() -> Self {
        Self {
            state: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Raise `signals` on this event
    ///
    /// The waiter is only notified if at least one of the bits was not
    /// already pending; re-signalling pending bits does not touch the
    /// condition variable.
    pub fn signal(&self, signals: u32) {
        let mut state = self.state.lock();
        if signals & !*state != 0 {
            *state |= signals;
            self.cond.notify_all();
        }
    }

    /// Replace the bits selected by `mask` with `new`, returning the old word
    pub fn set_signal(&self, new: u32, mask: u32) -> u32 {
        let new = new & mask;
        let mut state = self.state.lock();
        let old = *state;
        *state = (old & !mask) | new;
        if new & !old != 0 {
            self.cond.notify_all();
        }
        old
    }

    /// Block until any bit in `mask` is pending, then clear and return those bits
    ///
    /// A zero mask returns zero immediately.
    pub fn wait(&self, mask: u32) -> u32 {
        if mask == 0 {
            return 0;
        }
        let mut state = self.state.lock();
        loop {
            let got = *state & mask;
            if got != 0 {
                *state &= !got;
                return got;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Like [`Event::wait`], but give up after `timeout`
    ///
    /// Returns zero if no bit in `mask` was raised in time.
    pub fn wait_timeout(&self, mask: u32, timeout: Duration) -> u32 {
        if mask == 0 {
            return 0;
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            let got = *state & mask;
            if got != 0 {
                *state &= !got;
                return got;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                let got = *state & mask;
                *state &= !got;
                return got;
            }
        }
    }

    /// Snapshot of the pending bits
    pub fn pending(&self) -> u32 {
        *self.state.lock()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
