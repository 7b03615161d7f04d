//! Task signals
//!
//! Each task owns 32 signal bits. A few low bits are reserved by the runtime,
//! the rest are handed out with [`crate::Task::alloc_signal`]. Delivery goes
//! through the task's host [`Event`].

use crate::task::TaskId;
use parking_lot::Mutex;
use tek_hal::Event;

/// Abort request
pub const SIG_ABORT: u32 = 0x0000_0001;
/// Break request
pub const SIG_BREAK: u32 = 0x0000_0002;
/// Signal of the sync port, used for synchronous replies and lock hand-off
pub const SIG_SINGLE: u32 = 0x0000_0004;
/// Signal of the user port
pub const SIG_USER: u32 = 0x0000_0008;
/// Bits every task has allocated from the start
pub const SIG_RESERVED: u32 = SIG_ABORT | SIG_BREAK | SIG_SINGLE | SIG_USER;

/// Child task finished initialization (exec task only)
pub const SIG_CHILDINIT: u32 = 0x8000_0000;
/// Child task exited or was asked to (exec task only)
pub const SIG_CHILDEXIT: u32 = 0x4000_0000;

/// Free/used bit table of one task
///
/// `free` and `used` are always disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalAlloc {
    free: u32,
    used: u32,
}

impl Default for SignalAlloc {
    fn default() -> Self {
        Self {
            free: !SIG_RESERVED,
            used: SIG_RESERVED,
        }
    }
}

impl SignalAlloc {
    /// Bits available for allocation
    pub fn free(&self) -> u32 {
        self.free
    }

    /// Bits currently allocated
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Allocate `mask`, or the lowest free bit when `mask` is zero
    ///
    /// Fails with `None` unless every requested bit is free.
    pub fn alloc(&mut self, mask: u32) -> Option<u32> {
        let bits = if mask == 0 {
            let lowest = self.free & self.free.wrapping_neg();
            if lowest == 0 {
                return None;
            }
            lowest
        } else if self.free & mask == mask {
            mask
        } else {
            return None;
        };
        self.free &= !bits;
        self.used |= bits;
        Some(bits)
    }

    /// Return bits to the free set; bits not allocated are ignored
    pub fn release(&mut self, mask: u32) {
        let foreign = mask & !self.used;
        if foreign != 0 {
            tracing::warn!(mask = foreign, "freeing signals that were not allocated");
        }
        let bits = mask & self.used;
        self.used &= !bits;
        self.free |= bits;
    }
}

/// Signal state shared between a task and everyone who signals it
#[derive(Debug)]
pub(crate) struct TaskSignals {
    task: TaskId,
    event: Event,
    table: Mutex<SignalAlloc>,
}

impl TaskSignals {
    pub fn new(task: TaskId) -> Self {
        Self {
            task,
            event: Event::new(),
            table: Mutex::new(SignalAlloc::default()),
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn signal(&self, mask: u32) {
        self.event.signal(mask);
    }

    pub fn alloc(&self, mask: u32) -> Option<u32> {
        self.table.lock().alloc(mask)
    }

    pub fn release(&self, mask: u32) {
        self.table.lock().release(mask);
    }

    pub fn used(&self) -> u32 {
        self.table.lock().used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_table() {
        let table = SignalAlloc::default();
        assert_eq!(table.used(), SIG_RESERVED);
        assert_eq!(table.free() & table.used(), 0);
        assert_eq!(table.free() | table.used(), u32::MAX);
    }

    #[test]
    fn test_alloc_lowest_free_bit() {
        let mut table = SignalAlloc::default();
        assert_eq!(table.alloc(0), Some(0x10));
        assert_eq!(table.alloc(0), Some(0x20));
        table.release(0x10);
        assert_eq!(table.alloc(0), Some(0x10));
    }

    #[test]
    fn test_alloc_explicit_mask() {
        let mut table = SignalAlloc::default();
        assert_eq!(table.alloc(0x300), Some(0x300));
        assert_eq!(table.alloc(0x100), None);
        assert_eq!(table.alloc(SIG_USER), None);
        assert_eq!(table.free() & table.used(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut table = SignalAlloc::default();
        for _ in 0..28 {
            assert!(table.alloc(0).is_some());
        }
        assert_eq!(table.alloc(0), None);
        assert_eq!(table.free(), 0);
    }

    #[test]
    fn test_release_ignores_foreign_bits() {
        let mut table = SignalAlloc::default();
        let bit = table.alloc(0).unwrap();
        table.release(bit | 0x8000_0000);
        assert_eq!(table, SignalAlloc::default());
    }
}
