//! Mutex-guarded wrapper

use super::{MemPolicy, MemoryManager};
use parking_lot::Mutex;
use std::ptr::NonNull;

/// Serializes every call into an inner manager
pub struct TaskSafe<M: MemoryManager> {
    inner: M,
    lock: Mutex<()>,
}

impl<M: MemoryManager> TaskSafe<M> {
    /// Guard `inner` with a mutex
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

impl<M: MemoryManager> MemoryManager for TaskSafe<M> {
    fn policy(&self) -> MemPolicy {
        self.inner.policy() | MemPolicy::TASK_SAFE
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let _guard = self.lock.lock();
        self.inner.alloc(size)
    }

    fn alloc0(&self, size: usize) -> Option<NonNull<u8>> {
        // zero before the lock is dropped
        let _guard = self.lock.lock();
        self.inner.alloc0(size)
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        let _guard = self.lock.lock();
        self.inner.free(mem, size)
    }

    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        let _guard = self.lock.lock();
        self.inner.realloc(mem, oldsize, newsize)
    }

    fn outstanding(&self) -> Option<usize> {
        let _guard = self.lock.lock();
        self.inner.outstanding()
    }
}
