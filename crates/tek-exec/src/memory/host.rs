//! Managers that pass straight through to the host heap

use super::{MemPolicy, MemoryManager};
use std::ptr::NonNull;
use std::sync::Arc;
use tek_hal::HostPrimitives;

/// Manager over the host heap
///
/// The host allocator is callable from any thread, so this manager also
/// stands in for the task-safe policy over the host.
pub struct HostManager {
    host: Arc<dyn HostPrimitives>,
    policy: MemPolicy,
}

impl HostManager {
    /// Manager reporting `policy`
    pub fn new(host: Arc<dyn HostPrimitives>, policy: MemPolicy) -> Self {
        Self { host, policy }
    }
}

impl MemoryManager for HostManager {
    fn policy(&self) -> MemPolicy {
        self.policy
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.host.raw_alloc(size)
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        self.host.raw_free(mem, size)
    }

    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        self.host.raw_realloc(mem, oldsize, newsize)
    }
}
