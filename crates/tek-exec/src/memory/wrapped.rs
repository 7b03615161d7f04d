//! Manager layered on another manager

use super::{MemManager, MemPolicy, MemoryManager};
use std::ptr::NonNull;

/// Forwards every call to a parent manager it keeps alive
pub struct Wrapped {
    parent: MemManager,
}

impl Wrapped {
    /// Manager over `parent`
    pub fn new(parent: MemManager) -> Self {
        Self { parent }
    }
}

impl MemoryManager for Wrapped {
    fn policy(&self) -> MemPolicy {
        MemPolicy::MEM_MANAGER
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.parent.alloc(size)
    }

    fn alloc0(&self, size: usize) -> Option<NonNull<u8>> {
        self.parent.alloc0(size)
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        self.parent.free(mem, size)
    }

    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        self.parent.realloc(mem, oldsize, newsize)
    }
}
