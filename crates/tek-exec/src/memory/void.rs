//! The null manager

use super::{MemPolicy, MemoryManager};
use std::ptr::NonNull;

/// Manager on which every allocation fails
///
/// Produced for unsupported policy combinations.
#[derive(Debug, Default)]
pub struct VoidManager;

impl MemoryManager for VoidManager {
    fn policy(&self) -> MemPolicy {
        MemPolicy::VOID
    }

    fn alloc(&self, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn free(&self, _mem: NonNull<u8>, _size: usize) {}

    unsafe fn realloc(&self, _mem: NonNull<u8>, _oldsize: usize, _newsize: usize) -> Option<NonNull<u8>> {
        None
    }
}
