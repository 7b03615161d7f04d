//! Manager over one fixed region

use super::owner::OwnerCell;
use super::{MemPolicy, MemoryManager};
use crate::pool::{MemHead, Region};
use std::ptr::NonNull;

/// Serves allocations from a single region that never grows
pub struct StaticManager {
    head: OwnerCell<MemHead>,
    region: Region,
}

impl StaticManager {
    pub(crate) fn new(region: Region, low_frag: bool) -> Option<Self> {
        let head = MemHead::new(region.base(), region.size(), low_frag)?;
        Some(Self {
            head: OwnerCell::exclusive(head),
            region,
        })
    }

    /// Bytes in the region
    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> usize {
        self.head.with(|head| head.free_bytes()).unwrap_or(0)
    }
}

impl MemoryManager for StaticManager {
    fn policy(&self) -> MemPolicy {
        MemPolicy::STATIC
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.head.with(|head| head.alloc(size))?
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        self.head.with(|head| head.free(mem, size));
    }

    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        self.head.with(|head| head.realloc(mem, oldsize, newsize))?
    }
}
