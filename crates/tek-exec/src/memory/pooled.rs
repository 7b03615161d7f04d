//! Manager over a pool

use super::owner::OwnerCell;
use super::{MemPolicy, MemoryManager};
use crate::pool::Pool;
use std::ptr::NonNull;

/// Serves allocations from a [`Pool`] it owns
pub struct PooledManager {
    pool: OwnerCell<Pool>,
}

impl PooledManager {
    /// Take ownership of `pool`
    pub fn new(pool: Pool) -> Self {
        Self {
            pool: OwnerCell::exclusive(pool),
        }
    }

    /// Puddles currently held by the pool
    pub fn puddle_count(&self) -> usize {
        self.pool.with(|pool| pool.puddle_count()).unwrap_or(0)
    }
}

impl MemoryManager for PooledManager {
    fn policy(&self) -> MemPolicy {
        MemPolicy::POOLED
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.pool.with(|pool| pool.alloc(size))?
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        self.pool.with(|pool| pool.free(mem, size));
    }

    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        self.pool.with(|pool| pool.realloc(Some(mem), oldsize, newsize))?
    }
}
