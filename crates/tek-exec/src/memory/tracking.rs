//! Leak-tracking manager

use super::owner::OwnerCell;
use super::{MemPolicy, MemoryManager};
use rustc_hash::FxHashMap;
use std::ptr::NonNull;

/// Records every live block of an inner manager
///
/// Blocks still live when the manager is destroyed are freed and counted.
pub struct Tracking<M: MemoryManager> {
    inner: M,
    live: OwnerCell<FxHashMap<usize, usize>>,
}

impl<M: MemoryManager> Tracking<M> {
    /// Track blocks of `inner`
    pub fn new(inner: M) -> Self {
        Self {
            inner,
            live: OwnerCell::exclusive(FxHashMap::default()),
        }
    }
}

impl<M: MemoryManager> MemoryManager for Tracking<M> {
    fn policy(&self) -> MemPolicy {
        MemPolicy::TRACKING
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mem = self.inner.alloc(size)?;
        if self.live.with(|live| live.insert(mem.as_ptr() as usize, size)).is_none() {
            // SAFETY: just allocated from `inner` with `size` bytes
            unsafe { self.inner.free(mem, size) };
            return None;
        }
        Some(mem)
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        match self.live.with(|live| live.remove(&(mem.as_ptr() as usize))) {
            Some(Some(recorded)) => {
                debug_assert_eq!(recorded, size, "free with wrong size");
                self.inner.free(mem, recorded);
            }
            Some(None) => {
                tracing::error!(addr = ?mem, size, "free of a block this manager does not track");
                debug_assert!(false, "free of untracked block");
            }
            None => {
                tracing::error!(addr = ?mem, size, "free dropped on a contended tracking manager");
            }
        }
    }

    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        let addr = mem.as_ptr() as usize;
        self.live.with(|live| {
            live.remove(&addr)?;
            match self.inner.realloc(mem, oldsize, newsize) {
                Some(new) => {
                    live.insert(new.as_ptr() as usize, newsize);
                    Some(new)
                }
                None => {
                    live.insert(addr, oldsize);
                    None
                }
            }
        })?
    }

    fn outstanding(&self) -> Option<usize> {
        self.live.with(|live| live.len())
    }
}

impl<M: MemoryManager> Drop for Tracking<M> {
    fn drop(&mut self) {
        let live = std::mem::take(self.live.get_mut());
        if live.is_empty() {
            return;
        }
        tracing::warn!(pending = live.len(), "freed pending allocations");
        for (addr, size) in live {
            if let Some(mem) = NonNull::new(addr as *mut u8) {
                // SAFETY: every recorded block came from `inner` with its size
                unsafe { self.inner.free(mem, size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostManager;
    use std::sync::Arc;
    use tek_hal::StdHost;

    #[test]
    fn test_tracking_frees_leaks_on_drop() {
        let host = Arc::new(StdHost::new());
        let tracking = Tracking::new(HostManager::new(host.clone(), MemPolicy::MEM_MANAGER));
        let a = tracking.alloc(16).unwrap();
        let _b = tracking.alloc(32).unwrap();
        assert_eq!(tracking.outstanding(), Some(2));
        unsafe { tracking.free(a, 16) };
        assert_eq!(tracking.outstanding(), Some(1));
        assert_eq!(host.outstanding_blocks(), 1);
        drop(tracking);
        assert_eq!(host.outstanding_blocks(), 0);
    }

    #[test]
    fn test_tracking_realloc_follows_block() {
        let host = Arc::new(StdHost::new());
        let tracking = Tracking::new(HostManager::new(host.clone(), MemPolicy::MEM_MANAGER));
        let a = tracking.alloc(16).unwrap();
        let b = unsafe { tracking.realloc(a, 16, 4096) }.unwrap();
        assert_eq!(tracking.outstanding(), Some(1));
        unsafe { tracking.free(b, 4096) };
        assert_eq!(tracking.outstanding(), Some(0));
        assert_eq!(host.outstanding_bytes(), 0);
    }
}
