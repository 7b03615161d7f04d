//! Message payload manager

use super::{MemPolicy, MemoryManager};
use dashmap::DashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use tek_hal::HostPrimitives;

/// Host-backed manager for message payloads
///
/// Used by every task at once. Live payloads are tracked so that messages
/// abandoned in flight are reclaimed, and reported, when the manager goes.
/// Payloads cannot be resized.
pub struct MessageManager {
    host: Arc<dyn HostPrimitives>,
    live: DashMap<usize, usize>,
}

impl MessageManager {
    /// Manager drawing from `host`
    pub fn new(host: Arc<dyn HostPrimitives>) -> Self {
        Self {
            host,
            live: DashMap::new(),
        }
    }
}

impl MemoryManager for MessageManager {
    fn policy(&self) -> MemPolicy {
        MemPolicy::MESSAGE
    }

    fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let mem = self.host.raw_alloc(size)?;
        self.live.insert(mem.as_ptr() as usize, size);
        Some(mem)
    }

    unsafe fn free(&self, mem: NonNull<u8>, size: usize) {
        match self.live.remove(&(mem.as_ptr() as usize)) {
            Some((_, recorded)) => self.host.raw_free(mem, recorded),
            None => {
                tracing::error!(addr = ?mem, size, "free of an unknown message");
                debug_assert!(false, "free of an unknown message");
            }
        }
    }

    unsafe fn realloc(&self, _mem: NonNull<u8>, oldsize: usize, newsize: usize) -> Option<NonNull<u8>> {
        tracing::warn!(oldsize, newsize, "messages cannot be resized");
        None
    }

    fn outstanding(&self) -> Option<usize> {
        Some(self.live.len())
    }
}

impl Drop for MessageManager {
    fn drop(&mut self) {
        if self.live.is_empty() {
            return;
        }
        tracing::warn!(pending = self.live.len(), "freed pending messages");
        for (addr, size) in std::mem::take(&mut self.live) {
            if let Some(mem) = NonNull::new(addr as *mut u8) {
                // SAFETY: recorded blocks came from the host with their size
                unsafe { self.host.raw_free(mem, size) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tek_hal::StdHost;

    #[test]
    fn test_message_manager_refuses_resize() {
        let host = Arc::new(StdHost::new());
        let manager = MessageManager::new(host.clone());
        let mem = manager.alloc(64).unwrap();
        assert!(unsafe { manager.realloc(mem, 64, 128) }.is_none());
        unsafe { manager.free(mem, 64) };
        assert_eq!(host.outstanding_blocks(), 0);
    }

    #[test]
    fn test_message_manager_reclaims_on_drop() {
        let host = Arc::new(StdHost::new());
        let manager = MessageManager::new(host.clone());
        manager.alloc(10).unwrap();
        manager.alloc(20).unwrap();
        assert_eq!(manager.outstanding(), Some(2));
        drop(manager);
        assert_eq!(host.outstanding_blocks(), 0);
    }
}
