//! Backing regions for puddles and static managers

use crate::memory::{MemBlock, MemManager};
use std::ptr::NonNull;
use std::sync::Arc;
use tek_hal::HostPrimitives;

/// Where a region's memory came from, and where it goes back to
enum RegionSource {
    Host(Arc<dyn HostPrimitives>),
    Manager(MemManager),
    Block(MemBlock),
}

/// An owned, granule-aligned span of raw memory
pub(crate) struct Region {
    base: NonNull<u8>,
    size: usize,
    source: RegionSource,
}

// SAFETY: a Region exclusively owns its span; the sources it releases to
// are themselves Send.
unsafe impl Send for Region {}
// SAFETY: `&Region` only exposes the base address and size; the span is
// never read or written through a shared reference.
unsafe impl Sync for Region {}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match self.source {
            RegionSource::Host(_) => "host",
            RegionSource::Manager(_) => "manager",
            RegionSource::Block(_) => "block",
        };
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("source", &source)
            .finish()
    }
}

impl Region {
    /// Take `size` bytes from the backing manager, or from the host when there is none
    pub fn allocate(
        host: &Arc<dyn HostPrimitives>,
        backing: Option<&MemManager>,
        size: usize,
    ) -> Option<Self> {
        match backing {
            Some(manager) => {
                let base = manager.alloc(size)?;
                Some(Self {
                    base,
                    size,
                    source: RegionSource::Manager(manager.clone()),
                })
            }
            None => {
                let base = host.raw_alloc(size)?;
                Some(Self {
                    base,
                    size,
                    source: RegionSource::Host(host.clone()),
                })
            }
        }
    }

    /// Adopt a caller-supplied block as the region
    pub fn from_block(block: MemBlock) -> Self {
        Self {
            base: block.as_non_null(),
            size: block.size(),
            source: RegionSource::Block(block),
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match &self.source {
            // SAFETY: the span was obtained from this host/manager with `size` bytes
            RegionSource::Host(host) => unsafe { host.raw_free(self.base, self.size) },
            RegionSource::Manager(manager) => unsafe { manager.free(self.base, self.size) },
            RegionSource::Block(block) => debug_assert_eq!(block.size(), self.size),
        }
    }
}
