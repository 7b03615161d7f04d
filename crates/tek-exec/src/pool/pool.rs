//! Puddle-based pool allocator

use super::memhead::{align_up, MemHead};
use super::region::Region;
use crate::memory::{MemBlock, MemManager, MEM_ALIGN};
use crate::{ExecError, ExecResult};
use std::ptr::NonNull;
use std::sync::Arc;
use tek_hal::HostPrimitives;

/// Fixed-size pool backing
pub enum FixedRegion {
    /// Allocate a region of this many bytes
    Size(usize),
    /// Use a caller-provided region
    Block(MemBlock),
}

/// Pool creation options
pub struct PoolConfig {
    /// Size of each regular puddle (default 1024)
    pub puddle_size: usize,

    /// Requests of at least this size get a dedicated puddle (default 256)
    pub threshold_size: usize,

    /// Let puddle and threshold sizes follow recent request sizes (default on)
    pub auto_adapt: bool,

    /// Best-fit instead of first-fit run selection (default off)
    pub low_frag: bool,

    /// Serve everything from one fixed region instead of growing puddles
    pub fixed: Option<FixedRegion>,

    /// Manager puddles are allocated from (None = host)
    pub backing: Option<MemManager>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            puddle_size: 1024,
            threshold_size: 256,
            auto_adapt: true,
            low_frag: false,
            fixed: None,
            backing: None,
        }
    }
}

impl PoolConfig {
    /// Pool with a given puddle size
    pub fn with_puddle_size(mut self, size: usize) -> Self {
        self.puddle_size = size;
        self
    }

    /// Pool with a given large-allocation threshold
    pub fn with_threshold(mut self, size: usize) -> Self {
        self.threshold_size = size;
        self
    }

    /// Enable or disable auto-adaptation
    pub fn with_auto_adapt(mut self, enabled: bool) -> Self {
        self.auto_adapt = enabled;
        self
    }

    /// Enable or disable best-fit selection
    pub fn with_low_frag(mut self, enabled: bool) -> Self {
        self.low_frag = enabled;
        self
    }

    /// Allocate puddles from `manager`
    pub fn with_backing(mut self, manager: MemManager) -> Self {
        self.backing = Some(manager);
        self
    }

    /// Fixed pool over a freshly allocated region of `size` bytes
    pub fn fixed(size: usize) -> Self {
        Self {
            fixed: Some(FixedRegion::Size(size)),
            ..Default::default()
        }
    }

    /// Fixed pool over a caller-provided region
    pub fn fixed_block(block: MemBlock) -> Self {
        Self {
            fixed: Some(FixedRegion::Block(block)),
            ..Default::default()
        }
    }
}

/// One backing region plus its free-run state
#[derive(Debug)]
struct Puddle {
    head: MemHead,
    large: bool,
    // declared after `head` so the bookkeeping goes before the memory
    region: Region,
}

/// Sub-allocator over a chain of puddles
///
/// Regular puddles sit at the front of the list, dedicated large puddles at
/// the tail. A puddle that becomes completely free is released at once.
pub struct Pool {
    host: Arc<dyn HostPrimitives>,
    backing: Option<MemManager>,
    puddles: Vec<Puddle>,
    puddle_size: usize,
    threshold_size: usize,
    auto_adapt: bool,
    low_frag: bool,
    fixed: bool,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("puddles", &self.puddles.len())
            .field("puddle_size", &self.puddle_size)
            .field("threshold_size", &self.threshold_size)
            .field("auto_adapt", &self.auto_adapt)
            .field("low_frag", &self.low_frag)
            .field("fixed", &self.fixed)
            .finish()
    }
}

impl Pool {
    /// Create a pool
    ///
    /// Fails if the puddle size is below the threshold, or if a fixed region
    /// cannot be obtained or is smaller than one allocation granule.
    pub fn new(host: Arc<dyn HostPrimitives>, config: PoolConfig) -> ExecResult<Self> {
        let mut pool = Self {
            host,
            backing: config.backing,
            puddles: Vec::new(),
            puddle_size: config.puddle_size,
            threshold_size: config.threshold_size,
            auto_adapt: config.auto_adapt,
            low_frag: config.low_frag,
            fixed: config.fixed.is_some(),
        };

        match config.fixed {
            Some(fixed) => {
                let region = match fixed {
                    FixedRegion::Block(block) => Region::from_block(block),
                    FixedRegion::Size(size) if size < MEM_ALIGN => {
                        return Err(ExecError::RegionTooSmall(size));
                    }
                    FixedRegion::Size(size) => {
                        Region::allocate(&pool.host, pool.backing.as_ref(), size)
                            .ok_or(ExecError::OutOfMemory(size))?
                    }
                };
                let head = MemHead::new(region.base(), region.size(), pool.low_frag)
                    .ok_or(ExecError::RegionTooSmall(region.size()))?;
                pool.auto_adapt = false;
                pool.puddles.push(Puddle {
                    head,
                    large: false,
                    region,
                });
            }
            None => {
                if pool.puddle_size < pool.threshold_size {
                    return Err(ExecError::InvalidPool {
                        puddle: pool.puddle_size,
                        threshold: pool.threshold_size,
                    });
                }
            }
        }

        Ok(pool)
    }

    /// Number of puddles currently held
    pub fn puddle_count(&self) -> usize {
        self.puddles.len()
    }

    /// Number of dedicated large puddles
    pub fn large_count(&self) -> usize {
        self.puddles.iter().filter(|p| p.large).count()
    }

    /// Current puddle size
    pub fn puddle_size(&self) -> usize {
        self.puddle_size
    }

    /// Current large-allocation threshold
    pub fn threshold_size(&self) -> usize {
        self.threshold_size
    }

    /// Whether the pool serves from one fixed region
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Free bytes across all puddles
    pub fn free_bytes(&self) -> usize {
        self.puddles.iter().map(|p| p.head.free_bytes()).sum()
    }

    /// Move threshold toward 4x the request and puddle size toward 8x threshold
    fn adapt(&mut self, size: usize) {
        let mut t = self.threshold_size as isize;
        t += (size as isize - (t >> 2)) >> 2;
        let mut p = self.puddle_size as isize;
        p += (t - (p >> 3)) >> 3;
        if t > p {
            p = t;
        }
        self.threshold_size = t.max(1) as usize;
        self.puddle_size = p.max(1) as usize;
    }

    fn new_puddle(&self, size: usize, large: bool) -> Option<Puddle> {
        let region = Region::allocate(&self.host, self.backing.as_ref(), size)?;
        let head = MemHead::new(region.base(), region.size(), self.low_frag)?;
        tracing::trace!(size, large, "new puddle");
        Some(Puddle {
            head,
            large,
            region,
        })
    }

    fn find(&self, addr: usize, size: usize) -> Option<usize> {
        self.puddles.iter().position(|p| p.head.contains(addr, size))
    }

    /// Flush an empty puddle, or move a busy one a step toward the front
    fn settle(&mut self, index: usize) {
        if self.puddles[index].head.is_unused() {
            let puddle = self.puddles.remove(index);
            tracing::trace!(size = puddle.region.size(), large = puddle.large, "flushed puddle");
        } else if index > 0 && !self.puddles[index - 1].large {
            self.puddles.swap(index - 1, index);
        }
    }

    /// Allocate `size` bytes
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if self.fixed {
            return self.puddles.first_mut()?.head.alloc(size);
        }

        if self.auto_adapt {
            self.adapt(size);
        }

        if size < self.threshold_size {
            for puddle in self.puddles.iter_mut() {
                if puddle.large {
                    break;
                }
                if let Some(mem) = puddle.head.alloc(size) {
                    return Some(mem);
                }
            }
            let puddle = self.new_puddle(align_up(self.puddle_size)?, false)?;
            self.puddles.insert(0, puddle);
            self.puddles[0].head.alloc(size)
        } else {
            let size = align_up(size)?;
            let puddle = self.new_puddle(size, true)?;
            self.puddles.push(puddle);
            self.puddles.last_mut()?.head.alloc(size)
        }
    }

    /// Return an allocation to the pool
    ///
    /// # Safety
    ///
    /// `mem` must have been returned by this pool for `size` bytes and not
    /// freed since.
    pub unsafe fn free(&mut self, mem: NonNull<u8>, size: usize) {
        if size == 0 {
            return;
        }
        if self.fixed {
            if let Some(puddle) = self.puddles.first_mut() {
                puddle.head.free(mem, size);
            }
            return;
        }
        match self.find(mem.as_ptr() as usize, size) {
            Some(index) => {
                self.puddles[index].head.free(mem, size);
                self.settle(index);
            }
            None => {
                tracing::error!(addr = ?mem, size, "free of memory not owned by pool");
                debug_assert!(false, "free of memory not owned by pool");
            }
        }
    }

    /// Resize an allocation
    ///
    /// `None`/zero old size allocates; a zero new size frees and returns
    /// `None`. On failure to grow the old block is left intact.
    ///
    /// # Safety
    ///
    /// A given `mem` must have been returned by this pool for `oldsize` bytes.
    pub unsafe fn realloc(
        &mut self,
        mem: Option<NonNull<u8>>,
        oldsize: usize,
        newsize: usize,
    ) -> Option<NonNull<u8>> {
        let mem = match mem {
            Some(mem) if oldsize != 0 => mem,
            _ => return self.alloc(newsize),
        };
        if newsize == 0 {
            self.free(mem, oldsize);
            return None;
        }
        if self.fixed {
            return self.puddles.first_mut()?.head.realloc(mem, oldsize, newsize);
        }

        let Some(index) = self.find(mem.as_ptr() as usize, oldsize) else {
            tracing::error!(addr = ?mem, oldsize, "realloc of memory not owned by pool");
            debug_assert!(false, "realloc of memory not owned by pool");
            return None;
        };

        if self.puddles[index].head.resize_in_place(mem, oldsize, newsize) {
            if self.puddles[index].large {
                let mut puddle = self.puddles.remove(index);
                puddle.large = false;
                self.puddles.insert(0, puddle);
            }
            return Some(mem);
        }

        let new = self.alloc(newsize)?;
        std::ptr::copy_nonoverlapping(mem.as_ptr(), new.as_ptr(), oldsize.min(newsize));
        self.free(mem, oldsize);
        Some(new)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        let busy = self.puddles.iter().filter(|p| !p.head.is_unused()).count();
        if busy > 0 && !self.fixed {
            tracing::debug!(puddles = busy, "pool destroyed with live allocations");
        }
    }
}
