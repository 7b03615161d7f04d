//! Memory managers
//!
//! Every allocation in the runtime goes through a [`MemoryManager`]. A
//! manager is built from a backing store (host heap, another manager, a fixed
//! region or a pool) and a [`MemPolicy`] selecting task-safety and tracking.
//! Unsupported combinations produce a void manager on which every allocation
//! fails, so callers only ever need to check for `None`.

mod block;
mod host;
mod message;
mod owner;
mod policy;
mod pooled;
mod static_mm;
mod task_safe;
mod tracking;
mod void;
mod wrapped;

pub use block::MemBlock;
pub use host::HostManager;
pub use message::MessageManager;
pub use policy::MemPolicy;
pub use pooled::PooledManager;
pub use static_mm::StaticManager;
pub use task_safe::TaskSafe;
pub use tracking::Tracking;
pub use void::VoidManager;
pub use wrapped::Wrapped;

use crate::pool::{FixedRegion, Pool, PoolConfig, Region};
use crate::{ExecError, ExecResult};
use std::ptr::NonNull;
use std::sync::Arc;
use tek_hal::HostPrimitives;

/// Alignment and size granule of managed allocations
pub const MEM_ALIGN: usize = (2 * std::mem::size_of::<usize>()).next_power_of_two();

/// Allocator interface shared by all policies
///
/// Sizes passed to `free` and `realloc` are the sizes the block was
/// allocated (or last resized) with. Exhaustion is reported as `None`.
pub trait MemoryManager: Send + Sync {
    /// Policy this manager implements
    fn policy(&self) -> MemPolicy;

    /// Allocate `size` bytes
    fn alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Allocate `size` zeroed bytes
    fn alloc0(&self, size: usize) -> Option<NonNull<u8>> {
        let mem = self.alloc(size)?;
        // SAFETY: fresh allocation of `size` bytes
        unsafe { mem.as_ptr().write_bytes(0, size) };
        Some(mem)
    }

    /// Return a block
    ///
    /// # Safety
    ///
    /// `mem` must have come from this manager with `size` bytes and must not
    /// be used afterwards.
    unsafe fn free(&self, mem: NonNull<u8>, size: usize);

    /// Resize a block to a non-zero size
    ///
    /// On `None` the old block is still valid.
    ///
    /// # Safety
    ///
    /// `mem` must have come from this manager with `oldsize` bytes.
    unsafe fn realloc(&self, mem: NonNull<u8>, oldsize: usize, newsize: usize)
        -> Option<NonNull<u8>>;

    /// Number of live blocks, for managers that track them
    fn outstanding(&self) -> Option<usize> {
        None
    }
}

/// Shared handle to a memory manager; the manager is destroyed with the last handle
pub type MemManager = Arc<dyn MemoryManager>;

/// A manager on which every allocation fails
pub fn void_manager() -> MemManager {
    Arc::new(VoidManager)
}

/// Backing store of a new manager
pub enum Backing {
    /// The host heap
    Host,
    /// Another manager
    Manager(MemManager),
    /// An existing pool, owned by the new manager
    Pool(Pool),
    /// A caller-provided region, owned by the new manager
    Region(MemBlock),
}

/// Sizing options for region and pool backed managers
pub struct MemOptions {
    /// Region size for a static manager over the host or another manager
    pub static_size: usize,
    /// Best-fit selection in static regions
    pub low_frag: bool,
    /// Pool configuration for pooled managers that build their own pool
    pub pool: PoolConfig,
}

impl Default for MemOptions {
    fn default() -> Self {
        Self {
            static_size: 0,
            low_frag: false,
            pool: PoolConfig::default(),
        }
    }
}

impl MemOptions {
    /// Options with a static region of `size` bytes
    pub fn with_static_size(size: usize) -> Self {
        Self {
            static_size: size,
            ..Default::default()
        }
    }

    /// Options with a pool configuration
    pub fn with_pool(pool: PoolConfig) -> Self {
        Self {
            pool,
            ..Default::default()
        }
    }
}

const SAFE_TRACKING: MemPolicy = MemPolicy::TASK_SAFE.union(MemPolicy::TRACKING);
const SAFE_STATIC: MemPolicy = MemPolicy::TASK_SAFE.union(MemPolicy::STATIC);
const SAFE_POOLED: MemPolicy = MemPolicy::TASK_SAFE.union(MemPolicy::POOLED);

/// Create a memory manager
///
/// Supported combinations:
///
/// | policy                   | backing                      |
/// |--------------------------|------------------------------|
/// | `VOID`                   | any                          |
/// | `MEM_MANAGER`            | host, manager                |
/// | `MESSAGE`                | host                         |
/// | `TRACKING`               | host, manager                |
/// | `TASK_SAFE`              | host, manager                |
/// | `TASK_SAFE \| TRACKING`  | host, manager                |
/// | `STATIC` (+`TASK_SAFE`)  | host, manager, region        |
/// | `POOLED` (+`TASK_SAFE`)  | host, manager, pool, region  |
///
/// Anything else yields a void manager. Errors are reserved for supported
/// combinations whose region or pool cannot be set up.
pub fn create_mem_manager(
    host: &Arc<dyn HostPrimitives>,
    backing: Backing,
    policy: MemPolicy,
    options: MemOptions,
) -> ExecResult<MemManager> {
    let host_mm = || HostManager::new(host.clone(), MemPolicy::MEM_MANAGER);

    let manager: MemManager = match (policy, backing) {
        (MemPolicy::VOID, _) => void_manager(),

        (MemPolicy::MEM_MANAGER, Backing::Host) => Arc::new(host_mm()),
        (MemPolicy::MEM_MANAGER, Backing::Manager(parent)) => Arc::new(Wrapped::new(parent)),

        (MemPolicy::MESSAGE, Backing::Host) => Arc::new(MessageManager::new(host.clone())),

        // host-backed tracking is always serialized
        (MemPolicy::TRACKING | SAFE_TRACKING, Backing::Host) => {
            Arc::new(TaskSafe::new(Tracking::new(host_mm())))
        }
        (MemPolicy::TRACKING, Backing::Manager(parent)) => {
            Arc::new(Tracking::new(Wrapped::new(parent)))
        }

        (MemPolicy::TASK_SAFE, Backing::Host) => {
            Arc::new(HostManager::new(host.clone(), MemPolicy::TASK_SAFE))
        }
        (MemPolicy::TASK_SAFE, Backing::Manager(parent)) => {
            Arc::new(TaskSafe::new(Wrapped::new(parent)))
        }

        (SAFE_TRACKING, Backing::Manager(parent)) => {
            Arc::new(TaskSafe::new(Tracking::new(Wrapped::new(parent))))
        }

        (MemPolicy::STATIC | SAFE_STATIC, backing @ (Backing::Host | Backing::Manager(_) | Backing::Region(_))) => {
            let region = static_region(host, backing, options.static_size)?;
            let size = region.size();
            let manager = StaticManager::new(region, options.low_frag)
                .ok_or(ExecError::RegionTooSmall(size))?;
            if policy.contains(MemPolicy::TASK_SAFE) {
                Arc::new(TaskSafe::new(manager))
            } else {
                Arc::new(manager)
            }
        }

        (MemPolicy::POOLED | SAFE_POOLED, backing) => {
            let pool = match backing {
                Backing::Pool(pool) => pool,
                Backing::Host => Pool::new(host.clone(), options.pool)?,
                Backing::Manager(parent) => Pool::new(host.clone(), options.pool.with_backing(parent))?,
                Backing::Region(block) => Pool::new(
                    host.clone(),
                    PoolConfig {
                        fixed: Some(FixedRegion::Block(block)),
                        ..options.pool
                    },
                )?,
            };
            let manager = PooledManager::new(pool);
            if policy.contains(MemPolicy::TASK_SAFE) {
                Arc::new(TaskSafe::new(manager))
            } else {
                Arc::new(manager)
            }
        }

        (policy, _) => {
            tracing::warn!(?policy, "unsupported memory manager policy, using void manager");
            void_manager()
        }
    };

    tracing::trace!(policy = ?manager.policy(), "created memory manager");
    Ok(manager)
}

fn static_region(
    host: &Arc<dyn HostPrimitives>,
    backing: Backing,
    size: usize,
) -> ExecResult<Region> {
    let region = match backing {
        Backing::Region(block) => {
            if block.size() <= MEM_ALIGN {
                return Err(ExecError::RegionTooSmall(block.size()));
            }
            return Ok(Region::from_block(block));
        }
        Backing::Manager(parent) => {
            if size <= MEM_ALIGN {
                return Err(ExecError::RegionTooSmall(size));
            }
            Region::allocate(host, Some(&parent), size)
        }
        _ => {
            if size <= MEM_ALIGN {
                return Err(ExecError::RegionTooSmall(size));
            }
            Region::allocate(host, None, size)
        }
    };
    region.ok_or(ExecError::OutOfMemory(size))
}
