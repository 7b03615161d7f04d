//! Pool allocator
//!
//! A pool carves small allocations out of larger puddles obtained from the
//! host or from a backing memory manager. Requests at or above the threshold
//! get a puddle of their own. A fixed pool serves from one region and never
//! grows.

mod memhead;
#[allow(clippy::module_inception)]
mod pool;
mod region;

pub(crate) use memhead::MemHead;
pub use pool::{FixedRegion, Pool, PoolConfig};
pub(crate) use region::Region;
