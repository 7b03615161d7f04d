//! Host primitives contract and the standard-library host

use crate::{HalError, HalResult, HostThread};
use once_cell::sync::Lazy;
use std::alloc::{alloc, dealloc, realloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// Alignment of every raw host allocation
pub const HOST_ALIGN: usize = 16;

/// Platform services consumed by the exec runtime
///
/// Implementations must be callable from any thread. Raw memory returned by
/// [`HostPrimitives::raw_alloc`] is aligned to [`HOST_ALIGN`] and must be
/// released with the same size it was allocated (or last reallocated) with.
pub trait HostPrimitives: Send + Sync {
    /// Start a native thread running `entry`
    fn spawn_thread(
        &self,
        name: &str,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> HalResult<HostThread>;

    /// Wait for a thread to terminate
    fn join_thread(&self, thread: HostThread) -> HalResult<()> {
        thread.join()
    }

    /// Allocate `size` bytes; `None` on exhaustion or zero size
    fn raw_alloc(&self, size: usize) -> Option<NonNull<u8>>;

    /// Release a block
    ///
    /// # Safety
    ///
    /// `mem` must come from this host with exactly `size` bytes.
    unsafe fn raw_free(&self, mem: NonNull<u8>, size: usize);

    /// Resize a block, preserving the common prefix
    ///
    /// On `None` the original block is untouched.
    ///
    /// # Safety
    ///
    /// `mem` must come from this host with exactly `oldsize` bytes.
    unsafe fn raw_realloc(
        &self,
        mem: NonNull<u8>,
        oldsize: usize,
        newsize: usize,
    ) -> Option<NonNull<u8>>;

    /// Microseconds since an arbitrary fixed origin
    fn monotonic_micros(&self) -> u64;
}

/// Host built on `std::thread`, `std::alloc` and `Instant`
///
/// Keeps counters of outstanding raw allocations so callers can observe
/// leaks and region release.
#[derive(Debug)]
pub struct StdHost {
    origin: Instant,
    outstanding_blocks: AtomicUsize,
    outstanding_bytes: AtomicUsize,
}

impl StdHost {
    /// Create a new host with zeroed counters
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            outstanding_blocks: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
        }
    }

    /// Number of raw blocks currently allocated
    pub fn outstanding_blocks(&self) -> usize {
        self.outstanding_blocks.load(Ordering::Acquire)
    }

    /// Number of raw bytes currently allocated
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Acquire)
    }

    fn layout(size: usize) -> Option<Layout> {
        Layout::from_size_align(size, HOST_ALIGN).ok()
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPrimitives for StdHost {
    fn spawn_thread(
        &self,
        name: &str,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> HalResult<HostThread> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(entry)
            .map_err(|source| HalError::ThreadSpawn {
                name: name.to_string(),
                source,
            })?;
        tracing::trace!(thread = name, "spawned host thread");
        Ok(HostThread::new(name, handle))
    }

    fn raw_alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Self::layout(size)?;
        let mem = NonNull::new(unsafe { alloc(layout) })?;
        self.outstanding_blocks.fetch_add(1, Ordering::AcqRel);
        self.outstanding_bytes.fetch_add(size, Ordering::AcqRel);
        Some(mem)
    }

    unsafe fn raw_free(&self, mem: NonNull<u8>, size: usize) {
        if let Some(layout) = Self::layout(size) {
            dealloc(mem.as_ptr(), layout);
            self.outstanding_blocks.fetch_sub(1, Ordering::AcqRel);
            self.outstanding_bytes.fetch_sub(size, Ordering::AcqRel);
        }
    }

    unsafe fn raw_realloc(
        &self,
        mem: NonNull<u8>,
        oldsize: usize,
        newsize: usize,
    ) -> Option<NonNull<u8>> {
        if newsize == 0 {
            return None;
        }
        let layout = Self::layout(oldsize)?;
        Self::layout(newsize)?;
        let new = NonNull::new(realloc(mem.as_ptr(), layout, newsize))?;
        self.outstanding_bytes.fetch_sub(oldsize, Ordering::AcqRel);
        self.outstanding_bytes.fetch_add(newsize, Ordering::AcqRel);
        Some(new)
    }

    fn monotonic_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

static DEFAULT_HOST: Lazy<Arc<StdHost>> = Lazy::new(|| Arc::new(StdHost::new()));

/// Process-wide standard host
pub fn default_host() -> Arc<dyn HostPrimitives> {
    DEFAULT_HOST.clone()
}
