//! Owned allocations

use super::MemManager;
use std::fmt;
use std::ptr::NonNull;

/// An allocation that remembers its size and the manager it came from
///
/// The bytes are zeroed on allocation and the block is returned to its
/// manager when dropped. The manager is kept alive for as long as any of its
/// blocks exist.
pub struct MemBlock {
    mem: NonNull<u8>,
    size: usize,
    manager: MemManager,
}

// SAFETY: a MemBlock exclusively owns its bytes; managers are Send + Sync.
unsafe impl Send for MemBlock {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for MemBlock {}

impl MemBlock {
    /// Allocate `size` zeroed bytes from `manager`
    pub fn alloc(manager: &MemManager, size: usize) -> Option<Self> {
        if size == 0 {
            tracing::warn!("alloc of zero bytes");
            return None;
        }
        let mem = manager.alloc0(size)?;
        Some(Self {
            mem,
            size,
            manager: manager.clone(),
        })
    }

    /// Allocate a copy of `bytes`
    pub fn from_bytes(manager: &MemManager, bytes: &[u8]) -> Option<Self> {
        let mut block = Self::alloc(manager, bytes.len())?;
        block.as_mut_slice().copy_from_slice(bytes);
        Some(block)
    }

    /// Size requested at allocation time
    pub fn size(&self) -> usize {
        self.size
    }

    /// Manager the block belongs to
    pub fn manager(&self) -> &MemManager {
        &self.manager
    }

    /// Start of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.mem.as_ptr()
    }

    /// Start of the block, writable
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mem.as_ptr()
    }

    /// Start of the block as a non-null pointer
    pub fn as_non_null(&self) -> NonNull<u8> {
        self.mem
    }

    /// Block contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `size` initialized bytes owned by this block
        unsafe { std::slice::from_raw_parts(self.mem.as_ptr(), self.size) }
    }

    /// Block contents, writable
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `size` initialized bytes exclusively owned by this block
        unsafe { std::slice::from_raw_parts_mut(self.mem.as_ptr(), self.size) }
    }

    /// Resize the block
    ///
    /// A zero size frees the block and yields `Ok(None)`. Growth is zeroed.
    /// When the manager cannot resize, the untouched block comes back as
    /// `Err`.
    pub fn resize(mut self, newsize: usize) -> Result<Option<Self>, Self> {
        if newsize == 0 {
            return Ok(None);
        }
        if newsize == self.size {
            return Ok(Some(self));
        }
        // SAFETY: the block came from this manager with `size` bytes
        match unsafe { self.manager.realloc(self.mem, self.size, newsize) } {
            Some(mem) => {
                if newsize > self.size {
                    // SAFETY: the tail lies inside the new allocation
                    unsafe { mem.as_ptr().add(self.size).write_bytes(0, newsize - self.size) };
                }
                self.mem = mem;
                self.size = newsize;
                Ok(Some(self))
            }
            None => Err(self),
        }
    }
}

impl Drop for MemBlock {
    fn drop(&mut self) {
        // SAFETY: the block came from this manager with `size` bytes
        unsafe { self.manager.free(self.mem, self.size) };
    }
}

impl fmt::Debug for MemBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemBlock")
            .field("mem", &self.mem)
            .field("size", &self.size)
            .field("policy", &self.manager.policy())
            .finish()
    }
}
