//! Free-run bookkeeping for one contiguous region
//!
//! A `MemHead` hands out aligned slices of a region it does not own. Free
//! space is tracked as address-ordered runs; frees coalesce with the
//! following run first, then with the preceding one.

use crate::memory::MEM_ALIGN;
use std::ptr::NonNull;

/// One free run, relative to the region base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeRun {
    pub offset: usize,
    pub size: usize,
}

/// Allocator state over a single region
#[derive(Debug)]
pub(crate) struct MemHead {
    base: NonNull<u8>,
    size: usize,
    free: usize,
    low_frag: bool,
    runs: Vec<FreeRun>,
}

// SAFETY: a MemHead only stores the address of a region whose lifetime is
// managed by its owner; it never dereferences that address itself.
unsafe impl Send for MemHead {}

/// Round `size` up to the allocation granule
pub(crate) fn align_up(size: usize) -> Option<usize> {
    size.checked_add(MEM_ALIGN - 1).map(|s| s & !(MEM_ALIGN - 1))
}

impl MemHead {
    /// Manage `size` bytes at `base`; the usable size is truncated to the granule
    pub fn new(base: NonNull<u8>, size: usize, low_frag: bool) -> Option<Self> {
        debug_assert_eq!(base.as_ptr() as usize % MEM_ALIGN, 0);
        let size = size & !(MEM_ALIGN - 1);
        if size == 0 {
            return None;
        }
        Some(Self {
            base,
            size,
            free: size,
            low_frag,
            runs: vec![FreeRun { offset: 0, size }],
        })
    }

    /// Usable capacity in bytes
    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Bytes currently free
    pub fn free_bytes(&self) -> usize {
        self.free
    }

    /// True when nothing is allocated
    pub fn is_unused(&self) -> bool {
        self.free == self.size
    }

    /// Free runs in address order
    #[cfg(test)]
    pub fn runs(&self) -> &[FreeRun] {
        &self.runs
    }

    /// Whether `[addr, addr + len)` lies inside this region
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr.saturating_add(len) <= start + self.size
    }

    fn offset_of(&self, mem: NonNull<u8>) -> usize {
        mem.as_ptr() as usize - self.base.as_ptr() as usize
    }

    fn at(&self, offset: usize) -> NonNull<u8> {
        // SAFETY: offsets handed to this function are always inside the region
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) }
    }

    /// Pick the run to carve from: first fit, or best fit with low fragmentation
    fn select(&self, size: usize) -> Option<usize> {
        if !self.low_frag {
            return self.runs.iter().position(|run| run.size >= size);
        }
        let mut best: Option<usize> = None;
        for (index, run) in self.runs.iter().enumerate() {
            if run.size == size {
                return Some(index);
            }
            if run.size > size && best.map_or(true, |b| run.size < self.runs[b].size) {
                best = Some(index);
            }
        }
        best
    }

    /// Allocate `size` bytes, or `None` if no run is large enough
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let size = align_up(size)?;
        if size > self.free {
            return None;
        }
        let index = self.select(size)?;
        let run = &mut self.runs[index];
        let offset = run.offset;
        if run.size == size {
            self.runs.remove(index);
        } else {
            run.offset += size;
            run.size -= size;
        }
        self.free -= size;
        Some(self.at(offset))
    }

    /// Return `[offset, offset + size)` to the free runs
    fn release(&mut self, offset: usize, size: usize) {
        let index = self.runs.partition_point(|run| run.offset < offset);

        let overlaps_next = index < self.runs.len() && offset + size > self.runs[index].offset;
        let overlaps_prev = index > 0 && {
            let prev = self.runs[index - 1];
            prev.offset + prev.size > offset
        };
        if overlaps_next || overlaps_prev {
            tracing::error!(offset, size, "free of a range that is already free");
            debug_assert!(false, "double free in memory region");
            return;
        }

        let mut run = FreeRun { offset, size };
        if index < self.runs.len() && offset + size == self.runs[index].offset {
            run.size += self.runs[index].size;
            self.runs.remove(index);
        }
        if index > 0 && self.runs[index - 1].offset + self.runs[index - 1].size == offset {
            self.runs[index - 1].size += run.size;
        } else {
            self.runs.insert(index, run);
        }
        self.free += size;
    }

    /// Give back an allocation of `size` bytes
    pub fn free(&mut self, mem: NonNull<u8>, size: usize) {
        let Some(size) = align_up(size) else { return };
        if size == 0 {
            return;
        }
        if !self.contains(mem.as_ptr() as usize, size) {
            tracing::error!(addr = ?mem, size, "free of memory outside region");
            debug_assert!(false, "free of memory outside region");
            return;
        }
        let offset = self.offset_of(mem);
        self.release(offset, size);
    }

    /// Resize without moving; `false` if the block cannot grow where it is
    pub fn resize_in_place(&mut self, mem: NonNull<u8>, oldsize: usize, newsize: usize) -> bool {
        let (Some(old), Some(new)) = (align_up(oldsize), align_up(newsize)) else {
            return false;
        };
        let offset = self.offset_of(mem);
        if new == old {
            return true;
        }
        if new < old {
            self.release(offset + new, old - new);
            return true;
        }

        let end = offset + old;
        let grow = new - old;
        let index = self.runs.partition_point(|run| run.offset < end);
        match self.runs.get_mut(index) {
            Some(run) if run.offset == end && run.size >= grow => {
                if run.size == grow {
                    self.runs.remove(index);
                } else {
                    run.offset += grow;
                    run.size -= grow;
                }
                self.free -= grow;
                true
            }
            _ => false,
        }
    }

    /// Resize, moving inside the region when growing in place fails
    pub fn realloc(
        &mut self,
        mem: NonNull<u8>,
        oldsize: usize,
        newsize: usize,
    ) -> Option<NonNull<u8>> {
        if self.resize_in_place(mem, oldsize, newsize) {
            return Some(mem);
        }
        let new = self.alloc(newsize)?;
        // SAFETY: both ranges lie in this region and the new block does not
        // overlap the old one, which is still allocated at this point.
        unsafe {
            std::ptr::copy_nonoverlapping(mem.as_ptr(), new.as_ptr(), oldsize.min(newsize));
        }
        self.free(mem, oldsize);
        Some(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};

    struct Backing {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl Backing {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, MEM_ALIGN).unwrap();
            let ptr = NonNull::new(unsafe { alloc(layout) }).unwrap();
            Self { ptr, layout }
        }
    }

    impl Drop for Backing {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    fn head(size: usize, low_frag: bool) -> (Backing, MemHead) {
        let backing = Backing::new(size);
        let head = MemHead::new(backing.ptr, size, low_frag).unwrap();
        (backing, head)
    }

    #[test]
    fn test_size_truncated_to_granule() {
        let backing = Backing::new(256);
        let head = MemHead::new(backing.ptr, 100, false).unwrap();
        assert_eq!(head.capacity(), 100 & !(MEM_ALIGN - 1));
        assert!(MemHead::new(backing.ptr, MEM_ALIGN - 1, false).is_none());
    }

    #[test]
    fn test_alloc_splits_front() {
        let (backing, mut head) = head(256, false);
        let a = head.alloc(1).unwrap();
        assert_eq!(a, backing.ptr);
        assert_eq!(head.free_bytes(), 256 - MEM_ALIGN);
        assert_eq!(head.runs(), &[FreeRun { offset: MEM_ALIGN, size: 256 - MEM_ALIGN }]);
    }

    #[test]
    fn test_exact_fit_removes_run() {
        let (_backing, mut head) = head(64, false);
        head.alloc(64).unwrap();
        assert!(head.runs().is_empty());
        assert_eq!(head.free_bytes(), 0);
        assert!(head.alloc(1).is_none());
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let (_backing, mut head) = head(4 * MEM_ALIGN, false);
        let a = head.alloc(MEM_ALIGN).unwrap();
        let b = head.alloc(MEM_ALIGN).unwrap();
        let c = head.alloc(MEM_ALIGN).unwrap();

        head.free(a, MEM_ALIGN);
        head.free(c, MEM_ALIGN);
        assert_eq!(head.runs().len(), 2);

        head.free(b, MEM_ALIGN);
        assert_eq!(head.runs(), &[FreeRun { offset: 0, size: 4 * MEM_ALIGN }]);
        assert!(head.is_unused());
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let (_backing, mut head) = head(8 * MEM_ALIGN, true);
        let a = head.alloc(3 * MEM_ALIGN).unwrap();
        let _b = head.alloc(MEM_ALIGN).unwrap();
        let c = head.alloc(MEM_ALIGN).unwrap();
        let _d = head.alloc(MEM_ALIGN).unwrap();
        head.free(a, 3 * MEM_ALIGN);
        head.free(c, MEM_ALIGN);

        // runs: [0..3], [4..5], [6..8]; best fit for one granule is the hole at 4
        let got = head.alloc(MEM_ALIGN).unwrap();
        assert_eq!(got, c);
    }

    #[test]
    fn test_first_fit_takes_lowest() {
        let (_backing, mut head) = head(8 * MEM_ALIGN, false);
        let a = head.alloc(3 * MEM_ALIGN).unwrap();
        let _b = head.alloc(MEM_ALIGN).unwrap();
        let c = head.alloc(MEM_ALIGN).unwrap();
        head.free(a, 3 * MEM_ALIGN);
        head.free(c, MEM_ALIGN);

        let got = head.alloc(MEM_ALIGN).unwrap();
        assert_eq!(got, a);
    }

    #[test]
    fn test_double_free_ignored() {
        let (_backing, mut head) = head(4 * MEM_ALIGN, false);
        let a = head.alloc(MEM_ALIGN).unwrap();
        let _b = head.alloc(MEM_ALIGN).unwrap();
        head.free(a, MEM_ALIGN);
        let free = head.free_bytes();
        if !cfg!(debug_assertions) {
            head.free(a, MEM_ALIGN);
            assert_eq!(head.free_bytes(), free);
        }
    }

    #[test]
    fn test_grow_in_place() {
        let (_backing, mut head) = head(8 * MEM_ALIGN, false);
        let a = head.alloc(MEM_ALIGN).unwrap();
        assert!(head.resize_in_place(a, MEM_ALIGN, 4 * MEM_ALIGN));
        assert_eq!(head.free_bytes(), 4 * MEM_ALIGN);
        let b = head.alloc(MEM_ALIGN).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 4 * MEM_ALIGN);
    }

    #[test]
    fn test_shrink_returns_tail() {
        let (_backing, mut head) = head(8 * MEM_ALIGN, false);
        let a = head.alloc(6 * MEM_ALIGN).unwrap();
        assert!(head.resize_in_place(a, 6 * MEM_ALIGN, 2 * MEM_ALIGN));
        assert_eq!(head.free_bytes(), 6 * MEM_ALIGN);
        assert_eq!(head.runs(), &[FreeRun { offset: 2 * MEM_ALIGN, size: 6 * MEM_ALIGN }]);
    }

    #[test]
    fn test_realloc_moves_and_copies() {
        let (_backing, mut head) = head(8 * MEM_ALIGN, false);
        let a = head.alloc(MEM_ALIGN).unwrap();
        let _wall = head.alloc(MEM_ALIGN).unwrap();
        unsafe { a.as_ptr().write_bytes(0x5a, MEM_ALIGN) };

        let moved = head.realloc(a, MEM_ALIGN, 3 * MEM_ALIGN).unwrap();
        assert_ne!(moved, a);
        let bytes = unsafe { std::slice::from_raw_parts(moved.as_ptr(), MEM_ALIGN) };
        assert!(bytes.iter().all(|&b| b == 0x5a));
        assert_eq!(head.free_bytes(), 4 * MEM_ALIGN);
    }
}
