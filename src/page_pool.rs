//! The page source: ultimate leaf of every allocator chain.
//!
//! A [`PagePool`] owns a process-wide freelist of 2 MiB pages. Pages are
//! mapped from the OS on demand, prefaulted one byte per OS page so the
//! physical memory is committed up front, and are never returned to the OS
//! until the pool itself is dropped. The freelist is guarded by a short
//! spinlock held for a constant number of instructions.
//!
//! With NUMA interleaving enabled, freshly mapped pages are bound
//! round-robin across the machine's nodes (best effort), so worklist chunks
//! and other pooled storage spread across memory controllers.

use std::ptr::NonNull;

use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::{
    error::OutOfMemory,
    loom_testing::*,
    sys,
    util::{SpinLock, UsizePtr},
    worker::{self, MAX_WORKERS},
};
use std::sync::atomic::Ordering;

/// Size of one pool page (conventional huge page)
pub const PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Freelist link written into the first bytes of a free page
struct FreePage {
    next: Option<NonNull<FreePage>>,
}

struct FreeList {
    head: Option<NonNull<FreePage>>,
    len: usize,
}
// safety: the raw links are only followed while the pool's lock is held
unsafe impl Send for FreeList {}

/// Process-wide source of 2 MiB pages.
pub struct PagePool {
    free: SpinLock<FreeList>,
    /// Round-robin NUMA target for fresh mappings; unused when
    /// `n_nodes == 1` or interleaving is off
    next_node: AtomicUsize,
    interleave: bool,
    n_nodes: usize,
    total_mapped: AtomicUsize,
    mapped_by: [CachePadded<AtomicUsize>; MAX_WORKERS],
}

impl PagePool {
    pub fn new(interleave: bool) -> Self {
        let n_nodes = sys::num_numa_nodes();
        Self {
            free: SpinLock::new(FreeList { head: None, len: 0 }),
            next_node: AtomicUsize::new(0),
            interleave: interleave && n_nodes > 1,
            n_nodes,
            total_mapped: AtomicUsize::new(0),
            mapped_by: std::array::from_fn(|_| CachePadded::new(AtomicUsize::new(0))),
        }
    }

    /// Hands out one page, recycling a freed one if possible.
    pub fn page_alloc(&self) -> Result<NonNull<u8>, OutOfMemory> {
        {
            let mut fl = self.free.lock();
            if let Some(head) = fl.head {
                // safety: free pages hold a valid FreePage link while pooled
                fl.head = unsafe { head.as_ref().next };
                fl.len -= 1;
                return Ok(head.cast());
            }
        }
        self.map_fresh(worker::worker_id())
    }

    /// Returns a page to the pool. Never unmaps.
    ///
    /// # Safety
    /// `page` must have come from this pool's `page_alloc`/`pre_alloc` and
    /// no reference into it may survive this call.
    pub unsafe fn page_free(&self, page: NonNull<u8>) {
        let node: NonNull<FreePage> = page.cast();
        let mut fl = self.free.lock();
        unsafe { node.as_ptr().write(FreePage { next: fl.head }) };
        fl.head = Some(node);
        fl.len += 1;
    }

    /// Maps `n` pages up front and stocks the freelist, attributing them to
    /// worker `tid`.
    pub fn pre_alloc(&self, n: usize, tid: usize) -> Result<(), OutOfMemory> {
        for _ in 0..n {
            let page = self.map_fresh(tid)?;
            // safety: freshly mapped page, no outstanding references
            unsafe { self.page_free(page) };
        }
        Ok(())
    }

    fn map_fresh(&self, tid: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let page = sys::map_pages(PAGE_SIZE).ok_or(OutOfMemory)?;
        if self.interleave {
            let node = self.next_node.fetch_add(1, Ordering::Relaxed) % self.n_nodes;
            sys::bind_to_node(page, PAGE_SIZE, node);
        }
        sys::prefault(page, PAGE_SIZE, sys::OS_PAGE_SIZE);
        self.total_mapped.fetch_add(1, Ordering::Relaxed);
        self.mapped_by[tid].fetch_add(1, Ordering::Relaxed);
        tracing::event!(Level::TRACE, tid, page = ?UsizePtr::from(page.as_ptr()), "mapped fresh page");
        Ok(page)
    }

    /// Total pages mapped from the OS over the pool's lifetime
    pub fn pages_mapped(&self) -> usize {
        self.total_mapped.load(Ordering::Relaxed)
    }

    /// Pages mapped from the OS on behalf of worker `tid`
    pub fn pages_mapped_by(&self, tid: usize) -> usize {
        self.mapped_by[tid].load(Ordering::Relaxed)
    }

    /// Pages currently sitting in the freelist
    pub fn pages_free(&self) -> usize {
        self.free.lock().len
    }

    /// One-shot large mapping outside the freelist.
    pub fn large_alloc(&self, bytes: usize, prefault: bool) -> Result<NonNull<u8>, OutOfMemory> {
        let len = crate::util::roundto(bytes.max(1), sys::OS_PAGE_SIZE);
        let ptr = sys::map_pages(len).ok_or(OutOfMemory)?;
        if prefault {
            sys::prefault(ptr, len, sys::OS_PAGE_SIZE);
        }
        Ok(ptr)
    }

    /// # Safety
    /// `ptr`/`bytes` must match a prior `large_alloc`.
    pub unsafe fn large_free(&self, ptr: NonNull<u8>, bytes: usize) {
        let len = crate::util::roundto(bytes.max(1), sys::OS_PAGE_SIZE);
        sys::unmap_pages(ptr, len);
    }

    /// Maps `bytes` and binds consecutive OS pages round-robin to `nodes`.
    ///
    /// `nodes` selects the NUMA nodes to spread over (all nodes, or only the
    /// nodes hosting active workers). Binding is best effort; the mapping
    /// itself failing reports [`OutOfMemory`].
    pub fn interleaved_alloc(
        &self,
        bytes: usize,
        nodes: &[usize],
    ) -> Result<NonNull<u8>, OutOfMemory> {
        let len = crate::util::roundto(bytes.max(1), sys::OS_PAGE_SIZE);
        let ptr = sys::map_pages(len).ok_or(OutOfMemory)?;
        if nodes.len() > 1 {
            let mut off = 0;
            let mut i = 0;
            while off < len {
                // safety: off stays within the fresh mapping
                let page = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(off)) };
                sys::bind_to_node(page, sys::OS_PAGE_SIZE, nodes[i % nodes.len()]);
                off += sys::OS_PAGE_SIZE;
                i += 1;
            }
        }
        sys::prefault(ptr, len, sys::OS_PAGE_SIZE);
        Ok(ptr)
    }

    /// # Safety
    /// `ptr`/`bytes` must match a prior `interleaved_alloc`.
    pub unsafe fn interleaved_free(&self, ptr: NonNull<u8>, bytes: usize) {
        let len = crate::util::roundto(bytes.max(1), sys::OS_PAGE_SIZE);
        sys::unmap_pages(ptr, len);
    }
}

impl Drop for PagePool {
    fn drop(&mut self) {
        let fl = self.free.get_mut();
        let mut head = fl.head.take();
        while let Some(page) = head {
            // safety: pooled pages are exclusively ours at drop time
            head = unsafe { page.as_ref().next };
            sys::unmap_pages(page.cast(), PAGE_SIZE);
        }
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("pages_mapped", &self.pages_mapped())
            .field("interleave", &self.interleave)
            .field("n_nodes", &self.n_nodes)
            .finish()
    }
}

// the pool's lock and counters go through the loom shim; these tests run
// the real OS mapping path, so they are host-only
#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn page_recycles_through_freelist() {
        let pool = PagePool::new(false);
        let p1 = pool.page_alloc().unwrap();
        assert_eq!(pool.pages_mapped(), 1);
        unsafe { pool.page_free(p1) };
        assert_eq!(pool.pages_free(), 1);
        let p2 = pool.page_alloc().unwrap();
        // the freed page comes back, nothing new is mapped
        assert_eq!(p2, p1);
        assert_eq!(pool.pages_mapped(), 1);
        unsafe { pool.page_free(p2) };
    }

    #[test]
    fn pre_alloc_stocks_freelist() {
        let pool = PagePool::new(false);
        pool.pre_alloc(4, 0).unwrap();
        assert_eq!(pool.pages_free(), 4);
        assert_eq!(pool.pages_mapped(), 4);
        assert_eq!(pool.pages_mapped_by(0), 4);
        assert_eq!(pool.pages_mapped_by(1), 0);
        let _p = pool.page_alloc().unwrap();
        assert_eq!(pool.pages_mapped(), 4);
        assert_eq!(pool.pages_free(), 3);
        unsafe { pool.page_free(_p) };
    }

    #[test]
    fn pages_are_writable_end_to_end() {
        let pool = PagePool::new(false);
        let p = pool.page_alloc().unwrap();
        unsafe {
            p.as_ptr().write(0x5a);
            p.as_ptr().add(PAGE_SIZE - 1).write(0xa5);
            assert_eq!(p.as_ptr().read(), 0x5a);
            assert_eq!(p.as_ptr().add(PAGE_SIZE - 1).read(), 0xa5);
            pool.page_free(p);
        }
    }

    #[test]
    fn large_mapping_roundtrip() {
        let pool = PagePool::new(false);
        let bytes = 5 * sys::OS_PAGE_SIZE + 3;
        let p = pool.large_alloc(bytes, true).unwrap();
        unsafe {
            // prefaulted mapping is zeroed and writable end to end
            assert_eq!(p.as_ptr().read(), 0);
            p.as_ptr().add(bytes - 1).write(0x42);
            assert_eq!(p.as_ptr().add(bytes - 1).read(), 0x42);
            pool.large_free(p, bytes);
        }
    }

    #[test]
    fn interleaved_mapping_roundtrip() {
        let pool = PagePool::new(false);
        let bytes = 3 * sys::OS_PAGE_SIZE + 17;
        let p = pool.interleaved_alloc(bytes, &[0]).unwrap();
        unsafe {
            p.as_ptr().add(bytes - 1).write(1);
            pool.interleaved_free(p, bytes);
        }
    }

    #[test]
    fn concurrent_alloc_free_is_consistent() {
        let pool = PagePool::new(false);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..100 {
                        let p = pool.page_alloc().unwrap();
                        unsafe { pool.page_free(p) };
                    }
                });
            }
        });
        // every page ever mapped is back in the freelist
        assert_eq!(pool.pages_free(), pool.pages_mapped());
        assert!(pool.pages_mapped() <= 4);
    }
}
