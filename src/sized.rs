//! Size-classed allocators: the main scalable allocation path.
//!
//! A [`SizedHeapRegistry`] maps each size class to one shared
//! `per-worker-private(freelist(bump(page)))` stack, created lazily and kept
//! alive for the registry's lifetime. Lookups go through a two-level cache:
//! a thread-local map consulted with no synchronization, then the shared map
//! behind a spinlock. Entries are never evicted, so the thread-local cache
//! can hand out bare pointers into the boxed allocators.
//!
//! [`FixedSizeAllocator`] is the handle consumers hold (the worklist sizes
//! one to its chunk type); [`TypedFixedSizeAlloc`] is the typed facade over
//! it.

use std::{
    cell::RefCell,
    collections::HashMap,
    marker::PhantomData,
    mem::{align_of, size_of, MaybeUninit},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    error::OutOfMemory,
    heap::{BumpPtr, FreeListHeap, Heap, PageHeap, ThreadAwarePrivateHeap},
    page_pool::PagePool,
    util::{roundto, SpinLock},
};

/// The allocator stack kept per size class
pub type SizedHeap = ThreadAwarePrivateHeap<FreeListHeap<BumpPtr<PageHeap>>>;

/// Scalable variable-size allocations, one bump heap per worker.
///
/// Does not serve requests larger than a page; callers split those with
/// [`BumpPtr::allocate_short`] on their local instance.
pub type VariableSizeAllocator = ThreadAwarePrivateHeap<BumpPtr<PageHeap>>;

pub fn variable_size_allocator(pool: &Arc<PagePool>) -> VariableSizeAllocator {
    ThreadAwarePrivateHeap::new(|_tid| BumpPtr::new(PageHeap::new(pool.clone())))
}

/// Smallest size class holding `size` (multiples of 8, at least one free
/// node)
pub fn size_class(size: usize) -> usize {
    roundto(size.max(8), 8)
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // registry ids are process-unique, so entries from dropped registries
    // can never be confused with a live one
    static LOCAL_CACHE: RefCell<HashMap<(u64, usize), NonNull<SizedHeap>>> =
        RefCell::new(HashMap::new());
}

/// Process-wide (per [`Runtime`](crate::executor::Runtime)) mapping from
/// size class to its shared allocator.
pub struct SizedHeapRegistry {
    id: u64,
    pool: Arc<PagePool>,
    shared: SpinLock<HashMap<usize, Box<SizedHeap>>>,
}

impl SizedHeapRegistry {
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            shared: SpinLock::new(HashMap::new()),
        }
    }

    /// The shared allocator for `size`, creating it on first use.
    pub fn get(&self, size: usize) -> &SizedHeap {
        let class = size_class(size);
        let key = (self.id, class);
        if let Some(ptr) = LOCAL_CACHE.with(|c| c.borrow().get(&key).copied()) {
            // safety: the box this points into lives until the registry
            // drops, and the returned borrow is tied to &self
            return unsafe { &*ptr.as_ptr() };
        }

        let ptr = {
            let mut shared = self.shared.lock();
            let heap = shared.entry(class).or_insert_with(|| {
                let pool = &self.pool;
                Box::new(ThreadAwarePrivateHeap::new(|_tid| {
                    FreeListHeap::new(BumpPtr::new(PageHeap::new(pool.clone())))
                }))
            });
            NonNull::from(&**heap)
        };
        LOCAL_CACHE.with(|c| c.borrow_mut().insert(key, ptr));
        // safety: as above
        unsafe { &*ptr.as_ptr() }
    }

    /// Size classes instantiated so far
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SizedHeapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizedHeapRegistry")
            .field("id", &self.id)
            .field("classes", &self.len())
            .finish()
    }
}

/// Handle to the shared allocator of one size class.
#[derive(Clone, Copy)]
pub struct FixedSizeAllocator<'r> {
    heap: &'r SizedHeap,
    size: usize,
}

impl<'r> FixedSizeAllocator<'r> {
    pub fn new(registry: &'r SizedHeapRegistry, size: usize) -> Self {
        let size = size_class(size);
        Self {
            heap: registry.get(size),
            size,
        }
    }

    /// The size class served, in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocate(&self) -> Result<NonNull<u8>, OutOfMemory> {
        self.heap.allocate(self.size)
    }

    /// # Safety
    /// `ptr` must come from this allocator (same registry, same size class)
    /// on the calling worker, with no outstanding references.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        unsafe { self.heap.deallocate(ptr, self.size) };
    }
}

impl PartialEq for FixedSizeAllocator<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.heap, other.heap)
    }
}
impl Eq for FixedSizeAllocator<'_> {}

impl std::fmt::Debug for FixedSizeAllocator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSizeAllocator")
            .field("size", &self.size)
            .field("heap", &(self.heap as *const _))
            .finish()
    }
}

/// Typed facade over [`FixedSizeAllocator`]: slots for `T`, uninitialized on
/// allocate, never dropped on deallocate.
pub struct TypedFixedSizeAlloc<'r, T> {
    raw: FixedSizeAllocator<'r>,
    _pd: PhantomData<fn() -> T>,
}

impl<'r, T> TypedFixedSizeAlloc<'r, T> {
    pub fn new(registry: &'r SizedHeapRegistry) -> Self {
        // the sized stack only guarantees 8-byte alignment
        assert!(align_of::<T>() <= 8);
        Self {
            raw: FixedSizeAllocator::new(registry, size_of::<T>()),
            _pd: PhantomData,
        }
    }

    pub fn allocate(&self) -> Result<NonNull<MaybeUninit<T>>, OutOfMemory> {
        Ok(self.raw.allocate()?.cast())
    }

    /// # Safety
    /// As [`FixedSizeAllocator::deallocate`]; the slot's `T` is not dropped.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>) {
        unsafe { self.raw.deallocate(ptr.cast()) };
    }
}
