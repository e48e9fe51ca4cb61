//! Composable heap building blocks.
//!
//! A [`Heap`] is a value with two operations, `allocate` and `deallocate`,
//! plus an advertised natural allocation size ([`Heap::ALLOC_SIZE`], 0 for
//! "variable"). Heaps compose as decorators: each mixin owns an inner heap
//! and adds one behavior (pooling, bump carving, locking, headers, zeroing,
//! per-worker privacy). The composition happens at the type level, so a
//! finished allocator like
//! `ThreadAwarePrivateHeap<FreeListHeap<BumpPtr<PageHeap>>>` is one flat
//! object with no dynamic dispatch anywhere on the allocation path.
//!
//! Failure model: only the leaves can fail ([`OutOfMemory`] from the page
//! pool or the system allocator); every decorator propagates with `?` and
//! never masks it.
//!
//! Single-owner mixins keep their state in `Cell`s and take `&self`; the
//! concurrent ones ([`SelfLockFreeListHeap`], [`LockedHeap`],
//! [`ThreadAwarePrivateHeap`]) document their synchronization individually.
//! Every pointer returned by a bump or block heap is aligned to 8 bytes;
//! types needing stricter alignment do not belong in these heaps.

use std::{
    alloc::{self, Layout},
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
    mem::size_of,
    ptr::NonNull,
    sync::{atomic::Ordering, Arc},
};

use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::{
    error::OutOfMemory,
    loom_testing::*,
    page_pool::{PagePool, PAGE_SIZE},
    util::{roundto, SpinLock, UsizePtr},
    worker::{self, MAX_WORKERS},
};

/// A heap: something that hands out and takes back raw blocks.
pub trait Heap {
    /// Natural size this heap serves; 0 means variable.
    const ALLOC_SIZE: usize;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory>;

    /// # Safety
    /// `ptr` must have come from this heap's `allocate` with the same
    /// `size`, and no reference into the block may survive this call.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);

    /// Releases pooled resources back to the inner heap. Default: nothing
    /// pooled.
    fn clear(&self) {}
}

// ---------------------------------------------------------------------------
// leaves

/// Leaf heap drawing 2 MiB pages from a [`PagePool`].
#[derive(Clone, Debug)]
pub struct PageHeap {
    pool: Arc<PagePool>,
}

impl PageHeap {
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PagePool {
        &self.pool
    }
}

impl Heap for PageHeap {
    const ALLOC_SIZE: usize = PAGE_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert!(size <= PAGE_SIZE);
        self.pool.page_alloc()
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        unsafe { self.pool.page_free(ptr) };
    }
}

/// Leaf heap over the process allocator, for oversize fallbacks and tests.
#[derive(Clone, Copy, Default, Debug)]
pub struct SystemHeap;

impl SystemHeap {
    fn layout(size: usize) -> Layout {
        // 8-byte alignment like every other heap here
        Layout::from_size_align(roundto(size.max(1), 8), 8).unwrap()
    }
}

impl Heap for SystemHeap {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        NonNull::new(unsafe { alloc::alloc(Self::layout(size)) }).ok_or(OutOfMemory)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { alloc::dealloc(ptr.as_ptr(), Self::layout(size)) };
    }
}

// ---------------------------------------------------------------------------
// freelists

/// Link living inside a pooled free block
struct FreeNode {
    next: Cell<Option<NonNull<FreeNode>>>,
}
const _: () = assert!(size_of::<FreeNode>() == 8);

/// Single-owner freelist: `deallocate` pools the block, `allocate` hands the
/// most recently pooled block back before asking the inner heap.
pub struct FreeListHeap<H: Heap> {
    head: Cell<Option<NonNull<FreeNode>>>,
    inner: H,
}
// safety: pooled blocks are exclusively owned; the heap may migrate between
// threads as a whole
unsafe impl<H: Heap + Send> Send for FreeListHeap<H> {}

impl<H: Heap> FreeListHeap<H> {
    pub fn new(inner: H) -> Self {
        Self {
            head: Cell::new(None),
            inner,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H: Heap> Heap for FreeListHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert!(size >= size_of::<FreeNode>());
        match self.head.get() {
            Some(node) => {
                // safety: pooled blocks hold a valid FreeNode
                self.head.set(unsafe { node.as_ref().next.get() });
                Ok(node.cast())
            }
            None => self.inner.allocate(size),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size >= size_of::<FreeNode>());
        let node: NonNull<FreeNode> = ptr.cast();
        unsafe {
            node.as_ptr().write(FreeNode {
                next: Cell::new(self.head.get()),
            })
        };
        self.head.set(Some(node));
    }

    fn clear(&self) {
        while let Some(node) = self.head.get() {
            // safety: the node came through deallocate and is exclusively
            // pooled; inner heaps under a freelist ignore the size argument
            unsafe {
                self.head.set(node.as_ref().next.get());
                self.inner.deallocate(node.cast(), H::ALLOC_SIZE);
            }
        }
    }
}

impl<H: Heap> Drop for FreeListHeap<H> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Free block link manipulated concurrently
struct AtomicFreeNode {
    next: AtomicPtr<AtomicFreeNode>,
}

/// Concurrent freelist: push is a pure CAS, pop serializes the read of
/// `head->next` with a short lock.
///
/// The lock is what prevents ABA: a node cannot be popped and recycled while
/// another popper is dereferencing it, because all poppers hold the lock.
/// Pushers never take it.
pub struct SelfLockFreeListHeap<H: Heap> {
    head: AtomicPtr<AtomicFreeNode>,
    pop_lock: SpinLock<()>,
    inner: H,
}
// safety: head is CAS-managed, pops and clear are serialized by pop_lock,
// and the inner heap is only reached on pop miss / clear
unsafe impl<H: Heap + Send> Send for SelfLockFreeListHeap<H> {}
unsafe impl<H: Heap + Sync> Sync for SelfLockFreeListHeap<H> {}

impl<H: Heap> SelfLockFreeListHeap<H> {
    pub fn new(inner: H) -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            pop_lock: SpinLock::new(()),
            inner,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

impl<H: Heap> Heap for SelfLockFreeListHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert!(size >= size_of::<AtomicFreeNode>());
        let guard = self.pop_lock.lock();
        // order: acquire pairs with the release CAS in deallocate so the
        // pushed node's next link is visible
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                drop(guard);
                return self.inner.allocate(size);
            }
            // the pop_lock protects this dereference: no other popper can
            // free `head` out from under us, pushers only prepend
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            // order: acquire on success as above; the failure value is
            // reused as the new head so it needs acquire too
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::Acquire, Ordering::Acquire)
            {
                Ok(_) => {
                    drop(guard);
                    // safety: we own the popped node now
                    return Ok(unsafe { NonNull::new_unchecked(head) }.cast());
                }
                Err(x) => head = x,
            }
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size >= size_of::<AtomicFreeNode>());
        let node = ptr.cast::<AtomicFreeNode>().as_ptr();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe {
                node.write(AtomicFreeNode {
                    next: AtomicPtr::new(head),
                })
            };
            // order: release so the write of node.next happens-before any
            // popper that acquires this head value
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(x) => head = x,
            }
        }
    }

    fn clear(&self) {
        // the lock keeps a concurrent popper from dereferencing nodes we
        // are about to return to the inner heap
        let guard = self.pop_lock.lock();
        // order: acquire the pushed next links before walking them
        let mut head = self.head.swap(std::ptr::null_mut(), Ordering::Acquire);
        drop(guard);
        while !head.is_null() {
            unsafe {
                let next = (*head).next.load(Ordering::Relaxed);
                self.inner
                    .deallocate(NonNull::new_unchecked(head).cast(), H::ALLOC_SIZE);
                head = next;
            }
        }
    }
}

impl<H: Heap> Drop for SelfLockFreeListHeap<H> {
    fn drop(&mut self) {
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// bump heaps

/// Link written at the start of each page a bump/block heap owns
#[repr(C)]
struct PageLink {
    next: Cell<Option<NonNull<PageLink>>>,
}
const PAGE_LINK_SIZE: usize = size_of::<PageLink>();
const _: () = assert!(PAGE_LINK_SIZE == 8);

fn push_page_link(head: &Cell<Option<NonNull<PageLink>>>, page: NonNull<u8>) {
    let link: NonNull<PageLink> = page.cast();
    // safety: the first 8 bytes of a fresh page are ours to use as the link
    unsafe {
        link.as_ptr().write(PageLink {
            next: Cell::new(head.get()),
        })
    };
    head.set(Some(link));
}

/// Returns every page on the chain to `inner`
fn clear_page_chain<H: Heap>(head: &Cell<Option<NonNull<PageLink>>>, inner: &H) {
    while let Some(page) = head.get() {
        // safety: pages on the chain are exclusively owned by this heap
        unsafe {
            head.set(page.as_ref().next.get());
            inner.deallocate(page.cast(), H::ALLOC_SIZE);
        }
    }
}

/// Bump-pointer heap: carves 8-byte-aligned slices out of the current page,
/// refilling from the inner heap. `deallocate` is a no-op; `clear` frees all
/// pages at once.
pub struct BumpPtr<H: Heap> {
    head: Cell<Option<NonNull<PageLink>>>,
    offset: Cell<usize>,
    inner: H,
}
// safety: the page chain is exclusively owned
unsafe impl<H: Heap + Send> Send for BumpPtr<H> {}

impl<H: Heap> BumpPtr<H> {
    pub fn new(inner: H) -> Self {
        assert!(H::ALLOC_SIZE > PAGE_LINK_SIZE);
        Self {
            head: Cell::new(None),
            offset: Cell::new(0),
            inner,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn refill(&self) -> Result<(), OutOfMemory> {
        let trace_span = tracing::span!(Level::TRACE, "heap::bump::refill");
        let _span_enter = trace_span.enter();
        let page = self.inner.allocate(H::ALLOC_SIZE)?;
        push_page_link(&self.head, page);
        self.offset.set(PAGE_LINK_SIZE);
        tracing::event!(Level::TRACE, page = ?UsizePtr::from(page.as_ptr()));
        Ok(())
    }

    #[inline]
    fn head_ptr(&self) -> *mut u8 {
        self.head.get().unwrap().as_ptr().cast()
    }

    /// Short-allocation variant: if `size` does not fit in the current
    /// page's remainder, yields the remainder instead. Returns the block and
    /// the number of bytes of it actually usable (at most `size`), for
    /// callers that can split a request across pages.
    pub fn allocate_short(&self, size: usize) -> Result<(NonNull<u8>, usize), OutOfMemory> {
        let aligned = roundto(size.max(1), 8).min(H::ALLOC_SIZE - PAGE_LINK_SIZE);
        if self.head.get().is_none() {
            self.refill()?;
        }
        let mut grant = aligned;
        let remaining = H::ALLOC_SIZE - self.offset.get();
        if remaining < aligned {
            if remaining >= 8 {
                grant = remaining;
            } else {
                self.refill()?;
            }
        }
        let offset = self.offset.get();
        self.offset.set(offset + grant);
        // safety: offset + grant <= H::ALLOC_SIZE
        let ptr = unsafe { NonNull::new_unchecked(self.head_ptr().add(offset)) };
        Ok((ptr, grant.min(size)))
    }
}

impl<H: Heap> Heap for BumpPtr<H> {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let aligned = roundto(size.max(1), 8);
        if aligned > H::ALLOC_SIZE - PAGE_LINK_SIZE {
            // requests beyond one page belong to the fallback variant
            return Err(OutOfMemory);
        }
        if self.head.get().is_none() || self.offset.get() + aligned > H::ALLOC_SIZE {
            self.refill()?;
        }
        let offset = self.offset.get();
        self.offset.set(offset + aligned);
        // safety: offset + aligned <= H::ALLOC_SIZE
        Ok(unsafe { NonNull::new_unchecked(self.head_ptr().add(offset)) })
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {}

    fn clear(&self) {
        clear_page_chain(&self.head, &self.inner);
        self.offset.set(0);
    }
}

impl<H: Heap> Drop for BumpPtr<H> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Header of an oversize block drawn from the system allocator
#[repr(C)]
struct FallbackLink {
    next: Cell<Option<NonNull<FallbackLink>>>,
    size: usize,
}
const FALLBACK_LINK_SIZE: usize = size_of::<FallbackLink>();

/// [`BumpPtr`] that sends requests too large for one page to the system
/// allocator, chaining the oversize blocks separately so `clear` can return
/// them.
pub struct BumpPtrWithMallocFallback<H: Heap> {
    bump: BumpPtr<H>,
    fallback_head: Cell<Option<NonNull<FallbackLink>>>,
}
// safety: both chains are exclusively owned
unsafe impl<H: Heap + Send> Send for BumpPtrWithMallocFallback<H> {}

impl<H: Heap> BumpPtrWithMallocFallback<H> {
    pub fn new(inner: H) -> Self {
        Self {
            bump: BumpPtr::new(inner),
            fallback_head: Cell::new(None),
        }
    }

    fn fallback_layout(aligned: usize) -> Layout {
        Layout::from_size_align(FALLBACK_LINK_SIZE + aligned, 8).unwrap()
    }
}

impl<H: Heap> Heap for BumpPtrWithMallocFallback<H> {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let aligned = roundto(size.max(1), 8);
        if FALLBACK_LINK_SIZE + aligned > H::ALLOC_SIZE {
            let raw = unsafe { alloc::alloc(Self::fallback_layout(aligned)) };
            let link: NonNull<FallbackLink> = NonNull::new(raw).ok_or(OutOfMemory)?.cast();
            unsafe {
                link.as_ptr().write(FallbackLink {
                    next: Cell::new(self.fallback_head.get()),
                    size: aligned,
                });
                self.fallback_head.set(Some(link));
                return Ok(NonNull::new_unchecked(raw.add(FALLBACK_LINK_SIZE)));
            }
        }
        self.bump.allocate(size)
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {}

    fn clear(&self) {
        self.bump.clear();
        while let Some(link) = self.fallback_head.get() {
            // safety: fallback blocks are exclusively chained here
            unsafe {
                let size = link.as_ref().size;
                self.fallback_head.set(link.as_ref().next.get());
                alloc::dealloc(link.as_ptr().cast(), Self::fallback_layout(size));
            }
        }
    }
}

impl<H: Heap> Drop for BumpPtrWithMallocFallback<H> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Sub-allocator stepping through a page in fixed `elem_size` slots.
///
/// Freed slots are never reused here; pair with a freelist for reuse.
pub struct BlockAlloc<H: Heap> {
    elem: usize,
    per_page: usize,
    head: Cell<Option<NonNull<PageLink>>>,
    index: Cell<usize>,
    inner: H,
}
// safety: the page chain is exclusively owned
unsafe impl<H: Heap + Send> Send for BlockAlloc<H> {}

impl<H: Heap> BlockAlloc<H> {
    pub fn new(elem_size: usize, inner: H) -> Self {
        let elem = roundto(elem_size.max(1), 8);
        let per_page = (H::ALLOC_SIZE - PAGE_LINK_SIZE) / elem;
        assert!(per_page >= 1);
        Self {
            elem,
            per_page,
            head: Cell::new(None),
            index: Cell::new(0),
            inner,
        }
    }

    pub fn elem_size(&self) -> usize {
        self.elem
    }
}

impl<H: Heap> Heap for BlockAlloc<H> {
    const ALLOC_SIZE: usize = 0;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        debug_assert!(roundto(size.max(1), 8) == self.elem);
        if self.head.get().is_none() || self.index.get() == self.per_page {
            let page = self.inner.allocate(H::ALLOC_SIZE)?;
            push_page_link(&self.head, page);
            self.index.set(0);
        }
        let i = self.index.get();
        self.index.set(i + 1);
        let base: *mut u8 = self.head.get().unwrap().as_ptr().cast();
        // safety: PAGE_LINK_SIZE + per_page * elem <= H::ALLOC_SIZE
        Ok(unsafe { NonNull::new_unchecked(base.add(PAGE_LINK_SIZE + i * self.elem)) })
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _size: usize) {}

    fn clear(&self) {
        clear_page_chain(&self.head, &self.inner);
        self.index.set(0);
    }
}

impl<H: Heap> Drop for BlockAlloc<H> {
    fn drop(&mut self) {
        self.clear();
    }
}

// ---------------------------------------------------------------------------
// wrappers

/// Serializes every call to the inner heap with a spinlock.
pub struct LockedHeap<H: Heap> {
    inner: SpinLock<H>,
}

impl<H: Heap> LockedHeap<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }
}

impl<H: Heap> Heap for LockedHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.inner.lock().allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.inner.lock().deallocate(ptr, size) };
    }

    fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Prepends an 8-aligned header of type `Hdr` to every allocation.
pub struct AddHeader<Hdr, H: Heap> {
    inner: H,
    _pd: PhantomData<fn() -> Hdr>,
}

impl<Hdr, H: Heap> AddHeader<Hdr, H> {
    /// Bytes between the header and the pointer handed out
    pub const OFFSET: usize = roundto(size_of::<Hdr>(), 8);

    pub fn new(inner: H) -> Self {
        assert!(std::mem::align_of::<Hdr>() <= 8);
        Self {
            inner,
            _pd: PhantomData,
        }
    }

    /// Header slot belonging to a pointer this heap handed out
    pub fn header_of(ptr: NonNull<u8>) -> NonNull<Hdr> {
        // safety: allocate placed the header OFFSET bytes below ptr
        unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(Self::OFFSET)).cast() }
    }
}

impl<Hdr, H: Heap> Heap for AddHeader<Hdr, H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let ptr = self.inner.allocate(size + Self::OFFSET)?;
        // safety: the inner block is at least OFFSET bytes
        Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(Self::OFFSET)) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe {
            let base = NonNull::new_unchecked(ptr.as_ptr().sub(Self::OFFSET));
            self.inner.deallocate(base, size + Self::OFFSET);
        }
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

/// Tags each allocation with a pointer back to the owning heap, so any
/// address can be traced home with [`OwnerTaggedHeap::owner_of`].
///
/// The heap must stay at a fixed address while tagged allocations are live
/// (boxed or otherwise pinned storage).
pub struct OwnerTaggedHeap<H: Heap> {
    inner: AddHeader<*const (), H>,
}

impl<H: Heap> OwnerTaggedHeap<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner: AddHeader::new(inner),
        }
    }

    fn tag(&self) -> *const () {
        self as *const Self as *const ()
    }

    /// The heap that allocated `ptr`, as an opaque address.
    ///
    /// # Safety
    /// `ptr` must be live and have come from an `OwnerTaggedHeap`.
    pub unsafe fn owner_of(ptr: NonNull<u8>) -> *const () {
        unsafe { AddHeader::<*const (), H>::header_of(ptr).as_ptr().read() }
    }
}

impl<H: Heap> Heap for OwnerTaggedHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let ptr = self.inner.allocate(size)?;
        unsafe {
            AddHeader::<*const (), H>::header_of(ptr)
                .as_ptr()
                .write(self.tag())
        };
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // a mismatched owner is a programmer bug, caught in debug builds
        debug_assert_eq!(
            unsafe { Self::owner_of(ptr) },
            self.tag(),
            "pointer deallocated on a heap that does not own it"
        );
        unsafe { self.inner.deallocate(ptr, size) };
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

/// Zero-fills every allocation.
pub struct ZeroOut<H: Heap> {
    inner: H,
}

impl<H: Heap> ZeroOut<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H: Heap> Heap for ZeroOut<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        let ptr = self.inner.allocate(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.inner.deallocate(ptr, size) };
    }

    fn clear(&self) {
        self.inner.clear();
    }
}

// ---------------------------------------------------------------------------
// per-worker privacy

/// One inner heap instance per possible worker; every request is routed to
/// the calling worker's instance, so the fast path has no synchronization.
///
/// A pointer allocated on worker `t` must be deallocated on worker `t`
/// unless an inner locked or self-locked layer says otherwise.
pub struct ThreadAwarePrivateHeap<H: Heap> {
    heaps: [CachePadded<UnsafeCell<H>>; MAX_WORKERS],
}
// safety: each slot is only ever touched by the worker whose logical id it
// is keyed by (clear takes &mut self and is therefore exclusive)
unsafe impl<H: Heap + Send> Send for ThreadAwarePrivateHeap<H> {}
unsafe impl<H: Heap + Send> Sync for ThreadAwarePrivateHeap<H> {}

impl<H: Heap> ThreadAwarePrivateHeap<H> {
    pub fn new(mut mk: impl FnMut(usize) -> H) -> Self {
        Self {
            heaps: std::array::from_fn(|tid| CachePadded::new(UnsafeCell::new(mk(tid)))),
        }
    }

    #[inline]
    fn local(&self) -> &H {
        // safety: slot worker_id() is owned by the calling worker
        unsafe { &*self.heaps[worker::worker_id()].get() }
    }

    /// Clears every per-worker instance. Exclusive access proves all workers
    /// are done with the heap.
    pub fn clear_all(&mut self) {
        for slot in self.heaps.iter_mut() {
            slot.get_mut().clear();
        }
    }

    /// Direct access to one worker's instance, for inspection in tests.
    pub fn instance(&mut self, tid: usize) -> &mut H {
        self.heaps[tid].get_mut()
    }
}

impl<H: Heap> Heap for ThreadAwarePrivateHeap<H> {
    const ALLOC_SIZE: usize = H::ALLOC_SIZE;

    fn allocate(&self, size: usize) -> Result<NonNull<u8>, OutOfMemory> {
        self.local().allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { self.local().deallocate(ptr, size) };
    }

    fn clear(&self) {
        // through the shared trait only the caller's own instance can be
        // cleared; clear_all covers the rest
        self.local().clear();
    }
}
