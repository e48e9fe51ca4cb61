//! Chunked work-stealing worklists.
//!
//! Tasks move between workers in chunks: each worker fills a private `next`
//! chunk and drains a private `cur` chunk, and only full (or flushed) chunks
//! travel through shared per-package containers. The shared containers are
//! the sole synchronization points, so the per-task fast path is two `Cell`
//! bumps inside a ring.
//!
//! The container flavor and the pop discipline are type parameters, mirrored
//! by the public aliases:
//!
//! * [`ChunkedFifo`] / [`ChunkedLifo`]: one global container;
//! * [`DistChunkedFifo`] / [`DistChunkedLifo`]: one container per package,
//!   stealing scans packages monotonically from the neighbor up;
//! * [`DistChunkedBag`]: LIFO pop over FIFO-published chunks, for callers
//!   agnostic to ordering.
//!
//! Chunks come from the [`sized`](crate::sized) allocator keyed to the chunk
//! type's size, and go back to it the moment they drain, on whichever worker
//! drained them; that is how chunk storage migrates to the workers that
//! consume fastest.

use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr::{self, addr_of_mut, NonNull},
    sync::atomic::Ordering,
};

use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::{
    error::OutOfMemory,
    executor::Runtime,
    loom_testing::*,
    ring::FixedSizeRing,
    sized::{FixedSizeAllocator, SizedHeapRegistry},
    util::{SpinLock, UsizePtr},
    worker::{self, Topology, MAX_WORKERS},
};

/// Fixed-capacity ring of tasks plus the intrusive link the shared
/// containers thread through it.
#[repr(C)]
pub struct Chunk<T, const N: usize> {
    next: AtomicPtr<Chunk<T, N>>,
    ring: FixedSizeRing<T, N>,
}

impl<T, const N: usize> Chunk<T, N> {
    /// # Safety
    /// `self_` must point at a fresh, suitably sized and aligned block.
    unsafe fn init(self_: *mut Self) {
        unsafe {
            addr_of_mut!((*self_).next).write(AtomicPtr::new(ptr::null_mut()));
            FixedSizeRing::init(addr_of_mut!((*self_).ring));
        }
    }
}

/// A concurrent container of chunks: the hand-off point between workers.
pub trait SharedChunks<T, const N: usize> {
    fn new() -> Self;
    /// Publishes a chunk; the caller gives up ownership.
    fn push(&self, chunk: NonNull<Chunk<T, N>>);
    /// Takes a chunk; the caller becomes its sole owner.
    fn pop(&self) -> Option<NonNull<Chunk<T, N>>>;
}

/// Treiber stack of chunks (LIFO hand-off).
///
/// Push is a pure CAS. Pop serializes the read of `head->next` with a short
/// lock, the same ABA discipline as the self-locked freelist: a chunk cannot
/// be popped, drained and recycled while another popper is dereferencing it,
/// because all poppers hold the lock.
pub struct ChunkStack<T, const N: usize> {
    head: AtomicPtr<Chunk<T, N>>,
    pop_lock: SpinLock<()>,
}
// safety: chunks are transferred whole; the CAS/lock discipline above makes
// the shared head safe to use from any thread
unsafe impl<T: Send, const N: usize> Send for ChunkStack<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for ChunkStack<T, N> {}

impl<T, const N: usize> SharedChunks<T, N> for ChunkStack<T, N> {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pop_lock: SpinLock::new(()),
        }
    }

    fn push(&self, chunk: NonNull<Chunk<T, N>>) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // safety: we own the chunk until the CAS below succeeds
            unsafe { chunk.as_ref().next.store(head, Ordering::Relaxed) };
            // order: release publishes the chunk's contents (and its next
            // link) to the popper's acquire
            match self.head.compare_exchange_weak(
                head,
                chunk.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => head = x,
            }
        }
    }

    fn pop(&self) -> Option<NonNull<Chunk<T, N>>> {
        let guard = self.pop_lock.lock();
        // order: acquire pairs with the pusher's release
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            // the pop_lock protects this dereference; pushers only prepend
            let next = unsafe { (*head).next.load(Ordering::Relaxed) };
            // order: acquire on both paths, the failure value becomes the
            // new head to dereference
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    drop(guard);
                    // safety: the CAS handed the head chunk to us
                    return Some(unsafe { NonNull::new_unchecked(head) });
                }
                Err(x) => head = x,
            }
        }
    }
}

/// Two-lock queue of chunks (FIFO hand-off).
///
/// Pushers serialize on the tail lock, poppers on the head lock; the only
/// word they can both touch is the last chunk's next link, which is atomic.
/// The sentinel is a link embedded in the queue header; `tail` is null
/// exactly when the queue is empty.
pub struct ChunkQueue<T, const N: usize> {
    head_lock: CachePadded<SpinLock<()>>,
    tail_lock: CachePadded<SpinLock<()>>,
    /// next link of the embedded sentinel: first chunk in the queue
    stub_next: AtomicPtr<Chunk<T, N>>,
    tail: AtomicPtr<Chunk<T, N>>,
}
// safety: see the locking discipline above
unsafe impl<T: Send, const N: usize> Send for ChunkQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for ChunkQueue<T, N> {}

impl<T, const N: usize> SharedChunks<T, N> for ChunkQueue<T, N> {
    fn new() -> Self {
        Self {
            head_lock: CachePadded::new(SpinLock::new(())),
            tail_lock: CachePadded::new(SpinLock::new(())),
            stub_next: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, chunk: NonNull<Chunk<T, N>>) {
        // safety: we own the chunk until it is linked in below
        unsafe { chunk.as_ref().next.store(ptr::null_mut(), Ordering::Relaxed) };
        let _t = self.tail_lock.lock();
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.is_null() {
            // order: release publishes the chunk contents to the popper
            self.stub_next.store(chunk.as_ptr(), Ordering::Release);
        } else {
            // safety: a non-null tail is owned by the queue
            unsafe { (*tail).next.store(chunk.as_ptr(), Ordering::Release) };
        }
        self.tail.store(chunk.as_ptr(), Ordering::Relaxed);
    }

    fn pop(&self) -> Option<NonNull<Chunk<T, N>>> {
        let _h = self.head_lock.lock();
        // order: acquire pairs with the pusher's release
        let first = self.stub_next.load(Ordering::Acquire);
        let first = NonNull::new(first)?;
        // safety: the head lock keeps other poppers off this chunk
        let next = unsafe { first.as_ref().next.load(Ordering::Acquire) };
        if next.is_null() {
            // possibly the tail; take the tail lock to close the race with
            // a pusher appending to this very chunk
            let _t = self.tail_lock.lock();
            let next = unsafe { first.as_ref().next.load(Ordering::Acquire) };
            if next.is_null() {
                self.tail.store(ptr::null_mut(), Ordering::Relaxed);
                self.stub_next.store(ptr::null_mut(), Ordering::Relaxed);
            } else {
                self.stub_next.store(next, Ordering::Relaxed);
            }
        } else {
            self.stub_next.store(next, Ordering::Relaxed);
        }
        Some(first)
    }
}

/// Per-worker worklist record: the two private chunk slots.
struct WlRecord<T, const N: usize> {
    /// chunk being drained (FIFO discipline only)
    cur: *mut Chunk<T, N>,
    /// chunk being filled; promoted to the shared container when full
    next: *mut Chunk<T, N>,
}

/// Common machinery of every chunked worklist flavor.
///
/// `Q` is the shared container type, `DISTRIBUTED` selects per-package
/// containers over one global one, `IS_STACK` selects LIFO pop, and
/// `CONCURRENT = false` degenerates to a single record and container for
/// strictly serial use.
pub struct ChunkedMaster<
    'r,
    T,
    Q,
    const N: usize,
    const DISTRIBUTED: bool,
    const IS_STACK: bool,
    const CONCURRENT: bool,
> where
    Q: SharedChunks<T, N>,
{
    heap: FixedSizeAllocator<'r>,
    topo: Topology,
    records: [CachePadded<UnsafeCell<WlRecord<T, N>>>; MAX_WORKERS],
    shared: Vec<CachePadded<Q>>,
    /// bumped after every chunk publication; consumed by termination
    /// detection
    epoch: AtomicUsize,
}

// safety: records are only touched by the worker whose id they are keyed by
// (Drop takes &mut self); the shared containers synchronize themselves
unsafe impl<'r, T, Q, const N: usize, const D: bool, const S: bool, const C: bool> Send
    for ChunkedMaster<'r, T, Q, N, D, S, C>
where
    T: Send,
    Q: SharedChunks<T, N> + Send,
{
}
unsafe impl<'r, T, Q, const N: usize, const D: bool, const S: bool, const C: bool> Sync
    for ChunkedMaster<'r, T, Q, N, D, S, C>
where
    T: Send,
    Q: SharedChunks<T, N> + Sync,
{
}

impl<'r, T, Q, const N: usize, const DISTRIBUTED: bool, const IS_STACK: bool, const CONCURRENT: bool>
    ChunkedMaster<'r, T, Q, N, DISTRIBUTED, IS_STACK, CONCURRENT>
where
    Q: SharedChunks<T, N>,
{
    pub fn new(rt: &'r Runtime) -> Self {
        Self::with_registry(rt.registry(), *rt.topology())
    }

    pub fn with_registry(registry: &'r SizedHeapRegistry, topo: Topology) -> Self {
        assert!(N >= 1);
        let n_shared = if DISTRIBUTED && CONCURRENT {
            topo.n_packages()
        } else {
            1
        };
        Self {
            heap: FixedSizeAllocator::new(registry, size_of::<Chunk<T, N>>()),
            topo,
            records: std::array::from_fn(|_| {
                CachePadded::new(UnsafeCell::new(WlRecord {
                    cur: ptr::null_mut(),
                    next: ptr::null_mut(),
                }))
            }),
            shared: (0..n_shared).map(|_| CachePadded::new(Q::new())).collect(),
            epoch: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn etid() -> usize {
        if CONCURRENT {
            worker::worker_id()
        } else {
            0
        }
    }

    /// # Safety
    /// Only the owning worker may call this; the record is private to it.
    #[allow(clippy::mut_from_ref)]
    unsafe fn record(&self) -> &mut WlRecord<T, N> {
        unsafe { &mut *self.records[Self::etid()].get() }
    }

    fn mk_chunk(&self) -> Result<NonNull<Chunk<T, N>>, OutOfMemory> {
        let raw: NonNull<Chunk<T, N>> = self.heap.allocate()?.cast();
        // safety: fresh block of size_of::<Chunk>, 8-aligned
        unsafe { Chunk::init(raw.as_ptr()) };
        Ok(raw)
    }

    /// # Safety
    /// The chunk must be exclusively owned by the caller.
    unsafe fn del_chunk(&self, chunk: NonNull<Chunk<T, N>>) {
        unsafe {
            // drop whatever tasks are still inside
            ptr::drop_in_place(addr_of_mut!((*chunk.as_ptr()).ring));
            self.heap.deallocate(chunk.cast());
        }
    }

    fn publish_chunk(&self, chunk: NonNull<Chunk<T, N>>) {
        let pkg = self.pkg_index();
        self.shared[pkg].push(chunk);
        // order: the bump is released after the chunk is visible in the
        // container, so a termination snapshot that includes it cannot miss
        // the chunk on a rescan
        self.epoch.fetch_add(1, Ordering::Release);
        tracing::event!(Level::TRACE, pkg, chunk = ?UsizePtr::from(chunk.as_ptr()), "published chunk");
    }

    #[inline]
    fn pkg_index(&self) -> usize {
        if DISTRIBUTED && CONCURRENT {
            self.topo.package_of(worker::worker_id())
        } else {
            0
        }
    }

    /// Takes a chunk from the local package's container, then scans the
    /// others in increasing id order from the neighbor up.
    fn steal_chunk(&self) -> Option<NonNull<Chunk<T, N>>> {
        let local = self.pkg_index();
        let n = self.shared.len();
        for i in 0..n {
            let pkg = (local + i) % n;
            if let Some(chunk) = self.shared[pkg].pop() {
                if pkg != local {
                    tracing::event!(Level::TRACE, from = pkg, chunk = ?UsizePtr::from(chunk.as_ptr()), "stole chunk");
                }
                return Some(chunk);
            }
        }
        None
    }

    fn pop_fifo(&self, r: &mut WlRecord<T, N>) -> Option<T> {
        if let Some(cur) = NonNull::new(r.cur) {
            // safety: cur is owned by this worker
            if let Some(v) = unsafe { cur.as_ref() }.ring.pop_front() {
                return Some(v);
            }
            unsafe { self.del_chunk(cur) };
            r.cur = ptr::null_mut();
        }
        match self.steal_chunk() {
            Some(chunk) => r.cur = chunk.as_ptr(),
            None => {
                r.cur = r.next;
                r.next = ptr::null_mut();
            }
        }
        let cur = NonNull::new(r.cur)?;
        // safety: cur is owned by this worker now
        unsafe { cur.as_ref() }.ring.pop_front()
    }

    fn pop_lifo(&self, r: &mut WlRecord<T, N>) -> Option<T> {
        if let Some(next) = NonNull::new(r.next) {
            // safety: next is owned by this worker
            if let Some(v) = unsafe { next.as_ref() }.ring.pop_back() {
                return Some(v);
            }
            unsafe { self.del_chunk(next) };
            r.next = ptr::null_mut();
        }
        let stolen = self.steal_chunk()?;
        r.next = stolen.as_ptr();
        // safety: the stolen chunk is owned by this worker now
        unsafe { stolen.as_ref() }.ring.pop_back()
    }
}

impl<'r, T, Q, const N: usize, const D: bool, const S: bool, const C: bool> Drop
    for ChunkedMaster<'r, T, Q, N, D, S, C>
where
    Q: SharedChunks<T, N>,
{
    fn drop(&mut self) {
        // reclaim every chunk, full or empty: private records first, then
        // whatever is still sitting in the shared containers
        let mut chunks: Vec<NonNull<Chunk<T, N>>> = Vec::new();
        for rec in self.records.iter_mut() {
            let r = rec.get_mut();
            chunks.extend(NonNull::new(r.cur));
            chunks.extend(NonNull::new(r.next));
            r.cur = ptr::null_mut();
            r.next = ptr::null_mut();
        }
        for q in self.shared.iter() {
            while let Some(chunk) = q.pop() {
                chunks.push(chunk);
            }
        }
        for chunk in chunks {
            // safety: exclusive access at drop time
            unsafe { self.del_chunk(chunk) };
        }
    }
}

/// The worklist interface the for-each engine drives.
pub trait Worklist<T: Send>: Sync {
    /// Adds one task; may allocate a chunk.
    fn push(&self, task: T) -> Result<(), OutOfMemory>;

    /// Adds many tasks; used by workers for their slice of the initial
    /// range.
    fn push_initial(&self, tasks: &mut dyn Iterator<Item = T>) -> Result<(), OutOfMemory> {
        for task in tasks {
            self.push(task)?;
        }
        Ok(())
    }

    /// Takes one task, in this worklist's advertised discipline.
    fn pop(&self) -> Option<T>;

    /// Publishes the caller's in-flight chunk so other workers can see it.
    /// Must be called at synchronization points before termination checks.
    fn flush(&self);

    /// Monotone counter of chunk publications.
    fn publication_epoch(&self) -> usize;

    /// Tasks per chunk, for configuration validation.
    fn chunk_capacity(&self) -> usize;
}

impl<'r, T, Q, const N: usize, const DISTRIBUTED: bool, const IS_STACK: bool, const CONCURRENT: bool>
    Worklist<T> for ChunkedMaster<'r, T, Q, N, DISTRIBUTED, IS_STACK, CONCURRENT>
where
    T: Send,
    Q: SharedChunks<T, N> + Send + Sync,
{
    fn push(&self, task: T) -> Result<(), OutOfMemory> {
        // safety: calling worker owns its record
        let r = unsafe { self.record() };
        let mut task = task;
        if let Some(next) = NonNull::new(r.next) {
            // safety: next is owned by this worker
            match unsafe { next.as_ref() }.ring.emplace_back(task) {
                Ok(_) => return Ok(()),
                Err(back) => task = back,
            }
            // chunk is full: promote it before starting a fresh one
            r.next = ptr::null_mut();
            self.publish_chunk(next);
        }
        let fresh = self.mk_chunk()?;
        r.next = fresh.as_ptr();
        // safety: fresh chunk is owned by this worker; N >= 1 so this fits
        let pushed = unsafe { fresh.as_ref() }.ring.emplace_back(task);
        debug_assert!(pushed.is_ok());
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        // safety: calling worker owns its record
        let r = unsafe { self.record() };
        if IS_STACK {
            self.pop_lifo(r)
        } else {
            self.pop_fifo(r)
        }
    }

    fn flush(&self) {
        // safety: calling worker owns its record
        let r = unsafe { self.record() };
        if let Some(next) = NonNull::new(r.next) {
            r.next = ptr::null_mut();
            self.publish_chunk(next);
        }
    }

    fn publication_epoch(&self) -> usize {
        // order: pairs with the release bump in publish_chunk
        self.epoch.load(Ordering::Acquire)
    }

    fn chunk_capacity(&self) -> usize {
        N
    }
}

/// Chunked FIFO: a global queue of chunks.
pub type ChunkedFifo<'r, T, const N: usize> =
    ChunkedMaster<'r, T, ChunkQueue<T, N>, N, false, false, true>;

/// Chunked LIFO: a global stack of chunks.
pub type ChunkedLifo<'r, T, const N: usize> =
    ChunkedMaster<'r, T, ChunkStack<T, N>, N, false, true, true>;

/// Distributed chunked FIFO: per-package queues, the scalable default.
pub type DistChunkedFifo<'r, T, const N: usize> =
    ChunkedMaster<'r, T, ChunkQueue<T, N>, N, true, false, true>;

/// Distributed chunked LIFO: per-package stacks.
pub type DistChunkedLifo<'r, T, const N: usize> =
    ChunkedMaster<'r, T, ChunkStack<T, N>, N, true, true, true>;

/// Distributed chunked bag: LIFO pop over FIFO-published chunks; no ordering
/// promised, cheapest hand-off.
pub type DistChunkedBag<'r, T, const N: usize> =
    ChunkedMaster<'r, T, ChunkQueue<T, N>, N, true, true, true>;

#[cfg(test)]
mod tests;
