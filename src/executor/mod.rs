//! The for-each engine: binds a worklist to a user operator and runs it to
//! quiescence.
//!
//! [`Runtime`] owns everything process-wide (the page pool, the sized
//! allocator registry and the topology), so isolated runtimes can coexist in
//! one process. [`Runtime::for_each`] spawns one pinned worker per
//! configured core, splits the initial range across them, and drives the
//! worker loop: pop, invoke the operator (which may push through its
//! [`Ctx`]), repeat.
//!
//! Quiescence uses a two-phase detector: a shared active-worker count plus
//! the worklist's publication epoch. A worker that finds its worklist view
//! empty flushes its in-flight chunk, snapshots the epoch, retries one pop,
//! and only then decrements the count; it leaves only when the count hits
//! zero with the epoch unchanged since its snapshot, and re-joins the moment
//! the epoch moves. Any failure (operator error, allocation failure) flips a
//! drain flag first-wins: workers stop invoking the operator, the detector
//! runs to completion, and the recorded failure surfaces to the caller.

use std::{
    cell::Cell,
    marker::PhantomData,
    sync::{atomic::Ordering, Arc, Barrier},
};

#[cfg(not(loom))]
use crossbeam_utils::Backoff;
use crossbeam_utils::CachePadded;
use tracing::Level;

use crate::{
    error::ForEachError,
    loom_testing::*,
    page_pool::PagePool,
    sized::SizedHeapRegistry,
    sys,
    util::SpinLock,
    worker::{self, Topology, MAX_WORKERS},
    worklist::Worklist,
};

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of OS worker threads
    pub worker_count: usize,
    /// CPU index per worker; defaults to `0..worker_count`
    pub thread_affinity: Option<Vec<usize>>,
    /// Pages stocked into the pool freelist per worker before the loop
    pub page_prealloc_per_thread: usize,
    /// Spread pool pages across NUMA nodes
    pub numa_interleave: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: sys::online_cpus().min(MAX_WORKERS),
            thread_affinity: None,
            page_prealloc_per_thread: 0,
            numa_interleave: sys::num_numa_nodes() > 1,
        }
    }
}

impl Config {
    /// Defaults overridden by `AMORPH_WORKER_COUNT`,
    /// `AMORPH_THREAD_AFFINITY` (comma-separated CPU list),
    /// `AMORPH_PAGE_PREALLOC` and `AMORPH_NUMA_INTERLEAVE`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = std::env::var("AMORPH_WORKER_COUNT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            cfg.worker_count = n;
        }
        if let Some(list) = std::env::var("AMORPH_THREAD_AFFINITY")
            .ok()
            .and_then(|v| parse_affinity(&v))
        {
            cfg.thread_affinity = Some(list);
        }
        if let Some(n) = std::env::var("AMORPH_PAGE_PREALLOC")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            cfg.page_prealloc_per_thread = n;
        }
        if let Some(b) = std::env::var("AMORPH_NUMA_INTERLEAVE")
            .ok()
            .and_then(|v| parse_bool(&v))
        {
            cfg.numa_interleave = b;
        }
        cfg
    }
}

fn parse_affinity(s: &str) -> Option<Vec<usize>> {
    s.split(',')
        .map(|part| part.trim().parse().ok())
        .collect::<Option<Vec<usize>>>()
        .filter(|v| !v.is_empty())
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Aggregate result of a successful iteration.
#[derive(Clone, Debug, Default)]
pub struct IterationStats {
    /// Operator invocations that returned success
    pub processed: usize,
    /// Tasks pushed by operators through their context
    pub pushed: usize,
    /// Whether the iteration was stopped by [`Ctx::abort`]
    pub aborted: bool,
    /// Successful operator invocations per worker
    pub processed_per_worker: Vec<usize>,
}

/// Owner of all process-wide runtime state.
pub struct Runtime {
    config: Config,
    topo: Topology,
    pool: Arc<PagePool>,
    registry: SizedHeapRegistry,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        let topo = Topology::new(config.worker_count.clamp(1, MAX_WORKERS));
        let pool = Arc::new(PagePool::new(config.numa_interleave));
        let registry = SizedHeapRegistry::new(pool.clone());
        Self {
            config,
            topo,
            pool,
            registry,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn page_pool(&self) -> &Arc<PagePool> {
        &self.pool
    }

    pub fn registry(&self) -> &SizedHeapRegistry {
        &self.registry
    }

    /// NUMA nodes hosting active workers, as a mask for
    /// [`PagePool::interleaved_alloc`]
    pub fn active_nodes(&self) -> Vec<usize> {
        (0..self.topo.n_packages()).collect()
    }

    fn validate<T: Send, W: Worklist<T>>(&self, worklist: &W) -> Result<usize, String> {
        let cap = worklist.chunk_capacity();
        if !cap.is_power_of_two() || cap > 1024 {
            return Err(format!(
                "chunk capacity {} must be a power of two in 1..=1024",
                cap
            ));
        }
        let n = self.config.worker_count;
        if n == 0 || n > MAX_WORKERS {
            return Err(format!(
                "worker_count {} must be in 1..={}",
                n, MAX_WORKERS
            ));
        }
        if let Some(affinity) = &self.config.thread_affinity {
            if affinity.len() < n {
                return Err(format!(
                    "thread_affinity lists {} CPUs for {} workers",
                    affinity.len(),
                    n
                ));
            }
        }
        Ok(n)
    }

    /// Runs `operator` over `initial` and everything it transitively pushes,
    /// until the worklist is globally quiescent.
    ///
    /// Tasks are executed in whatever order the worklist's discipline and
    /// stealing produce; nothing more is promised across workers. A second
    /// iteration must not start on the same runtime before this one
    /// returns.
    pub fn for_each<T, W, I, A>(
        &self,
        worklist: &W,
        initial: I,
        operator: &A,
    ) -> Result<IterationStats, ForEachError<A::Error>>
    where
        T: Send + Sync + Clone,
        W: Worklist<T>,
        I: IntoIterator<Item = T>,
        A: Operator<T>,
    {
        let n = self
            .validate::<T, W>(worklist)
            .map_err(ForEachError::InvalidConfiguration)?;
        let initial: Vec<T> = initial.into_iter().collect();

        let trace_span = tracing::span!(Level::TRACE, "executor::for_each", workers = n, initial = initial.len());
        let _span_enter = trace_span.enter();

        let mut shared = EngineShared {
            wl: worklist,
            operator,
            config: &self.config,
            pool: &self.pool,
            term: TerminationDetector::new(n),
            barrier: Barrier::new(n),
            fault: FaultState::new(),
            abort: AtomicBool::new(false),
            processed: (0..n).map(|_| CachePadded::new(AtomicUsize::new(0))).collect(),
            pushed: AtomicUsize::new(0),
            _pd: PhantomData,
        };

        std::thread::scope(|s| {
            for tid in 0..n {
                let lo = tid * initial.len() / n;
                let hi = (tid + 1) * initial.len() / n;
                let slice = &initial[lo..hi];
                let shared = &shared;
                s.spawn(move || shared.worker_main(tid, slice));
            }
        });

        if let Some(err) = shared.fault.first.get_mut().take() {
            return Err(err);
        }
        let processed_per_worker: Vec<usize> = shared
            .processed
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        Ok(IterationStats {
            processed: processed_per_worker.iter().sum(),
            pushed: shared.pushed.load(Ordering::Relaxed),
            aborted: shared.abort.load(Ordering::Relaxed),
            processed_per_worker,
        })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("topology", &self.topo)
            .finish()
    }
}

/// Two-phase quiescence detector: a shared active-worker count checked
/// against the worklist's publication epoch.
pub(crate) struct TerminationDetector {
    active: AtomicUsize,
}

impl TerminationDetector {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            active: AtomicUsize::new(workers),
        }
    }

    /// Called by a worker whose view is empty, with the epoch snapshot it
    /// took before its final failed pop. Blocks until either global
    /// quiescence (returns true) or a publication to rejoin on (false; the
    /// worker is counted active again).
    pub(crate) fn probe(&self, snapshot: usize, epoch: impl Fn() -> usize) -> bool {
        // order: AcqRel so the final decrement synchronizes the deciding
        // worker with everything the others did
        self.active.fetch_sub(1, Ordering::AcqRel);
        #[cfg(not(loom))]
        let backoff = Backoff::new();
        loop {
            if epoch() != snapshot {
                // new work was published somewhere; rejoin
                self.active.fetch_add(1, Ordering::AcqRel);
                return false;
            }
            if self.active.load(Ordering::Acquire) == 0 {
                return true;
            }
            #[cfg(loom)]
            spin_hint();
            #[cfg(not(loom))]
            backoff.snooze();
        }
    }
}

/// First-wins failure record plus the drain flag that stops further
/// operator work.
struct FaultState<E> {
    drain: AtomicBool,
    first: SpinLock<Option<ForEachError<E>>>,
}

impl<E> FaultState<E> {
    fn new() -> Self {
        Self {
            drain: AtomicBool::new(false),
            first: SpinLock::new(None),
        }
    }

    fn record(&self, err: ForEachError<E>) {
        {
            let mut first = self.first.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        // order: the flag is advisory; the error itself is behind the lock
        self.drain.store(true, Ordering::Relaxed);
    }

    #[inline]
    fn draining(&self) -> bool {
        self.drain.load(Ordering::Relaxed)
    }
}

/// A user operator: invoked once per task, may emit new tasks through the
/// context.
///
/// Implementations are shared by every worker, so `&self` state must be
/// synchronized by the implementor (atomics, or nothing).
pub trait Operator<T: Send>: Sync {
    type Error: Send;

    fn process<W: Worklist<T>>(
        &self,
        task: T,
        ctx: &Ctx<'_, T, W, Self::Error>,
    ) -> Result<(), Self::Error>;
}

/// Operator-facing context: push new work, or stop the iteration.
pub struct Ctx<'a, T: Send, W: Worklist<T>, E> {
    wl: &'a W,
    fault: &'a FaultState<E>,
    abort_flag: &'a AtomicBool,
    pushed: Cell<usize>,
    _pd: PhantomData<fn(T)>,
}

impl<'a, T: Send, W: Worklist<T>, E> Ctx<'a, T, W, E> {
    /// Emits one new task into the running iteration. Safe from any
    /// operator; an allocation failure aborts the iteration.
    pub fn push(&self, task: T) {
        match self.wl.push(task) {
            Ok(()) => self.pushed.set(self.pushed.get() + 1),
            Err(oom) => self.fault.record(oom.into()),
        }
    }

    pub fn push_range(&self, tasks: impl IntoIterator<Item = T>) {
        for task in tasks {
            self.push(task);
        }
    }

    /// Cooperatively stops the iteration: the flag is consulted before each
    /// operator call, remaining tasks are discarded.
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::Relaxed);
    }

    /// Logical id of the worker running this operator
    pub fn worker_id(&self) -> usize {
        worker::worker_id()
    }
}

struct EngineShared<'s, T: Send, W: Worklist<T>, A: Operator<T>> {
    wl: &'s W,
    operator: &'s A,
    config: &'s Config,
    pool: &'s PagePool,
    term: TerminationDetector,
    barrier: Barrier,
    fault: FaultState<A::Error>,
    abort: AtomicBool,
    processed: Vec<CachePadded<AtomicUsize>>,
    pushed: AtomicUsize,
    _pd: PhantomData<fn(T)>,
}

impl<'s, T, W, A> EngineShared<'s, T, W, A>
where
    T: Send + Sync + Clone,
    W: Worklist<T>,
    A: Operator<T>,
{
    #[inline]
    fn stopped(&self) -> bool {
        self.fault.draining() || self.abort.load(Ordering::Relaxed)
    }

    fn worker_main(&self, tid: usize, initial_slice: &[T]) {
        let _id_guard = worker::install_worker_id(tid);
        let cpu = self
            .config
            .thread_affinity
            .as_ref()
            .map(|a| a[tid])
            .unwrap_or(tid);
        sys::pin_to_cpu(cpu);

        let trace_span = tracing::span!(Level::TRACE, "executor::worker", tid, cpu);
        let _span_enter = trace_span.enter();

        if self.config.page_prealloc_per_thread > 0 {
            if let Err(oom) = self.pool.pre_alloc(self.config.page_prealloc_per_thread, tid) {
                self.fault.record(oom.into());
            }
        }

        // everyone pushes their slice of the initial range, then the
        // barrier makes all of it visible before anyone starts popping
        if let Err(oom) = self
            .wl
            .push_initial(&mut initial_slice.iter().cloned())
        {
            self.fault.record(oom.into());
        }
        self.barrier.wait();

        let ctx = Ctx {
            wl: self.wl,
            fault: &self.fault,
            abort_flag: &self.abort,
            pushed: Cell::new(0),
            _pd: PhantomData,
        };
        let mut processed = 0usize;

        'outer: loop {
            // work phase
            while !self.stopped() {
                match self.wl.pop() {
                    Some(task) => self.run_one(task, &ctx, &mut processed),
                    None => break,
                }
            }

            // would-be-empty transition: publish in-flight work, then
            // snapshot before the final pop attempt so a publication between
            // that pop and the snapshot cannot be missed
            self.wl.flush();
            let snapshot = self.wl.publication_epoch();
            if !self.stopped() {
                if let Some(task) = self.wl.pop() {
                    self.run_one(task, &ctx, &mut processed);
                    continue 'outer;
                }
            }

            // probe phase
            if self.term.probe(snapshot, || self.wl.publication_epoch()) {
                break 'outer;
            }
        }

        tracing::event!(Level::TRACE, tid, processed, "worker quiescent");
        self.processed[tid].store(processed, Ordering::Relaxed);
        self.pushed.fetch_add(ctx.pushed.get(), Ordering::Relaxed);
    }

    #[inline]
    fn run_one(&self, task: T, ctx: &Ctx<'_, T, W, A::Error>, processed: &mut usize) {
        // cancellation and drain are consulted before each operator call;
        // a task popped after the flag flips is discarded
        if self.stopped() {
            return;
        }
        match self.operator.process(task, ctx) {
            Ok(()) => *processed += 1,
            Err(e) => self.fault.record(ForEachError::Operator(e)),
        }
    }
}

#[cfg(test)]
mod tests;
