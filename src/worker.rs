//! Logical worker identities and machine topology.
//!
//! Per-thread structures throughout the runtime (private heaps, worklist
//! records, page statistics) are keyed by a *logical* worker id, not the OS
//! thread id, so workers can be bound to arbitrary cores without aliasing.
//! The engine installs an id for each worker it spawns; a thread that never
//! had one installed (the bootstrap thread in tests, or a caller setting up
//! initial state before running an iteration) reads as worker 0.

use std::cell::Cell;

use crate::sys;

/// Absolute maximum number of workers.
///
/// Per-thread state is stored in fixed arrays so references handed out to
/// workers stay valid; 64 also lets bitfield bookkeeping fit in a `u64`.
pub const MAX_WORKERS: usize = 64;

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Logical id of the calling thread.
///
/// Threads without an installed id alias to worker 0; such threads must not
/// run concurrently with a worker that holds id 0 (the engine's calling
/// thread is blocked for the whole parallel region, so this holds).
#[inline]
pub fn worker_id() -> usize {
    WORKER_ID.with(|w| w.get().unwrap_or(0))
}

/// Installs `tid` as the calling thread's logical id for the lifetime of the
/// returned guard.
pub(crate) fn install_worker_id(tid: usize) -> WorkerIdGuard {
    assert!(tid < MAX_WORKERS);
    WORKER_ID.with(|w| {
        assert!(w.get().is_none(), "worker id installed twice");
        w.set(Some(tid));
    });
    WorkerIdGuard(())
}

pub(crate) struct WorkerIdGuard(());
impl Drop for WorkerIdGuard {
    fn drop(&mut self) {
        WORKER_ID.with(|w| w.set(None));
    }
}

/// Static worker → package map for one runtime instance.
///
/// A package is a NUMA locality group; workers are spread evenly across the
/// packages the machine reports. All of this is fixed at runtime
/// construction so the worklist can index per-package containers without
/// any synchronization.
#[derive(Clone, Copy, Debug)]
pub struct Topology {
    n_workers: usize,
    n_packages: usize,
    pkg_of: [u8; MAX_WORKERS],
}

impl Topology {
    pub fn new(n_workers: usize) -> Self {
        assert!(n_workers >= 1 && n_workers <= MAX_WORKERS);
        let n_packages = sys::num_numa_nodes().clamp(1, n_workers);
        let mut pkg_of = [0u8; MAX_WORKERS];
        for (tid, pkg) in pkg_of.iter_mut().enumerate().take(n_workers) {
            *pkg = (tid * n_packages / n_workers) as u8;
        }
        Self {
            n_workers,
            n_packages,
            pkg_of,
        }
    }

    #[inline]
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    #[inline]
    pub fn n_packages(&self) -> usize {
        self.n_packages
    }

    /// Package hosting worker `tid`
    #[inline]
    pub fn package_of(&self, tid: usize) -> usize {
        self.pkg_of[tid] as usize
    }
}
