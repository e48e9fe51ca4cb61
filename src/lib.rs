//! Parallel runtime core for amorphous data-parallelism.
//!
//! This crate contains the three tightly coupled subsystems at the heart of
//! a for-each style graph-analytics runtime:
//!
//! * a scalable memory subsystem ([`page_pool`], [`heap`], [`sized`]) built
//!   from composable heap decorators over a process-wide pool of 2 MiB
//!   pages, with per-worker private instances so the allocation fast path is
//!   free of synchronization;
//! * a chunked, work-stealing worklist ([`worklist`]) that moves tasks
//!   between workers in fixed-capacity chunks ([`ring`]) to amortize the
//!   cost of inter-thread hand-off;
//! * a for-each engine ([`executor`]) that pins one worker per core, drives
//!   a user operator against the worklist, and detects global quiescence
//!   with a two-phase termination protocol.
//!
//! The subsystems are deliberately coupled: the worklist allocates its
//! chunks from the fixed-size allocator registry, and the engine owns the
//! per-worker identities that the per-thread heaps and worklist records are
//! keyed by. Everything process-wide (page pool, allocator registry,
//! topology) hangs off an explicitly constructed [`executor::Runtime`] so
//! tests can run isolated instances side by side.

pub mod error;
pub mod executor;
pub mod heap;
pub mod loom_testing;
pub mod page_pool;
pub mod ring;
pub mod sized;
pub mod sys;
pub mod util;
pub mod worker;
pub mod worklist;

pub use error::{ForEachError, OutOfMemory};
pub use executor::{Config, Ctx, IterationStats, Operator, Runtime};
pub use worklist::{
    ChunkedFifo, ChunkedLifo, DistChunkedBag, DistChunkedFifo, DistChunkedLifo, Worklist,
};
