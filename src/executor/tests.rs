#[cfg(not(loom))]
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};
#[cfg(loom)]
use std::sync::atomic::Ordering;

#[cfg(not(loom))]
use memory_stats::memory_stats;

use super::*;
#[cfg(not(loom))]
use crate::worklist::{ChunkedFifo, DistChunkedBag, DistChunkedFifo, DistChunkedLifo};

#[cfg(not(loom))]
fn config(workers: usize) -> Config {
    Config {
        worker_count: workers,
        thread_affinity: None,
        page_prealloc_per_thread: 0,
        numa_interleave: false,
    }
}

/// Counts invocations, nothing else
#[cfg(not(loom))]
struct CountingOp<'c> {
    counter: &'c AtomicUsize,
}
#[cfg(not(loom))]
impl<T: Send> Operator<T> for CountingOp<'_> {
    type Error = ();

    fn process<W: Worklist<T>>(&self, _task: T, _ctx: &Ctx<'_, T, W, ()>) -> Result<(), ()> {
        self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Does nothing at all
#[cfg(not(loom))]
struct NoopOp;
#[cfg(not(loom))]
impl<T: Send> Operator<T> for NoopOp {
    type Error = ();

    fn process<W: Worklist<T>>(&self, _task: T, _ctx: &Ctx<'_, T, W, ()>) -> Result<(), ()> {
        Ok(())
    }
}

#[test]
fn affinity_and_bool_parsing() {
    assert_eq!(parse_affinity("0, 2,4"), Some(vec![0, 2, 4]));
    assert_eq!(parse_affinity(""), None);
    assert_eq!(parse_affinity("1,x"), None);
    assert_eq!(parse_bool("1"), Some(true));
    assert_eq!(parse_bool("false"), Some(false));
    assert_eq!(parse_bool("maybe"), None);
}

#[cfg(not(loom))]
#[test]
fn empty_initial_range_terminates() {
    let rt = Runtime::new(config(2));
    let wl = ChunkedFifo::<u64, 8>::new(&rt);
    let stats = rt
        .for_each(&wl, std::iter::empty::<u64>(), &NoopOp)
        .unwrap();
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.pushed, 0);
    assert!(!stats.aborted);
}

#[cfg(not(loom))]
#[test]
fn single_worker_runs_every_task() {
    let rt = Runtime::new(config(1));
    let wl = ChunkedFifo::<u64, 8>::new(&rt);
    let counter = AtomicUsize::new(0);
    let stats = rt
        .for_each(&wl, 0..100u64, &CountingOp { counter: &counter })
        .unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), 100);
    assert_eq!(stats.processed, 100);
    assert_eq!(stats.processed_per_worker, vec![100]);
}

#[cfg(not(loom))]
#[test]
fn four_workers_share_a_hundred_thousand_tasks() {
    const NTASKS: usize = 100_000;
    let rt = Runtime::new(config(4));
    let wl = DistChunkedFifo::<usize, 8>::new(&rt);
    let counter = AtomicUsize::new(0);
    let stats = rt
        .for_each(&wl, 0..NTASKS, &CountingOp { counter: &counter })
        .unwrap();
    assert_eq!(counter.load(Ordering::Relaxed), NTASKS);
    assert_eq!(stats.processed, NTASKS);
    assert_eq!(stats.processed_per_worker.len(), 4);
    // every worker's private tail of the initial range is unstealable until
    // that worker runs, so all four must have popped something
    for (tid, &count) in stats.processed_per_worker.iter().enumerate() {
        assert!(count > 0, "worker {} never popped", tid);
    }
}

#[cfg(not(loom))]
#[test]
fn self_scheduling_countdown_reaches_quiescence() {
    // every task t spawns t-1 down to 1: sum 1..=N total invocations
    const N: u64 = 1000;

    struct CountdownOp;
    impl Operator<u64> for CountdownOp {
        type Error = ();

        fn process<W: Worklist<u64>>(&self, t: u64, ctx: &Ctx<'_, u64, W, ()>) -> Result<(), ()> {
            if t > 1 {
                ctx.push(t - 1);
            }
            Ok(())
        }
    }

    let rt = Runtime::new(config(4));
    let wl = DistChunkedLifo::<u64, 16>::new(&rt);
    let stats = rt.for_each(&wl, 1..=N, &CountdownOp).unwrap();
    assert_eq!(stats.processed as u64, N * (N + 1) / 2);
    assert_eq!(stats.pushed as u64, N * (N + 1) / 2 - N);
}

#[cfg(not(loom))]
#[test]
fn first_operator_error_wins_and_surfaces() {
    struct FaultyOp<'c> {
        invoked: &'c AtomicUsize,
    }
    impl Operator<u64> for FaultyOp<'_> {
        type Error = &'static str;

        fn process<W: Worklist<u64>>(
            &self,
            t: u64,
            _ctx: &Ctx<'_, u64, W, &'static str>,
        ) -> Result<(), &'static str> {
            self.invoked.fetch_add(1, Ordering::Relaxed);
            if t % 4096 == 567 {
                Err("operator rejected task")
            } else {
                Ok(())
            }
        }
    }

    let rt = Runtime::new(config(4));
    let wl = DistChunkedFifo::<u64, 8>::new(&rt);
    let invoked = AtomicUsize::new(0);
    let result = rt.for_each(&wl, 0..10_000u64, &FaultyOp { invoked: &invoked });
    match result {
        Err(ForEachError::Operator(msg)) => assert_eq!(msg, "operator rejected task"),
        other => panic!("expected operator error, got {:?}", other.map(|s| s.processed)),
    }
}

#[cfg(not(loom))]
#[test]
fn abort_stops_early_with_success() {
    struct AbortAfter<'c> {
        counter: &'c AtomicUsize,
        limit: usize,
    }
    impl Operator<usize> for AbortAfter<'_> {
        type Error = ();

        fn process<W: Worklist<usize>>(
            &self,
            _t: usize,
            ctx: &Ctx<'_, usize, W, ()>,
        ) -> Result<(), ()> {
            if self.counter.fetch_add(1, Ordering::Relaxed) >= self.limit {
                ctx.abort();
            }
            Ok(())
        }
    }

    let rt = Runtime::new(config(2));
    let wl = DistChunkedFifo::<usize, 8>::new(&rt);
    let counter = AtomicUsize::new(0);
    let stats = rt
        .for_each(
            &wl,
            0..1_000_000usize,
            &AbortAfter {
                counter: &counter,
                limit: 50,
            },
        )
        .unwrap();
    assert!(stats.aborted);
    assert!(stats.processed > 50);
    assert!(stats.processed < 1_000_000);
}

#[cfg(not(loom))]
#[test]
fn chunk_capacity_must_be_power_of_two() {
    let rt = Runtime::new(config(2));
    let wl = ChunkedFifo::<u64, 3>::new(&rt);
    let result = rt.for_each(&wl, 0..10u64, &NoopOp);
    assert!(matches!(result, Err(ForEachError::InvalidConfiguration(_))));
}

#[cfg(not(loom))]
#[test]
fn zero_workers_is_rejected() {
    let rt = Runtime::new(config(0));
    let wl = ChunkedFifo::<u64, 8>::new(&rt);
    let result = rt.for_each(&wl, 0..10u64, &NoopOp);
    assert!(matches!(result, Err(ForEachError::InvalidConfiguration(_))));
}

#[cfg(not(loom))]
#[test]
fn short_affinity_list_is_rejected() {
    let mut cfg = config(4);
    cfg.thread_affinity = Some(vec![0, 1]);
    let rt = Runtime::new(cfg);
    let wl = ChunkedFifo::<u64, 8>::new(&rt);
    let result = rt.for_each(&wl, 0..10u64, &NoopOp);
    assert!(matches!(result, Err(ForEachError::InvalidConfiguration(_))));
}

#[cfg(not(loom))]
#[test]
fn worklist_is_reusable_across_iterations() {
    let rt = Runtime::new(config(2));
    let wl = DistChunkedBag::<u64, 8>::new(&rt);
    for round in 0..3u64 {
        let counter = AtomicUsize::new(0);
        let stats = rt
            .for_each(
                &wl,
                round * 100..(round + 1) * 100,
                &CountingOp { counter: &counter },
            )
            .unwrap();
        assert_eq!(stats.processed, 100);
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }
}

#[cfg(not(loom))]
#[test]
fn operators_can_push_ranges() {
    // seed tasks carry a high bit; each fans out 10 plain tasks
    const SEED: u64 = 1 << 60;

    struct FanOutOp;
    impl Operator<u64> for FanOutOp {
        type Error = ();

        fn process<W: Worklist<u64>>(&self, t: u64, ctx: &Ctx<'_, u64, W, ()>) -> Result<(), ()> {
            if t & SEED != 0 {
                ctx.push_range(0..10u64);
            }
            Ok(())
        }
    }

    let rt = Runtime::new(config(2));
    let wl = DistChunkedFifo::<u64, 8>::new(&rt);
    let stats = rt
        .for_each(&wl, (0..100u64).map(|i| SEED | i), &FanOutOp)
        .unwrap();
    assert_eq!(stats.processed, 100 + 100 * 10);
    assert_eq!(stats.pushed, 1000);
}

#[cfg(loom)]
mod loom_tests {
    use super::*;
    use crate::loom_testing::AtomicUsize;

    fn try_pop(tasks: &AtomicUsize) -> bool {
        let mut n = tasks.load(Ordering::Acquire);
        loop {
            if n == 0 {
                return false;
            }
            match tasks.compare_exchange(n, n - 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(x) => n = x,
            }
        }
    }

    /// The worker loop's shape over a one-word work source: drain, snapshot,
    /// one last pop, then probe.
    fn worker(
        detector: &TerminationDetector,
        epoch: &AtomicUsize,
        tasks: &AtomicUsize,
        publish: bool,
    ) {
        if publish {
            // the task first, then the epoch bump, as publish_chunk does
            tasks.fetch_add(1, Ordering::Release);
            epoch.fetch_add(1, Ordering::Release);
        }
        loop {
            while try_pop(tasks) {}
            let snapshot = epoch.load(Ordering::Acquire);
            if try_pop(tasks) {
                continue;
            }
            if detector.probe(snapshot, || epoch.load(Ordering::Acquire)) {
                return;
            }
        }
    }

    #[test]
    fn termination_loom_no_lost_work() {
        loom::model(|| {
            let detector = &*Box::leak(Box::new(TerminationDetector::new(2)));
            let epoch = &*Box::leak(Box::new(AtomicUsize::new(0)));
            let tasks = &*Box::leak(Box::new(AtomicUsize::new(1)));

            let t1 = loom::thread::spawn(move || worker(detector, epoch, tasks, true));
            let t2 = loom::thread::spawn(move || worker(detector, epoch, tasks, false));
            t1.join().unwrap();
            t2.join().unwrap();

            // both workers reached quiescence, so no task may remain
            assert_eq!(tasks.load(Ordering::Acquire), 0);
        });
    }
}

#[cfg(not(loom))]
#[test]
fn bench_million_noop_tasks() {
    const NTASKS: usize = 1_000_000;
    const NTHREADS: usize = 8;

    let rt = Runtime::new(config(NTHREADS));
    let wl = DistChunkedBag::<usize, 64>::new(&rt);
    let start_mem = memory_stats();

    let start = Instant::now();
    let stats = rt.for_each(&wl, 0..NTASKS, &NoopOp).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(stats.processed, NTASKS);
    println!("Draining {} tasks took {:?}", NTASKS, elapsed);
    if let (Some(before), Some(after)) = (start_mem, memory_stats()) {
        println!(
            "Additional memory {:?} MB",
            (after.physical_mem.saturating_sub(before.physical_mem)) as f64 / 1024.0 / 1024.0
        );
    }
    println!("Pages mapped: {}", rt.page_pool().pages_mapped());
}
