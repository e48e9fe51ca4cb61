#[cfg(not(loom))]
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier,
    },
};

#[cfg(not(loom))]
use rand::{Rng, SeedableRng};

use super::*;
#[cfg(not(loom))]
use crate::executor::{Config, Runtime};

#[cfg(not(loom))]
fn runtime(workers: usize) -> Runtime {
    Runtime::new(Config {
        worker_count: workers,
        thread_affinity: None,
        page_prealloc_per_thread: 0,
        numa_interleave: false,
    })
}

#[cfg(not(loom))]
fn drain<T: Send, W: Worklist<T>>(wl: &W) -> Vec<T> {
    std::iter::from_fn(|| wl.pop()).collect()
}

#[cfg(not(loom))]
#[test]
fn fifo_pop_order_equals_push_order() {
    let rt = runtime(1);
    let wl = ChunkedFifo::<u32, 4>::new(&rt);
    for i in 1..=10 {
        wl.push(i).unwrap();
    }
    assert_eq!(drain(&wl), (1..=10).collect::<Vec<_>>());
    assert_eq!(wl.pop(), None);
}

#[cfg(not(loom))]
#[test]
fn lifo_pop_order_reverses_push_order() {
    let rt = runtime(1);
    let wl = ChunkedLifo::<u32, 4>::new(&rt);
    for i in 1..=10 {
        wl.push(i).unwrap();
    }
    // 10,9 from the open chunk, then 8..5 and 4..1 chunk by chunk
    assert_eq!(drain(&wl), (1..=10).rev().collect::<Vec<_>>());
    assert_eq!(wl.pop(), None);
}

#[cfg(not(loom))]
#[test]
fn bag_returns_every_task_some_order() {
    let rt = runtime(1);
    let wl = DistChunkedBag::<u32, 4>::new(&rt);
    for i in 1..=10 {
        wl.push(i).unwrap();
    }
    let mut got = drain(&wl);
    got.sort_unstable();
    assert_eq!(got, (1..=10).collect::<Vec<_>>());
}

#[cfg(not(loom))]
#[test]
fn conservation_under_random_traffic() {
    let rt = runtime(1);
    let wl = ChunkedFifo::<u64, 8>::new(&rt);
    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(7);
    let mut pushed: HashMap<u64, usize> = HashMap::new();
    let mut popped: HashMap<u64, usize> = HashMap::new();

    for _ in 0..5000 {
        if rng.gen::<f64>() < 0.55 {
            let v = rng.gen_range(0..64u64);
            wl.push(v).unwrap();
            *pushed.entry(v).or_default() += 1;
        } else if let Some(v) = wl.pop() {
            *popped.entry(v).or_default() += 1;
        }
    }
    for v in drain(&wl) {
        *popped.entry(v).or_default() += 1;
    }
    assert_eq!(pushed, popped);
}

#[cfg(not(loom))]
#[test]
fn publication_epoch_tracks_promotions_and_flush() {
    let rt = runtime(1);
    let wl = ChunkedFifo::<u32, 8>::new(&rt);
    for i in 0..8 {
        wl.push(i).unwrap();
    }
    // chunk not promoted until the next push needs a fresh one
    assert_eq!(wl.publication_epoch(), 0);
    wl.push(8).unwrap();
    assert_eq!(wl.publication_epoch(), 1);
    wl.flush();
    assert_eq!(wl.publication_epoch(), 2);
    // flush with no in-flight chunk publishes nothing
    wl.flush();
    assert_eq!(wl.publication_epoch(), 2);
    assert_eq!(drain(&wl).len(), 9);
}

#[cfg(not(loom))]
#[test]
fn drop_reclaims_unpopped_tasks() {
    struct Droppy(#[allow(dead_code)] u32, Arc<AtomicUsize>);
    impl Drop for Droppy {
        fn drop(&mut self) {
            self.1.fetch_add(1, Ordering::Relaxed);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let rt = runtime(1);
    {
        let wl = ChunkedFifo::<Droppy, 4>::new(&rt);
        for i in 0..10 {
            wl.push(Droppy(i, drops.clone())).unwrap();
        }
        for _ in 0..3 {
            wl.pop().unwrap();
        }
        assert_eq!(drops.load(Ordering::Relaxed), 3);
        // 7 tasks still live across cur/next/shared chunks
    }
    assert_eq!(drops.load(Ordering::Relaxed), 10);
}

#[cfg(not(loom))]
#[test]
fn serial_specialization_degenerates_to_one_record() {
    let rt = runtime(1);
    let wl: ChunkedMaster<'_, u32, ChunkQueue<u32, 4>, 4, false, false, false> =
        ChunkedMaster::with_registry(rt.registry(), *rt.topology());
    // a single record and a single container regardless of caller identity
    for i in 0..20 {
        wl.push(i).unwrap();
    }
    assert_eq!(drain(&wl), (0..20).collect::<Vec<_>>());
}

#[cfg(not(loom))]
#[test]
fn flushed_work_is_stealable() {
    let rt = runtime(2);
    let wl = DistChunkedFifo::<usize, 8>::new(&rt);
    let barrier = Barrier::new(2);

    std::thread::scope(|s| {
        let producer = s.spawn(|| {
            let _guard = crate::worker::install_worker_id(0);
            for i in 0..100 {
                wl.push(i).unwrap();
            }
            wl.flush();
            barrier.wait();
        });
        let consumer = s.spawn(|| {
            let _guard = crate::worker::install_worker_id(1);
            barrier.wait();
            let mut got = drain(&wl);
            got.sort_unstable();
            got
        });
        producer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), (0..100).collect::<Vec<_>>());
    });
}

#[cfg(loom)]
mod loom_tests {
    use super::*;

    fn chunk_with(val: u32) -> NonNull<Chunk<u32, 4>> {
        let chunk = Box::leak(Box::new(Chunk {
            next: AtomicPtr::new(ptr::null_mut()),
            ring: FixedSizeRing::new(),
        }));
        chunk.ring.push_back(val).unwrap();
        NonNull::from(chunk)
    }

    // the chunk itself stays leaked, like the rest of the model state
    fn take(chunk: NonNull<Chunk<u32, 4>>) -> u32 {
        unsafe { chunk.as_ref() }.ring.pop_front().unwrap()
    }

    #[test]
    fn chunk_stack_loom_push_pop() {
        loom::model(|| {
            let stack = &*Box::leak(Box::new(ChunkStack::<u32, 4>::new()));
            let t1 = loom::thread::spawn(move || {
                stack.push(chunk_with(1));
                stack.pop().map(take)
            });
            let t2 = loom::thread::spawn(move || {
                stack.push(chunk_with(2));
                stack.pop().map(take)
            });
            let mut got: Vec<u32> = [t1.join().unwrap(), t2.join().unwrap()]
                .into_iter()
                .flatten()
                .collect();
            while let Some(chunk) = stack.pop() {
                got.push(take(chunk));
            }
            got.sort_unstable();
            // every chunk handed off exactly once, in any interleaving
            assert_eq!(got, vec![1, 2]);
        });
    }

    #[test]
    fn chunk_queue_loom_push_pop() {
        loom::model(|| {
            let queue = &*Box::leak(Box::new(ChunkQueue::<u32, 4>::new()));
            let t1 = loom::thread::spawn(move || {
                queue.push(chunk_with(1));
                queue.pop().map(take)
            });
            let t2 = loom::thread::spawn(move || {
                queue.push(chunk_with(2));
                queue.pop().map(take)
            });
            let mut got: Vec<u32> = [t1.join().unwrap(), t2.join().unwrap()]
                .into_iter()
                .flatten()
                .collect();
            while let Some(chunk) = queue.pop() {
                got.push(take(chunk));
            }
            got.sort_unstable();
            assert_eq!(got, vec![1, 2]);
        });
    }
}

#[cfg(not(loom))]
#[test]
fn no_task_lost_or_duplicated_under_stealing() {
    const WORKERS: usize = 4;
    const PER_WORKER: usize = 1000;

    let rt = runtime(WORKERS);
    let wl = DistChunkedFifo::<usize, 8>::new(&rt);
    let barrier = Barrier::new(WORKERS);
    let seen: Vec<AtomicUsize> = (0..WORKERS * PER_WORKER)
        .map(|_| AtomicUsize::new(0))
        .collect();

    std::thread::scope(|s| {
        for tid in 0..WORKERS {
            let wl = &wl;
            let barrier = &barrier;
            let seen = &seen;
            s.spawn(move || {
                let _guard = crate::worker::install_worker_id(tid);
                for i in 0..PER_WORKER {
                    wl.push(tid * PER_WORKER + i).unwrap();
                }
                wl.flush();
                barrier.wait();
                while let Some(task) = wl.pop() {
                    seen[task].fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });

    // every task observed exactly once across all workers
    for (task, count) in seen.iter().enumerate() {
        assert_eq!(count.load(Ordering::Relaxed), 1, "task {}", task);
    }
}
