//! Multi-threaded stress: randomly interleaved allocate/release traffic must
//! leak nothing and keep every reachable descriptor's invariants intact.
//!
//! This binary holds a single test because it installs the global debugging
//! metrics recorder and asserts exact mapped/retired accounting; a second
//! test running in parallel would pollute the counters.

use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;

use metrics::Label;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fluxalloc::{DescriptorPool, Heap, SizeClass};

const THREADS: usize = 8;
const PAIRS_PER_THREAD: usize = 100_000;
/// Cap on slots a thread keeps outstanding, so traffic keeps crossing the
/// Full/Partial/Empty edges instead of just growing.
const MAX_OUTSTANDING: usize = 64;

fn drain_epochs() {
    for _ in 0..1024 {
        crossbeam_epoch::pin().flush();
    }
}

fn counter_value(snapshot: Snapshot, name: &str) -> u64 {
    snapshot
        .into_vec()
        .into_iter()
        .find_map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<&Label> = key.labels().collect();
            if key.name() == name && labels.is_empty() {
                if let DebugValue::Counter(c) = value {
                    return Some(c);
                }
            }
            None
        })
        .unwrap_or(0)
}

#[test]
fn randomly_interleaved_traffic_leaks_nothing() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install recorder");

    let class = SizeClass::new(16, 4096).unwrap();
    let heap = Arc::new(Heap::new(class, DescriptorPool::new()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut workers = Vec::new();
    for seed in 0..THREADS {
        let heap = Arc::clone(&heap);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed as u64);
            let mut outstanding: Vec<usize> = Vec::with_capacity(MAX_OUTSTANDING);
            barrier.wait();

            for _ in 0..PAIRS_PER_THREAD {
                let want_alloc = outstanding.is_empty()
                    || (outstanding.len() < MAX_OUTSTANDING && rng.random_range(0..2) == 0);
                if want_alloc {
                    let ptr = heap.allocate().expect("mapping should not fail under test");
                    outstanding.push(ptr.as_ptr() as usize);
                } else {
                    let victim = rng.random_range(0..outstanding.len());
                    let addr = outstanding.swap_remove(victim);
                    // SAFETY: `addr` was allocated from this heap by this
                    // thread and is released exactly once.
                    unsafe { heap.release(NonNull::new(addr as *mut u8).unwrap()) };
                }
            }
            // No net leak: return everything before finishing.
            for addr in outstanding {
                // SAFETY: as above.
                unsafe { heap.release(NonNull::new(addr as *mut u8).unwrap()) };
            }
        }));
    }
    for worker in workers {
        worker.join().expect("stress worker panicked");
    }

    assert!(heap.check_consistency(), "invariants must hold after the storm");

    // Flush out empty descriptors that lost their retirement race and are
    // parked in the partial queue: a few allocate calls dequeue and retire
    // them on sight.
    for _ in 0..4 {
        let ptr = heap.allocate().unwrap();
        // SAFETY: just allocated from this heap.
        unsafe { heap.release(ptr) };
    }
    drain_epochs();

    assert_eq!(
        heap.reachable_descriptors(),
        0,
        "every descriptor must retire once all slots are back"
    );
    assert!(heap.check_consistency());

    let mapped = counter_value(
        snapshotter.snapshot(),
        fluxalloc::metrics::SUPERBLOCKS_MAPPED_TOTAL,
    );
    let retired = counter_value(
        snapshotter.snapshot(),
        fluxalloc::metrics::SUPERBLOCKS_RETIRED_TOTAL,
    );
    assert!(mapped > 0, "the stress run must have mapped superblocks");
    assert_eq!(
        mapped, retired,
        "with no slot outstanding, every mapped superblock must be retired"
    );

    let ops = (THREADS * PAIRS_PER_THREAD) as u64;
    let allocations = counter_value(
        snapshotter.snapshot(),
        fluxalloc::metrics::ALLOCATIONS_TOTAL,
    );
    let releases = counter_value(
        snapshotter.snapshot(),
        fluxalloc::metrics::RELEASES_TOTAL,
    );
    assert_eq!(
        allocations,
        releases,
        "every allocation was matched by a release"
    );
    assert!(
        allocations >= ops / 4,
        "a healthy share of the traffic should have been allocations"
    );
}
