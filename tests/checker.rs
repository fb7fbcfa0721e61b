//! Concurrency properties: the consistency checker runs safely alongside
//! live traffic, and no two outstanding allocations ever share an address.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fluxalloc::{DescriptorPool, Heap, SizeClass};

#[test]
fn checker_never_reports_violations_under_live_traffic() {
    let class = SizeClass::new(16, 4096).unwrap();
    let heap = Arc::new(Heap::new(class, DescriptorPool::new()));
    let running = Arc::new(AtomicBool::new(true));
    let barrier = Arc::new(Barrier::new(5));

    let mut workers = Vec::new();
    for seed in 0..4u64 {
        let heap = Arc::clone(&heap);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut outstanding: Vec<usize> = Vec::new();
            barrier.wait();
            for _ in 0..50_000 {
                if outstanding.len() < 48 && (outstanding.is_empty() || rng.random_range(0..2) == 0)
                {
                    outstanding.push(heap.allocate().unwrap().as_ptr() as usize);
                } else {
                    let victim = rng.random_range(0..outstanding.len());
                    let addr = outstanding.swap_remove(victim);
                    // SAFETY: allocated from this heap above, released once.
                    unsafe { heap.release(NonNull::new(addr as *mut u8).unwrap()) };
                }
            }
            for addr in outstanding {
                // SAFETY: as above.
                unsafe { heap.release(NonNull::new(addr as *mut u8).unwrap()) };
            }
        }));
    }

    // The checker thread audits continuously while the workers churn. Every
    // settled snapshot it inspects must satisfy the invariants.
    let checker = {
        let heap = Arc::clone(&heap);
        let running = Arc::clone(&running);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            let mut checks = 0u64;
            barrier.wait();
            while running.load(Ordering::Relaxed) {
                assert!(
                    heap.check_consistency(),
                    "checker observed an invariant violation during live traffic"
                );
                checks += 1;
            }
            checks
        })
    };

    for worker in workers {
        worker.join().expect("worker panicked");
    }
    running.store(false, Ordering::Relaxed);
    let checks = checker.join().expect("checker panicked");
    assert!(checks > 0, "the checker should have run at least once");
    assert!(heap.check_consistency());
}

#[test]
fn concurrent_threads_never_hold_the_same_address() {
    // Each thread writes a thread-unique pattern into every slot it holds
    // and verifies the pattern before releasing: if two threads were ever
    // handed the same live slot, the pattern check would trip.
    let class = SizeClass::new(16, 4096).unwrap();
    let heap = Arc::new(Heap::new(class, DescriptorPool::new()));
    let barrier = Arc::new(Barrier::new(4));

    let mut workers = Vec::new();
    for id in 0..4u64 {
        let heap = Arc::clone(&heap);
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xA110C + id);
            let mut held: Vec<NonNull<u8>> = Vec::new();
            let stamp = 0x5EED_0000_0000_0000u64 | id;
            barrier.wait();
            for _ in 0..30_000 {
                if held.len() < 32 && (held.is_empty() || rng.random_range(0..2) == 0) {
                    let ptr = heap.allocate().unwrap();
                    // SAFETY: the slot is 16 bytes and exclusively ours
                    // while outstanding.
                    unsafe { (ptr.as_ptr() as *mut u64).write(stamp) };
                    held.push(ptr);
                } else {
                    let victim = rng.random_range(0..held.len());
                    let ptr = held.swap_remove(victim);
                    // SAFETY: we wrote this slot when we allocated it.
                    let seen = unsafe { (ptr.as_ptr() as *const u64).read() };
                    assert_eq!(seen, stamp, "another thread scribbled on a live slot");
                    // SAFETY: allocated from this heap, released once.
                    unsafe { heap.release(ptr) };
                }
            }
            for ptr in held {
                let seen = unsafe { (ptr.as_ptr() as *const u64).read() };
                assert_eq!(seen, stamp, "another thread scribbled on a live slot");
                // SAFETY: as above.
                unsafe { heap.release(ptr) };
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker panicked");
    }
    assert!(heap.check_consistency());
}
