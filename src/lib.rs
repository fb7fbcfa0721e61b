#![doc = include_str!("../README.md")]
//! The core, concurrent, per-size-class heap front end.
//!
//! This module provides [`Heap`], the allocator's hot path. It hands out
//! fixed-size slots carved from superblocks without ever taking a lock,
//! using only atomic compare-and-swap and epoch-based reclamation for the
//! shared descriptor metadata.
//!
//! # Internals
//!
//! -   **Active slot:** each heap holds at most one descriptor in its
//!     `active` slot. The slot is a handoff point, not a shared-mutation
//!     point: the thread that CASes a descriptor out of it is that
//!     descriptor's sole mutator until it republishes or retires it.
//! -   **Partial queue:** descriptors with free slots that are not the
//!     active descriptor wait in a lock-free partial queue. Entries can
//!     be logically stale — a queued descriptor may have drained to empty
//!     in the meantime — and consumers retire such entries on sight.
//! -   **Superblock discovery:** `release` finds a slot's descriptor by
//!     masking the slot address down to the superblock-size boundary and
//!     reading the descriptor pointer stored in the superblock header.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ::metrics::counter;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

pub mod check;
pub mod error;
pub mod metrics;
pub mod region;
pub mod size_class;

mod descriptor;
pub mod slab;

pub use crate::error::{AllocError, MapError};
pub use crate::region::{MmapSource, Region, RegionSource};
pub use crate::size_class::SizeClass;
pub use crate::slab::DescriptorPool;

use crate::descriptor::{Descriptor, Pop, SlotState, SuperblockHeader};
use crate::metrics::{
    ALLOCATIONS_TOTAL, RELEASES_TOTAL, SUPERBLOCKS_MAPPED_TOTAL, SUPERBLOCKS_RETIRED_TOTAL,
};

/// How many partial-queue entries a failed retirement claim will inspect,
/// retiring any found empty. Amortized maintenance, not required for
/// correctness; see `Heap::scavenge`.
const SCAVENGE_LIMIT: usize = 4;

static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(1);

/// A node in the partial queue, pointing at one descriptor.
///
/// Nodes are heap-allocated per enqueue and destroyed (deferred) on dequeue,
/// never reused. That indirection is what makes dequeue safe while the
/// descriptors themselves are republished immediately: an intrusive link
/// through the descriptor would let the list head recur with a stale link
/// (ABA) the moment a dequeued descriptor re-entered the queue.
pub(crate) struct PartialNode {
    pub(crate) desc: usize,
    pub(crate) next: Atomic<PartialNode>,
}

/// A lock-free collection of descriptors that have free slots but are not
/// currently any heap's active descriptor.
///
/// No ordering is guaranteed across entries; which descriptor a dequeue
/// returns is unspecified.
pub(crate) struct PartialQueue {
    pub(crate) head: CachePadded<Atomic<PartialNode>>,
}

impl PartialQueue {
    fn new() -> Self {
        PartialQueue {
            head: CachePadded::new(Atomic::null()),
        }
    }

    fn enqueue(&self, desc: Shared<'_, Descriptor>, guard: &Guard) {
        let node = Owned::new(PartialNode {
            desc: desc.as_raw() as usize,
            next: Atomic::null(),
        })
        .into_shared(guard);
        loop {
            let head = self.head.load(Ordering::Relaxed, guard);
            unsafe {
                // SAFETY: `node` was allocated above and is not yet visible
                // to any other thread.
                node.deref().next.store(head, Ordering::Relaxed)
            };
            if self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                return;
            }
        }
    }

    fn dequeue<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, Descriptor>> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            let node = unsafe {
                // SAFETY: `head` is null or a node whose destruction is
                // deferred past this guard.
                head.as_ref()
            }?;
            let next = node.next.load(Ordering::Acquire, guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                unsafe {
                    // SAFETY: the node is unlinked; no new reader can reach
                    // it, and current readers are protected by their guards.
                    guard.defer_destroy(head);
                }
                return Some(Shared::from(node.desc as *const Descriptor));
            }
        }
    }
}

/// A per-size-class, lock-free slot allocator.
///
/// Every slot returned by [`Heap::allocate`] is exactly
/// `size_class.slot_size()` bytes, carved from superblocks of
/// `size_class.superblock_size()` bytes. Superblocks are mapped on demand
/// through the descriptor pool's [`RegionSource`] and returned to it once
/// every slot has been released.
///
/// Dropping a heap does not unmap superblocks that still hold outstanding
/// slots; release every allocation first if reclaiming the memory matters.
pub struct Heap {
    /// The current active descriptor, or null. A handoff slot: at most one
    /// descriptor occupies it, and CASing it out confers exclusive
    /// ownership.
    active: CachePadded<Atomic<Descriptor>>,
    partial: PartialQueue,
    size_class: SizeClass,
    pool: Arc<DescriptorPool>,
    id: usize,
}

impl Heap {
    /// Creates a heap for `size_class`, drawing descriptor metadata and
    /// superblock mappings from `pool`.
    pub fn new(size_class: SizeClass, pool: Arc<DescriptorPool>) -> Self {
        Heap {
            active: CachePadded::new(Atomic::null()),
            partial: PartialQueue::new(),
            size_class,
            pool,
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// The size class this heap serves.
    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    /// Allocates one slot and returns its address.
    ///
    /// Lock-free: contention only delays the CAS loops, it never blocks on a
    /// lock. The only failure is the memory-mapping collaborator refusing to
    /// map a new superblock, and that error is propagated untouched — the
    /// failed attempt publishes nothing.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        let guard = &epoch::pin();
        let addr = loop {
            // 1. Obtain a descriptor to own: the active slot first, then the
            //    partial queue, then a brand-new superblock.
            let desc = match self.take_active(guard) {
                Some(desc) => desc,
                None => match self.take_partial(guard) {
                    Some(desc) => desc,
                    None => match self.install_fresh(guard)? {
                        // Won the publication race; slot 0 of the fresh
                        // superblock was reserved for this request.
                        Some(addr) => break addr,
                        None => continue,
                    },
                },
            };

            // 2. Pop one slot from the owned descriptor.
            match unsafe {
                // SAFETY: `desc` came out of the active slot or the partial
                // queue under `guard`; recycling is deferred past it.
                desc.deref()
            }
            .pop_slot()
            {
                Pop::Empty => {
                    // We own it and nothing else can reach it: retire it
                    // here and start over.
                    self.retire(desc, guard);
                }
                Pop::Slot { addr, new_state } => {
                    // 3. Republish if it still has free slots. A descriptor
                    //    that just went Full stays unreferenced on purpose —
                    //    it becomes discoverable again through the addresses
                    //    of slots released later.
                    if new_state == SlotState::Partial {
                        self.republish(desc, guard);
                    }
                    break addr;
                }
            }
        };
        counter!(ALLOCATIONS_TOTAL).increment(1);
        Ok(addr)
    }

    /// Releases a slot previously returned by [`Heap::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on a heap configured with
    /// the identical size class, and must not have been released since.
    /// Anything else is undefined behavior — this is the allocator's one
    /// critical usage contract.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        let guard = &epoch::pin();

        // 1. Mask down to the superblock header and load the owning
        //    descriptor.
        let base = ptr.as_ptr() as usize & !(self.size_class.superblock_size() - 1);
        let header = unsafe {
            // SAFETY: per the contract, `ptr` points into a live superblock
            // of this size class, whose first word is the header.
            &*(base as *const SuperblockHeader)
        };
        let desc = Shared::from(header.descriptor.load(Ordering::Acquire) as *const Descriptor);
        let record = unsafe {
            // SAFETY: a live slot keeps its descriptor bound; the descriptor
            // record itself is never unmapped while the pool lives.
            desc.deref()
        };
        debug_assert_eq!(
            record.heap_id(),
            self.id,
            "pointer released against a heap that does not own it"
        );

        // 2. Push the slot back.
        let (old_state, new_state) = unsafe {
            // SAFETY: per the contract, the slot was popped from this
            // descriptor and is not on its free list.
            record.push_slot(ptr)
        };
        counter!(RELEASES_TOTAL).increment(1);

        match new_state {
            // 3. Every slot is free: try to claim exclusive ownership and
            //    retire.
            SlotState::Empty => {
                if self
                    .active
                    .compare_exchange(desc, Shared::null(), Ordering::AcqRel, Ordering::Relaxed, guard)
                    .is_ok()
                {
                    // Owned — but a concurrent allocate may have drained and
                    // republished it between our push and the claim, so
                    // re-check before unmapping anything.
                    if record.load_anchor().state == SlotState::Empty {
                        self.retire(desc, guard);
                    } else {
                        self.republish(desc, guard);
                    }
                } else {
                    // Not the active descriptor; it is either queued (a
                    // stale entry someone will retire) or already retired.
                    // Do a little opportunistic cleanup instead.
                    self.scavenge(guard);
                }
            }
            // 4. The descriptor was Full and therefore unreferenced; it is
            //    this thread's job to make it reachable again.
            SlotState::Partial if old_state == SlotState::Full => {
                self.republish(desc, guard);
            }
            // 5. Partial -> Partial: already reachable from wherever it was.
            _ => {}
        }
    }

    fn take_active<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, Descriptor>> {
        loop {
            let cur = self.active.load(Ordering::Acquire, guard);
            if cur.is_null() {
                return None;
            }
            if self
                .active
                .compare_exchange(cur, Shared::null(), Ordering::AcqRel, Ordering::Relaxed, guard)
                .is_ok()
            {
                return Some(cur);
            }
            // Contention: someone else took or replaced it. Retry.
        }
    }

    /// Dequeues until a usable descriptor appears. The queue is
    /// self-cleaning: entries that drained to empty while queued are not
    /// real work and are retired on the spot.
    fn take_partial<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, Descriptor>> {
        while let Some(desc) = self.partial.dequeue(guard) {
            let record = unsafe {
                // SAFETY: dequeued under `guard`; recycling is deferred.
                desc.deref()
            };
            if record.load_anchor().state == SlotState::Empty {
                self.retire(desc, guard);
                continue;
            }
            return Some(desc);
        }
        None
    }

    /// Maps and publishes a brand-new superblock. Returns the address of
    /// slot 0 on the publication-race win, `None` on the loss (the newborn
    /// descriptor is discarded — one wasted mapping, nothing observable).
    fn install_fresh(&self, guard: &Guard) -> Result<Option<NonNull<u8>>, AllocError> {
        let desc = self.pool.acquire(guard)?;
        let class = self.size_class;
        let region = match self
            .pool
            .source()
            .reserve(class.superblock_size(), class.superblock_size())
        {
            Ok(region) => region,
            Err(err) => {
                // Nothing was published; hand the record straight back.
                self.pool.release(desc, guard);
                return Err(AllocError::Map(err));
            }
        };
        let slot0 = unsafe {
            // SAFETY: the record came off the pool free list, so it is
            // exclusively ours and unpublished.
            desc.deref()
        }
        .bind(&class, &region, self.id);
        counter!(SUPERBLOCKS_MAPPED_TOTAL).increment(1);

        if self
            .active
            .compare_exchange(Shared::null(), desc, Ordering::AcqRel, Ordering::Relaxed, guard)
            .is_ok()
        {
            Ok(Some(slot0))
        } else {
            // Another thread published a descriptor first. No caller has
            // seen this one, so it can go straight to retirement.
            unsafe {
                // SAFETY: still exclusively ours, never published.
                desc.deref()
            }
            .make_empty();
            self.retire(desc, guard);
            Ok(None)
        }
    }

    /// Makes an owned, still-partial descriptor reachable again: into the
    /// active slot if it is vacant, otherwise onto the partial queue.
    fn republish(&self, desc: Shared<'_, Descriptor>, guard: &Guard) {
        if self
            .active
            .compare_exchange(Shared::null(), desc, Ordering::AcqRel, Ordering::Relaxed, guard)
            .is_err()
        {
            self.partial.enqueue(desc, guard);
        }
    }

    /// Retires an exclusively owned, empty descriptor: the superblock goes
    /// back to the mapping source and the record to the descriptor pool.
    ///
    /// The unmap is deferred past current epoch guards because a diagnostic
    /// walker that reached this descriptor through the partial queue may
    /// still be reading the superblock's free-list links.
    fn retire(&self, desc: Shared<'_, Descriptor>, guard: &Guard) {
        let record = unsafe {
            // SAFETY: the caller owns `desc`; the record is pool memory.
            desc.deref()
        };
        debug_assert_eq!(
            record.load_anchor().state,
            SlotState::Empty,
            "only empty descriptors retire"
        );
        let (base, len) = record.take_region();
        let source = Arc::clone(self.pool.source());
        guard.defer(move || {
            source.release(unsafe {
                // SAFETY: base/len came from take_region on the descriptor
                // that owned this mapping; the descriptor is unbound, so the
                // mapping has exactly one owner — this closure.
                Region::from_raw(base, len)
            });
        });
        self.pool.release(desc, guard);
        counter!(SUPERBLOCKS_RETIRED_TOTAL).increment(1);
    }

    /// Best-effort cleanup after a failed retirement claim: inspect a few
    /// queue entries and retire any found empty. Stops at the first live
    /// entry — with a LIFO queue, pressing on would just re-dequeue the
    /// entry we re-enqueued.
    fn scavenge(&self, guard: &Guard) {
        for _ in 0..SCAVENGE_LIMIT {
            let Some(desc) = self.partial.dequeue(guard) else {
                return;
            };
            let record = unsafe {
                // SAFETY: dequeued under `guard`; recycling is deferred.
                desc.deref()
            };
            if record.load_anchor().state == SlotState::Empty {
                self.retire(desc, guard);
            } else {
                self.republish(desc, guard);
                return;
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Drain the queue so its nodes are freed, and retire any descriptor
        // that is already empty. Descriptors with outstanding slots stay
        // mapped, per the documented drop contract.
        let guard = &epoch::pin();
        if let Some(desc) = self.take_active(guard) {
            let record = unsafe {
                // SAFETY: taken from the active slot under `guard`.
                desc.deref()
            };
            if record.load_anchor().state == SlotState::Empty {
                self.retire(desc, guard);
            }
        }
        while let Some(desc) = self.partial.dequeue(guard) {
            let record = unsafe {
                // SAFETY: dequeued under `guard`; recycling is deferred.
                desc.deref()
            };
            if record.load_anchor().state == SlotState::Empty {
                self.retire(desc, guard);
            }
        }
    }
}
