//! A lock-free, recycling slab pool for descriptor records.
//!
//! This pool manages the fixed-size `Descriptor` metadata objects,
//! reducing pressure on the mapping layer and keeping descriptor memory
//! stable: records are carved out of mapped slabs and recycled through a
//! free list, never unmapped while the pool lives. That stability is what
//! lets threads chase `pool_next` links optimistically — a stale link read
//! can lose a CAS, but it can never touch unmapped memory.
//!
//! Reuse is the dangerous part. A thread may still be mid-read of a
//! descriptor it found through the partial queue or this free list at the
//! instant the descriptor is logically retired; handing the record out again
//! immediately would be a use-after-free/ABA hazard. `DescriptorPool::release`
//! therefore defers the actual re-linking until every epoch guard pinned at
//! retirement time has been dropped.

use std::mem;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Shared};
use crossbeam_utils::CachePadded;
use metrics::counter;

use crate::descriptor::Descriptor;
use crate::error::AllocError;
use crate::metrics::DESCRIPTOR_SLABS_MAPPED_TOTAL;
use crate::region::{MmapSource, Region, RegionSource};

/// Number of descriptor records carved from each slab mapping.
const SLAB_DESCRIPTORS: usize = 64;

/// A concurrent pool of descriptor records.
///
/// The pool is an explicit, singly-constructed shared service: construct it
/// once, hand an `Arc` to every heap that should share the recycle list and
/// the mapping source. There is no process-wide singleton.
pub struct DescriptorPool {
    /// Head of the free list of recycled records, linked through
    /// `Descriptor::pool_next`.
    free: CachePadded<Atomic<Descriptor>>,
    /// Every slab region ever mapped, unmapped on drop.
    slabs: Mutex<Vec<Region>>,
    source: Arc<dyn RegionSource>,
}

impl DescriptorPool {
    /// Creates a pool backed by the production mapping source.
    pub fn new() -> Arc<Self> {
        Self::with_source(Arc::new(MmapSource::new()))
    }

    /// Creates a pool backed by a caller-supplied mapping source.
    pub fn with_source(source: Arc<dyn RegionSource>) -> Arc<Self> {
        Arc::new(DescriptorPool {
            free: CachePadded::new(Atomic::null()),
            slabs: Mutex::new(Vec::new()),
            source,
        })
    }

    /// The mapping source shared by this pool; heaps map their superblocks
    /// through the same collaborator.
    pub fn source(&self) -> &Arc<dyn RegionSource> {
        &self.source
    }

    /// Hands out an unbound descriptor record.
    ///
    /// Pops from the free list; if the list is empty, grows by one slab and
    /// retries. Only the grow path can fail, and only on mapping exhaustion.
    pub(crate) fn acquire<'g>(
        &self,
        guard: &'g Guard,
    ) -> Result<Shared<'g, Descriptor>, AllocError> {
        loop {
            // Optimistically try to pop from the free list.
            if let Some(desc) = self.try_pop(guard) {
                return Ok(desc);
            }
            // If the list was empty, grow it and try again.
            self.grow(guard)?;
        }
    }

    fn try_pop<'g>(&self, guard: &'g Guard) -> Option<Shared<'g, Descriptor>> {
        loop {
            let head = self.free.load(Ordering::Acquire, guard);
            let desc = unsafe {
                // SAFETY: `head` is either null or a record inside a slab the
                // pool never unmaps; the epoch guard plus deferred release
                // guarantee a listed record is not concurrently rebound.
                head.as_ref()
            }?;
            let next = desc.pool_next.load(Ordering::Acquire, guard);
            if self
                .free
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                return Some(head);
            }
            // Contention: another thread popped or pushed first. Retry.
        }
    }

    /// Maps one slab, carves it into records and splices them all onto the
    /// free list.
    fn grow(&self, guard: &Guard) -> Result<(), AllocError> {
        let stride = mem::size_of::<Descriptor>();
        let region = self
            .source
            .reserve(SLAB_DESCRIPTORS * stride, mem::align_of::<Descriptor>())
            .map_err(AllocError::Map)?;
        let base = region.base().as_ptr() as *mut Descriptor;

        for i in 0..SLAB_DESCRIPTORS {
            // SAFETY: the slab is freshly mapped, sized for SLAB_DESCRIPTORS
            // records, and exclusively ours until spliced in below.
            unsafe { ptr::write(base.add(i), Descriptor::new()) };
        }
        // Chain the batch together before it becomes visible.
        for i in 0..SLAB_DESCRIPTORS - 1 {
            let next = Shared::from(unsafe {
                // SAFETY: record i + 1 lies inside the slab and was
                // initialized just above.
                base.add(i + 1) as *const Descriptor
            });
            unsafe {
                // SAFETY: record i was initialized just above and is still
                // private to this thread.
                (*base.add(i)).pool_next.store(next, Ordering::Relaxed)
            };
        }

        // Record the slab before publishing so drop can never miss it.
        self.slabs.lock().unwrap().push(region);
        counter!(DESCRIPTOR_SLABS_MAPPED_TOTAL).increment(1);

        let first = Shared::from(base as *const Descriptor);
        let last = unsafe {
            // SAFETY: the last record was initialized above.
            &*base.add(SLAB_DESCRIPTORS - 1)
        };
        loop {
            let head = self.free.load(Ordering::Acquire, guard);
            last.pool_next.store(head, Ordering::Relaxed);
            if self
                .free
                .compare_exchange(head, first, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Returns a retired descriptor record to the pool.
    ///
    /// The re-link is deferred past every epoch guard active right now, so a
    /// thread still dereferencing the record through a stale shared reference
    /// can finish its read before the record re-enters circulation.
    pub(crate) fn release(self: &Arc<Self>, desc: Shared<'_, Descriptor>, guard: &Guard) {
        let raw = desc.as_raw() as usize;
        let pool = Arc::clone(self);
        guard.defer(move || {
            let guard = &epoch::pin();
            pool.push(Shared::from(raw as *const Descriptor), guard);
        });
    }

    fn push(&self, desc: Shared<'_, Descriptor>, guard: &Guard) {
        let record = unsafe {
            // SAFETY: `desc` points into a slab this pool owns; the deferral
            // in `release` guarantees no other thread still holds a stale
            // reference that could observe the record mid-relink.
            desc.deref()
        };
        loop {
            let head = self.free.load(Ordering::Acquire, guard);
            record.pool_next.store(head, Ordering::Relaxed);
            if self
                .free
                .compare_exchange(head, desc, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
            {
                return;
            }
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // Deferred release closures hold an Arc to the pool, so by the time
        // this runs no deferred push can still reference it. Descriptor
        // records are plain atomics and need no per-record teardown.
        for region in self.slabs.lock().unwrap().drain(..) {
            self.source.release(region);
        }
    }
}
