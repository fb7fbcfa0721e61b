//! Read-only consistency diagnostics over a heap's reachable descriptors.
//!
//! The checker validates, for the active descriptor and everything reachable
//! from the partial queue, that the anchor's state matches its count and
//! that the intra-superblock free list is exactly `count` distinct in-range
//! slots with no cycle. It never repairs anything: a `false` result means
//! memory corruption or a logic bug, and the caller decides what to do.
//!
//! This is a testing aid, not a production call site.

use std::sync::atomic::Ordering;

use crossbeam_epoch as epoch;

use crate::descriptor::{Descriptor, SlotState};
use crate::Heap;

/// How many times to re-walk a descriptor whose anchor moved mid-walk
/// before skipping it as unverifiable under churn.
const SETTLE_RETRIES: usize = 8;

impl Heap {
    /// Validates the invariants of every reachable descriptor.
    ///
    /// Safe to run concurrently with allocate/release traffic: each
    /// descriptor is judged only on a settled snapshot (the anchor is
    /// re-read after the free-list walk and the walk is discarded if the
    /// anchor moved), so ongoing transitions can never manufacture a false
    /// violation. A descriptor that never settles within a bounded number
    /// of retries is skipped, not reported.
    pub fn check_consistency(&self) -> bool {
        let guard = &epoch::pin();

        // 1. The active descriptor, if any.
        let active = self.active.load(Ordering::Acquire, guard);
        if let Some(record) = unsafe {
            // SAFETY: loaded under `guard`; descriptor recycling and
            // superblock unmapping are both deferred past it.
            active.as_ref()
        } {
            if !check_descriptor(record) {
                return false;
            }
        }

        // 2. Everything reachable from the partial queue. The traversal is
        //    best-effort under churn; nodes unlinked mid-walk still point at
        //    valid descriptors thanks to the deferred destruction.
        let mut node_ptr = self.partial.head.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe {
            // SAFETY: node destruction is deferred past `guard`.
            node_ptr.as_ref()
        } {
            let record = unsafe {
                // SAFETY: queue entries reference pool-owned records whose
                // recycling is deferred past `guard`.
                &*(node.desc as *const Descriptor)
            };
            if !check_descriptor(record) {
                return false;
            }
            node_ptr = node.next.load(Ordering::Acquire, guard);
        }

        true
    }

    /// Counts the descriptors currently reachable from this heap (the
    /// active slot plus the partial queue).
    ///
    /// This is an approximation under concurrent traffic, in the same way
    /// the length of any lock-free structure is; with the heap quiescent it
    /// is exact.
    pub fn reachable_descriptors(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;

        if !self.active.load(Ordering::Acquire, guard).is_null() {
            count += 1;
        }
        let mut node_ptr = self.partial.head.load(Ordering::Acquire, guard);
        while let Some(node) = unsafe {
            // SAFETY: node destruction is deferred past `guard`.
            node_ptr.as_ref()
        } {
            count += 1;
            node_ptr = node.next.load(Ordering::Acquire, guard);
        }
        count
    }
}

/// Validates one descriptor on a settled anchor snapshot.
fn check_descriptor(record: &Descriptor) -> bool {
    for _ in 0..SETTLE_RETRIES {
        let before = record.load_anchor();
        let capacity = record.capacity();
        if record.slots_base() == 0 {
            // Unbound: the descriptor is mid-retirement. Nothing to check.
            return true;
        }

        // State/count coherence comes from a single atomic load, so a
        // mismatch is a real violation regardless of concurrent traffic.
        let count = before.count as usize;
        let state_ok = match before.state {
            SlotState::Full => count == 0,
            SlotState::Empty => count == capacity,
            SlotState::Partial => count > 0 && count < capacity,
        };
        if !state_ok {
            return false;
        }

        // Walk the free list for exactly `count` steps: every index must be
        // in range and distinct.
        let mut seen = vec![false; capacity];
        let mut idx = before.avail;
        let mut walk_ok = true;
        for _ in 0..count {
            if idx as usize >= capacity || seen[idx as usize] {
                walk_ok = false;
                break;
            }
            seen[idx as usize] = true;
            idx = record.slot_link(idx);
        }

        // The walk is only meaningful if no pop or push landed while it
        // ran; the tag makes any successful transition visible.
        let after = record.load_anchor();
        if after == before {
            return walk_ok;
        }
        // Anchor moved mid-walk; retry on a settled snapshot.
    }
    // Never settled under churn. Skipping beats reporting a false
    // violation from a torn walk.
    true
}
