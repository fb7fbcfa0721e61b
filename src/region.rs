//! OS-backed memory regions and the mapping layer that reserves them.
//!
//! Superblocks and descriptor slabs are both carved out of anonymous,
//! read-write mappings obtained through a [`RegionSource`]. The trait exists
//! so tests can substitute a failing or counting source; production code uses
//! [`MmapSource`], which goes straight to `mmap`/`munmap`.
//!
//! Superblocks must be aligned to their own (power-of-two) size so that any
//! slot address can be masked down to the superblock header. For alignments
//! beyond the page size, [`MmapSource`] over-maps by the alignment and trims
//! the misaligned head and tail back off.

use core::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::error::MapError;

/// A contiguous, page-backed, read-write memory region.
///
/// A `Region` does not unmap itself on drop; ownership of the underlying
/// mapping stays with whoever obtained it, and the mapping is returned
/// explicitly via [`RegionSource::release`]. This keeps the retirement path
/// free to defer the unmap past concurrent readers.
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: A Region is just an address and a length describing memory that no
// other Region aliases. It carries no thread affinity; the raw pointer is not
// dereferenced by the Region itself.
unsafe impl Send for Region {}

impl Region {
    /// Reassembles a region from its raw parts.
    ///
    /// # Safety
    ///
    /// `base`/`len` must describe a mapping previously produced by a
    /// [`RegionSource`] and not yet released.
    pub(crate) unsafe fn from_raw(base: usize, len: usize) -> Self {
        debug_assert!(base != 0);
        Region {
            // SAFETY: the caller guarantees `base` came from a live mapping,
            // which is never at address zero.
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            len,
        }
    }

    /// The first byte of the region.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The region's length in bytes (always a multiple of the page size).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the region has zero length. Never true for regions
    /// produced by a [`RegionSource`].
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The external memory-mapping collaborator.
///
/// Implementations hand out read-write regions; the allocator only ever
/// requests that one protection mode.
pub trait RegionSource: Send + Sync {
    /// Reserves a fresh region of at least `len` bytes whose base address is
    /// aligned to `align` (a power of two).
    fn reserve(&self, len: usize, align: usize) -> Result<Region, MapError>;

    /// Returns a region to the OS. The caller must guarantee nothing reads
    /// the region afterwards.
    fn release(&self, region: Region);
}

/// The production [`RegionSource`], backed by anonymous private mappings.
pub struct MmapSource {
    /// Number of regions currently reserved and not yet released.
    active: AtomicUsize,
}

impl MmapSource {
    /// Creates a new source with no outstanding regions.
    pub fn new() -> Self {
        MmapSource {
            active: AtomicUsize::new(0),
        }
    }

    /// Returns the number of regions currently outstanding.
    ///
    /// This is a diagnostic; under concurrent traffic it may not reflect
    /// in-flight reservations or releases.
    pub fn active_regions(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    fn map(&self, len: usize) -> Result<*mut c_void, MapError> {
        // SAFETY: a null hint with MAP_PRIVATE|MAP_ANONYMOUS asks the kernel
        // for a fresh, zeroed mapping; no existing memory is affected.
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }?;
        Ok(ptr)
    }
}

impl Default for MmapSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionSource for MmapSource {
    fn reserve(&self, len: usize, align: usize) -> Result<Region, MapError> {
        debug_assert!(align.is_power_of_two());
        let page = rustix::param::page_size();
        let len = (len + page - 1) & !(page - 1);

        let base = if align <= page {
            // Page alignment is free; any smaller power of two divides it.
            self.map(len)? as usize
        } else {
            // Over-map by the alignment, then trim the head and tail so the
            // surviving window is exactly [aligned, aligned + len).
            let raw = self.map(len + align)? as usize;
            let aligned = (raw + align - 1) & !(align - 1);
            let head = aligned - raw;
            if head > 0 {
                // SAFETY: [raw, raw + head) lies inside the mapping we just
                // created and nothing holds a pointer into it yet.
                unsafe { munmap(raw as *mut c_void, head) }?;
            }
            let tail = (raw + len + align) - (aligned + len);
            if tail > 0 {
                // SAFETY: same mapping, unused tail window.
                unsafe { munmap((aligned + len) as *mut c_void, tail) }?;
            }
            aligned
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        // SAFETY: mmap never returns address zero on success.
        Ok(Region {
            base: unsafe { NonNull::new_unchecked(base as *mut u8) },
            len,
        })
    }

    fn release(&self, region: Region) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        // SAFETY: the region was produced by `reserve` and, per the trait
        // contract, nothing reads it after this call.
        let result = unsafe { munmap(region.base.as_ptr() as *mut c_void, region.len) };
        debug_assert!(result.is_ok(), "munmap of an owned region failed");
    }
}
