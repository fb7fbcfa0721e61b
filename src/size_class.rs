//! Immutable (slot size, superblock size) configuration shared by heaps.

use std::mem;

use crate::descriptor::{SuperblockHeader, MAX_SLOT_CAPACITY};
use crate::error::AllocError;

/// A fixed allocation configuration: every slot handed out by a heap built on
/// this class is exactly `slot_size` bytes, carved from superblocks of
/// exactly `superblock_size` bytes.
///
/// Validation happens once, here. A `SizeClass` that exists is always usable;
/// the hot paths never re-check it.
///
/// The superblock size must be a power of two because `release` finds a
/// slot's superblock by masking the slot address down to the superblock-size
/// boundary. Each free slot stores a 32-bit next-index in its first word, so
/// slots must be at least 4 bytes and 4-byte aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClass {
    slot_size: usize,
    superblock_size: usize,
}

impl SizeClass {
    /// Creates a size class, validating the configuration.
    ///
    /// Fails with [`AllocError::Configuration`] if `superblock_size` is not a
    /// power of two, if fewer than two slots fit a superblock after the
    /// header reserve, if `slot_size` cannot hold an aligned free-list index,
    /// or if the slot capacity exceeds what the packed anchor word can
    /// represent.
    pub fn new(slot_size: usize, superblock_size: usize) -> Result<Self, AllocError> {
        if slot_size < mem::size_of::<u32>() || slot_size % mem::align_of::<u32>() != 0 {
            return Err(AllocError::Configuration(format!(
                "slot size {} must be a multiple of 4 bytes to hold a free-list index",
                slot_size
            )));
        }
        if !superblock_size.is_power_of_two() {
            return Err(AllocError::Configuration(format!(
                "superblock size {} is not a power of two",
                superblock_size
            )));
        }
        if superblock_size < 2 * slot_size {
            return Err(AllocError::Configuration(format!(
                "superblock size {} is smaller than two {}-byte slots",
                superblock_size, slot_size
            )));
        }

        let class = SizeClass {
            slot_size,
            superblock_size,
        };
        if class.slot_capacity() < 2 {
            return Err(AllocError::Configuration(format!(
                "superblock size {} leaves fewer than two {}-byte slots after the header",
                superblock_size, slot_size
            )));
        }
        if class.slot_capacity() > MAX_SLOT_CAPACITY {
            return Err(AllocError::Configuration(format!(
                "superblock size {} yields {} slots, above the representable {}",
                superblock_size,
                class.slot_capacity(),
                MAX_SLOT_CAPACITY
            )));
        }
        Ok(class)
    }

    /// The size of one slot in bytes.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The size of one superblock in bytes (a power of two).
    pub fn superblock_size(&self) -> usize {
        self.superblock_size
    }

    /// Bytes reserved at the start of a superblock for the header, rounded up
    /// to a slot-size multiple so slot 0 starts slot-aligned.
    pub fn header_reserve(&self) -> usize {
        let header = mem::size_of::<SuperblockHeader>();
        header.div_ceil(self.slot_size) * self.slot_size
    }

    /// The number of usable slots per superblock after the header reserve.
    pub fn slot_capacity(&self) -> usize {
        (self.superblock_size - self.header_reserve()) / self.slot_size
    }
}
