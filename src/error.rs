//! Defines the error types used throughout fluxalloc.
use std::fmt;

use rustix::io::Errno;

/// The primary error enum for all fallible operations in fluxalloc.
#[derive(Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Represents an error in the size-class configuration, detected when the
    /// size class is constructed. The allocator never re-validates on the hot
    /// path; a [`crate::SizeClass`] that exists is always usable.
    Configuration(String),
    /// Wraps an error originating from the memory-mapping layer.
    ///
    /// This is the only failure the allocate path can surface: mapping a new
    /// superblock (or a new descriptor slab) failed, typically due to address
    /// space or memory exhaustion. The failed call publishes nothing, so no
    /// partial state results and the operation can be retried later.
    Map(MapError),
}

/// A specific error originating from the memory-mapping layer.
#[derive(Debug, PartialEq, Eq)]
pub enum MapError {
    /// An underlying OS error from `mmap`/`munmap`.
    Os(Errno),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Os(e) => write!(f, "mapping error: {}", e),
        }
    }
}

impl std::error::Error for MapError {}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AllocError::Map(e) => write!(f, "Map error: {}", e),
        }
    }
}

impl std::error::Error for AllocError {}

impl From<MapError> for AllocError {
    fn from(err: MapError) -> Self {
        AllocError::Map(err)
    }
}

impl From<Errno> for MapError {
    fn from(err: Errno) -> Self {
        MapError::Os(err)
    }
}
