//! Defines the metric keys used throughout fluxalloc.
//!
//! Using a central module for these constants helps prevent typos and ensures
//! consistency across the codebase.

// --- Metric Keys ---

/// Tracks the total number of slots handed out by `allocate`.
pub const ALLOCATIONS_TOTAL: &str = "fluxalloc_allocations_total";

/// Tracks the total number of slots returned through `release`.
pub const RELEASES_TOTAL: &str = "fluxalloc_releases_total";

/// Tracks the total number of superblocks mapped from the OS.
///
/// Includes superblocks that lose the publication race and are retired
/// immediately; this counter minus [`SUPERBLOCKS_RETIRED_TOTAL`] is the
/// number of superblocks currently live.
pub const SUPERBLOCKS_MAPPED_TOTAL: &str = "fluxalloc_superblocks_mapped_total";

/// Tracks the total number of superblocks returned to the OS.
pub const SUPERBLOCKS_RETIRED_TOTAL: &str = "fluxalloc_superblocks_retired_total";

/// Tracks the total number of descriptor slabs mapped by the descriptor pool.
///
/// Slabs are never returned while the pool lives, so this is also the number
/// of slabs currently backing descriptor metadata.
pub const DESCRIPTOR_SLABS_MAPPED_TOTAL: &str = "fluxalloc_descriptor_slabs_mapped_total";
