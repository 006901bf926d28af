//! Sparse extent handling.
//!
//! A sparse extent lays a growable, copy-on-write address space over a flat
//! backing file: a 512-byte header, a redundant and a primary copy of the
//! grain directory and grain tables, then a grain-aligned data region that
//! grows by appending.

pub mod extent;
pub mod header;
pub mod layout;
pub mod stats;

pub use extent::SparseExtent;
pub use header::SparseExtentHeader;
pub use layout::SparseLayout;
pub use stats::{is_sparse_extent, ExtentStats};

/// Sparse extent magic number ("KDMV" on disk, little-endian).
pub const SPARSE_MAGIC: u32 = 0x564D444B;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Number of grain table entries per grain table.
pub const GT_ENTRIES_PER_GT: u32 = 512;

/// Minimum grain size in sectors.
pub const MIN_GRAIN_SECTORS: u64 = 8;
