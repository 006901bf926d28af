//! vdisk Core Library
//!
//! This crate provides read/write access to sparse virtual-disk images:
//! a growable, copy-on-write extent format laid out over flat files with
//! two-level grain addressing, composed per descriptor into one seekable
//! logical disk stream.
//!
//! # Overview
//!
//! Opening an image loads its descriptor (textual, or embedded in a
//! monolithic sparse file), which enumerates extents; each extent becomes
//! a logical stream (flat passthrough, constant-zero, or grain-addressed
//! sparse) and the streams are concatenated in list order. Creating an
//! image plans the sparse layout and writes a file whose every logical
//! byte reads as zero.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`descriptor`] - Descriptor text parsing and serialization
//! - [`sparse`] - Sparse extent header, layout planning, grain addressing
//! - [`disk`] - Extent composition and disk opening
//! - [`create`] - Disk image creation
//! - [`export`] - Raw-image export with content digest
//!
//! # Quick Start
//!
//! ```no_run
//! use vdisk_core::{create_sparse_disk, AccessMode, CreateOptions, Disk};
//! use std::path::Path;
//!
//! let path = Path::new("/tmp/disk.vmdk");
//! create_sparse_disk(path, 64 * 1024 * 1024, &CreateOptions::default()).unwrap();
//!
//! let mut disk = Disk::open(path, AccessMode::ReadWrite).unwrap();
//! disk.content().write_at(0, b"hello").unwrap();
//! ```

pub mod create;
pub mod descriptor;
pub mod disk;
pub mod error;
pub mod export;
pub mod sparse;

pub use error::{Error, Result};

pub use create::{create_sparse_disk, CreateOptions};
pub use descriptor::{
    parse_descriptor, AccessMode, CreateType, DiskDescriptor, DiskGeometry, ExtentDescriptor,
    ExtentKind, CID_NO_PARENT,
};
pub use disk::{Disk, DiskContent, ExtentStream};
pub use export::{
    export_raw, ExportOptions, ExportProgress, ExportSummary, ProgressCallback,
    DEFAULT_CHUNK_SIZE,
};
pub use sparse::{
    is_sparse_extent, ExtentStats, SparseExtent, SparseExtentHeader, SparseLayout,
    GT_ENTRIES_PER_GT, SECTOR_SIZE, SPARSE_MAGIC,
};
