//! Disk image creation.
//!
//! The single supported creation mode is monolithic sparse: one sparse
//! extent file with the descriptor embedded after the header.

use std::fs::OpenOptions;
use std::path::Path;

use crate::descriptor::{
    AccessMode, CreateType, DiskDescriptor, DiskGeometry, ExtentDescriptor, ExtentKind,
    CID_NO_PARENT,
};
use crate::error::{Error, Result};
use crate::sparse::{SparseExtent, SparseLayout};

/// BIOS geometry constants for created disks.
const HEADS: u32 = 16;
const SECTORS_PER_TRACK: u32 = 63;

/// Options for disk creation.
///
/// `content_id` and `uid` are injection points for the identifiers that
/// would otherwise be pseudo-random; tests supply fixed values.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Content id for the new descriptor; generated when absent.
    pub content_id: Option<u32>,
    /// 128-bit disk uid; generated when absent.
    pub uid: Option<[u8; 16]>,
}

/// Create a monolithic sparse disk image at `path`.
///
/// The capacity is rounded up to a whole number of grain-table spans; the
/// returned descriptor records the actual size. Fails if `path` already
/// exists — creation never clobbers an image.
pub fn create_sparse_disk(
    path: &Path,
    capacity_bytes: u64,
    options: &CreateOptions,
) -> Result<DiskDescriptor> {
    let layout = SparseLayout::plan(capacity_bytes, 0)?;
    let capacity_sectors = layout.capacity_sectors;

    let backing = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::format("image path has no file name"))?;

    let descriptor = DiskDescriptor {
        version: 1,
        content_id: options.content_id.unwrap_or_else(generate_content_id),
        parent_content_id: CID_NO_PARENT,
        parent_hint: None,
        create_type: CreateType::MonolithicSparse,
        uid: Some(options.uid.unwrap_or_else(generate_uid)),
        geometry: DiskGeometry {
            cylinders: capacity_sectors / (HEADS as u64 * SECTORS_PER_TRACK as u64),
            heads: HEADS,
            sectors: SECTORS_PER_TRACK,
        },
        extents: vec![ExtentDescriptor {
            access: AccessMode::ReadWrite,
            size_sectors: capacity_sectors,
            kind: ExtentKind::Sparse,
            backing: Some(backing),
            offset_sectors: 0,
        }],
        extra: Vec::new(),
    };

    let text = descriptor.serialize();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| Error::io(e, path))?;

    let mut extent = SparseExtent::create(file, capacity_bytes, Some(&text))?;
    extent.flush()?;

    Ok(descriptor)
}

/// Derive a pseudo-random 32-bit content id from the clock and process id.
fn generate_content_id() -> u32 {
    entropy_hash(0x43_49_44) as u32
}

/// Derive a pseudo-random 128-bit disk uid.
fn generate_uid() -> [u8; 16] {
    let mut uid = [0u8; 16];
    uid[..8].copy_from_slice(&entropy_hash(0x55_49_44).to_le_bytes());
    uid[8..].copy_from_slice(&entropy_hash(0x75_69_64).to_le_bytes());
    uid
}

fn entropy_hash(tag: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let mut hasher = DefaultHasher::new();
    tag.hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_create_writes_rounded_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let descriptor = create_sparse_disk(
            &path,
            MIB,
            &CreateOptions {
                content_id: Some(0xdeadbeef),
                uid: Some([7u8; 16]),
            },
        )
        .unwrap();

        assert_eq!(descriptor.content_id, 0xdeadbeef);
        assert_eq!(descriptor.create_type, CreateType::MonolithicSparse);
        // 1 MiB rounds up to one grain-table span (2 MiB)
        assert_eq!(descriptor.disk_size_bytes(), 2 * MIB);
        assert_eq!(descriptor.geometry.heads, 16);
        assert_eq!(descriptor.geometry.sectors, 63);
        assert_eq!(
            descriptor.geometry.cylinders,
            descriptor.disk_size_sectors() / (16 * 63)
        );
        assert!(path.exists());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        create_sparse_disk(&path, MIB, &CreateOptions::default()).unwrap();
        assert!(matches!(
            create_sparse_disk(&path, MIB, &CreateOptions::default()),
            Err(Error::Io { .. })
        ));
    }

    #[test]
    fn test_create_zero_capacity_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        assert!(create_sparse_disk(&path, 0, &CreateOptions::default()).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_generated_ids_when_unset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.vmdk");
        let descriptor = create_sparse_disk(&path, MIB, &CreateOptions::default()).unwrap();
        assert!(descriptor.uid.is_some());
        assert_eq!(descriptor.parent_content_id, CID_NO_PARENT);
    }
}
