//! Integration tests for raw-image export.

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use vdisk_core::{
    create_sparse_disk, export_raw, AccessMode, CreateOptions, Disk, ExportOptions,
};

const MIB: u64 = 1024 * 1024;

#[test]
fn test_export_matches_logical_content() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.vmdk");
    create_sparse_disk(&path, MIB, &CreateOptions::default()).unwrap();

    let payload = [0x7Eu8; 5000];
    {
        let mut disk = Disk::open(&path, AccessMode::ReadWrite).unwrap();
        disk.content().write_at(300_000, &payload).unwrap();
        disk.content().flush().unwrap();
    }

    let mut disk = Disk::open(&path, AccessMode::ReadOnly).unwrap();
    let total = disk.len_bytes();
    let options = ExportOptions {
        chunk_size: 64 * 1024,
    };
    let (raw, summary) = export_raw(disk.content(), Vec::new(), &options, None).unwrap();

    assert_eq!(raw.len() as u64, total);
    assert_eq!(summary.bytes_written, total);
    assert_eq!(&raw[300_000..305_000], &payload[..]);
    assert!(raw[..300_000].iter().all(|&b| b == 0));

    // Digest matches an independent hash of the raw content
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    let expected: [u8; 32] = hasher.finalize().into();
    assert_eq!(summary.sha256, expected);
    assert_eq!(summary.sha256_hex().len(), 64);
}

#[test]
fn test_export_chunk_size_does_not_change_output() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.vmdk");
    create_sparse_disk(&path, MIB, &CreateOptions::default()).unwrap();
    {
        let mut disk = Disk::open(&path, AccessMode::ReadWrite).unwrap();
        for i in 0..50u64 {
            disk.content().write_at(i * 31_013, &[i as u8]).unwrap();
        }
        disk.content().flush().unwrap();
    }

    let mut digests = Vec::new();
    for chunk_size in [4096usize, 65_536, 1_000_003] {
        let mut disk = Disk::open(&path, AccessMode::ReadOnly).unwrap();
        let options = ExportOptions { chunk_size };
        let (_, summary) = export_raw(disk.content(), Vec::new(), &options, None).unwrap();
        digests.push(summary.sha256);
    }
    assert_eq!(digests[0], digests[1]);
    assert_eq!(digests[1], digests[2]);
}

#[test]
fn test_export_progress_reaches_total() {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("disk.vmdk");
    create_sparse_disk(&path, MIB, &CreateOptions::default()).unwrap();

    let mut disk = Disk::open(&path, AccessMode::ReadOnly).unwrap();
    let total = disk.len_bytes();

    let high_water = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&high_water);
    let callback: vdisk_core::ProgressCallback = Box::new(move |p| {
        seen.fetch_max(p.bytes_processed, Ordering::SeqCst);
    });

    let options = ExportOptions {
        chunk_size: 128 * 1024,
    };
    export_raw(disk.content(), Vec::new(), &options, Some(callback)).unwrap();
    assert_eq!(high_water.load(Ordering::SeqCst), total);
}
