//! Integration tests for disk opening and extent composition.

use std::fs;
use std::path::Path;

use tempfile::TempDir;
use vdisk_core::{AccessMode, Disk, Error};

/// Lay down a flat backing file of `sectors` 512-byte sectors filled with
/// `fill`.
fn write_flat(dir: &Path, name: &str, sectors: u64, fill: u8) {
    fs::write(dir.join(name), vec![fill; (sectors * 512) as usize]).unwrap();
}

fn write_descriptor(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

#[test]
fn test_two_extent_composition_length_and_routing() {
    let dir = TempDir::new().unwrap();
    write_flat(dir.path(), "data-flat.vmdk", 1000, 0xAB);
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 1000 FLAT "data-flat.vmdk" 0
RW 2000 ZERO
"#,
    );

    let mut disk = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadOnly).unwrap();
    assert_eq!(disk.len_bytes(), 3000 * 512);
    assert!(!disk.is_sparse());

    // A read spanning [999*512, 1001*512) is split across both extents
    let mut buf = vec![0u8; 1024];
    disk.content().read_at(999 * 512, &mut buf).unwrap();
    assert!(buf[..512].iter().all(|&b| b == 0xAB));
    assert!(buf[512..].iter().all(|&b| b == 0));
}

#[test]
fn test_write_into_zero_extent_not_supported() {
    let dir = TempDir::new().unwrap();
    write_flat(dir.path(), "data-flat.vmdk", 8, 0);
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 8 FLAT "data-flat.vmdk" 0
RW 8 ZERO
"#,
    );

    let mut disk = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadWrite).unwrap();
    // Entirely inside the flat extent: fine
    disk.content().write_at(0, &[1u8; 512]).unwrap();
    // Touching the zero extent: rejected
    let err = disk.content().write_at(8 * 512 - 256, &[1u8; 512]).unwrap_err();
    assert!(matches!(err, Error::NotSupported { .. }));
}

#[test]
fn test_readonly_extent_denies_writes() {
    let dir = TempDir::new().unwrap();
    write_flat(dir.path(), "base-flat.vmdk", 16, 0);
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RDONLY 16 FLAT "base-flat.vmdk" 0
"#,
    );

    let mut disk = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadWrite).unwrap();
    let err = disk.content().write_at(0, &[1]).unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
}

#[test]
fn test_disk_opened_readonly_downgrades_extents() {
    let dir = TempDir::new().unwrap();
    write_flat(dir.path(), "data-flat.vmdk", 16, 0);
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 16 FLAT "data-flat.vmdk" 0
"#,
    );

    let mut disk = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadOnly).unwrap();
    let err = disk.content().write_at(0, &[1]).unwrap_err();
    assert!(matches!(err, Error::AccessDenied { .. }));
}

#[test]
fn test_differencing_disk_rejected() {
    let dir = TempDir::new().unwrap();
    write_flat(dir.path(), "child-flat.vmdk", 16, 0);
    write_descriptor(
        dir.path(),
        "child.vmdk",
        r#"version=1
CID=00000002
parentCID=00000001
parentFileNameHint="base.vmdk"
createType="custom"
RW 16 FLAT "child-flat.vmdk" 0
"#,
    );

    let err = Disk::open(&dir.path().join("child.vmdk"), AccessMode::ReadOnly).unwrap_err();
    assert!(matches!(err, Error::NotSupported { .. }));
}

#[test]
fn test_sparse_extent_bad_magic_fails_without_writing() {
    let dir = TempDir::new().unwrap();
    let garbage: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("broken.vmdk"), &garbage).unwrap();
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="monolithicSparse"
RW 4096 SPARSE "broken.vmdk" 0
"#,
    );

    let err = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadWrite).unwrap_err();
    assert!(matches!(err, Error::Format { .. }));
    // The rejected extent file was not touched
    assert_eq!(fs::read(dir.path().join("broken.vmdk")).unwrap(), garbage);
}

#[test]
fn test_missing_backing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 16 FLAT "gone-flat.vmdk" 0
"#,
    );

    let err = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadOnly).unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
}

#[test]
fn test_short_flat_backing_rejected_at_open() {
    let dir = TempDir::new().unwrap();
    // Backing holds 8 sectors but the descriptor claims 16
    write_flat(dir.path(), "data-flat.vmdk", 8, 0);
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 16 FLAT "data-flat.vmdk" 0
"#,
    );

    let err = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadOnly).unwrap_err();
    assert!(matches!(err, Error::Format { .. }));
}

#[test]
fn test_flat_extent_with_offset() {
    let dir = TempDir::new().unwrap();
    // 4 sectors of prefix, then 8 sectors of payload
    let mut bytes = vec![0u8; 12 * 512];
    bytes[4 * 512..].fill(0xCD);
    fs::write(dir.path().join("data-flat.vmdk"), &bytes).unwrap();
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 8 FLAT "data-flat.vmdk" 4
"#,
    );

    let mut disk = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadOnly).unwrap();
    assert_eq!(disk.len_bytes(), 8 * 512);
    let mut buf = [0u8; 512];
    disk.content().read_at(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0xCD));
}

#[test]
fn test_vmfs_rdm_extent_not_supported() {
    let dir = TempDir::new().unwrap();
    write_flat(dir.path(), "rdm.vmdk", 8, 0);
    write_descriptor(
        dir.path(),
        "disk.vmdk",
        r#"version=1
CID=00000001
parentCID=ffffffff
createType="custom"
RW 8 VMFSRDM "rdm.vmdk" 0
"#,
    );

    let err = Disk::open(&dir.path().join("disk.vmdk"), AccessMode::ReadOnly).unwrap_err();
    assert!(matches!(err, Error::NotSupported { .. }));
}
