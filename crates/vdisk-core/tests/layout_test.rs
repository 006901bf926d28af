//! Integration tests for sparse layout planning.

use vdisk_core::{SparseLayout, GT_ENTRIES_PER_GT, SECTOR_SIZE};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// A spread of awkward capacities: tiny, unaligned, huge.
fn capacity_sweep() -> Vec<u64> {
    let mut capacities = vec![1, 512, 513, 4096, MIB - 1, MIB, MIB + 1];
    for i in 1..40u64 {
        capacities.push(i * 97 * MIB + i * 31);
    }
    capacities.extend([GIB, 2 * GIB + 777, 64 * GIB, 500 * GIB]);
    capacities
}

#[test]
fn test_actual_capacity_covers_request() {
    for capacity in capacity_sweep() {
        let layout = SparseLayout::plan(capacity, 0).unwrap();
        assert!(layout.capacity_bytes() >= capacity);
    }
}

#[test]
fn test_capacity_is_multiple_of_table_span() {
    for capacity in capacity_sweep() {
        let layout = SparseLayout::plan(capacity, 0).unwrap();
        let span = layout.grain_size_bytes() * GT_ENTRIES_PER_GT as u64;
        assert_eq!(layout.capacity_bytes() % span, 0);
    }
}

#[test]
fn test_overhead_is_multiple_of_grain_size() {
    for capacity in capacity_sweep() {
        let layout = SparseLayout::plan(capacity, 20).unwrap();
        assert_eq!(layout.overhead_sectors % layout.grain_size_sectors, 0);
    }
}

#[test]
fn test_metadata_regions_are_ordered_and_disjoint() {
    for capacity in capacity_sweep() {
        let layout = SparseLayout::plan(capacity, 3).unwrap();
        let tables = layout.num_grain_tables * layout.table_sectors;
        // header | descriptor | rgd | rgts | gd | gts | data
        assert!(layout.rgd_offset >= 1 + layout.descriptor_sectors);
        assert_eq!(layout.rgt_offset, layout.rgd_offset + layout.directory_sectors);
        assert_eq!(layout.gd_offset, layout.rgt_offset + tables);
        assert_eq!(layout.gt_offset, layout.gd_offset + layout.directory_sectors);
        assert!(layout.overhead_sectors >= layout.gt_offset + tables);
    }
}

#[test]
fn test_grain_size_never_below_minimum() {
    for capacity in capacity_sweep() {
        let layout = SparseLayout::plan(capacity, 0).unwrap();
        assert!(layout.grain_size_sectors >= 8);
    }
}

#[test]
fn test_directory_slots_all_populated() {
    for capacity in [MIB, 100 * MIB, 3 * GIB] {
        let layout = SparseLayout::plan(capacity, 0).unwrap();
        for redundant in [true, false] {
            let entries = layout.directory_entries(redundant);
            assert_eq!(entries.len() as u64, layout.num_grain_tables);
            assert!(entries.iter().all(|&e| e != 0));
        }
    }
}

#[test]
fn test_header_round_trips_through_encoding() {
    let layout = SparseLayout::plan(10 * GIB, 20).unwrap();
    let header = layout.header();
    let decoded =
        vdisk_core::SparseExtentHeader::from_bytes(&header.to_bytes()).unwrap();
    assert_eq!(decoded, header);
    assert_eq!(decoded.capacity_bytes(), layout.capacity_bytes());
}

#[test]
fn test_one_mib_concrete_plan() {
    // The concrete scenario: 1 MiB requested, 512-byte sectors.
    let layout = SparseLayout::plan(MIB, 0).unwrap();
    assert_eq!(layout.grain_size_sectors, 8);
    assert_eq!(layout.grain_size_bytes(), 4096);
    assert_eq!(layout.num_grain_tables, 1);
    assert_eq!(layout.capacity_bytes(), 8 * SECTOR_SIZE * 512);
}
