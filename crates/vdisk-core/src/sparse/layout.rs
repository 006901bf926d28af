//! Sparse extent layout planning.
//!
//! Pure computation: given a requested capacity, derive the grain size,
//! grain-table count and the sector placement of every metadata region, so
//! that extent creation is a single pass of header + zeroed metadata
//! writes. The data region always starts on a grain-size boundary.

use crate::error::{Error, Result};

use super::header::{SparseExtentHeader, FLAG_REDUNDANT_GRAIN_TABLE, FLAG_VALID_NEWLINE};
use super::{GT_ENTRIES_PER_GT, MIN_GRAIN_SECTORS, SECTOR_SIZE};

/// Planning constant: aim for this many grain tables when sizing grains.
const TARGET_GRAIN_TABLES: u64 = 256;

/// Planned on-disk layout of a sparse extent.
///
/// All offsets and sizes are in sectors. Region order in the file:
/// header, optional embedded descriptor, redundant grain directory,
/// redundant grain tables, primary grain directory, primary grain tables,
/// then the grain-aligned data region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseLayout {
    /// Actual capacity in sectors; >= the requested capacity and a
    /// multiple of one grain table's span.
    pub capacity_sectors: u64,
    /// Grain size in sectors (>= 8, not necessarily a power of two).
    pub grain_size_sectors: u64,
    /// Number of grain tables (= grain directory entries).
    pub num_grain_tables: u64,
    /// Sector offset of the embedded descriptor, 0 if none.
    pub descriptor_offset: u64,
    /// Embedded descriptor region size in sectors.
    pub descriptor_sectors: u64,
    /// Sector offset of the redundant grain directory.
    pub rgd_offset: u64,
    /// Sector offset of the first redundant grain table.
    pub rgt_offset: u64,
    /// Sector offset of the primary grain directory.
    pub gd_offset: u64,
    /// Sector offset of the first primary grain table.
    pub gt_offset: u64,
    /// Directory size in sectors (each copy).
    pub directory_sectors: u64,
    /// Size of one grain table in sectors.
    pub table_sectors: u64,
    /// First data sector; a multiple of the grain size.
    pub overhead_sectors: u64,
}

impl SparseLayout {
    /// Plan the layout for a requested capacity in bytes.
    ///
    /// `descriptor_sectors` reserves an embedded-descriptor region after
    /// the header; pass 0 for none.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Format`] for a zero capacity and with
    /// [`Error::NotSupported`] when the extent would outgrow 32-bit sector
    /// addressing in the grain tables.
    pub fn plan(capacity_bytes: u64, descriptor_sectors: u64) -> Result<Self> {
        if capacity_bytes == 0 {
            return Err(Error::format("extent capacity must be positive"));
        }

        let entries = GT_ENTRIES_PER_GT as u64;
        let grain_size_sectors = (capacity_bytes / SECTOR_SIZE / (TARGET_GRAIN_TABLES * entries))
            .max(MIN_GRAIN_SECTORS);

        // Span of one grain table in bytes; capacity rounds up to a whole
        // number of table spans.
        let table_span_bytes = grain_size_sectors * SECTOR_SIZE * entries;
        let num_grain_tables = (capacity_bytes + table_span_bytes - 1) / table_span_bytes;
        let capacity_sectors = num_grain_tables * grain_size_sectors * entries;

        let directory_sectors = sectors_for_bytes(num_grain_tables * 4);
        let table_sectors = sectors_for_bytes(entries * 4);

        let descriptor_offset = if descriptor_sectors > 0 { 1 } else { 0 };
        let rgd_offset = 1 + descriptor_sectors;
        let rgt_offset = rgd_offset + directory_sectors;
        let gd_offset = rgt_offset + num_grain_tables * table_sectors;
        let gt_offset = gd_offset + directory_sectors;
        let metadata_end = gt_offset + num_grain_tables * table_sectors;

        // Data starts on a grain boundary so grain-index arithmetic maps
        // cleanly onto physical sectors.
        let overhead_sectors = round_up(metadata_end, grain_size_sectors);

        if overhead_sectors + capacity_sectors > u32::MAX as u64 {
            return Err(Error::not_supported(
                "extent too large for 32-bit grain addressing",
            ));
        }

        Ok(Self {
            capacity_sectors,
            grain_size_sectors,
            num_grain_tables,
            descriptor_offset,
            descriptor_sectors,
            rgd_offset,
            rgt_offset,
            gd_offset,
            gt_offset,
            directory_sectors,
            table_sectors,
            overhead_sectors,
        })
    }

    /// Actual capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_sectors * SECTOR_SIZE
    }

    /// Sector offset of grain table `index` in the chosen copy.
    pub fn table_offset(&self, index: u64, redundant: bool) -> u64 {
        let base = if redundant { self.rgt_offset } else { self.gt_offset };
        base + index * self.table_sectors
    }

    /// Directory entries for the chosen copy: each slot holds the sector
    /// offset of its grain table. Every slot is populated at creation.
    pub fn directory_entries(&self, redundant: bool) -> Vec<u32> {
        (0..self.num_grain_tables)
            .map(|i| self.table_offset(i, redundant) as u32)
            .collect()
    }

    /// Build the binary header for this layout.
    pub fn header(&self) -> SparseExtentHeader {
        SparseExtentHeader {
            flags: FLAG_VALID_NEWLINE | FLAG_REDUNDANT_GRAIN_TABLE,
            capacity_sectors: self.capacity_sectors,
            grain_size_sectors: self.grain_size_sectors,
            descriptor_offset: self.descriptor_offset,
            descriptor_size: self.descriptor_sectors,
            rgd_offset: self.rgd_offset,
            gd_offset: self.gd_offset,
            overhead_sectors: self.overhead_sectors,
            ..Default::default()
        }
    }
}

fn sectors_for_bytes(bytes: u64) -> u64 {
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

fn round_up(value: u64, multiple: u64) -> u64 {
    ((value + multiple - 1) / multiple) * multiple
}
