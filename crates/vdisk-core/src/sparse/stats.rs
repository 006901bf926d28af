//! Sparse extent statistics.
//!
//! Read-only scan of a sparse extent file, memory-mapped so the grain
//! tables can be walked in parallel without seek traffic. Feeds the
//! storage-efficiency reporting exposed by the CLI.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use rayon::prelude::*;

use crate::error::{Error, Result};

use super::header::SparseExtentHeader;
use super::{SECTOR_SIZE, SPARSE_MAGIC};

/// Allocation statistics for one sparse extent file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentStats {
    /// Virtual capacity in bytes.
    pub capacity_bytes: u64,
    /// Grain size in bytes.
    pub grain_size_bytes: u64,
    /// Total grains the capacity decomposes into.
    pub total_grains: u64,
    /// Grains with backing storage.
    pub allocated_grains: u64,
    /// Bytes of grain data actually stored.
    pub stored_bytes: u64,
    /// Bytes of header/descriptor/directory metadata.
    pub overhead_bytes: u64,
    /// Size of the backing file.
    pub file_bytes: u64,
}

impl ExtentStats {
    /// Scan a sparse extent file.
    pub fn scan(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let len = file.metadata().map_err(|e| Error::io(e, path))?.len();
        if len < SECTOR_SIZE {
            return Err(Error::format("file too short for a sparse extent header"));
        }

        // Safety: mapping a file we just opened read-only; it stays valid
        // for the lifetime of the map.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };
        let header = SparseExtentHeader::from_bytes(&mmap)?;

        let num_tables = header.num_grain_tables();
        let gd_start = (header.gd_offset * SECTOR_SIZE) as usize;
        let gd_end = gd_start + num_tables as usize * 4;
        if gd_end > mmap.len() {
            return Err(Error::format("grain directory extends beyond the file"));
        }

        let directory: Vec<u32> = mmap[gd_start..gd_end]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();

        let table_bytes = header.num_gtes_per_gt as usize * 4;
        let data = &mmap[..];
        let per_table: Vec<u64> = directory
            .par_iter()
            .map(|&table_sector| -> Result<u64> {
                if table_sector == 0 {
                    return Ok(0);
                }
                let start = table_sector as usize * SECTOR_SIZE as usize;
                let end = start + table_bytes;
                if end > data.len() {
                    return Err(Error::format("grain table extends beyond the file"));
                }
                Ok(data[start..end]
                    .chunks_exact(4)
                    .filter(|entry| entry.iter().any(|&b| b != 0))
                    .count() as u64)
            })
            .collect::<Result<Vec<u64>>>()?;
        let allocated_grains: u64 = per_table.iter().sum();

        let total_grains = (header.capacity_sectors + header.grain_size_sectors - 1)
            / header.grain_size_sectors;

        Ok(Self {
            capacity_bytes: header.capacity_bytes(),
            grain_size_bytes: header.grain_size_bytes(),
            total_grains,
            allocated_grains,
            stored_bytes: allocated_grains * header.grain_size_bytes(),
            overhead_bytes: header.overhead_sectors * SECTOR_SIZE,
            file_bytes: len,
        })
    }

    /// Fraction of grains with backing storage, in [0, 1].
    pub fn occupancy(&self) -> f64 {
        if self.total_grains == 0 {
            return 0.0;
        }
        self.allocated_grains as f64 / self.total_grains as f64
    }
}

/// Check whether a file starts with the sparse extent magic.
pub fn is_sparse_extent(path: &Path) -> Result<bool> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut magic_bytes = [0u8; 4];

    match file.read_exact(&mut magic_bytes) {
        Ok(_) => Ok(u32::from_le_bytes(magic_bytes) == SPARSE_MAGIC),
        Err(_) => Ok(false),
    }
}
