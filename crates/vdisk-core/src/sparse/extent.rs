//! Sparse grain address space.
//!
//! Resolves logical byte offsets to physical sectors through the two-level
//! grain directory / grain table structure, synthesizing zeros for
//! unallocated grains on read and allocating grains by appending on write.
//! Every allocation updates the redundant metadata copy before the primary
//! one, so an interrupted update leaves the redundant copy authoritative.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::descriptor::AccessMode;
use crate::error::{Error, Result};

use super::header::SparseExtentHeader;
use super::layout::SparseLayout;
use super::SECTOR_SIZE;

/// Entries per 512-byte sector of a grain table.
const ENTRIES_PER_SECTOR: usize = (SECTOR_SIZE / 4) as usize;

/// A sparse extent over seekable storage.
///
/// `S` is a file in production and an in-memory cursor in tests, the same
/// way the stream writer is generic over its sink.
#[derive(Debug)]
pub struct SparseExtent<S> {
    storage: S,
    header: SparseExtentHeader,
    access: AccessMode,
    /// Primary grain directory: sector offset of each grain table.
    grain_directory: Vec<u32>,
    /// Redundant grain directory; empty when the extent carries none.
    redundant_directory: Vec<u32>,
    /// Cached grain tables, loaded on first touch.
    tables: Vec<Option<Box<[u32]>>>,
    /// Append point for new grains, in sectors.
    end_sector: u64,
    allocated_grains: u64,
}

impl<S: Read + Write + Seek> SparseExtent<S> {
    /// Create a fresh sparse extent on empty storage.
    ///
    /// Plans the layout for `capacity_bytes` (rounded up per the planner),
    /// writes the header, the optional embedded descriptor and zero-filled
    /// grain tables with both directories fully populated. The resulting
    /// extent decodes every logical byte as zero.
    pub fn create(
        mut storage: S,
        capacity_bytes: u64,
        descriptor_text: Option<&str>,
    ) -> Result<Self> {
        let descriptor_sectors = descriptor_text
            .map(|t| (t.len() as u64 + SECTOR_SIZE - 1) / SECTOR_SIZE)
            .unwrap_or(0);
        let layout = SparseLayout::plan(capacity_bytes, descriptor_sectors)?;
        let header = layout.header();

        // Metadata image: header, descriptor, both directory/table copies.
        let metadata_end =
            (layout.gt_offset + layout.num_grain_tables * layout.table_sectors) * SECTOR_SIZE;
        let mut metadata = vec![0u8; metadata_end as usize];
        metadata[..SECTOR_SIZE as usize].copy_from_slice(&header.to_bytes());

        if let Some(text) = descriptor_text {
            let start = (layout.descriptor_offset * SECTOR_SIZE) as usize;
            metadata[start..start + text.len()].copy_from_slice(text.as_bytes());
        }

        for redundant in [true, false] {
            let dir_offset = if redundant {
                layout.rgd_offset
            } else {
                layout.gd_offset
            };
            let mut pos = (dir_offset * SECTOR_SIZE) as usize;
            for entry in layout.directory_entries(redundant) {
                metadata[pos..pos + 4].copy_from_slice(&entry.to_le_bytes());
                pos += 4;
            }
        }

        storage.seek(SeekFrom::Start(0))?;
        storage.write_all(&metadata)?;

        // Extend to exactly the data-region start; no trailing garbage.
        let pad = (layout.overhead_sectors * SECTOR_SIZE) - metadata_end;
        write_zeros(&mut storage, pad)?;
        storage.flush()?;

        let num_tables = layout.num_grain_tables as usize;
        Ok(Self {
            storage,
            grain_directory: layout.directory_entries(false),
            redundant_directory: layout.directory_entries(true),
            tables: vec![None; num_tables],
            end_sector: layout.overhead_sectors,
            allocated_grains: 0,
            header,
            access: AccessMode::ReadWrite,
        })
    }

    /// Open an existing sparse extent.
    ///
    /// The header and grain directory are read and validated eagerly: the
    /// extent is either fully usable afterwards or this fails. Marker
    /// streams are rejected, as is read-write access to compressed
    /// extents.
    pub fn open(mut storage: S, access: AccessMode) -> Result<Self> {
        storage.seek(SeekFrom::Start(0))?;
        let mut first_sector = vec![0u8; SECTOR_SIZE as usize];
        storage.read_exact(&mut first_sector)?;
        let header = SparseExtentHeader::from_bytes(&first_sector)?;

        if header.has_markers() {
            return Err(Error::not_supported(
                "marker-stream sparse extents cannot be opened for random access",
            ));
        }
        if header.is_compressed() && access == AccessMode::ReadWrite {
            return Err(Error::not_supported(
                "compressed sparse extents are read-only",
            ));
        }

        let file_len = storage.seek(SeekFrom::End(0))?;
        let num_tables = header.num_grain_tables();

        let grain_directory =
            read_directory(&mut storage, header.gd_offset, num_tables, file_len)?;
        let redundant_directory = if header.has_redundant_directory() {
            read_directory(&mut storage, header.rgd_offset, num_tables, file_len)?
        } else {
            Vec::new()
        };

        let end_sector = (file_len / SECTOR_SIZE).max(header.overhead_sectors);

        Ok(Self {
            storage,
            grain_directory,
            redundant_directory,
            tables: vec![None; num_tables as usize],
            end_sector,
            allocated_grains: 0,
            header,
            access,
        })
    }

    /// The parsed header.
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Virtual capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.header.capacity_bytes()
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.header.grain_size_bytes()
    }

    /// Grains allocated through this handle.
    pub fn allocated_grains(&self) -> u64 {
        self.allocated_grains
    }

    /// Whether writes are denied.
    pub fn is_read_only(&self) -> bool {
        self.access != AccessMode::ReadWrite
    }

    /// The embedded descriptor text, if the header reserves one.
    pub fn embedded_descriptor(&mut self) -> Result<Option<String>> {
        if self.header.descriptor_offset == 0 || self.header.descriptor_size == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; (self.header.descriptor_size * SECTOR_SIZE) as usize];
        self.storage
            .seek(SeekFrom::Start(self.header.descriptor_offset * SECTOR_SIZE))?;
        self.storage.read_exact(&mut buf)?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let text = String::from_utf8(buf[..end].to_vec())
            .map_err(|_| Error::format("embedded descriptor is not valid UTF-8"))?;
        Ok(Some(text))
    }

    /// Read `buf.len()` bytes at the logical `offset`.
    ///
    /// Unallocated grains read as zeros.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let grain_bytes = self.grain_size_bytes();

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let grain_index = pos / grain_bytes;
            let in_grain = pos % grain_bytes;
            let n = ((grain_bytes - in_grain) as usize).min(buf.len() - done);
            let out = &mut buf[done..done + n];

            match self.grain_entry(grain_index)? {
                0 => out.fill(0),
                entry if self.header.is_compressed() => {
                    let grain = self.read_compressed_grain(entry)?;
                    out.copy_from_slice(&grain[in_grain as usize..in_grain as usize + n]);
                }
                entry => {
                    self.storage
                        .seek(SeekFrom::Start(entry as u64 * SECTOR_SIZE + in_grain))?;
                    self.storage.read_exact(out)?;
                }
            }
            done += n;
        }
        Ok(())
    }

    /// Write `buf` at the logical `offset`, allocating grains as needed.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.access != AccessMode::ReadWrite {
            return Err(Error::access_denied("sparse extent is read-only"));
        }
        self.check_bounds(offset, buf.len())?;
        let grain_bytes = self.grain_size_bytes();

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let grain_index = pos / grain_bytes;
            let in_grain = pos % grain_bytes;
            let n = ((grain_bytes - in_grain) as usize).min(buf.len() - done);

            let grain_sector = self.resolve_or_allocate(grain_index)?;
            self.storage
                .seek(SeekFrom::Start(grain_sector * SECTOR_SIZE + in_grain))?;
            self.storage.write_all(&buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Flush buffered writes to the backing storage.
    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()?;
        Ok(())
    }

    /// Consume the extent, returning the backing storage.
    pub fn into_inner(self) -> S {
        self.storage
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        let capacity = self.capacity_bytes();
        if offset.checked_add(len as u64).map_or(true, |end| end > capacity) {
            return Err(Error::out_of_range(offset, len, capacity));
        }
        Ok(())
    }

    /// Grain table entry for `grain_index`; 0 means unallocated.
    ///
    /// Tolerates directories shorter than the capacity implies and
    /// unpopulated directory slots on third-party images: both read as
    /// unallocated.
    fn grain_entry(&mut self, grain_index: u64) -> Result<u32> {
        let entries = self.header.num_gtes_per_gt as u64;
        let table_index = (grain_index / entries) as usize;
        let entry_index = (grain_index % entries) as usize;

        if table_index >= self.grain_directory.len()
            || self.grain_directory[table_index] == 0
        {
            return Ok(0);
        }
        let table = self.load_table(table_index)?;
        Ok(table[entry_index])
    }

    /// Physical sector of the grain holding `grain_index`, allocating a
    /// fresh zero-filled grain at end of file when unallocated.
    fn resolve_or_allocate(&mut self, grain_index: u64) -> Result<u64> {
        let entries = self.header.num_gtes_per_gt as u64;
        let table_index = (grain_index / entries) as usize;
        let entry_index = (grain_index % entries) as usize;

        if table_index >= self.grain_directory.len()
            || self.grain_directory[table_index] == 0
        {
            // Tables are pre-allocated at creation; this engine never grows
            // the directory of a foreign image.
            return Err(Error::not_supported(
                "write targets a grain table the image never allocated",
            ));
        }

        let existing = self.load_table(table_index)?[entry_index];
        if existing != 0 {
            return Ok(existing as u64);
        }

        // Append a zero-filled grain at the end of the file.
        let grain_sector = self.end_sector;
        let grain_bytes = self.grain_size_bytes();
        self.storage
            .seek(SeekFrom::Start(grain_sector * SECTOR_SIZE))?;
        write_zeros(&mut self.storage, grain_bytes)?;

        // Record the entry in memory, then persist the table sector to the
        // redundant copy first and the primary second; a crash in between
        // leaves the redundant copy authoritative.
        let table = self.tables[table_index]
            .as_mut()
            .ok_or_else(|| Error::format("grain table vanished from cache"))?;
        table[entry_index] = grain_sector as u32;

        let sector_in_table = (entry_index / ENTRIES_PER_SECTOR) as u64;
        let mut sector = [0u8; SECTOR_SIZE as usize];
        let base = (sector_in_table as usize) * ENTRIES_PER_SECTOR;
        for (i, entry) in self.tables[table_index].as_ref().unwrap()[base..base + ENTRIES_PER_SECTOR]
            .iter()
            .enumerate()
        {
            sector[i * 4..i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }

        if let Some(&rgt) = self.redundant_directory.get(table_index) {
            if rgt != 0 {
                self.storage
                    .seek(SeekFrom::Start((rgt as u64 + sector_in_table) * SECTOR_SIZE))?;
                self.storage.write_all(&sector)?;
                self.storage.flush()?;
            }
        }
        let gt = self.grain_directory[table_index] as u64;
        self.storage
            .seek(SeekFrom::Start((gt + sector_in_table) * SECTOR_SIZE))?;
        self.storage.write_all(&sector)?;
        self.storage.flush()?;

        self.end_sector += self.header.grain_size_sectors;
        self.allocated_grains += 1;
        Ok(grain_sector)
    }

    fn load_table(&mut self, table_index: usize) -> Result<&[u32]> {
        if self.tables[table_index].is_none() {
            let offset = self.grain_directory[table_index] as u64 * SECTOR_SIZE;
            let count = self.header.num_gtes_per_gt as usize;
            let mut raw = vec![0u8; count * 4];
            self.storage.seek(SeekFrom::Start(offset))?;
            self.storage.read_exact(&mut raw)?;
            let entries: Vec<u32> = raw
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            self.tables[table_index] = Some(entries.into_boxed_slice());
        }
        Ok(self.tables[table_index].as_ref().unwrap())
    }

    /// Decompress one grain stored behind a 12-byte LBA/size marker.
    fn read_compressed_grain(&mut self, entry: u32) -> Result<Vec<u8>> {
        use flate2::read::DeflateDecoder;

        let offset = entry as u64 * SECTOR_SIZE;
        let mut marker = [0u8; 12];
        self.storage.seek(SeekFrom::Start(offset))?;
        self.storage.read_exact(&mut marker)?;
        let compressed_size = u32::from_le_bytes(marker[8..12].try_into().unwrap()) as usize;

        let mut compressed = vec![0u8; compressed_size];
        self.storage.read_exact(&mut compressed)?;

        let mut grain = vec![0u8; self.grain_size_bytes() as usize];
        let mut decoder = DeflateDecoder::new(&compressed[..]);
        decoder
            .read_exact(&mut grain)
            .map_err(|e| Error::format(format!("failed to decompress grain: {}", e)))?;
        Ok(grain)
    }
}

fn read_directory<S: Read + Seek>(
    storage: &mut S,
    offset_sectors: u64,
    num_entries: u64,
    file_len: u64,
) -> Result<Vec<u32>> {
    let offset = offset_sectors * SECTOR_SIZE;
    let bytes = num_entries * 4;
    if offset + bytes > file_len {
        return Err(Error::format("grain directory extends beyond the file"));
    }
    let mut raw = vec![0u8; bytes as usize];
    storage.seek(SeekFrom::Start(offset))?;
    storage.read_exact(&mut raw)?;
    Ok(raw
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn write_zeros<W: Write>(writer: &mut W, mut remaining: u64) -> Result<()> {
    let zeros = [0u8; 8192];
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        writer.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}
