//! Sparse extent binary header.
//!
//! The header occupies the first sector of every sparse extent file. All
//! fields are little-endian; third-party tooling reads the same layout, so
//! the codec here must be bit-exact.

use crate::error::{Error, Result};

use super::{GT_ENTRIES_PER_GT, SECTOR_SIZE, SPARSE_MAGIC};

/// Flag: newline-detection bytes are valid.
pub const FLAG_VALID_NEWLINE: u32 = 1 << 0;
/// Flag: a redundant grain directory/table copy is present.
pub const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
/// Flag: grain data is DEFLATE-compressed.
pub const FLAG_COMPRESSED: u32 = 1 << 16;
/// Flag: metadata is announced by stream markers.
pub const FLAG_MARKERS: u32 = 1 << 17;

/// Compression algorithm: none.
pub const COMPRESS_NONE: u16 = 0;
/// Compression algorithm: DEFLATE.
pub const COMPRESS_DEFLATE: u16 = 1;

/// Newline-detection bytes written at offsets 73..77.
const NEWLINE_CHARS: [u8; 4] = [b'\n', b' ', b'\r', b'\n'];

/// Parsed sparse extent header (the magic is implicit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseExtentHeader {
    /// Format version (1..=3).
    pub version: u32,
    /// Flag bits; see the `FLAG_*` constants.
    pub flags: u32,
    /// Virtual capacity of the extent, in sectors.
    pub capacity_sectors: u64,
    /// Grain size in sectors.
    pub grain_size_sectors: u64,
    /// Sector offset of the embedded descriptor, 0 if none.
    pub descriptor_offset: u64,
    /// Size of the embedded descriptor region in sectors, 0 if none.
    pub descriptor_size: u64,
    /// Number of grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Sector offset of the redundant grain directory, 0 if none.
    pub rgd_offset: u64,
    /// Sector offset of the primary grain directory.
    pub gd_offset: u64,
    /// First sector of the data region; everything before it is metadata.
    pub overhead_sectors: u64,
    /// Unclean-shutdown marker; left clear by this engine.
    pub unclean_shutdown: u8,
    /// Compression algorithm for grain data.
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Decode a header from the first sector of an extent file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the buffer is short, the magic does not
    /// match, the version is unrecognized, or the grain geometry is
    /// degenerate. Detection is eager: a header that decodes is usable.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(Error::format("sparse extent header too short"));
        }

        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != SPARSE_MAGIC {
            return Err(Error::format(format!(
                "invalid sparse extent magic: expected 0x{:X}, got 0x{:X}",
                SPARSE_MAGIC, magic
            )));
        }

        let header = Self {
            version: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            flags: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            capacity_sectors: u64::from_le_bytes(data[12..20].try_into().unwrap()),
            grain_size_sectors: u64::from_le_bytes(data[20..28].try_into().unwrap()),
            descriptor_offset: u64::from_le_bytes(data[28..36].try_into().unwrap()),
            descriptor_size: u64::from_le_bytes(data[36..44].try_into().unwrap()),
            num_gtes_per_gt: u32::from_le_bytes(data[44..48].try_into().unwrap()),
            rgd_offset: u64::from_le_bytes(data[48..56].try_into().unwrap()),
            gd_offset: u64::from_le_bytes(data[56..64].try_into().unwrap()),
            overhead_sectors: u64::from_le_bytes(data[64..72].try_into().unwrap()),
            unclean_shutdown: data[72],
            compress_algorithm: u16::from_le_bytes(data[77..79].try_into().unwrap()),
        };

        if header.version == 0 || header.version > 3 {
            return Err(Error::format(format!(
                "unsupported sparse extent version: {}",
                header.version
            )));
        }
        if header.grain_size_sectors == 0 {
            return Err(Error::format("sparse extent grain size is zero"));
        }
        if header.num_gtes_per_gt == 0 {
            return Err(Error::format("sparse extent grain table width is zero"));
        }

        Ok(header)
    }

    /// Encode the header to exactly one sector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SECTOR_SIZE as usize];

        buf[0..4].copy_from_slice(&SPARSE_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        buf[20..28].copy_from_slice(&self.grain_size_sectors.to_le_bytes());
        buf[28..36].copy_from_slice(&self.descriptor_offset.to_le_bytes());
        buf[36..44].copy_from_slice(&self.descriptor_size.to_le_bytes());
        buf[44..48].copy_from_slice(&self.num_gtes_per_gt.to_le_bytes());
        buf[48..56].copy_from_slice(&self.rgd_offset.to_le_bytes());
        buf[56..64].copy_from_slice(&self.gd_offset.to_le_bytes());
        buf[64..72].copy_from_slice(&self.overhead_sectors.to_le_bytes());
        buf[72] = self.unclean_shutdown;
        buf[73..77].copy_from_slice(&NEWLINE_CHARS);
        buf[77..79].copy_from_slice(&self.compress_algorithm.to_le_bytes());
        // 79..512 is pad, already zeroed

        buf
    }

    /// Whether a redundant grain directory/table copy is present.
    pub fn has_redundant_directory(&self) -> bool {
        (self.flags & FLAG_REDUNDANT_GRAIN_TABLE) != 0 && self.rgd_offset != 0
    }

    /// Whether grain data is compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Whether this is a marker stream.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size_sectors * SECTOR_SIZE
    }

    /// Virtual capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_sectors * SECTOR_SIZE
    }

    /// Logical span one grain table addresses, in bytes.
    pub fn table_span_bytes(&self) -> u64 {
        self.grain_size_bytes() * self.num_gtes_per_gt as u64
    }

    /// Number of grain directory entries (one per grain table).
    pub fn num_grain_tables(&self) -> u64 {
        let grains_total =
            (self.capacity_sectors + self.grain_size_sectors - 1) / self.grain_size_sectors;
        (grains_total + self.num_gtes_per_gt as u64 - 1) / self.num_gtes_per_gt as u64
    }
}

impl Default for SparseExtentHeader {
    fn default() -> Self {
        Self {
            version: 1,
            flags: FLAG_VALID_NEWLINE | FLAG_REDUNDANT_GRAIN_TABLE,
            capacity_sectors: 0,
            grain_size_sectors: 0,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt: GT_ENTRIES_PER_GT,
            rgd_offset: 0,
            gd_offset: 0,
            overhead_sectors: 0,
            unclean_shutdown: 0,
            compress_algorithm: COMPRESS_NONE,
        }
    }
}
