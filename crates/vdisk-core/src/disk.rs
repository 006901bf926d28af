//! Disk opening and extent composition.
//!
//! A disk is an ordered list of extents concatenated into one seekable
//! logical byte stream. Accesses that span an extent boundary are split
//! transparently and routed to each underlying extent in order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::descriptor::{
    parse_descriptor, AccessMode, DiskDescriptor, DiskGeometry, ExtentKind,
};
use crate::error::{Error, Result};
use crate::sparse::{is_sparse_extent, SparseExtent, SECTOR_SIZE};

/// One extent's logical stream: declared access, declared length, and the
/// backing flavor. The kind set is closed by the container format.
#[derive(Debug)]
pub struct ExtentStream<S> {
    access: AccessMode,
    len_bytes: u64,
    kind: ExtentIo<S>,
}

#[derive(Debug)]
enum ExtentIo<S> {
    /// Byte-for-byte passthrough to a region of the backing file.
    Flat { storage: S, base_offset: u64 },
    /// Reads as zeros, consumes no storage.
    Zero,
    /// Grain-addressed sparse extent.
    Sparse(Box<SparseExtent<S>>),
}

impl<S: Read + Write + Seek> ExtentStream<S> {
    /// A flat passthrough extent over `[base_offset, base_offset + len)`
    /// of the backing storage.
    pub fn flat(storage: S, base_offset: u64, len_bytes: u64, access: AccessMode) -> Self {
        Self {
            access,
            len_bytes,
            kind: ExtentIo::Flat {
                storage,
                base_offset,
            },
        }
    }

    /// A zero extent of the given length.
    pub fn zero(len_bytes: u64) -> Self {
        Self {
            access: AccessMode::ReadWrite,
            len_bytes,
            kind: ExtentIo::Zero,
        }
    }

    /// A sparse extent stream of `len_bytes` logical bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Format`] when the extent's capacity is smaller
    /// than the declared length.
    pub fn sparse(extent: SparseExtent<S>, len_bytes: u64, access: AccessMode) -> Result<Self> {
        if extent.capacity_bytes() < len_bytes {
            return Err(Error::format(format!(
                "sparse extent capacity {} below declared size {}",
                extent.capacity_bytes(),
                len_bytes
            )));
        }
        Ok(Self {
            access,
            len_bytes,
            kind: ExtentIo::Sparse(Box::new(extent)),
        })
    }

    /// Logical length in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.len_bytes
    }

    /// Whether writes are denied.
    pub fn is_read_only(&self) -> bool {
        self.access != AccessMode::ReadWrite
    }

    /// Whether this is a sparse extent.
    pub fn is_sparse(&self) -> bool {
        matches!(self.kind, ExtentIo::Sparse(_))
    }

    /// Read `buf.len()` bytes at `offset` within this extent.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.access == AccessMode::NoAccess {
            return Err(Error::access_denied("extent declares NOACCESS"));
        }
        self.check_bounds(offset, buf.len())?;
        match &mut self.kind {
            ExtentIo::Flat {
                storage,
                base_offset,
            } => {
                storage.seek(SeekFrom::Start(*base_offset + offset))?;
                storage.read_exact(buf)?;
                Ok(())
            }
            ExtentIo::Zero => {
                buf.fill(0);
                Ok(())
            }
            ExtentIo::Sparse(extent) => extent.read_at(offset, buf),
        }
    }

    /// Write `buf` at `offset` within this extent.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self.access {
            AccessMode::ReadWrite => {}
            AccessMode::ReadOnly => {
                return Err(Error::access_denied("extent declares RDONLY"));
            }
            AccessMode::NoAccess => {
                return Err(Error::access_denied("extent declares NOACCESS"));
            }
        }
        self.check_bounds(offset, buf.len())?;
        match &mut self.kind {
            ExtentIo::Flat {
                storage,
                base_offset,
            } => {
                storage.seek(SeekFrom::Start(*base_offset + offset))?;
                storage.write_all(buf)?;
                Ok(())
            }
            ExtentIo::Zero => Err(Error::not_supported(
                "zero extents have no backing storage to write",
            )),
            ExtentIo::Sparse(extent) => extent.write_at(offset, buf),
        }
    }

    /// Flush buffered writes.
    pub fn flush(&mut self) -> Result<()> {
        match &mut self.kind {
            ExtentIo::Flat { storage, .. } => {
                storage.flush()?;
                Ok(())
            }
            ExtentIo::Zero => Ok(()),
            ExtentIo::Sparse(extent) => extent.flush(),
        }
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset
            .checked_add(len as u64)
            .map_or(true, |end| end > self.len_bytes)
        {
            return Err(Error::out_of_range(offset, len, self.len_bytes));
        }
        Ok(())
    }
}

/// The composed logical content of a disk: extents concatenated in list
/// order into one addressable byte range `[0, len_bytes())`.
#[derive(Debug)]
pub struct DiskContent<S> {
    extents: Vec<ExtentStream<S>>,
    /// Logical start offset of each extent; parallel to `extents`.
    starts: Vec<u64>,
    total_bytes: u64,
}

impl<S: Read + Write + Seek> DiskContent<S> {
    /// Compose extents in list order.
    pub fn new(extents: Vec<ExtentStream<S>>) -> Self {
        let mut starts = Vec::with_capacity(extents.len());
        let mut total_bytes = 0u64;
        for extent in &extents {
            starts.push(total_bytes);
            total_bytes += extent.len_bytes();
        }
        Self {
            extents,
            starts,
            total_bytes,
        }
    }

    /// Total logical length in bytes (sum of extent sizes).
    pub fn len_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Whether any extent is sparse.
    pub fn is_sparse(&self) -> bool {
        self.extents.iter().any(|e| e.is_sparse())
    }

    /// Read at a logical offset. Accesses spanning extent boundaries are
    /// split and served by each extent in turn.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = self.extent_index(pos);
            let local = pos - self.starts[index];
            let extent = &mut self.extents[index];
            let n = ((extent.len_bytes() - local) as usize).min(buf.len() - done);
            extent.read_at(local, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Write at a logical offset, splitting across extents as needed.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_bounds(offset, buf.len())?;
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = self.extent_index(pos);
            let local = pos - self.starts[index];
            let extent = &mut self.extents[index];
            let n = ((extent.len_bytes() - local) as usize).min(buf.len() - done);
            extent.write_at(local, &buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Flush every extent.
    pub fn flush(&mut self) -> Result<()> {
        for extent in &mut self.extents {
            extent.flush()?;
        }
        Ok(())
    }

    fn extent_index(&self, pos: u64) -> usize {
        self.starts.partition_point(|&start| start <= pos) - 1
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset
            .checked_add(len as u64)
            .map_or(true, |end| end > self.total_bytes)
        {
            return Err(Error::out_of_range(offset, len, self.total_bytes));
        }
        Ok(())
    }
}

/// An open disk image: descriptor plus the composed content stream.
#[derive(Debug)]
pub struct Disk {
    descriptor: DiskDescriptor,
    content: DiskContent<File>,
}

impl Disk {
    /// Open a disk image, read-only or read-write.
    ///
    /// `path` is either a textual descriptor file or a monolithic sparse
    /// image with an embedded descriptor; the magic in the first sector
    /// decides. All headers and directories are validated here — the disk
    /// is either fully usable or not opened at all. Differencing disks are
    /// rejected before any extent is touched.
    pub fn open(path: &Path, access: AccessMode) -> Result<Self> {
        if is_sparse_extent(path)? {
            Self::open_monolithic_sparse(path, access)
        } else {
            let content = std::fs::read_to_string(path).map_err(|e| Error::io(e, path))?;
            let descriptor = parse_descriptor(&content)?;
            Self::open_with_descriptor(descriptor, path, access)
        }
    }

    fn open_monolithic_sparse(path: &Path, access: AccessMode) -> Result<Self> {
        let storage = open_backing(path, access)?;
        let mut extent = SparseExtent::open(storage, access)?;
        let text = extent.embedded_descriptor()?.ok_or_else(|| {
            Error::format("sparse image carries no embedded descriptor")
        })?;
        let descriptor = parse_descriptor(&text)?;
        if descriptor.has_parent() {
            return Err(Error::not_supported(
                "differencing disks are not supported",
            ));
        }
        if descriptor.extents.len() != 1 || descriptor.extents[0].kind != ExtentKind::Sparse {
            return Err(Error::format(
                "embedded descriptor must declare exactly one sparse extent",
            ));
        }
        let entry = &descriptor.extents[0];
        let effective = effective_access(access, entry.access);
        let stream =
            ExtentStream::sparse(extent, entry.size_sectors * SECTOR_SIZE, effective)?;

        Ok(Self {
            descriptor,
            content: DiskContent::new(vec![stream]),
        })
    }

    fn open_with_descriptor(
        descriptor: DiskDescriptor,
        descriptor_path: &Path,
        access: AccessMode,
    ) -> Result<Self> {
        if descriptor.has_parent() {
            return Err(Error::not_supported(
                "differencing disks are not supported",
            ));
        }

        let dir = descriptor_path.parent().unwrap_or_else(|| Path::new("."));
        let mut streams = Vec::with_capacity(descriptor.extents.len());

        for entry in &descriptor.extents {
            let len_bytes = entry.size_sectors * SECTOR_SIZE;
            let effective = effective_access(access, entry.access);

            let stream = match entry.kind {
                ExtentKind::Zero => ExtentStream::zero(len_bytes),
                ExtentKind::Flat | ExtentKind::Vmfs => {
                    let backing = require_backing(entry.backing.as_deref())?;
                    let backing_path = dir.join(backing);
                    let storage = open_backing(&backing_path, effective)?;
                    let base = entry.offset_sectors * SECTOR_SIZE;
                    let file_len = storage
                        .metadata()
                        .map_err(|e| Error::io(e, &backing_path))?
                        .len();
                    if base + len_bytes > file_len {
                        return Err(Error::format(format!(
                            "flat extent '{}' is shorter than its declared size",
                            backing
                        )));
                    }
                    ExtentStream::flat(storage, base, len_bytes, effective)
                }
                ExtentKind::Sparse => {
                    let backing = require_backing(entry.backing.as_deref())?;
                    let backing_path = dir.join(backing);
                    let storage = open_backing(&backing_path, effective)?;
                    let extent = SparseExtent::open(storage, effective)?;
                    ExtentStream::sparse(extent, len_bytes, effective)?
                }
                ExtentKind::VmfsSparse | ExtentKind::VmfsRdm | ExtentKind::VmfsRaw => {
                    return Err(Error::not_supported(format!(
                        "extent type {} is not supported",
                        entry.kind.as_str()
                    )));
                }
            };
            streams.push(stream);
        }

        Ok(Self {
            descriptor,
            content: DiskContent::new(streams),
        })
    }

    /// The parsed descriptor.
    pub fn descriptor(&self) -> &DiskDescriptor {
        &self.descriptor
    }

    /// Declared BIOS geometry.
    pub fn geometry(&self) -> DiskGeometry {
        self.descriptor.geometry
    }

    /// Whether any extent stores data sparsely.
    pub fn is_sparse(&self) -> bool {
        self.content.is_sparse()
    }

    /// Total logical length in bytes.
    pub fn len_bytes(&self) -> u64 {
        self.content.len_bytes()
    }

    /// The composed content stream.
    pub fn content(&mut self) -> &mut DiskContent<File> {
        &mut self.content
    }
}

fn effective_access(disk: AccessMode, extent: AccessMode) -> AccessMode {
    match (disk, extent) {
        (_, AccessMode::NoAccess) => AccessMode::NoAccess,
        (AccessMode::ReadOnly, _) | (_, AccessMode::ReadOnly) => AccessMode::ReadOnly,
        (AccessMode::NoAccess, _) => AccessMode::NoAccess,
        (AccessMode::ReadWrite, AccessMode::ReadWrite) => AccessMode::ReadWrite,
    }
}

fn require_backing(backing: Option<&str>) -> Result<&str> {
    backing.ok_or_else(|| Error::format("extent is missing its backing file name"))
}

fn open_backing(path: &Path, access: AccessMode) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(access == AccessMode::ReadWrite)
        .open(path)
        .map_err(|e| Error::io(e, path))
}
