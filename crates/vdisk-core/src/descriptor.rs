//! Disk descriptor parsing and serialization.
//!
//! The descriptor is the line-oriented text that names a disk's geometry,
//! content id, creation type and ordered extent list. Unknown keys are
//! preserved verbatim so that re-serializing an unmodified descriptor
//! round-trips semantically.

use crate::error::{Error, Result};
use crate::sparse::SECTOR_SIZE;

/// Parent content id value meaning "no parent".
pub const CID_NO_PARENT: u32 = 0xffffffff;

/// Access mode declared for an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-write access.
    ReadWrite,
    /// Read-only access; writes are denied.
    ReadOnly,
    /// No access; reads and writes are denied.
    NoAccess,
}

impl AccessMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "RW" => Some(AccessMode::ReadWrite),
            "RDONLY" => Some(AccessMode::ReadOnly),
            "NOACCESS" => Some(AccessMode::NoAccess),
            _ => None,
        }
    }

    /// The token used in extent lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWrite => "RW",
            AccessMode::ReadOnly => "RDONLY",
            AccessMode::NoAccess => "NOACCESS",
        }
    }
}

/// The type of an extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    /// Flat extent - raw disk data in a separate file.
    Flat,
    /// Sparse extent - uses grain tables for allocation.
    Sparse,
    /// Zero extent - reads as zeros, consumes no storage.
    Zero,
    /// VMFS flat extent.
    Vmfs,
    /// VMFS sparse extent.
    VmfsSparse,
    /// VMFS raw device mapping.
    VmfsRdm,
    /// VMFS raw extent.
    VmfsRaw,
}

impl ExtentKind {
    fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentKind::Flat),
            "SPARSE" => Ok(ExtentKind::Sparse),
            "ZERO" => Ok(ExtentKind::Zero),
            "VMFS" => Ok(ExtentKind::Vmfs),
            "VMFSSPARSE" => Ok(ExtentKind::VmfsSparse),
            "VMFSRDM" => Ok(ExtentKind::VmfsRdm),
            "VMFSRAW" => Ok(ExtentKind::VmfsRaw),
            _ => Err(Error::format(format!("unknown extent type: {}", s))),
        }
    }

    /// The token used in extent lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtentKind::Flat => "FLAT",
            ExtentKind::Sparse => "SPARSE",
            ExtentKind::Zero => "ZERO",
            ExtentKind::Vmfs => "VMFS",
            ExtentKind::VmfsSparse => "VMFSSPARSE",
            ExtentKind::VmfsRdm => "VMFSRDM",
            ExtentKind::VmfsRaw => "VMFSRAW",
        }
    }
}

/// The creation type of a disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateType {
    MonolithicSparse,
    MonolithicFlat,
    TwoGbMaxExtentSparse,
    TwoGbMaxExtentFlat,
    VmfsSparse,
    VmfsFlat,
    StreamOptimized,
    /// Unrecognized creation type, preserved verbatim for round-trips.
    Custom(String),
}

impl CreateType {
    /// Parse a creation type. Unrecognized values are preserved as
    /// [`CreateType::Custom`] so a descriptor always round-trips.
    pub fn parse(s: &str) -> Self {
        match s {
            "monolithicSparse" => CreateType::MonolithicSparse,
            "monolithicFlat" => CreateType::MonolithicFlat,
            "twoGbMaxExtentSparse" => CreateType::TwoGbMaxExtentSparse,
            "twoGbMaxExtentFlat" => CreateType::TwoGbMaxExtentFlat,
            "vmfsSparse" => CreateType::VmfsSparse,
            "vmfs" => CreateType::VmfsFlat,
            "streamOptimized" => CreateType::StreamOptimized,
            other => CreateType::Custom(other.to_string()),
        }
    }

    /// The value written to the `createType` key.
    pub fn as_str(&self) -> &str {
        match self {
            CreateType::MonolithicSparse => "monolithicSparse",
            CreateType::MonolithicFlat => "monolithicFlat",
            CreateType::TwoGbMaxExtentSparse => "twoGbMaxExtentSparse",
            CreateType::TwoGbMaxExtentFlat => "twoGbMaxExtentFlat",
            CreateType::VmfsSparse => "vmfsSparse",
            CreateType::VmfsFlat => "vmfs",
            CreateType::StreamOptimized => "streamOptimized",
            CreateType::Custom(s) => s,
        }
    }
}

/// BIOS disk geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskGeometry {
    /// Number of cylinders.
    pub cylinders: u64,
    /// Number of heads.
    pub heads: u32,
    /// Sectors per track.
    pub sectors: u32,
}

/// One extent entry describing a slice of the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentDescriptor {
    /// Access mode declared for this extent.
    pub access: AccessMode,
    /// Size of this extent in 512-byte sectors. Always > 0.
    pub size_sectors: u64,
    /// Type of the extent.
    pub kind: ExtentKind,
    /// Name of the backing file. Absent for zero extents.
    pub backing: Option<String>,
    /// Offset within the backing file, in sectors.
    pub offset_sectors: u64,
}

/// Parsed disk descriptor.
///
/// The extent list order is the contract: extents are concatenated in list
/// order to form the logical disk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDescriptor {
    /// Descriptor format version.
    pub version: u32,
    /// Content id; refreshed on every save that mutates the descriptor.
    pub content_id: u32,
    /// Parent content id. [`CID_NO_PARENT`] means no parent.
    pub parent_content_id: u32,
    /// Path hint to a parent image, present only on differencing disks.
    pub parent_hint: Option<String>,
    /// The creation type of the disk.
    pub create_type: CreateType,
    /// The 128-bit disk uid (`ddb.uuid`), if present.
    pub uid: Option<[u8; 16]>,
    /// BIOS geometry.
    pub geometry: DiskGeometry,
    /// Ordered extent list. Never empty.
    pub extents: Vec<ExtentDescriptor>,
    /// Unrecognized keys, preserved in order for round-trip fidelity.
    pub extra: Vec<(String, String)>,
}

impl DiskDescriptor {
    /// Total disk size in sectors (sum of extent sizes).
    pub fn disk_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    /// Total disk size in bytes.
    pub fn disk_size_bytes(&self) -> u64 {
        self.disk_size_sectors() * SECTOR_SIZE
    }

    /// Whether this descriptor references a parent image.
    pub fn has_parent(&self) -> bool {
        self.parent_content_id != CID_NO_PARENT || self.parent_hint.is_some()
    }

    /// Replace the content id, signaling that the descriptor was rewritten
    /// by this engine. The caller supplies the new value so tests can be
    /// deterministic.
    pub fn refresh_content_id(&mut self, cid: u32) {
        self.content_id = cid;
    }

    /// Serialize the descriptor to its text form.
    ///
    /// Re-parsing the output yields an equivalent descriptor; the byte
    /// layout is not guaranteed to match the input.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("# Disk DescriptorFile\n");
        out.push_str(&format!("version={}\n", self.version));
        out.push_str(&format!("CID={:08x}\n", self.content_id));
        out.push_str(&format!("parentCID={:08x}\n", self.parent_content_id));
        if let Some(hint) = &self.parent_hint {
            out.push_str(&format!("parentFileNameHint=\"{}\"\n", hint));
        }
        out.push_str(&format!("createType=\"{}\"\n", self.create_type.as_str()));

        out.push_str("\n# Extent description\n");
        for extent in &self.extents {
            out.push_str(&serialize_extent_line(extent));
            out.push('\n');
        }

        out.push_str("\n# The Disk Data Base\n#DDB\n\n");
        out.push_str(&format!(
            "ddb.geometry.cylinders = \"{}\"\n",
            self.geometry.cylinders
        ));
        out.push_str(&format!("ddb.geometry.heads = \"{}\"\n", self.geometry.heads));
        out.push_str(&format!(
            "ddb.geometry.sectors = \"{}\"\n",
            self.geometry.sectors
        ));
        if let Some(uid) = &self.uid {
            let hex: Vec<String> = uid.iter().map(|b| format!("{:02x}", b)).collect();
            out.push_str(&format!("ddb.uuid = \"{}\"\n", hex.join(" ")));
        }
        for (key, value) in &self.extra {
            out.push_str(&format!("{} = \"{}\"\n", key, value));
        }
        out
    }
}

/// Parse a disk descriptor from its text content.
///
/// # Errors
///
/// Returns [`Error::Format`] when the extent line grammar is violated,
/// geometry or id fields are non-numeric, or no extent is declared.
pub fn parse_descriptor(content: &str) -> Result<DiskDescriptor> {
    let mut version = 1;
    let mut content_id = 0u32;
    let mut parent_content_id = CID_NO_PARENT;
    let mut parent_hint = None;
    let mut create_type = CreateType::Custom(String::new());
    let mut uid = None;
    let mut geometry = DiskGeometry::default();
    let mut extents = Vec::new();
    let mut extra = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Extent lines start with an access token
        if line.starts_with("RW ") || line.starts_with("RDONLY ") || line.starts_with("NOACCESS ")
        {
            extents.push(parse_extent_line(line)?);
            continue;
        }

        let Some((key, value)) = parse_key_value(line) else {
            continue;
        };

        match key.as_str() {
            "version" => {
                version = value
                    .parse()
                    .map_err(|_| Error::format(format!("invalid version: {}", value)))?;
            }
            "CID" => {
                content_id = u32::from_str_radix(&value, 16)
                    .map_err(|_| Error::format(format!("invalid CID: {}", value)))?;
            }
            "parentCID" => {
                parent_content_id = u32::from_str_radix(&value, 16)
                    .map_err(|_| Error::format(format!("invalid parentCID: {}", value)))?;
            }
            "parentFileNameHint" => {
                parent_hint = Some(value);
            }
            "createType" => {
                create_type = CreateType::parse(&value);
            }
            "ddb.geometry.cylinders" => {
                geometry.cylinders = value
                    .parse()
                    .map_err(|_| Error::format(format!("invalid cylinders: {}", value)))?;
            }
            "ddb.geometry.heads" => {
                geometry.heads = value
                    .parse()
                    .map_err(|_| Error::format(format!("invalid heads: {}", value)))?;
            }
            "ddb.geometry.sectors" => {
                geometry.sectors = value
                    .parse()
                    .map_err(|_| Error::format(format!("invalid sectors: {}", value)))?;
            }
            "ddb.uuid" => {
                uid = Some(parse_uid(&value)?);
            }
            _ => {
                // Preserve unknown keys in order for round-trip fidelity
                extra.push((key, value));
            }
        }
    }

    if extents.is_empty() {
        return Err(Error::format("descriptor declares no extents"));
    }

    Ok(DiskDescriptor {
        version,
        content_id,
        parent_content_id,
        parent_hint,
        create_type,
        uid,
        geometry,
        extents,
        extra,
    })
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let mut value = line[eq_pos + 1..].trim().to_string();

    // Remove surrounding quotes if present
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }

    Some((key, value))
}

/// Parse a 128-bit uid like "60 00 c2 93 ..." (16 hex bytes).
fn parse_uid(value: &str) -> Result<[u8; 16]> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 16 {
        return Err(Error::format(format!("invalid uuid: {}", value)));
    }
    let mut uid = [0u8; 16];
    for (i, part) in parts.iter().enumerate() {
        uid[i] = u8::from_str_radix(part, 16)
            .map_err(|_| Error::format(format!("invalid uuid byte: {}", part)))?;
    }
    Ok(uid)
}

/// Parse an extent line like: `RW 4192256 SPARSE "disk.vmdk" 0`
///
/// Zero extents carry no backing name or offset: `RW 2000 ZERO`
fn parse_extent_line(line: &str) -> Result<ExtentDescriptor> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::format(format!("invalid extent line: {}", line)));
    }

    let access = AccessMode::parse(parts[0])
        .ok_or_else(|| Error::format(format!("invalid extent access: {}", parts[0])))?;
    let size_sectors: u64 = parts[1]
        .parse()
        .map_err(|_| Error::format(format!("invalid extent size: {}", parts[1])))?;
    if size_sectors == 0 {
        return Err(Error::format(format!("zero-sized extent: {}", line)));
    }
    let kind = ExtentKind::parse(parts[2])?;

    if kind == ExtentKind::Zero {
        return Ok(ExtentDescriptor {
            access,
            size_sectors,
            kind,
            backing: None,
            offset_sectors: 0,
        });
    }

    // The backing name is quoted and may contain spaces
    let rest_of_line = line
        .split_whitespace()
        .skip(3)
        .collect::<Vec<&str>>()
        .join(" ");
    let (backing, offset_str) = parse_quoted_name_and_offset(&rest_of_line)?;

    let offset_sectors: u64 = if offset_str.is_empty() {
        0
    } else {
        offset_str
            .parse()
            .map_err(|_| Error::format(format!("invalid extent offset: {}", offset_str)))?
    };

    Ok(ExtentDescriptor {
        access,
        size_sectors,
        kind,
        backing: Some(backing),
        offset_sectors,
    })
}

/// Parse a quoted backing name followed by an optional offset, e.g.
/// `"disk-flat.vmdk" 0`.
fn parse_quoted_name_and_offset(s: &str) -> Result<(String, String)> {
    let s = s.trim();

    if !s.starts_with('"') {
        return Err(Error::format(format!("expected quoted extent name, got: {}", s)));
    }

    let end_quote = s[1..]
        .find('"')
        .ok_or_else(|| Error::format(format!("unclosed quote in: {}", s)))?
        + 1;

    let name = s[1..end_quote].to_string();
    let offset_str = s[end_quote + 1..].trim().to_string();

    Ok((name, offset_str))
}

fn serialize_extent_line(extent: &ExtentDescriptor) -> String {
    match &extent.backing {
        Some(name) => format!(
            "{} {} {} \"{}\" {}",
            extent.access.as_str(),
            extent.size_sectors,
            extent.kind.as_str(),
            name,
            extent.offset_sectors
        ),
        None => format!(
            "{} {} {}",
            extent.access.as_str(),
            extent.size_sectors,
            extent.kind.as_str()
        ),
    }
}
