//! Mach-O and Universal (fat) binary inspection.
//!
//! This module reads just enough of the Mach-O container format to answer
//! two questions: which dynamic libraries does a binary reference, and what
//! is the binary's own install-name identity. Both thin and fat files are
//! handled; fat files report the dylib records of every architecture slice.
//!
//! Headers and load commands are stored in the byte order declared by the
//! file's magic number, so every field read goes through a swap decided per
//! slice.

use std::fmt::Display;
use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::{Error, Result};

// Mach-O magic numbers, as seen by a little-endian read of the first field.
pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;
pub const FAT_MAGIC: u32 = 0xcafebabe;
pub const FAT_CIGAM: u32 = 0xbebafeca;

// Load command tags
const LC_REQ_DYLD: u32 = 0x80000000;
const LC_LOAD_DYLIB: u32 = 0x0c;
const LC_ID_DYLIB: u32 = 0x0d;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;

const MACH_HEADER_SIZE: usize = 28;
const MACH_HEADER_64_SIZE: usize = 32;
const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;
const DYLIB_COMMAND_SIZE: usize = 24;

/// Architecture of a Mach-O slice (CPU family plus subtype).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arch {
    pub cpu: u32,
    pub subtype: u32,
}

impl Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.cpu {
            0x00000007 => "i386",
            0x01000007 => "x86_64",
            0x0000000c => "arm",
            0x0100000c => "arm64",
            0x00000012 => "ppc",
            0x01000012 => "ppc64",
            other => return write!(f, "cpu{other}"),
        };
        write!(f, "{name}")
    }
}

/// One dylib load command, or the binary's own identity command.
#[derive(Debug, Clone)]
pub struct DylibRecord {
    /// The install-name path recorded in the command.
    pub path: String,
    /// Timestamp field of the command.
    pub time: u32,
    /// Packed current version (`A.B.C` as `A<<16 | B<<8 | C`).
    pub current_version: u32,
    /// Packed compatibility version.
    pub compat_version: u32,
    /// Whether the library was referenced through a weak-dylib command.
    pub weak: bool,
    /// Architecture of the slice the command was found in.
    pub arch: Arch,
}

impl DylibRecord {
    /// Human-readable rendering of the version fields.
    pub fn info(&self) -> String {
        format!(
            "compatibility version {}, current version {}",
            format_version(self.compat_version),
            format_version(self.current_version)
        )
    }
}

fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version >> 16,
        (version >> 8) & 0xff,
        version & 0xff
    )
}

/// Whether the file starts with one of the six Mach-O/fat magic numbers.
///
/// Reads exactly four bytes. A file too short to contain a magic number is
/// not a Mach-O, not an error; open and read failures propagate.
pub fn is_fat_or_macho(path: &Path) -> Result<bool> {
    let mut file = fs_err::File::open(path)?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(err) => return Err(err.into()),
    }

    let magic = u32::from_le_bytes(magic);
    Ok(matches!(
        magic,
        MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 | FAT_MAGIC | FAT_CIGAM
    ))
}

/// List the dynamic libraries referenced by a file, across every slice of a
/// fat binary. Both normal and weakly loaded libraries are reported.
pub fn read_dylibs(path: &Path) -> Result<Vec<DylibRecord>> {
    let records = read_records(path, false)?;
    debug!(
        "{}: {} dylib load commands",
        path.display(),
        records.len()
    );
    Ok(records)
}

/// The binary's own install-name identity, one record per slice. Empty for
/// binaries without an identity command (e.g. executables).
pub fn read_identity(path: &Path) -> Result<Vec<DylibRecord>> {
    read_records(path, true)
}

fn read_records(path: &Path, identity: bool) -> Result<Vec<DylibRecord>> {
    let data = fs_err::read(path)?;
    let mut records = Vec::new();
    for slice in carve_slices(&data, path)? {
        records.extend(slice_dylibs(&slice, identity)?);
    }
    Ok(records)
}

/// A single-architecture image, either the whole file or one fat slice.
struct Slice<'a> {
    data: &'a [u8],
    swap: bool,
    is64: bool,
    arch: Arch,
}

fn carve_slices<'a>(data: &'a [u8], path: &Path) -> Result<Vec<Slice<'a>>> {
    if data.len() < 4 {
        return Err(Error::NotMachO(path.to_path_buf()));
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    match magic {
        MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 => Ok(vec![thin_slice(data, path)?]),
        FAT_MAGIC | FAT_CIGAM => {
            let swap = magic == FAT_CIGAM;
            let count = read_u32(data, 4, swap)? as usize;
            let mut slices = Vec::with_capacity(count);
            for i in 0..count {
                let entry = FAT_HEADER_SIZE + i * FAT_ARCH_SIZE;
                let offset = read_u32(data, entry + 8, swap)? as usize;
                let size = read_u32(data, entry + 12, swap)? as usize;
                let end = offset
                    .checked_add(size)
                    .filter(|&end| end <= data.len())
                    .ok_or_else(|| {
                        Error::InvalidLoadCommand(format!("fat slice {i} out of bounds"))
                    })?;
                slices.push(thin_slice(&data[offset..end], path)?);
            }
            Ok(slices)
        }
        _ => Err(Error::NotMachO(path.to_path_buf())),
    }
}

fn thin_slice<'a>(data: &'a [u8], path: &Path) -> Result<Slice<'a>> {
    if data.len() < 4 {
        return Err(Error::NotMachO(path.to_path_buf()));
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let (swap, is64) = match magic {
        MH_MAGIC => (false, false),
        MH_CIGAM => (true, false),
        MH_MAGIC_64 => (false, true),
        MH_CIGAM_64 => (true, true),
        _ => return Err(Error::NotMachO(path.to_path_buf())),
    };

    let header_size = if is64 {
        MACH_HEADER_64_SIZE
    } else {
        MACH_HEADER_SIZE
    };
    if data.len() < header_size {
        return Err(Error::InvalidLoadCommand("truncated Mach-O header".into()));
    }

    Ok(Slice {
        data,
        swap,
        is64,
        arch: Arch {
            cpu: read_u32(data, 4, swap)?,
            subtype: read_u32(data, 8, swap)?,
        },
    })
}

fn slice_dylibs(slice: &Slice<'_>, identity: bool) -> Result<Vec<DylibRecord>> {
    let ncmds = read_u32(slice.data, 16, slice.swap)?;
    let mut offset = if slice.is64 {
        MACH_HEADER_64_SIZE
    } else {
        MACH_HEADER_SIZE
    };

    let mut records = Vec::new();
    for _ in 0..ncmds {
        let cmd = read_u32(slice.data, offset, slice.swap)?;
        let cmdsize = read_u32(slice.data, offset + 4, slice.swap)? as usize;
        if cmdsize < 8 || offset + cmdsize > slice.data.len() {
            return Err(Error::InvalidLoadCommand(format!(
                "command size {cmdsize} out of bounds at offset {offset}"
            )));
        }

        let wanted = if identity {
            cmd == LC_ID_DYLIB
        } else {
            cmd == LC_LOAD_DYLIB || cmd == LC_LOAD_WEAK_DYLIB
        };
        if wanted {
            records.push(parse_dylib_command(
                slice,
                offset,
                cmdsize,
                cmd == LC_LOAD_WEAK_DYLIB,
            )?);
            if identity {
                // At most one identity command per slice.
                break;
            }
        }

        offset += cmdsize;
    }
    Ok(records)
}

fn parse_dylib_command(
    slice: &Slice<'_>,
    offset: usize,
    cmdsize: usize,
    weak: bool,
) -> Result<DylibRecord> {
    if cmdsize < DYLIB_COMMAND_SIZE {
        return Err(Error::InvalidLoadCommand(format!(
            "dylib command too short ({cmdsize} bytes)"
        )));
    }

    let name_offset = read_u32(slice.data, offset + 8, slice.swap)? as usize;
    if name_offset >= cmdsize {
        return Err(Error::InvalidLoadCommand(format!(
            "name offset {name_offset} past command size {cmdsize}"
        )));
    }

    // The name is NUL terminated, padded to the command size.
    let name = &slice.data[offset + name_offset..offset + cmdsize];
    let name = match name.iter().position(|&b| b == 0) {
        Some(nul) => &name[..nul],
        None => name,
    };

    Ok(DylibRecord {
        path: String::from_utf8_lossy(name).into_owned(),
        time: read_u32(slice.data, offset + 12, slice.swap)?,
        current_version: read_u32(slice.data, offset + 16, slice.swap)?,
        compat_version: read_u32(slice.data, offset + 20, slice.swap)?,
        weak,
        arch: slice.arch,
    })
}

fn read_u32(data: &[u8], offset: usize, swap: bool) -> Result<u32> {
    let bytes = data.get(offset..offset + 4).ok_or_else(|| {
        Error::InvalidLoadCommand(format!("truncated read at offset {offset}"))
    })?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    let value = u32::from_le_bytes(raw);
    Ok(if swap { value.swap_bytes() } else { value })
}
