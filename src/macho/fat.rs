//! Fat (universal) container splitting.
//!
//! A fat file is a big-endian header followed by an array of `fat_arch`
//! entries, each describing one thin Mach-O slice by offset and size.

use super::arch::Arch;
use super::constants::*;
use super::structs::FatArch;
use crate::error::{Error, Result};
use crate::util::{read_u32_be_at, read_u64_be_at};

/// Upper bound on slice entries; anything larger is not a real fat header
/// (Java class files share the 0xCAFEBABE magic).
const MAX_FAT_SLICES: u32 = 32;

/// Result of looking up an architecture in a possibly-fat file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatLookup {
    /// The file is not a fat container; treat it as a thin Mach-O.
    NotFat,
    /// The requested slice lives at `[offset, offset + size)`.
    Slice {
        /// File offset of the slice
        offset: u64,
        /// Length of the slice
        size: u64,
    },
    /// The file is fat but carries no usable slice for the architecture.
    MissingSlice,
}

/// Returns true if the data starts with a fat header magic.
#[inline]
pub fn is_fat(data: &[u8]) -> bool {
    data.len() >= 8 && matches!(read_u32_be_at(data, 0), FAT_MAGIC | FAT_MAGIC_64)
}

/// Parses every slice entry of a fat header.
pub fn fat_arches(data: &[u8]) -> Result<Vec<FatArch>> {
    if !is_fat(data) {
        return Ok(Vec::new());
    }

    let is_64 = read_u32_be_at(data, 0) == FAT_MAGIC_64;
    let count = read_u32_be_at(data, 4);
    if count > MAX_FAT_SLICES {
        return Err(Error::FatTooManySlices(count));
    }

    let entry_size = if is_64 { FatArch::SIZE_64 } else { FatArch::SIZE };
    let table_end = 8 + count as usize * entry_size;
    if table_end > data.len() {
        return Err(Error::buffer_too_small(table_end, data.len()));
    }

    let mut arches = Vec::with_capacity(count as usize);
    for index in 0..count as usize {
        let at = 8 + index * entry_size;
        let (offset, size) = if is_64 {
            (read_u64_be_at(data, at + 8), read_u64_be_at(data, at + 16))
        } else {
            (
                read_u32_be_at(data, at + 8) as u64,
                read_u32_be_at(data, at + 12) as u64,
            )
        };

        let end = offset.checked_add(size);
        if end.map_or(true, |end| end > data.len() as u64) {
            return Err(Error::FatSliceOutOfBounds {
                index,
                offset,
                size,
                file_size: data.len() as u64,
            });
        }

        arches.push(FatArch {
            cputype: read_u32_be_at(data, at),
            cpusubtype: read_u32_be_at(data, at + 4),
            offset,
            size,
        });
    }

    Ok(arches)
}

/// Finds the slice to use for `arch`.
///
/// An exact CPU subtype match wins over a fallback match, so a fat file with
/// both `x86_64` and `x86_64h` slices yields the Haswell slice for `x86_64h`.
pub fn slice_for(arch: &Arch, data: &[u8]) -> Result<FatLookup> {
    if !is_fat(data) {
        return Ok(FatLookup::NotFat);
    }

    let arches = fat_arches(data)?;
    let chosen = arches
        .iter()
        .find(|fa| arch.matches_exactly(fa.cputype, fa.cpusubtype))
        .or_else(|| arches.iter().find(|fa| arch.accepts(fa.cputype, fa.cpusubtype)));

    Ok(match chosen {
        Some(fa) => FatLookup::Slice {
            offset: fa.offset,
            size: fa.size,
        },
        None => FatLookup::MissingSlice,
    })
}
