//! Mach-O binary structures.
//!
//! These structures match the on-disk format of thin Mach-O files. Only the
//! commands needed to classify a binary are modelled; everything else is
//! skipped by size.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

// =============================================================================
// Header Structures
// =============================================================================

/// 32-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader {
    /// Magic number (MH_MAGIC)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

impl MachHeader {
    /// Size of the header in bytes.
    pub const SIZE: usize = 28;
}

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true if this is a valid 64-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Returns true if this is a dylib.
    #[inline]
    pub fn is_dylib(&self) -> bool {
        self.filetype == MH_DYLIB
    }
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC_64,
            cputype: 0,
            cpusubtype: 0,
            filetype: 0,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }
}

impl From<MachHeader> for MachHeader64 {
    fn from(h: MachHeader) -> Self {
        Self {
            magic: h.magic,
            cputype: h.cputype,
            cpusubtype: h.cpusubtype,
            filetype: h.filetype,
            ncmds: h.ncmds,
            sizeofcmds: h.sizeofcmds,
            flags: h.flags,
            reserved: 0,
        }
    }
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Commands
// =============================================================================

/// 32-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand {
    /// LC_SEGMENT
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u32,
    /// Virtual memory size
    pub vmsize: u32,
    /// File offset
    pub fileoff: u32,
    /// Amount of file to map
    pub filesize: u32,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 56;
}

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        fixed_name(&self.segname)
    }

    /// Sets the segment name from a string.
    pub fn set_name(&mut self, name: &str) {
        set_fixed_name(&mut self.segname, name);
    }
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

/// 32-bit section.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u32,
    /// Size in bytes
    pub size: u32,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (for runtime use)
    pub reserved1: u32,
    /// Reserved (for runtime use)
    pub reserved2: u32,
}

impl Section {
    /// Size of a section entry.
    pub const SIZE: usize = 68;
}

/// 64-bit section.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (for runtime use)
    pub reserved1: u32,
    /// Reserved (for runtime use)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section entry.
    pub const SIZE: usize = 80;

    /// Returns the section name as a string.
    pub fn name(&self) -> &str {
        fixed_name(&self.sectname)
    }

    /// Sets the section and segment names.
    pub fn set_names(&mut self, segment: &str, section: &str) {
        set_fixed_name(&mut self.segname, segment);
        set_fixed_name(&mut self.sectname, section);
    }
}

impl Default for Section64 {
    fn default() -> Self {
        Self {
            sectname: [0u8; 16],
            segname: [0u8; 16],
            addr: 0,
            size: 0,
            offset: 0,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
    }
}

// =============================================================================
// Dylib Command
// =============================================================================

/// Dylib reference (shared by several load commands).
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Dylib {
    /// Library's path name offset
    pub name_offset: u32,
    /// Library's build timestamp
    pub timestamp: u32,
    /// Library's current version number
    pub current_version: u32,
    /// Library's compatibility version number
    pub compatibility_version: u32,
}

/// Dylib load command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// LC_LOAD_DYLIB, LC_ID_DYLIB, etc.
    pub cmd: u32,
    /// Total size (includes path string)
    pub cmdsize: u32,
    /// Library identification
    pub dylib: Dylib,
}

impl DylibCommand {
    /// Minimum size of this command (without path string).
    pub const SIZE: usize = 24;
}

// =============================================================================
// Fat Container
// =============================================================================

/// One architecture entry of a fat header, decoded to host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type of the slice
    pub cputype: u32,
    /// CPU subtype of the slice
    pub cpusubtype: u32,
    /// File offset of the slice
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
}

impl FatArch {
    /// Size of a 32-bit `fat_arch` entry.
    pub const SIZE: usize = 20;
    /// Size of a `fat_arch_64` entry.
    pub const SIZE_64: usize = 32;
}

// =============================================================================
// Helpers
// =============================================================================

fn fixed_name(bytes: &[u8; 16]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

fn set_fixed_name(bytes: &mut [u8; 16], name: &str) {
    *bytes = [0u8; 16];
    let src = name.as_bytes();
    let len = src.len().min(16);
    bytes[..len].copy_from_slice(&src[..len]);
}

/// Returns the name stored in a fixed 16-byte name field.
pub fn name_from_fixed(bytes: &[u8; 16]) -> &str {
    fixed_name(bytes)
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for MachHeader64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MachO {{ cpu: {:#x}/{:#x}, type: {:#x}, cmds: {}, flags: {:#x} }}",
            self.cputype, self.cpusubtype, self.filetype, self.ncmds, self.flags
        )
    }
}
