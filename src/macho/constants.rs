//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// 32-bit Mach-O magic (big-endian)
pub const MH_CIGAM: u32 = 0xCEFAEDFE;

/// FAT binary magic (stored big-endian)
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// FAT binary magic with 64-bit offsets (stored big-endian)
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

// =============================================================================
// File Types
// =============================================================================

/// Object file
pub const MH_OBJECT: u32 = 0x1;
/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Dynamic link editor
pub const MH_DYLINKER: u32 = 0x7;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

// =============================================================================
// CPU Subtypes
// =============================================================================

/// Mask for the capability bits in the high byte of a subtype.
pub const CPU_SUBTYPE_MASK: u32 = 0xFF00_0000;

/// i386 all
pub const CPU_SUBTYPE_I386_ALL: u32 = 3;
/// x86_64 all
pub const CPU_SUBTYPE_X86_64_ALL: u32 = 3;
/// x86_64 Haswell
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Segment of this file
pub const LC_SEGMENT: u32 = 0x1;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xE;
/// Load a dynamically linked shared library that is allowed to be missing
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment of this file
pub const LC_SEGMENT_64: u32 = 0x19;
/// Code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1D;
/// Info to split segments
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1E;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib until first use
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;

// =============================================================================
// Section Names
// =============================================================================

/// Section holding interposing tuples
pub const SECT_INTERPOSE: &str = "__interpose";

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags that matter for cache placement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The executable is forcing all images to use flat name space bindings
        const FORCE_FLAT = 0x100;
        /// The final linked image contains external weak symbols
        const WEAK_DEFINES = 0x8000;
        /// The final linked image uses weak symbols
        const BINDS_TO_WEAK = 0x10000;
        /// When this bit is set, the OS will load the main executable at a random address
        const PIE = 0x200000;
        /// The code was linked for use in an application extension
        const APP_EXTENSION_SAFE = 0x2000000;
        /// The dylib is part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}
