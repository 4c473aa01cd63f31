//! Architecture names and CPU type matching.

use std::fmt;

use super::constants::*;
use crate::error::{Error, Result};

/// A target architecture a shared cache can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Arch {
    /// Canonical name (e.g. "x86_64h")
    pub name: &'static str,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype without capability bits
    pub cpusubtype: u32,
    /// Name of a less specific architecture whose slices are also usable
    pub fallback: Option<&'static str>,
}

/// All architectures a cache can be built for.
pub const KNOWN_ARCHS: &[Arch] = &[
    Arch {
        name: "i386",
        cputype: CPU_TYPE_X86,
        cpusubtype: CPU_SUBTYPE_I386_ALL,
        fallback: None,
    },
    Arch {
        name: "x86_64",
        cputype: CPU_TYPE_X86_64,
        cpusubtype: CPU_SUBTYPE_X86_64_ALL,
        fallback: None,
    },
    Arch {
        name: "x86_64h",
        cputype: CPU_TYPE_X86_64,
        cpusubtype: CPU_SUBTYPE_X86_64_H,
        fallback: Some("x86_64"),
    },
    Arch {
        name: "arm64",
        cputype: CPU_TYPE_ARM64,
        cpusubtype: CPU_SUBTYPE_ARM64_ALL,
        fallback: None,
    },
    Arch {
        name: "arm64e",
        cputype: CPU_TYPE_ARM64,
        cpusubtype: CPU_SUBTYPE_ARM64E,
        fallback: None,
    },
];

impl Arch {
    /// Looks up an architecture by name.
    pub fn from_name(name: &str) -> Result<Arch> {
        KNOWN_ARCHS
            .iter()
            .find(|a| a.name == name)
            .copied()
            .ok_or_else(|| Error::UnknownArchitecture(name.to_string()))
    }

    /// Returns true if this architecture uses 64-bit Mach-O headers.
    #[inline]
    pub fn is_64bit(&self) -> bool {
        self.cputype & CPU_ARCH_ABI64 != 0
    }

    /// Returns true if a slice with exactly this CPU type and subtype was found.
    #[inline]
    pub fn matches_exactly(&self, cputype: u32, cpusubtype: u32) -> bool {
        self.cputype == cputype && self.cpusubtype == (cpusubtype & !CPU_SUBTYPE_MASK)
    }

    /// Returns true if a slice with this CPU type and subtype can be used,
    /// either exactly or through the fallback architecture.
    pub fn accepts(&self, cputype: u32, cpusubtype: u32) -> bool {
        if self.matches_exactly(cputype, cpusubtype) {
            return true;
        }
        self.fallback
            .and_then(|name| Arch::from_name(name).ok())
            .is_some_and(|fb| fb.matches_exactly(cputype, cpusubtype))
    }

    /// Describes an arbitrary CPU type pair for diagnostics.
    pub fn describe(cputype: u32, cpusubtype: u32) -> String {
        KNOWN_ARCHS
            .iter()
            .find(|a| a.matches_exactly(cputype, cpusubtype))
            .map(|a| a.name.to_string())
            .unwrap_or_else(|| format!("cpu {:#x}/{:#x}", cputype, cpusubtype))
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
