//! Mach-O context for classifying one thin slice.
//!
//! Parsing is read-only and keeps only what the cache pipeline asks about:
//! identity, dependencies, and the properties that decide cache placement.

use zerocopy::FromBytes;

use super::arch::Arch;
use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::{c_string_at, has_any_prefix, read_u32_le_at};

/// Directories whose dylibs may be placed in the shared cache.
const CACHEABLE_DIRS: &[&str] = &["/usr/lib/", "/System/Library/"];

// =============================================================================
// Binary Kind
// =============================================================================

/// Coarse classification of a Mach-O file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryKind {
    /// MH_DYLIB
    Dylib,
    /// MH_EXECUTE
    Executable,
    /// Bundles and anything else that can be loaded
    Other,
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Parsed view of a thin Mach-O slice.
///
/// 32-bit headers are widened into a [`MachHeader64`] so callers see one shape.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Whether the slice uses 64-bit structures
    pub is_64: bool,
    install_name: Option<String>,
    dependents: Vec<String>,
    has_dylinker: bool,
    has_split_seg_info: bool,
    has_interposing: bool,
}

impl MachOContext {
    /// Parses a thin Mach-O slice without checking its architecture.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader::SIZE {
            return Err(Error::buffer_too_small(MachHeader::SIZE, data.len()));
        }

        let magic = read_u32_le_at(data, 0);
        let (header, is_64, header_size) = match magic {
            MH_MAGIC_64 => {
                let h = MachHeader64::read_from_prefix(data)
                    .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, data.len()))?
                    .0;
                (h, true, MachHeader64::SIZE)
            }
            MH_MAGIC => {
                let h = MachHeader::read_from_prefix(data)
                    .map_err(|_| Error::buffer_too_small(MachHeader::SIZE, data.len()))?
                    .0;
                (MachHeader64::from(h), false, MachHeader::SIZE)
            }
            _ => return Err(Error::InvalidMachoMagic(magic)),
        };

        if !matches!(header.filetype, MH_EXECUTE | MH_DYLIB | MH_BUNDLE) {
            return Err(Error::UnsupportedMachoType(header.filetype));
        }

        let mut ctx = Self {
            header,
            is_64,
            install_name: None,
            dependents: Vec::new(),
            has_dylinker: false,
            has_split_seg_info: false,
            has_interposing: false,
        };
        ctx.parse_load_commands(data, header_size)?;

        Ok(ctx)
    }

    /// Parses a thin slice and validates it against the requested architecture.
    pub fn parse_for_arch(arch: &Arch, data: &[u8]) -> Result<Self> {
        if data.len() < MachHeader::SIZE {
            return Err(Error::buffer_too_small(MachHeader::SIZE, data.len()));
        }
        let magic = read_u32_le_at(data, 0);
        if !matches!(magic, MH_MAGIC | MH_MAGIC_64) {
            return Err(Error::InvalidMachoMagic(magic));
        }

        let cputype = read_u32_le_at(data, 4);
        let cpusubtype = read_u32_le_at(data, 8);
        if !arch.accepts(cputype, cpusubtype) {
            return Err(Error::WrongArchitecture {
                required: arch.name.to_string(),
                found: Arch::describe(cputype, cpusubtype),
            });
        }

        Self::parse(data)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self, data: &[u8], header_size: usize) -> Result<()> {
        let mut offset = header_size;
        let end_offset = header_size + self.header.sizeofcmds as usize;
        if end_offset > data.len() {
            return Err(Error::LoadCommandOverflow { offset: header_size });
        }

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            let size = lc.cmdsize as usize;
            if size < LoadCommand::SIZE || offset + size > end_offset {
                return Err(Error::LoadCommandOverflow { offset });
            }

            self.parse_load_command(lc.cmd, &data[offset..offset + size], offset)?;
            offset += size;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(&mut self, cmd: u32, data: &[u8], offset: usize) -> Result<()> {
        match cmd {
            LC_ID_DYLIB => {
                self.install_name = Some(dylib_name(data, offset)?);
            }

            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB => {
                self.dependents.push(dylib_name(data, offset)?);
            }

            LC_LOAD_DYLINKER => self.has_dylinker = true,

            LC_SEGMENT_SPLIT_INFO => self.has_split_seg_info = true,

            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;
                let mut at = SegmentCommand64::SIZE;
                for _ in 0..seg.nsects {
                    let sect = data
                        .get(at..)
                        .and_then(|d| Section64::read_from_prefix(d).ok())
                        .ok_or_else(|| Error::parse(offset + at, "failed to parse section"))?
                        .0;
                    if sect.name() == SECT_INTERPOSE {
                        self.has_interposing = true;
                    }
                    at += Section64::SIZE;
                }
            }

            LC_SEGMENT => {
                let seg = SegmentCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?
                    .0;
                let mut at = SegmentCommand::SIZE;
                for _ in 0..seg.nsects {
                    let sect = data
                        .get(at..)
                        .and_then(|d| Section::read_from_prefix(d).ok())
                        .ok_or_else(|| Error::parse(offset + at, "failed to parse section"))?
                        .0;
                    if name_from_fixed(&sect.sectname) == SECT_INTERPOSE {
                        self.has_interposing = true;
                    }
                    at += Section::SIZE;
                }
            }

            _ => {}
        }

        Ok(())
    }

    /// Returns the file type.
    #[inline]
    pub fn file_type(&self) -> u32 {
        self.header.filetype
    }

    /// Returns the header flags.
    #[inline]
    pub fn flags(&self) -> MachOFlags {
        MachOFlags::from_bits_retain(self.header.flags)
    }

    /// Returns the coarse kind of this binary.
    pub fn kind(&self) -> BinaryKind {
        match self.header.filetype {
            MH_DYLIB => BinaryKind::Dylib,
            MH_EXECUTE => BinaryKind::Executable,
            _ => BinaryKind::Other,
        }
    }

    /// Returns the install name recorded by LC_ID_DYLIB, if any.
    pub fn install_name(&self) -> Option<&str> {
        self.install_name.as_deref()
    }

    /// Returns the load paths of all dependent dylibs.
    pub fn dependency_paths(&self) -> impl Iterator<Item = &str> {
        self.dependents.iter().map(String::as_str)
    }

    /// Returns true for a main executable that is loaded through dyld.
    pub fn is_dynamic_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE && self.has_dylinker
    }

    /// Returns the reasons this image cannot be placed in the shared cache.
    ///
    /// An empty list means the image is eligible.
    pub fn cache_ineligibility(&self, runtime_path: &str) -> Vec<String> {
        let mut reasons = Vec::new();

        if !self.header.is_dylib() {
            reasons.push("Not MH_DYLIB".to_string());
            return reasons;
        }

        match self.install_name() {
            None => reasons.push("Missing install name".to_string()),
            Some(name) if !name.starts_with('/') => {
                reasons.push(format!("Install name '{}' is not an absolute path", name))
            }
            Some(_) => {}
        }

        if !has_any_prefix(runtime_path, CACHEABLE_DIRS) {
            reasons.push("Not in '/usr/lib/' or '/System/Library/'".to_string());
        }

        if !self.flags().contains(MachOFlags::TWOLEVEL) {
            reasons.push("Not built with two level namespaces".to_string());
        }

        if !self.has_split_seg_info {
            reasons.push("Missing split seg info".to_string());
        }

        if self.has_interposing {
            reasons.push("Has interposing tuples".to_string());
        }

        reasons
    }

    /// Returns true if this image may be placed in the shared cache.
    pub fn can_be_placed_in_cache(&self, runtime_path: &str) -> bool {
        self.cache_ineligibility(runtime_path).is_empty()
    }
}

/// Reads the path string of a dylib-style load command.
fn dylib_name(data: &[u8], offset: usize) -> Result<String> {
    let cmd = DylibCommand::read_from_prefix(data)
        .map_err(|_| Error::parse(offset, "failed to parse dylib command"))?
        .0;
    c_string_at(data, cmd.dylib.name_offset as usize)
        .ok_or_else(|| Error::parse(offset, "dylib name offset beyond load command"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn dylib_cmd(cmd: u32, name: &str) -> Vec<u8> {
        let size = (DylibCommand::SIZE + name.len() + 1 + 7) & !7;
        let mut out = vec![0u8; size];
        let lc = DylibCommand {
            cmd,
            cmdsize: size as u32,
            dylib: Dylib {
                name_offset: DylibCommand::SIZE as u32,
                ..Default::default()
            },
        };
        out[..DylibCommand::SIZE].copy_from_slice(lc.as_bytes());
        out[DylibCommand::SIZE..DylibCommand::SIZE + name.len()].copy_from_slice(name.as_bytes());
        out
    }

    fn build(filetype: u32, flags: u32, cmds: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = cmds.concat();
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_X86_64,
            cpusubtype: CPU_SUBTYPE_X86_64_ALL,
            filetype,
            ncmds: cmds.len() as u32,
            sizeofcmds: body.len() as u32,
            flags,
            reserved: 0,
        };
        let mut data = header.as_bytes().to_vec();
        data.extend_from_slice(&body);
        data.resize(0x1000, 0);
        data
    }

    fn split_info() -> Vec<u8> {
        let mut v = vec![0u8; 16];
        v[0..4].copy_from_slice(&LC_SEGMENT_SPLIT_INFO.to_le_bytes());
        v[4..8].copy_from_slice(&16u32.to_le_bytes());
        v
    }

    #[test]
    fn test_parse_dylib() {
        let data = build(
            MH_DYLIB,
            MachOFlags::TWOLEVEL.bits(),
            &[
                dylib_cmd(LC_ID_DYLIB, "/usr/lib/libfoo.dylib"),
                dylib_cmd(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib"),
                dylib_cmd(LC_LOAD_WEAK_DYLIB, "/usr/lib/libweak.dylib"),
                split_info(),
            ],
        );
        let ctx = MachOContext::parse(&data).unwrap();

        assert_eq!(ctx.kind(), BinaryKind::Dylib);
        assert_eq!(ctx.install_name(), Some("/usr/lib/libfoo.dylib"));
        let deps: Vec<_> = ctx.dependency_paths().collect();
        assert_eq!(deps, ["/usr/lib/libSystem.B.dylib", "/usr/lib/libweak.dylib"]);
        assert!(ctx.can_be_placed_in_cache("/usr/lib/libfoo.dylib"));
        assert!(!ctx.can_be_placed_in_cache("/opt/lib/libfoo.dylib"));
    }

    #[test]
    fn test_ineligibility_reasons() {
        let data = build(MH_DYLIB, 0, &[dylib_cmd(LC_ID_DYLIB, "@rpath/libfoo.dylib")]);
        let ctx = MachOContext::parse(&data).unwrap();
        let reasons = ctx.cache_ineligibility("/usr/lib/libfoo.dylib");

        assert!(reasons.iter().any(|r| r.contains("not an absolute path")));
        assert!(reasons.iter().any(|r| r.contains("two level")));
        assert!(reasons.iter().any(|r| r.contains("split seg")));
    }

    #[test]
    fn test_dynamic_executable() {
        let mut dylinker = vec![0u8; 32];
        dylinker[0..4].copy_from_slice(&LC_LOAD_DYLINKER.to_le_bytes());
        dylinker[4..8].copy_from_slice(&32u32.to_le_bytes());
        let data = build(MH_EXECUTE, 0, &[dylinker]);
        let ctx = MachOContext::parse(&data).unwrap();

        assert!(ctx.is_dynamic_executable());
        assert_eq!(ctx.kind(), BinaryKind::Executable);
        assert!(!ctx.can_be_placed_in_cache("/usr/bin/true"));
    }

    #[test]
    fn test_wrong_architecture_is_expected() {
        let data = build(MH_DYLIB, 0, &[]);
        let arch = Arch::from_name("i386").unwrap();
        let err = MachOContext::parse_for_arch(&arch, &data).unwrap_err();
        assert!(err.is_expected_rejection());
    }

    #[test]
    fn test_rejects_object_files() {
        let data = build(MH_OBJECT, 0, &[]);
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::UnsupportedMachoType(MH_OBJECT))
        ));
    }

    #[test]
    fn test_load_command_overflow() {
        let mut data = build(MH_DYLIB, 0, &[dylib_cmd(LC_ID_DYLIB, "/usr/lib/libfoo.dylib")]);
        // Claim a second command that does not exist.
        data[16..20].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::LoadCommandOverflow { .. })
        ));
    }
}
