//! Synthetic Mach-O images for unit tests.

use zerocopy::IntoBytes;

use crate::candidate::{CandidateFile, MappedFile, MappedSlice};
use crate::macho::*;

/// Builds a thin 64-bit Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOBuilder {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    flags: u32,
    commands: Vec<Vec<u8>>,
}

impl MachOBuilder {
    /// An eligible x86_64 dylib with the given install name.
    pub fn dylib(install_name: &str) -> Self {
        Self::new(MH_DYLIB)
            .command(dylib_command(LC_ID_DYLIB, install_name))
            .split_seg_info()
    }

    /// A dynamically linked x86_64 executable.
    pub fn executable() -> Self {
        let mut dylinker = vec![0u8; 32];
        dylinker[0..4].copy_from_slice(&LC_LOAD_DYLINKER.to_le_bytes());
        dylinker[4..8].copy_from_slice(&32u32.to_le_bytes());
        dylinker[8..12].copy_from_slice(&12u32.to_le_bytes());
        dylinker[12..25].copy_from_slice(b"/usr/lib/dyld");
        Self::new(MH_EXECUTE).command(dylinker)
    }

    /// An image of arbitrary file type with no load commands.
    pub fn new(filetype: u32) -> Self {
        Self {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: CPU_SUBTYPE_X86_64_ALL,
            filetype,
            flags: (MachOFlags::TWOLEVEL | MachOFlags::DYLDLINK).bits(),
            commands: Vec::new(),
        }
    }

    /// Sets the CPU type.
    pub fn cpu(mut self, cputype: u32, cpusubtype: u32) -> Self {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    /// Sets the header flags.
    pub fn flags(mut self, flags: MachOFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    /// Adds a dependency.
    pub fn depends_on(self, path: &str) -> Self {
        self.command(dylib_command(LC_LOAD_DYLIB, path))
    }

    /// Adds a segment split info command.
    pub fn split_seg_info(self) -> Self {
        let mut cmd = vec![0u8; 16];
        cmd[0..4].copy_from_slice(&LC_SEGMENT_SPLIT_INFO.to_le_bytes());
        cmd[4..8].copy_from_slice(&16u32.to_le_bytes());
        self.command(cmd)
    }

    /// Adds a raw load command.
    pub fn command(mut self, cmd: Vec<u8>) -> Self {
        self.commands.push(cmd);
        self
    }

    /// Serializes the image, padded to a page.
    pub fn build(&self) -> Vec<u8> {
        let body = self.commands.concat();
        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            cputype: self.cputype,
            cpusubtype: self.cpusubtype,
            filetype: self.filetype,
            ncmds: self.commands.len() as u32,
            sizeofcmds: body.len() as u32,
            flags: self.flags,
            reserved: 0,
        };
        let mut data = header.as_bytes().to_vec();
        data.extend_from_slice(&body);
        data.resize(data.len().max(0x1000), 0);
        data
    }
}

/// Serializes a dylib-style load command.
pub fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
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

/// An eligible dylib candidate backed by real image bytes.
pub fn dylib(runtime_path: &str, install_name: &str, deps: &[&str]) -> CandidateFile {
    let builder = deps
        .iter()
        .fold(MachOBuilder::dylib(install_name), |b, d| b.depends_on(d));
    candidate(runtime_path, install_name, BinaryKind::Dylib, deps, builder.build())
}

/// An executable candidate backed by real image bytes.
pub fn executable(runtime_path: &str, deps: &[&str]) -> CandidateFile {
    let builder = deps
        .iter()
        .fold(MachOBuilder::executable(), |b, d| b.depends_on(d));
    candidate(runtime_path, "", BinaryKind::Executable, deps, builder.build())
}

fn candidate(
    runtime_path: &str,
    install_name: &str,
    kind: BinaryKind,
    deps: &[&str],
    bytes: Vec<u8>,
) -> CandidateFile {
    CandidateFile {
        runtime_path: runtime_path.to_string(),
        install_name: install_name.to_string(),
        kind,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        mod_time: 100,
        inode: 1,
        is_setuid: false,
        sip_protected: false,
        image: MappedSlice::whole(MappedFile::from_bytes(runtime_path, bytes)),
    }
}
