//! Fake volumes populated with synthetic Mach-O binaries.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use zerocopy::IntoBytes;

use dscbuild::classify::MIN_CANDIDATE_SIZE;
use dscbuild::macho::*;
use dscbuild::util::on_volume;
use dscbuild::BuildConfig;

/// A synthetic thin Mach-O image.
#[derive(Debug, Clone)]
pub struct Image {
    cputype: u32,
    cpusubtype: u32,
    filetype: u32,
    commands: Vec<Vec<u8>>,
}

impl Image {
    /// An x86_64 dylib that passes every eligibility check.
    pub fn dylib(install_name: &str) -> Self {
        Self::new(MH_DYLIB)
            .command(dylib_command(LC_ID_DYLIB, install_name))
            .command(split_seg_info())
    }

    /// An x86_64 dylib without split segment info.
    pub fn unsplit_dylib(install_name: &str) -> Self {
        Self::new(MH_DYLIB).command(dylib_command(LC_ID_DYLIB, install_name))
    }

    /// A dynamically linked x86_64 executable.
    pub fn executable() -> Self {
        let mut cmd = vec![0u8; 32];
        cmd[0..4].copy_from_slice(&LC_LOAD_DYLINKER.to_le_bytes());
        cmd[4..8].copy_from_slice(&32u32.to_le_bytes());
        cmd[8..12].copy_from_slice(&12u32.to_le_bytes());
        cmd[12..25].copy_from_slice(b"/usr/lib/dyld");
        Self::new(MH_EXECUTE).command(cmd)
    }

    fn new(filetype: u32) -> Self {
        Self {
            cputype: CPU_TYPE_X86_64,
            cpusubtype: CPU_SUBTYPE_X86_64_ALL,
            filetype,
            commands: Vec::new(),
        }
    }

    /// Retargets the image to i386.
    pub fn i386(mut self) -> Self {
        self.cputype = CPU_TYPE_X86;
        self.cpusubtype = CPU_SUBTYPE_I386_ALL;
        self
    }

    /// Adds a dependency.
    pub fn depends_on(self, path: &str) -> Self {
        self.command(dylib_command(LC_LOAD_DYLIB, path))
    }

    fn command(mut self, cmd: Vec<u8>) -> Self {
        self.commands.push(cmd);
        self
    }

    /// Serializes the image, padded past the candidate size floor.
    pub fn build(&self) -> Vec<u8> {
        let body = self.commands.concat();
        let flags = (MachOFlags::TWOLEVEL | MachOFlags::DYLDLINK).bits();
        let mut data = if self.cputype == CPU_TYPE_X86 {
            MachHeader {
                magic: MH_MAGIC,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: self.commands.len() as u32,
                sizeofcmds: body.len() as u32,
                flags,
            }
            .as_bytes()
            .to_vec()
        } else {
            MachHeader64 {
                magic: MH_MAGIC_64,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: self.commands.len() as u32,
                sizeofcmds: body.len() as u32,
                flags,
                reserved: 0,
            }
            .as_bytes()
            .to_vec()
        };
        data.extend_from_slice(&body);
        data.resize(MIN_CANDIDATE_SIZE as usize, 0);
        data
    }
}

fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
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

fn split_seg_info() -> Vec<u8> {
    let mut cmd = vec![0u8; 16];
    cmd[0..4].copy_from_slice(&LC_SEGMENT_SPLIT_INFO.to_le_bytes());
    cmd[4..8].copy_from_slice(&16u32.to_le_bytes());
    cmd
}

/// Packs thin images into a fat container with page-aligned slices.
pub fn fat(images: &[Image]) -> Vec<u8> {
    let mut data = vec![0u8; 0x1000];
    data[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
    data[4..8].copy_from_slice(&(images.len() as u32).to_be_bytes());
    for (i, image) in images.iter().enumerate() {
        let bytes = image.build();
        let at = 8 + i * FatArch::SIZE;
        let offset = data.len() as u32;
        data[at..at + 4].copy_from_slice(&image.cputype.to_be_bytes());
        data[at + 4..at + 8].copy_from_slice(&image.cpusubtype.to_be_bytes());
        data[at + 8..at + 12].copy_from_slice(&offset.to_be_bytes());
        data[at + 12..at + 16].copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        data[at + 16..at + 20].copy_from_slice(&12u32.to_be_bytes());
        data.extend_from_slice(&bytes);
    }
    data
}

/// A volume rooted in a temporary directory.
pub struct Volume {
    _dir: TempDir,
    root: PathBuf,
}

impl Volume {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        // Resolver output is compared against canonical paths.
        let root = fs::canonicalize(dir.path()).unwrap();
        Self { _dir: dir, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn host_path(&self, runtime_path: &str) -> PathBuf {
        on_volume(&self.root, runtime_path)
    }

    /// Writes a file with mode 0755.
    pub fn write(&self, runtime_path: &str, bytes: &[u8]) {
        let host = self.host_path(runtime_path);
        fs::create_dir_all(host.parent().unwrap()).unwrap();
        fs::write(&host, bytes).unwrap();
        fs::set_permissions(&host, fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn add(&self, runtime_path: &str, image: Image) {
        self.write(runtime_path, &image.build());
    }

    /// Adds an eligible dylib whose install name is its runtime path.
    pub fn add_dylib(&self, runtime_path: &str, deps: &[&str]) {
        let image = deps
            .iter()
            .fold(Image::dylib(runtime_path), |img, d| img.depends_on(d));
        self.add(runtime_path, image);
    }

    pub fn add_executable(&self, runtime_path: &str, deps: &[&str]) {
        let image = deps
            .iter()
            .fold(Image::executable(), |img, d| img.depends_on(d));
        self.add(runtime_path, image);
    }

    /// Creates `link` pointing at `target`, both runtime paths.
    pub fn symlink(&self, link: &str, target: &str) {
        let host = self.host_path(link);
        fs::create_dir_all(host.parent().unwrap()).unwrap();
        symlink(self.host_path(target), host).unwrap();
    }

    /// Moves the modification time of a file into the past.
    pub fn touch_back(&self, runtime_path: &str, secs: u64) {
        let file = fs::File::options()
            .write(true)
            .open(self.host_path(runtime_path))
            .unwrap();
        let when = SystemTime::now() - Duration::from_secs(secs);
        file.set_modified(when).unwrap();
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("private/var/db/dyld")
    }

    /// A configuration building `archs` for this volume.
    pub fn config(&self, archs: &[&str]) -> BuildConfig {
        fs::create_dir_all(self.cache_dir()).unwrap();
        BuildConfig {
            root: self.root.clone(),
            cache_dir: self.cache_dir(),
            archs: archs.iter().map(|a| Arch::from_name(a).unwrap()).collect(),
            ..BuildConfig::default()
        }
    }
}

/// Identity store that remembers nothing.
pub struct NoTags;

impl dscbuild::IdentityStore for NoTags {
    fn clear(&self, _: &Path) -> dscbuild::Result<()> {
        Ok(())
    }

    fn set(&self, _: &Path, _: &[u8; 16]) -> dscbuild::Result<()> {
        Ok(())
    }
}
