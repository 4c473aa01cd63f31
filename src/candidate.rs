//! Candidate binaries and the per-architecture buckets that hold them.
//!
//! Every file that survives classification for an architecture becomes a
//! [`CandidateFile`]. The candidate keeps a [`MappedSlice`] of its bytes alive
//! for as long as some bucket references it; the mapping is released when the
//! last slice referencing it is dropped.

use std::fmt;
use std::fs::{File, Metadata};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;

use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::macho::{Arch, BinaryKind};

/// BSD `SF_RESTRICTED`: the file is protected by System Integrity Protection.
pub const SF_RESTRICTED: u32 = 0x0008_0000;

// =============================================================================
// File Status
// =============================================================================

/// The subset of `stat` results the pipeline looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStatus {
    /// File size in bytes
    pub size: u64,
    /// Permission and type bits
    pub mode: u32,
    /// Modification time in seconds
    pub mod_time: u64,
    /// Inode number
    pub inode: u64,
    /// Whether the file carries the restricted flag
    pub restricted: bool,
}

impl FileStatus {
    /// Extracts status from filesystem metadata.
    #[cfg(unix)]
    pub fn from_metadata(md: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            size: md.size(),
            mode: md.mode(),
            mod_time: md.mtime() as u64,
            inode: md.ino(),
            restricted: restricted_flag(md),
        }
    }

    /// Extracts status from filesystem metadata.
    #[cfg(not(unix))]
    pub fn from_metadata(md: &Metadata) -> Self {
        Self {
            size: md.len(),
            ..Default::default()
        }
    }

    /// Stats a host path.
    pub fn of(path: &Path) -> std::io::Result<Self> {
        std::fs::metadata(path).map(|md| Self::from_metadata(&md))
    }

    /// Returns true if the file is executable by others.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.mode & 0o001 != 0
    }

    /// Returns true if the set-user-ID or set-group-ID bit is set.
    #[inline]
    pub fn is_setugid(&self) -> bool {
        self.mode & 0o6000 != 0
    }

    /// Returns the identity pair recorded for freshness checks.
    #[inline]
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            inode: self.inode,
            mod_time: self.mod_time,
        }
    }
}

#[cfg(target_os = "macos")]
fn restricted_flag(md: &Metadata) -> bool {
    use std::os::macos::fs::MetadataExt;
    md.st_flags() & SF_RESTRICTED != 0
}

#[cfg(all(unix, not(target_os = "macos")))]
fn restricted_flag(_md: &Metadata) -> bool {
    false
}

/// The (inode, mtime) pair that identifies a file version on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileIdentity {
    /// Inode number
    pub inode: u64,
    /// Modification time in seconds
    pub mod_time: u64,
}

// =============================================================================
// Mapped Files
// =============================================================================

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

/// A whole file held in memory, shared by every slice taken from it.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    backing: Backing,
}

impl MappedFile {
    /// Maps a file read-only.
    pub fn map(path: &Path) -> Result<Arc<Self>> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: candidates are only read; a concurrent writer on the volume
        // is outside what the tool can defend against, same as any reader.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(Arc::new(Self {
            path: path.to_path_buf(),
            backing: Backing::Mapped(mmap),
        }))
    }

    /// Wraps bytes that are already in memory.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            backing: Backing::Owned(bytes),
        })
    }

    /// Returns the file contents.
    pub fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(m) => &m[..],
            Backing::Owned(v) => &v[..],
        }
    }

    /// Returns the file length.
    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    /// Returns true if the file is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}

/// A byte range of a [`MappedFile`] holding one thin Mach-O image.
#[derive(Clone)]
pub struct MappedSlice {
    file: Arc<MappedFile>,
    range: Range<usize>,
}

impl MappedSlice {
    /// Creates a slice, clamping the range to the file.
    pub fn new(file: Arc<MappedFile>, offset: u64, len: u64) -> Self {
        let start = (offset as usize).min(file.len());
        let end = start.saturating_add(len as usize).min(file.len());
        Self {
            file,
            range: start..end,
        }
    }

    /// Slice covering the whole file.
    pub fn whole(file: Arc<MappedFile>) -> Self {
        let len = file.len() as u64;
        Self::new(file, 0, len)
    }

    /// Returns the slice bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.file.bytes()[self.range.clone()]
    }

    /// Returns the offset of the slice in its file.
    pub fn offset(&self) -> u64 {
        self.range.start as u64
    }

    /// Returns the slice length.
    pub fn len(&self) -> u64 {
        self.range.len() as u64
    }

    /// Returns true if the slice is empty.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl fmt::Debug for MappedSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedSlice")
            .field("path", &self.file.path)
            .field("range", &self.range)
            .finish()
    }
}

// =============================================================================
// Candidate File
// =============================================================================

/// A binary that passed validation for one architecture.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    /// Path at which the binary is seen at run time
    pub runtime_path: String,
    /// LC_ID_DYLIB path; empty for non-dylibs
    pub install_name: String,
    /// Dylib, executable or other loadable
    pub kind: BinaryKind,
    /// Load paths of dependent dylibs, in load-command order
    pub dependencies: Vec<String>,
    /// Modification time of the file
    pub mod_time: u64,
    /// Inode of the file
    pub inode: u64,
    /// Set-user-ID or set-group-ID
    pub is_setuid: bool,
    /// Protected by System Integrity Protection
    pub sip_protected: bool,
    /// The thin slice for this architecture
    pub image: MappedSlice,
}

impl CandidateFile {
    /// Offset of the thin slice within its file.
    #[inline]
    pub fn slice_offset(&self) -> u64 {
        self.image.offset()
    }

    /// Length of the thin slice.
    #[inline]
    pub fn slice_length(&self) -> u64 {
        self.image.len()
    }

    /// Identity recorded for freshness checks.
    #[inline]
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            inode: self.inode,
            mod_time: self.mod_time,
        }
    }
}

// =============================================================================
// Arch Bucket
// =============================================================================

/// Candidates partitioned for one architecture.
///
/// `dylibs_for_cache` are the images to pack, `other_dylibs` are tracked but
/// not packed, and `executables` get launch closures prebuilt.
#[derive(Debug)]
pub struct ArchBucket {
    /// Target architecture
    pub arch: Arch,
    /// Dylibs to pack
    pub dylibs_for_cache: Vec<CandidateFile>,
    /// Tracked but not packed
    pub other_dylibs: Vec<CandidateFile>,
    /// Main executables
    pub executables: Vec<CandidateFile>,
    /// Warnings collected for this architecture
    pub diagnostics: Diagnostics,
}

impl ArchBucket {
    /// Creates an empty bucket.
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            dylibs_for_cache: Vec::new(),
            other_dylibs: Vec::new(),
            executables: Vec::new(),
            diagnostics: Diagnostics::new(arch.name),
        }
    }

    /// Total number of candidates across all three sequences.
    pub fn len(&self) -> usize {
        self.dylibs_for_cache.len() + self.other_dylibs.len() + self.executables.len()
    }

    /// Returns true if no candidate was classified.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if any sequence already holds this runtime path.
    pub fn contains_runtime_path(&self, runtime_path: &str) -> bool {
        self.dylibs_for_cache
            .iter()
            .chain(&self.other_dylibs)
            .chain(&self.executables)
            .any(|c| c.runtime_path == runtime_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::executable;

    #[test]
    fn test_slice_clamps_to_file() {
        let file = MappedFile::from_bytes("/x", vec![1, 2, 3, 4, 5, 6]);
        let slice = MappedSlice::new(file.clone(), 2, 100);
        assert_eq!(slice.bytes(), &[3, 4, 5, 6]);
        assert_eq!(slice.offset(), 2);
        assert_eq!(slice.len(), 4);

        let past_end = MappedSlice::new(file, 10, 4);
        assert!(past_end.is_empty());
    }

    #[test]
    fn test_slice_keeps_file_alive() {
        let file = MappedFile::from_bytes("/x", vec![0u8; 8]);
        let slice = MappedSlice::whole(file.clone());
        assert_eq!(Arc::strong_count(&file), 2);
        drop(slice);
        assert_eq!(Arc::strong_count(&file), 1);
    }

    #[test]
    fn test_status_bits() {
        let status = FileStatus {
            mode: 0o104755,
            ..Default::default()
        };
        assert!(status.is_executable());
        assert!(status.is_setugid());

        let plain = FileStatus {
            mode: 0o100644,
            ..Default::default()
        };
        assert!(!plain.is_executable());
        assert!(!plain.is_setugid());
    }

    #[test]
    fn test_bucket_bookkeeping() {
        let mut bucket = ArchBucket::new(Arch::from_name("x86_64").unwrap());
        assert!(bucket.is_empty());
        bucket.executables.push(executable("/usr/bin/true", &[]));
        assert_eq!(bucket.len(), 1);
        assert!(bucket.contains_runtime_path("/usr/bin/true"));
    }
}
