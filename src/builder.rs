//! The cache builder contract.
//!
//! Layout, address assignment and code signing belong to the builder. The
//! pipeline hands it three verified sequences and an options record, and gets
//! back either the artifact bytes with a layout description or an error.
//! [`ImageTableBuilder`] is the bundled implementation: it lays images out at
//! page-aligned addresses and records only the header and image table.

use std::fmt::Write as _;
use std::path::PathBuf;

use crate::candidate::CandidateFile;
use crate::dyld::{ImageRecord, ImageTableWriter};
use crate::macho::Arch;
use crate::util::align_up;

/// Target operating system of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// macOS
    MacOS,
}

/// Code directory hash flavors to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSigningDigestMode {
    /// SHA-256 only
    Sha256Only,
    /// SHA-1 only
    Sha1Only,
    /// Both SHA-1 and SHA-256
    Agile,
}

/// Options passed to a [`CacheBuilder`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Target architecture
    pub arch: Arch,
    /// Target platform
    pub platform: Platform,
    /// Strip local symbols from packed images
    pub exclude_local_symbols: bool,
    /// Optimize stubs
    pub optimize_stubs: bool,
    /// Optimize Objective-C metadata
    pub optimize_objc: bool,
    /// Code signing digest flavor
    pub code_signing_digest_mode: CodeSigningDigestMode,
    /// Images were stripped from the install after mastering
    pub dylibs_removed_during_mastering: bool,
    /// Recorded inodes are those seen at run time
    pub inodes_are_same_as_runtime: bool,
    /// Reserve room for ASLR sliding
    pub cache_supports_aslr: bool,
    /// Build for a simulator runtime
    pub for_simulator: bool,
    /// Verbose builder output
    pub verbose: bool,
    /// Drop leaf dylibs instead of failing when the cache overflows
    pub evict_leaf_dylibs_on_overflow: bool,
    /// Volume prefixes used to map runtime paths back to files
    pub path_prefixes: Vec<PathBuf>,
}

impl CreateOptions {
    /// Options for a macOS cache build.
    pub fn for_macos(arch: Arch, path_prefixes: Vec<PathBuf>) -> Self {
        Self {
            arch,
            platform: Platform::MacOS,
            exclude_local_symbols: false,
            optimize_stubs: false,
            optimize_objc: true,
            code_signing_digest_mode: CodeSigningDigestMode::Sha256Only,
            dylibs_removed_during_mastering: false,
            inodes_are_same_as_runtime: true,
            cache_supports_aslr: arch.name != "i386",
            for_simulator: false,
            verbose: false,
            evict_leaf_dylibs_on_overflow: true,
            path_prefixes,
        }
    }
}

/// A successfully built cache.
#[derive(Debug, Clone)]
pub struct BuiltCache {
    /// Artifact contents
    pub bytes: Vec<u8>,
    /// Human-readable layout description
    pub map: String,
    /// Identity of the artifact
    pub uuid: [u8; 16],
}

/// What a builder returns.
#[derive(Debug, Clone, Default)]
pub struct CreateResults {
    /// The cache, when the build succeeded
    pub cache: Option<BuiltCache>,
    /// Non-fatal diagnostics
    pub warnings: Vec<String>,
    /// Fatal error; set exactly when `cache` is `None`
    pub error_message: Option<String>,
}

impl CreateResults {
    /// A failed build.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            cache: None,
            warnings: Vec::new(),
            error_message: Some(message.into()),
        }
    }
}

/// Builds a cache from verified candidate sets.
pub trait CacheBuilder: Sync {
    /// Builds a cache.
    fn create(
        &self,
        options: &CreateOptions,
        dylibs_for_cache: &[CandidateFile],
        other_dylibs: &[CandidateFile],
        executables: &[CandidateFile],
    ) -> CreateResults;
}

// =============================================================================
// Image Table Builder
// =============================================================================

/// Builder that records the image table and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageTableBuilder;

impl ImageTableBuilder {
    /// Shared region base for an architecture.
    pub fn base_address(arch: &Arch) -> u64 {
        match arch.name {
            "i386" => 0x9000_0000,
            "arm64" | "arm64e" => 0x1_8000_0000,
            _ => 0x7FFF_2000_0000,
        }
    }
}

impl CacheBuilder for ImageTableBuilder {
    fn create(
        &self,
        options: &CreateOptions,
        dylibs_for_cache: &[CandidateFile],
        other_dylibs: &[CandidateFile],
        executables: &[CandidateFile],
    ) -> CreateResults {
        if dylibs_for_cache.is_empty() {
            return CreateResults::failed(format!("{}: no dylibs to place in cache", options.arch));
        }

        let mut sorted: Vec<&CandidateFile> = dylibs_for_cache.iter().collect();
        sorted.sort_by(|a, b| a.install_name.cmp(&b.install_name));

        let base = Self::base_address(&options.arch);
        let mut address = base;
        let mut warnings = Vec::new();
        let records: Vec<ImageRecord> = sorted
            .iter()
            .map(|dylib| {
                if dylib.slice_length() == 0 {
                    warnings.push(format!("{} has an empty image", dylib.runtime_path));
                }
                let record = ImageRecord {
                    path: dylib.install_name.clone(),
                    address,
                    mod_time: dylib.mod_time,
                    inode: dylib.inode,
                };
                address += align_up(dylib.slice_length().max(1), 0x1000);
                record
            })
            .collect();

        let table = ImageTableWriter::new(options.arch.name)
            .with_base_address(base)
            .write(&records);

        let mut map = String::new();
        let _ = writeln!(map, "# dyld shared cache map for {}", options.arch);
        let _ = writeln!(map, "# uuid {}", format_uuid(&table.uuid));
        let _ = writeln!(
            map,
            "# {} images, {} other dylibs tracked, {} executables",
            records.len(),
            other_dylibs.len(),
            executables.len()
        );
        for (index, record) in records.iter().enumerate() {
            let _ = writeln!(map, "[{:4}] {:#014x} {}", index, record.address, record.path);
        }

        CreateResults {
            cache: Some(BuiltCache {
                bytes: table.bytes,
                map,
                uuid: table.uuid,
            }),
            warnings,
            error_message: None,
        }
    }
}

/// Formats a UUID in canonical 8-4-4-4-12 form.
pub fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex: String = uuid.iter().map(|b| format!("{:02X}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
