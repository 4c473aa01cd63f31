//! Candidate classification.
//!
//! Turns one discovered file into at most one [`CandidateFile`] per requested
//! architecture and files it into the matching [`ArchBucket`] sequence.

use std::path::Path;

use tracing::debug;

use crate::candidate::{ArchBucket, CandidateFile, FileStatus, MappedFile, MappedSlice};
use crate::error::Error;
use crate::macho::{slice_for, BinaryKind, FatLookup, MachOContext};
use crate::util::{has_any_prefix, is_in_app_bundle};

/// Files smaller than this cannot hold a linkable image worth caching.
pub const MIN_CANDIDATE_SIZE: u64 = 0x3000;

/// Debug and profile variants of system libraries are never cached.
const VARIANT_SUFFIXES: &[&str] = &["_profile.dylib", "_debug.dylib", "_profile", "_debug"];

/// Directories where a relative install name indicates a packaging defect.
const SYSTEM_LIBRARY_DIRS: &[&str] = &["/usr/lib/", "/System/Library/"];

/// Returns true if the runtime path names a debug or profile variant.
#[inline]
pub fn has_variant_suffix(runtime_path: &str) -> bool {
    VARIANT_SUFFIXES.iter().any(|s| runtime_path.ends_with(s))
}

/// Cheap checks applied to files found by walking the disk.
///
/// Listed paths and dependencies looked up by install name skip this and
/// only reject debug and profile variants.
pub fn passes_prefilter(runtime_path: &str, status: &FileStatus) -> bool {
    if has_variant_suffix(runtime_path) {
        return false;
    }
    if !status.is_executable() && !runtime_path.ends_with(".dylib") {
        return false;
    }
    status.size >= MIN_CANDIDATE_SIZE
}

/// Sorts binaries into per-architecture buckets.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    require_protection: bool,
}

impl Classifier {
    /// Creates a classifier.
    ///
    /// With `require_protection`, executables and packable dylibs are only
    /// accepted from files carrying the restricted flag.
    pub fn new(require_protection: bool) -> Self {
        Self { require_protection }
    }

    /// Returns the protection policy.
    pub fn require_protection(&self) -> bool {
        self.require_protection
    }

    /// Classifies the file at `host_path`, seen at run time as `runtime_path`.
    ///
    /// Returns true if any requested architecture has a valid slice, even
    /// when the protection policy kept it out of the buckets. Buckets are
    /// only appended to.
    pub fn classify(
        &self,
        host_path: &Path,
        runtime_path: &str,
        status: &FileStatus,
        buckets: &mut [ArchBucket],
    ) -> bool {
        if has_variant_suffix(runtime_path) {
            return false;
        }

        let file = match MappedFile::map(host_path) {
            Ok(file) => file,
            Err(e) => {
                debug!("{}: {}", runtime_path, e);
                return false;
            }
        };

        let mut matched = false;
        for bucket in buckets.iter_mut() {
            matched |= self.classify_for(&file, runtime_path, status, bucket);
        }
        matched
    }

    fn classify_for(
        &self,
        file: &std::sync::Arc<MappedFile>,
        runtime_path: &str,
        status: &FileStatus,
        bucket: &mut ArchBucket,
    ) -> bool {
        let arch = bucket.arch;

        let slice = match slice_for(&arch, file.bytes()) {
            Ok(FatLookup::NotFat) => MappedSlice::whole(file.clone()),
            Ok(FatLookup::Slice { offset, size }) => MappedSlice::new(file.clone(), offset, size),
            Ok(FatLookup::MissingSlice) => return false,
            Err(e) => {
                debug!("{}: {}: {}", arch, runtime_path, e);
                return false;
            }
        };

        let macho = match MachOContext::parse_for_arch(&arch, slice.bytes()) {
            Ok(macho) => macho,
            Err(Error::InvalidMachoMagic(_)) => return false,
            Err(e) if e.is_expected_rejection() => return false,
            Err(e) => {
                bucket.diagnostics.warn(format!("{}: {}", runtime_path, e));
                return false;
            }
        };

        let protection_ok = !self.require_protection || status.restricted;
        let install_name = macho.install_name().unwrap_or_default().to_string();
        let candidate = CandidateFile {
            runtime_path: runtime_path.to_string(),
            install_name,
            kind: macho.kind(),
            dependencies: macho.dependency_paths().map(str::to_string).collect(),
            mod_time: status.mod_time,
            inode: status.inode,
            is_setuid: status.is_setugid(),
            sip_protected: status.restricted,
            image: slice,
        };

        if macho.is_dynamic_executable() {
            if protection_ok {
                bucket.executables.push(candidate);
            } else {
                debug!("{}: {}: executable not protected", arch, runtime_path);
            }
        } else if macho.can_be_placed_in_cache(runtime_path) {
            if protection_ok {
                bucket.dylibs_for_cache.push(candidate);
            } else {
                bucket.other_dylibs.push(candidate);
            }
        } else {
            if candidate.kind == BinaryKind::Dylib
                && candidate.install_name.starts_with('@')
                && !is_in_app_bundle(runtime_path)
                && has_any_prefix(runtime_path, SYSTEM_LIBRARY_DIRS)
            {
                bucket.diagnostics.warn(format!(
                    "{} install name for system framework: {}",
                    candidate.install_name.split('/').next().unwrap_or("@"),
                    runtime_path
                ));
            }
            bucket.other_dylibs.push(candidate);
        }

        true
    }
}
