//! Conflict resolution and pruning of classified candidates.
//!
//! Runs after classification and before closure verification. Three passes
//! touch one bucket each, in order: packable dylibs are filtered through
//! [`dont_cache`], tracked dylibs lose anything bundle-private, and shim
//! executables are dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::candidate::{ArchBucket, CandidateFile};
use crate::util::{has_any_prefix, is_in_app_bundle, on_volume, runtime_path_of};

/// Prefixes whose dylibs are never packed.
pub const DENIED_CACHE_PREFIXES: &[&str] = &[
    "/usr/lib/system/introspection/",
    "/System/Library/QuickTime/",
    "/System/Library/Tcl/",
    "/System/Library/Perl/",
    "/System/Library/MonitorPanels/",
    "/System/Library/Accessibility/",
    "/usr/local/",
];

/// Prefixes excluded only from the `i386` cache.
pub const LEGACY_I386_PREFIXES: &[&str] = &[
    "/System/Library/CoreServices/",
    "/System/Library/Extensions/",
];

/// Executables here may only re-exec the real tool.
pub const SHIM_PREFIX: &str = "/usr/bin/";

/// Helper library linked by shim executables.
pub const SHIM_HELPER: &str = "/usr/lib/libxcselect.dylib";

// =============================================================================
// Install Name Resolution
// =============================================================================

/// Resolves an install name through the filesystem being scanned.
pub trait InstallNameResolver {
    /// Returns the runtime path `install_name` ends up at after following
    /// symlinks, or `None` if it does not exist.
    fn resolve(&self, install_name: &str) -> Option<String>;
}

/// Resolver that canonicalizes paths under a volume prefix.
#[derive(Debug, Clone, Default)]
pub struct VolumeResolver {
    prefix: PathBuf,
}

impl VolumeResolver {
    /// Creates a resolver for the volume at `prefix` (empty for the boot volume).
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl InstallNameResolver for VolumeResolver {
    fn resolve(&self, install_name: &str) -> Option<String> {
        let real = std::fs::canonicalize(on_volume(&self.prefix, install_name)).ok()?;
        if self.prefix.as_os_str().is_empty() {
            return real.to_str().map(str::to_string);
        }
        // The prefix itself may be reached through a symlink (/tmp on macOS).
        let prefix = std::fs::canonicalize(&self.prefix).unwrap_or_else(|_| self.prefix.clone());
        runtime_path_of(&prefix, &real)
    }
}

impl<F> InstallNameResolver for F
where
    F: Fn(&str) -> Option<String>,
{
    fn resolve(&self, install_name: &str) -> Option<String> {
        self(install_name)
    }
}

// =============================================================================
// Rejection Reasons
// =============================================================================

/// Why a packable dylib was demoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Named on the skip list
    SkipListed,
    /// Under a denied prefix
    DeniedPrefix(&'static str),
    /// Inside an application bundle
    InAppBundle,
    /// Excluded for this architecture only
    LegacyArch(&'static str),
    /// Runtime path contains `//`
    DoubledSeparator,
    /// Another packable dylib claims the same install name
    DuplicateInstallName,
    /// Runtime path and install name refer to different files
    InstallNameMismatch,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::SkipListed => f.write_str("on skip list"),
            Rejection::DeniedPrefix(p) => write!(f, "under excluded prefix {}", p),
            Rejection::InAppBundle => f.write_str("inside application bundle"),
            Rejection::LegacyArch(p) => write!(f, "under {} excluded for this architecture", p),
            Rejection::DoubledSeparator => f.write_str("bad install name"),
            Rejection::DuplicateInstallName => f.write_str("duplicate install name"),
            Rejection::InstallNameMismatch => f.write_str("bad install name"),
        }
    }
}

// =============================================================================
// Passes
// =============================================================================

/// Returns the runtime paths of every packable dylib whose install name is
/// claimed more than once. Both the first claimant and each later one are
/// included.
pub fn duplicate_install_names(dylibs: &[CandidateFile]) -> HashSet<String> {
    let mut first_seen: HashMap<&str, &str> = HashMap::new();
    let mut duplicates = HashSet::new();

    for dylib in dylibs {
        match first_seen.get(dylib.install_name.as_str()) {
            Some(first) => {
                duplicates.insert(first.to_string());
                duplicates.insert(dylib.runtime_path.clone());
            }
            None => {
                first_seen.insert(&dylib.install_name, &dylib.runtime_path);
            }
        }
    }

    duplicates
}

/// Decides whether a packable dylib must be kept out of the cache.
pub fn dont_cache(
    arch_name: &str,
    dylib: &CandidateFile,
    skip: &HashSet<String>,
    duplicates: &HashSet<String>,
    resolver: &dyn InstallNameResolver,
) -> Option<Rejection> {
    let path = dylib.runtime_path.as_str();

    if skip.contains(path) {
        return Some(Rejection::SkipListed);
    }
    if let Some(prefix) = DENIED_CACHE_PREFIXES.iter().find(|p| path.starts_with(**p)) {
        return Some(Rejection::DeniedPrefix(prefix));
    }
    if is_in_app_bundle(path) {
        return Some(Rejection::InAppBundle);
    }
    if arch_name == "i386" {
        if let Some(prefix) = LEGACY_I386_PREFIXES.iter().find(|p| path.starts_with(**p)) {
            return Some(Rejection::LegacyArch(prefix));
        }
    }
    if path.contains("//") {
        return Some(Rejection::DoubledSeparator);
    }
    if duplicates.contains(path) && path != dylib.install_name {
        return Some(Rejection::DuplicateInstallName);
    }
    if path != dylib.install_name
        && resolver.resolve(&dylib.install_name).as_deref() != Some(path)
    {
        return Some(Rejection::InstallNameMismatch);
    }

    None
}

/// Demotes packable dylibs that fail [`dont_cache`], preserving order.
pub fn prune_cached_dylibs(
    bucket: &mut ArchBucket,
    skip: &HashSet<String>,
    resolver: &dyn InstallNameResolver,
) {
    let duplicates = duplicate_install_names(&bucket.dylibs_for_cache);
    let arch_name = bucket.arch.name;

    let (kept, demoted): (Vec<_>, Vec<_>) = std::mem::take(&mut bucket.dylibs_for_cache)
        .into_iter()
        .map(|dylib| {
            let rejection = dont_cache(arch_name, &dylib, skip, &duplicates, resolver);
            (dylib, rejection)
        })
        .partition(|(_, rejection)| rejection.is_none());

    bucket.dylibs_for_cache = kept.into_iter().map(|(dylib, _)| dylib).collect();
    for (dylib, rejection) in demoted {
        if let Some(rejection) = rejection {
            bucket
                .diagnostics
                .warn(format!("{}: {}", rejection, dylib.runtime_path));
        }
        bucket.other_dylibs.push(dylib);
    }
}

/// Drops bundle-private entries from the tracked dylibs.
pub fn prune_other_dylibs(bucket: &mut ArchBucket) {
    let before = bucket.other_dylibs.len();
    bucket
        .other_dylibs
        .retain(|dylib| !is_in_app_bundle(&dylib.runtime_path));
    debug!(
        "{}: dropped {} bundle-private dylibs",
        bucket.arch,
        before - bucket.other_dylibs.len()
    );
}

/// Drops shim executables that only re-exec another tool.
pub fn prune_executables(bucket: &mut ArchBucket) {
    bucket.executables.retain(|exe| {
        let is_shim = has_any_prefix(&exe.runtime_path, &[SHIM_PREFIX])
            && exe.dependencies.iter().any(|d| d == SHIM_HELPER);
        if is_shim {
            debug!("{}: skipping shim executable {}", exe.runtime_path, SHIM_HELPER);
        }
        !is_shim
    });
}

/// Runs all passes on one bucket.
pub fn prune_bucket(
    bucket: &mut ArchBucket,
    skip: &HashSet<String>,
    resolver: &dyn InstallNameResolver,
) {
    prune_cached_dylibs(bucket, skip, resolver);
    prune_other_dylibs(bucket);
    prune_executables(bucket);
}
