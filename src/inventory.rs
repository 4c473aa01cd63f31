//! Discovering candidate files.
//!
//! Two providers produce (runtime path, status) pairs lazily: a walk of the
//! allowed search roots on each volume prefix, and a list of runtime paths
//! read from a file. [`classify_inventory`] feeds either into the classifier.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::debug;
use walkdir::WalkDir;

use crate::candidate::{ArchBucket, FileStatus};
use crate::classify::{passes_prefilter, Classifier};
use crate::error::{Error, Result};
use crate::util::{has_any_prefix, on_volume, runtime_path_of};

/// Roots searched for candidates.
pub const ALLOWED_PREFIXES: &[&str] = &[
    "/bin/",
    "/sbin/",
    "/usr/",
    "/System",
    "/Applications/App Store.app/",
    "/Applications/Automator.app/",
    "/Applications/Calculator.app/",
    "/Applications/Calendar.app/",
    "/Applications/Chess.app/",
    "/Applications/Contacts.app/",
    "/Applications/Dashboard.app/",
    "/Applications/Dictionary.app/",
    "/Applications/FaceTime.app/",
    "/Applications/Font Book.app/",
    "/Applications/Image Capture.app/",
    "/Applications/Launchpad.app/",
    "/Applications/Mail.app/",
    "/Applications/Maps.app/",
    "/Applications/Messages.app/",
    "/Applications/Mission Control.app/",
    "/Applications/Notes.app/",
    "/Applications/Photo Booth.app/",
    "/Applications/Preview.app/",
    "/Applications/QuickTime Player.app/",
    "/Applications/Reminders.app/",
    "/Applications/Safari.app/",
    "/Applications/Siri.app/",
    "/Applications/Stickies.app/",
    "/Applications/System Preferences.app/",
    "/Applications/TextEdit.app/",
    "/Applications/Time Machine.app/",
    "/Applications/iBooks.app/",
    "/Applications/iTunes.app/",
    "/Applications/Utilities/Activity Monitor.app",
    "/Applications/Utilities/AirPort Utility.app",
    "/Applications/Utilities/Audio MIDI Setup.app",
    "/Applications/Utilities/Bluetooth File Exchange.app",
    "/Applications/Utilities/Boot Camp Assistant.app",
    "/Applications/Utilities/ColorSync Utility.app",
    "/Applications/Utilities/Console.app",
    "/Applications/Utilities/Digital Color Meter.app",
    "/Applications/Utilities/Disk Utility.app",
    "/Applications/Utilities/Grab.app",
    "/Applications/Utilities/Grapher.app",
    "/Applications/Utilities/Keychain Access.app",
    "/Applications/Utilities/Migration Assistant.app",
    "/Applications/Utilities/Script Editor.app",
    "/Applications/Utilities/System Information.app",
    "/Applications/Utilities/Terminal.app",
    "/Applications/Utilities/VoiceOver Utility.app",
    "/Library/CoreMediaIO/Plug-Ins/DAL/",
];

/// Paths never searched. Spotlight importers load third party plugins.
pub const DENIED_PREFIXES: &[&str] = &[
    "/usr/share",
    "/usr/local/",
    "/System/Library/Assets",
    "/System/Library/StagedFrameworks",
    "/System/Library/Kernels/",
    "/bin/zsh",
    "/System/Library/Frameworks/CoreServices.framework/Versions/A/Frameworks/Metadata.framework/Versions/A/Support/mdworker",
    "/usr/bin/mdimport",
];

/// One discovered file.
#[derive(Debug, Clone)]
pub struct InventoryEntry {
    /// Volume prefix the file was found under
    pub prefix: PathBuf,
    /// Path as seen at run time
    pub runtime_path: String,
    /// `stat` result
    pub status: FileStatus,
}

impl InventoryEntry {
    /// Returns the host path of the file.
    pub fn host_path(&self) -> PathBuf {
        on_volume(&self.prefix, &self.runtime_path)
    }
}

/// A source of candidate files.
pub trait Inventory {
    /// Yields every discovered file.
    fn entries(&self) -> Box<dyn Iterator<Item = InventoryEntry> + '_>;
}

// =============================================================================
// Disk Scan
// =============================================================================

/// Walks the allowed roots under each volume prefix.
///
/// Only files passing [`passes_prefilter`] are yielded.
#[derive(Debug, Clone)]
pub struct DiskScan {
    prefixes: Vec<PathBuf>,
    allowed: Vec<String>,
    denied: Vec<String>,
}

impl DiskScan {
    /// Scans the default roots.
    pub fn new(prefixes: Vec<PathBuf>) -> Self {
        Self::with_roots(
            prefixes,
            ALLOWED_PREFIXES.iter().map(|s| s.to_string()).collect(),
            DENIED_PREFIXES.iter().map(|s| s.to_string()).collect(),
        )
    }

    /// Scans custom roots.
    pub fn with_roots(prefixes: Vec<PathBuf>, allowed: Vec<String>, denied: Vec<String>) -> Self {
        Self {
            prefixes,
            allowed,
            denied,
        }
    }

    /// Directories and files named exactly by a denied prefix are skipped
    /// together with everything below them.
    fn is_denied(&self, runtime_path: &str) -> bool {
        self.denied
            .iter()
            .any(|d| runtime_path == d.trim_end_matches('/'))
    }

    fn walk<'a>(
        &'a self,
        prefix: &'a Path,
        root: &'a str,
    ) -> impl Iterator<Item = InventoryEntry> + 'a {
        WalkDir::new(on_volume(prefix, root))
            .follow_links(false)
            .into_iter()
            .filter_entry(move |e| {
                runtime_path_of(prefix, e.path()).map_or(true, |p| !self.is_denied(&p))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(move |e| {
                let runtime_path = runtime_path_of(prefix, e.path())?;
                let md = e.metadata().ok()?;
                let status = FileStatus::from_metadata(&md);
                if !passes_prefilter(&runtime_path, &status) {
                    return None;
                }
                Some(InventoryEntry {
                    prefix: prefix.to_path_buf(),
                    runtime_path,
                    status,
                })
            })
    }
}

impl Inventory for DiskScan {
    fn entries(&self) -> Box<dyn Iterator<Item = InventoryEntry> + '_> {
        Box::new(self.prefixes.iter().flat_map(move |prefix| {
            self.allowed
                .iter()
                .flat_map(move |root| self.walk(prefix, root))
        }))
    }
}

// =============================================================================
// Path List
// =============================================================================

/// Runtime paths listed in a file, one per line.
///
/// Entries outside the allowed roots or under a denied prefix are ignored.
/// Each path resolves against the volume prefixes in order; the first prefix
/// holding the file wins.
#[derive(Debug, Clone)]
pub struct PathList {
    prefixes: Vec<PathBuf>,
    paths: Vec<String>,
}

impl PathList {
    /// Creates a list from runtime paths.
    pub fn new(prefixes: Vec<PathBuf>, paths: Vec<String>) -> Self {
        Self { prefixes, paths }
    }

    /// Reads a list file. Blank lines and `#` comments are ignored.
    pub fn from_file(list: &Path, prefixes: Vec<PathBuf>) -> Result<Self> {
        let text = fs::read_to_string(list).map_err(|e| Error::FileOpen {
            path: list.to_path_buf(),
            source: e,
        })?;
        let paths = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| l.strip_prefix('.').filter(|s| s.starts_with('/')).unwrap_or(l))
            .map(str::to_string)
            .collect();
        Ok(Self::new(prefixes, paths))
    }

    fn wanted(runtime_path: &str) -> bool {
        has_any_prefix(runtime_path, ALLOWED_PREFIXES) && !has_any_prefix(runtime_path, DENIED_PREFIXES)
    }
}

impl Inventory for PathList {
    fn entries(&self) -> Box<dyn Iterator<Item = InventoryEntry> + '_> {
        let mut seen: HashSet<&String> = HashSet::new();
        Box::new(
            self.paths
                .iter()
                .filter(|p| Self::wanted(p))
                .filter(move |p| seen.insert(*p))
                .filter_map(move |runtime_path| {
                    self.prefixes.iter().find_map(|prefix| {
                        let status = FileStatus::of(&on_volume(prefix, runtime_path)).ok()?;
                        Some(InventoryEntry {
                            prefix: prefix.clone(),
                            runtime_path: runtime_path.clone(),
                            status,
                        })
                    })
                }),
        )
    }
}

// =============================================================================
// Classification
// =============================================================================

/// Classifies every inventory entry into `buckets`.
///
/// A runtime path classified under one prefix is not classified again under
/// a later one. Returns the number of distinct runtime paths classified.
pub fn classify_inventory(
    inventory: &dyn Inventory,
    classifier: &Classifier,
    buckets: &mut [ArchBucket],
) -> usize {
    let start = Instant::now();
    let mut used: HashSet<String> = HashSet::new();

    for entry in inventory.entries() {
        if used.contains(&entry.runtime_path) {
            continue;
        }
        if classifier.classify(&entry.host_path(), &entry.runtime_path, &entry.status, buckets) {
            used.insert(entry.runtime_path);
        }
    }

    debug!(
        "classified {} files in {:.2?}",
        used.len(),
        start.elapsed()
    );
    used.len()
}
