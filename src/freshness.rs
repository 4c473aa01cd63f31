//! Deciding whether an existing cache still matches the volume.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, info};

use crate::candidate::{CandidateFile, FileIdentity};
use crate::dyld::CacheImages;
use crate::error::Result;

/// Recorded identities keyed by install name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreshnessWitness {
    entries: Vec<(String, FileIdentity)>,
}

impl FreshnessWitness {
    /// Reads the witness embedded in a cache artifact.
    pub fn from_artifact(path: &Path) -> Result<Self> {
        let cache = CacheImages::open(path)?;
        Ok(Self {
            entries: cache
                .images
                .into_iter()
                .map(|img| {
                    let identity = FileIdentity {
                        inode: img.inode,
                        mod_time: img.mod_time,
                    };
                    (img.path, identity)
                })
                .collect(),
        })
    }

    /// Derives a witness from a candidate set.
    pub fn from_candidates(candidates: &[CandidateFile]) -> Self {
        Self {
            entries: candidates
                .iter()
                .map(|c| (c.install_name.clone(), c.identity()))
                .collect(),
        }
    }

    /// Returns the recorded entries.
    pub fn entries(&self) -> &[(String, FileIdentity)] {
        &self.entries
    }

    /// Returns the install names whose identity no current candidate has.
    ///
    /// With `report_all` false this stops at the first mismatch.
    pub fn changed_images(&self, current: &[CandidateFile], report_all: bool) -> Vec<String> {
        let by_path: HashMap<&str, FileIdentity> = current
            .iter()
            .map(|c| (c.runtime_path.as_str(), c.identity()))
            .collect();

        let mut changed = Vec::new();
        for (install_name, recorded) in &self.entries {
            if by_path.get(install_name.as_str()) == Some(recorded) {
                continue;
            }
            // The file may have moved without changing.
            if current.iter().any(|c| c.identity() == *recorded) {
                continue;
            }

            changed.push(install_name.clone());
            if !report_all {
                break;
            }
        }
        changed
    }
}

/// Returns true if the cache at `artifact` was built from exactly the
/// identities in `current`.
///
/// A missing or unreadable artifact is stale.
pub fn existing_cache_up_to_date(artifact: &Path, current: &[CandidateFile], report_all: bool) -> bool {
    let witness = match FreshnessWitness::from_artifact(artifact) {
        Ok(witness) => witness,
        Err(e) => {
            debug!("{}: treating cache as stale: {}", artifact.display(), e);
            return false;
        }
    };

    let changed = witness.changed_images(current, report_all);
    for install_name in &changed {
        info!("rebuilding dyld cache because dylib changed: {}", install_name);
    }
    changed.is_empty()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::dyld::{ImageRecord, ImageTableWriter};
    use crate::test_support::dylib;

    fn with_identity(mut c: CandidateFile, inode: u64, mod_time: u64) -> CandidateFile {
        c.inode = inode;
        c.mod_time = mod_time;
        c
    }

    fn write_artifact(dir: &TempDir, records: &[(&str, u64, u64)]) -> std::path::PathBuf {
        let records: Vec<_> = records
            .iter()
            .map(|(path, inode, mod_time)| ImageRecord {
                path: path.to_string(),
                address: 0,
                mod_time: *mod_time,
                inode: *inode,
            })
            .collect();
        let path = dir.path().join("dyld_shared_cache_x86_64");
        fs::write(&path, ImageTableWriter::new("x86_64").write(&records).bytes).unwrap();
        path
    }

    #[test]
    fn test_missing_artifact_is_stale() {
        let dir = TempDir::new().unwrap();
        assert!(!existing_cache_up_to_date(&dir.path().join("nope"), &[], false));
    }

    #[test]
    fn test_garbage_artifact_is_stale() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dyld_shared_cache_x86_64");
        fs::write(&path, b"not a cache").unwrap();
        assert!(!existing_cache_up_to_date(&path, &[], true));
    }

    #[test]
    fn test_identical_identity_is_fresh() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, &[("/usr/lib/libD.dylib", 5, 100)]);
        let current = [with_identity(dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[]), 5, 100)];
        assert!(existing_cache_up_to_date(&artifact, &current, false));
    }

    #[test]
    fn test_changed_identity_is_stale() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, &[("/usr/lib/libD.dylib", 5, 100)]);
        let touched = [with_identity(dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[]), 5, 101)];
        let replaced = [with_identity(dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[]), 6, 100)];
        assert!(!existing_cache_up_to_date(&artifact, &touched, false));
        assert!(!existing_cache_up_to_date(&artifact, &replaced, false));
    }

    #[test]
    fn test_moved_file_is_fresh() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, &[("/usr/lib/libD.dylib", 5, 100)]);
        let moved = [with_identity(dylib("/usr/lib/libD.A.dylib", "/usr/lib/libD.dylib", &[]), 5, 100)];
        assert!(existing_cache_up_to_date(&artifact, &moved, false));
    }

    #[test]
    fn test_report_all_lists_every_mismatch() {
        let witness = FreshnessWitness::from_candidates(&[
            with_identity(dylib("/usr/lib/a.dylib", "/usr/lib/a.dylib", &[]), 1, 1),
            with_identity(dylib("/usr/lib/b.dylib", "/usr/lib/b.dylib", &[]), 2, 2),
        ]);
        assert_eq!(witness.changed_images(&[], true).len(), 2);
        assert_eq!(witness.changed_images(&[], false).len(), 1);
    }

    #[test]
    fn test_witness_round_trip_through_artifact() {
        let dir = TempDir::new().unwrap();
        let artifact = write_artifact(&dir, &[("/usr/lib/a.dylib", 1, 2), ("/usr/lib/b.dylib", 3, 4)]);
        let witness = FreshnessWitness::from_artifact(&artifact).unwrap();
        assert_eq!(witness.entries()[1].0, "/usr/lib/b.dylib");
        assert_eq!(witness.entries()[1].1, FileIdentity { inode: 3, mod_time: 4 });
    }
}
