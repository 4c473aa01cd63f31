//! Dependency closure verification.
//!
//! Every packable dylib must have each of its dependencies present in the
//! packable set. Missing dependencies are pulled in through a
//! [`DylibLoader`]; dylibs whose dependencies cannot be satisfied are
//! excluded, and exclusion propagates to everything that depends on them.
//!
//! The pass iterates to a fixpoint instead of walking the graph recursively.
//! A dependency counts as satisfied as soon as its path is in the working
//! set, so cycles need no in-progress bookkeeping: they terminate because
//! each round either adds a new dylib, records a new exclusion, or changes
//! nothing.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use tracing::debug;

use crate::candidate::{ArchBucket, CandidateFile, FileStatus};
use crate::classify::Classifier;
use crate::macho::{Arch, MachOContext};
use crate::util::on_volume;

// =============================================================================
// Loader
// =============================================================================

/// Finds and classifies a dylib by runtime path.
pub trait DylibLoader {
    /// Returns a packable candidate for `runtime_path`, or `None` if the path
    /// is skipped, missing, or not packable for this architecture.
    fn load(&self, runtime_path: &str) -> Option<CandidateFile>;
}

impl<F> DylibLoader for F
where
    F: Fn(&str) -> Option<CandidateFile>,
{
    fn load(&self, runtime_path: &str) -> Option<CandidateFile> {
        self(runtime_path)
    }
}

/// Loader that re-scans the search prefixes on disk.
#[derive(Debug, Clone)]
pub struct FsLoader {
    arch: Arch,
    prefixes: Vec<PathBuf>,
    skip: HashSet<String>,
    classifier: Classifier,
}

impl FsLoader {
    /// Creates a loader for one architecture.
    pub fn new(
        arch: Arch,
        prefixes: Vec<PathBuf>,
        skip: HashSet<String>,
        classifier: Classifier,
    ) -> Self {
        Self {
            arch,
            prefixes,
            skip,
            classifier,
        }
    }
}

impl DylibLoader for FsLoader {
    fn load(&self, runtime_path: &str) -> Option<CandidateFile> {
        if self.skip.contains(runtime_path) {
            return None;
        }

        for prefix in &self.prefixes {
            let host_path = on_volume(prefix, runtime_path);
            let Ok(status) = FileStatus::of(&host_path) else {
                continue;
            };

            let mut scratch = [ArchBucket::new(self.arch)];
            self.classifier
                .classify(&host_path, runtime_path, &status, &mut scratch);
            let [bucket] = scratch;
            if let Some(found) = bucket.dylibs_for_cache.into_iter().last() {
                return Some(found);
            }
        }

        None
    }
}

// =============================================================================
// Exclusion Records
// =============================================================================

/// Why a dylib was excluded during closure verification.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExclusionReason {
    /// The loader could not produce the dependency
    MissingDependency(String),
    /// The dependency was itself excluded
    ExcludedDependency(String),
    /// A loaded dependency failed the cache eligibility check
    Ineligible(String),
}

impl ExclusionReason {
    /// Returns the dependency path the reason refers to, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            ExclusionReason::MissingDependency(p) | ExclusionReason::ExcludedDependency(p) => {
                Some(p)
            }
            ExclusionReason::Ineligible(_) => None,
        }
    }
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExclusionReason::MissingDependency(p) => write!(f, "Could not find dependency '{}'", p),
            ExclusionReason::ExcludedDependency(p) => {
                write!(f, "Dependency '{}' was excluded from the cache", p)
            }
            ExclusionReason::Ineligible(r) => f.write_str(r),
        }
    }
}

/// An excluded dylib and every reason recorded against it.
#[derive(Debug, Clone)]
pub struct ExclusionRecord {
    /// The excluded candidate
    pub candidate: CandidateFile,
    /// De-duplicated reasons
    pub reasons: BTreeSet<ExclusionReason>,
}

impl ExclusionRecord {
    /// Joins the reasons into one line.
    pub fn describe(&self) -> String {
        self.reasons
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Outcome of one verification run.
#[derive(Debug, Default)]
pub struct ClosureReport {
    /// Runtime paths of dylibs pulled in through the loader
    pub added: Vec<String>,
    /// Dylibs removed from the packable set
    pub excluded: Vec<ExclusionRecord>,
}

// =============================================================================
// Verification
// =============================================================================

/// Working state: every name a packable dylib answers to, mapped to the
/// runtime path of that dylib.
#[derive(Default)]
struct WorkingSet {
    owners: HashMap<String, String>,
    excluded: HashSet<String>,
    unloadable: HashSet<String>,
}

impl WorkingSet {
    fn insert(&mut self, candidate: &CandidateFile) {
        self.owners
            .insert(candidate.runtime_path.clone(), candidate.runtime_path.clone());
        if !candidate.install_name.is_empty() {
            self.owners
                .insert(candidate.install_name.clone(), candidate.runtime_path.clone());
        }
    }

    fn alias(&mut self, load_path: &str, owner: &str) {
        self.owners.insert(load_path.to_string(), owner.to_string());
    }

    fn owner_of(&self, candidate: &CandidateFile) -> Option<&String> {
        self.owners
            .get(&candidate.install_name)
            .or_else(|| self.owners.get(&candidate.runtime_path))
    }

    fn contains(&self, path: &str) -> bool {
        self.owners.contains_key(path)
    }

    /// Removes every name that points at `runtime_path`.
    fn exclude(&mut self, runtime_path: &str) {
        let excluded = &mut self.excluded;
        self.owners.retain(|name, owner| {
            if owner == runtime_path {
                excluded.insert(name.clone());
                false
            } else {
                true
            }
        });
        excluded.insert(runtime_path.to_string());
    }
}

/// Verifies that `dylibs` is closed under its dependencies.
///
/// On return `dylibs` holds the surviving set, in original order followed by
/// loader-added dylibs in discovery order. Excluded candidates are returned
/// in the report.
pub fn verify_self_contained(
    dylibs: &mut Vec<CandidateFile>,
    loader: &dyn DylibLoader,
) -> ClosureReport {
    let mut set = WorkingSet::default();
    for dylib in dylibs.iter() {
        set.insert(dylib);
    }

    let mut report = ClosureReport::default();
    let mut bad: HashMap<String, BTreeSet<ExclusionReason>> = HashMap::new();

    loop {
        let mut changed = false;
        let mut found: Vec<CandidateFile> = Vec::new();

        for dylib in dylibs.iter() {
            if bad.contains_key(&dylib.runtime_path) {
                continue;
            }

            for dep in &dylib.dependencies {
                if set.contains(dep) {
                    continue;
                }
                changed = true;

                let loaded = if set.excluded.contains(dep) || set.unloadable.contains(dep) {
                    None
                } else {
                    loader.load(dep)
                };

                let reason = match loaded {
                    Some(candidate) => match admit(&candidate, dep, &mut set) {
                        Ok(true) => {
                            set.insert(&candidate);
                            set.alias(dep, &candidate.runtime_path);
                            found.push(candidate);
                            continue;
                        }
                        Ok(false) => continue,
                        Err(reason) => reason,
                    },
                    None if set.excluded.contains(dep) => {
                        ExclusionReason::ExcludedDependency(dep.clone())
                    }
                    None => {
                        set.unloadable.insert(dep.clone());
                        ExclusionReason::MissingDependency(dep.clone())
                    }
                };

                debug!("{}: {}", dylib.runtime_path, reason);
                bad.entry(dylib.runtime_path.clone()).or_default().insert(reason);
                set.exclude(&dylib.runtime_path);
            }
        }

        for candidate in found {
            debug!("adding required dylib {}", candidate.runtime_path);
            report.added.push(candidate.runtime_path.clone());
            dylibs.push(candidate);
        }

        if !changed {
            break;
        }
    }

    if !bad.is_empty() {
        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(dylibs)
            .into_iter()
            .partition(|d| !bad.contains_key(&d.runtime_path));
        *dylibs = kept;
        report.excluded = removed
            .into_iter()
            .map(|candidate| {
                let reasons = bad.remove(&candidate.runtime_path).unwrap_or_default();
                ExclusionRecord { candidate, reasons }
            })
            .collect();
    }

    report
}

/// Decides whether a loaded dependency joins the set.
///
/// `Ok(false)` means the dependency turned out to be an alias of a dylib
/// already present; only the load path is recorded.
fn admit(
    candidate: &CandidateFile,
    load_path: &str,
    set: &mut WorkingSet,
) -> Result<bool, ExclusionReason> {
    if let Some(owner) = set.owner_of(candidate).cloned() {
        set.alias(load_path, &owner);
        return Ok(false);
    }

    let reasons = match MachOContext::parse(candidate.image.bytes()) {
        Ok(macho) => macho.cache_ineligibility(&candidate.runtime_path),
        Err(e) => vec![e.to_string()],
    };
    if reasons.is_empty() {
        return Ok(true);
    }

    set.unloadable.insert(load_path.to_string());
    Err(ExclusionReason::Ineligible(format!(
        "Dependency '{}' cannot be placed in the cache: {}",
        load_path,
        reasons.join(", ")
    )))
}

/// Runs verification on a bucket and moves exclusions to `other_dylibs`.
pub fn verify_bucket(bucket: &mut ArchBucket, loader: &dyn DylibLoader) -> ClosureReport {
    let report = verify_self_contained(&mut bucket.dylibs_for_cache, loader);

    for path in &report.added {
        bucket
            .diagnostics
            .warn(format!("not in inventory, but adding required dylib {}", path));
    }
    for record in &report.excluded {
        bucket.diagnostics.warn(format!(
            "rejected from cached dylibs: {} ({})",
            record.candidate.runtime_path,
            record.describe()
        ));
        bucket.other_dylibs.push(record.candidate.clone());
    }

    report
}
