//! Per-architecture build orchestration.
//!
//! Discovery and pruning run once over the whole inventory. Each
//! architecture then goes through closure verification, the freshness gate,
//! the cache builder and persistence on its own, in parallel when the host
//! has enough memory. A failure in one architecture is recorded in its
//! [`ArchReport`] and never stops the others.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::builder::{BuiltCache, CacheBuilder, CreateOptions};
use crate::candidate::ArchBucket;
use crate::classify::Classifier;
use crate::closure::{verify_bucket, DylibLoader, FsLoader};
use crate::dyld::CACHE_FILE_PREFIX;
use crate::error::{Error, Result};
use crate::freshness::existing_cache_up_to_date;
use crate::identity::IdentityStore;
use crate::inventory::{classify_inventory, Inventory};
use crate::macho::Arch;
use crate::prune::{prune_bucket, VolumeResolver};
use crate::symbols::SymbolExporter;

/// Physical memory needed before architectures are built concurrently.
pub const PARALLEL_MEMORY_THRESHOLD: u64 = 0x1_0000_0000;

// =============================================================================
// Configuration
// =============================================================================

/// Everything a run needs to know, resolved from the command line.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Volume to build for; empty for the boot volume
    pub root: PathBuf,
    /// Directory searched before the boot volume
    pub overlay: Option<PathBuf>,
    /// Where artifacts are written
    pub cache_dir: PathBuf,
    /// Architectures to build
    pub archs: Vec<Arch>,
    /// Runtime paths never packed
    pub skip: HashSet<String>,
    /// Rebuild even when the existing cache is fresh
    pub force: bool,
    /// Report every freshness mismatch and pass verbosity to the builder
    pub verbose: bool,
    /// Images were stripped from the install after mastering
    pub dylibs_removed_in_mastering: bool,
    /// Only accept binaries carrying the restricted flag
    pub require_protection: bool,
}

impl BuildConfig {
    /// Volume prefixes searched in order.
    pub fn path_prefixes(&self) -> Vec<PathBuf> {
        match &self.overlay {
            Some(overlay) => vec![overlay.clone(), PathBuf::new()],
            None => vec![self.root.clone()],
        }
    }

    /// Prefix install names are resolved against.
    pub fn volume_prefix(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact for `arch`.
    pub fn artifact_path(&self, arch: &Arch) -> PathBuf {
        self.cache_dir.join(format!("{}{}", CACHE_FILE_PREFIX, arch.name))
    }

    /// Path of the layout description for `arch`.
    pub fn map_path(&self, arch: &Arch) -> PathBuf {
        self.cache_dir
            .join(format!("{}{}.map", CACHE_FILE_PREFIX, arch.name))
    }

    /// Root handed to the symbol exporter.
    pub fn symbols_root(&self) -> PathBuf {
        if !self.root.as_os_str().is_empty() {
            self.root.clone()
        } else if let Some(overlay) = &self.overlay {
            overlay.clone()
        } else {
            PathBuf::from("/")
        }
    }
}

// =============================================================================
// Run State
// =============================================================================

/// What happened to one architecture.
#[derive(Debug)]
pub enum ArchOutcome {
    /// The existing artifact already matched the volume
    UpToDate,
    /// A new artifact was written
    Written {
        /// Artifact path
        artifact: PathBuf,
        /// Number of packed dylibs
        dylibs: usize,
    },
    /// The build or persistence failed
    Failed(Error),
}

/// Result of one architecture's pipeline.
#[derive(Debug)]
pub struct ArchReport {
    /// Architecture name
    pub arch: &'static str,
    /// Warnings collected from discovery to persistence
    pub warnings: Vec<String>,
    /// Final outcome
    pub outcome: ArchOutcome,
}

impl ArchReport {
    /// Returns true if the architecture failed.
    pub fn failed(&self) -> bool {
        matches!(self.outcome, ArchOutcome::Failed(_))
    }
}

/// State shared by the architecture tasks of one run.
#[derive(Debug, Default)]
pub struct RunContext {
    /// Report every freshness mismatch
    pub verbose: bool,
    /// Skip the freshness gate
    pub force: bool,
    wrote_any: AtomicBool,
    reports: Mutex<Vec<ArchReport>>,
}

impl RunContext {
    /// Creates a context.
    pub fn new(verbose: bool, force: bool) -> Self {
        Self {
            verbose,
            force,
            ..Self::default()
        }
    }

    /// Returns true once any artifact has been written.
    pub fn wrote_any(&self) -> bool {
        self.wrote_any.load(Ordering::SeqCst)
    }

    fn mark_written(&self) {
        self.wrote_any.store(true, Ordering::SeqCst);
    }

    fn record(&self, report: ArchReport) {
        match self.reports.lock() {
            Ok(mut reports) => reports.push(report),
            Err(poisoned) => poisoned.into_inner().push(report),
        }
    }

    fn into_reports(self) -> Vec<ArchReport> {
        match self.reports.into_inner() {
            Ok(reports) => reports,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Aggregate result of a run.
#[derive(Debug)]
pub struct RunSummary {
    /// One report per architecture, in configuration order
    pub reports: Vec<ArchReport>,
    /// Whether any artifact was written
    pub wrote_any: bool,
}

impl RunSummary {
    /// Returns true if any architecture failed.
    pub fn failed(&self) -> bool {
        self.reports.iter().any(ArchReport::failed)
    }

    /// Total warnings across architectures.
    pub fn warning_count(&self) -> usize {
        self.reports.iter().map(|r| r.warnings.len()).sum()
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Classifies the inventory and prunes every bucket.
pub fn discover(config: &BuildConfig, inventory: &dyn Inventory) -> Vec<ArchBucket> {
    let classifier = Classifier::new(config.require_protection);
    let mut buckets: Vec<ArchBucket> = config.archs.iter().copied().map(ArchBucket::new).collect();

    let start = Instant::now();
    classify_inventory(inventory, &classifier, &mut buckets);

    let resolver = VolumeResolver::new(config.volume_prefix());
    for bucket in &mut buckets {
        prune_bucket(bucket, &config.skip, &resolver);
    }
    debug!("discovery took {:.2?}", start.elapsed());

    buckets
}

/// Returns the host's physical memory in bytes.
pub fn physical_memory() -> Option<u64> {
    // SAFETY: sysconf has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    // SAFETY: as above.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    (pages as u64).checked_mul(page_size as u64)
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives the per-architecture pipeline.
pub struct Orchestrator<'a> {
    config: &'a BuildConfig,
    builder: &'a dyn CacheBuilder,
    identity: &'a dyn IdentityStore,
    parallel: bool,
}

impl<'a> Orchestrator<'a> {
    /// Creates an orchestrator. Architectures run in parallel when the host
    /// has at least [`PARALLEL_MEMORY_THRESHOLD`] bytes of memory.
    pub fn new(
        config: &'a BuildConfig,
        builder: &'a dyn CacheBuilder,
        identity: &'a dyn IdentityStore,
    ) -> Self {
        let parallel = physical_memory().is_some_and(|m| m >= PARALLEL_MEMORY_THRESHOLD);
        Self {
            config,
            builder,
            identity,
            parallel,
        }
    }

    /// Overrides the memory-based parallelism decision.
    pub fn with_parallelism(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Builds every bucket, then runs the symbol exporter if anything was
    /// written.
    pub fn run(
        &self,
        buckets: Vec<ArchBucket>,
        exporter: Option<&dyn SymbolExporter>,
    ) -> RunSummary {
        let ctx = RunContext::new(self.config.verbose, self.config.force);

        if self.parallel {
            buckets
                .into_par_iter()
                .for_each(|bucket| self.build_arch(bucket, &ctx));
        } else {
            debug!("building architectures serially");
            for bucket in buckets {
                self.build_arch(bucket, &ctx);
            }
        }

        let wrote_any = ctx.wrote_any();
        if wrote_any {
            if let Some(exporter) = exporter {
                if let Err(e) = exporter.export(&self.config.symbols_root()) {
                    warn!("{}", e);
                }
            }
        }

        let mut reports = ctx.into_reports();
        reports.sort_by_key(|r| {
            self.config
                .archs
                .iter()
                .position(|a| a.name == r.arch)
                .unwrap_or(usize::MAX)
        });
        RunSummary { reports, wrote_any }
    }

    /// Runs one architecture to completion and records its report.
    pub fn build_arch(&self, mut bucket: ArchBucket, ctx: &RunContext) {
        let loader = FsLoader::new(
            bucket.arch,
            self.config.path_prefixes(),
            self.config.skip.clone(),
            Classifier::new(self.config.require_protection),
        );
        let outcome = self.build_with_loader(&mut bucket, &loader, ctx);
        if let ArchOutcome::Failed(e) = &outcome {
            error!("{}", e);
        }

        ctx.record(ArchReport {
            arch: bucket.arch.name,
            warnings: bucket.diagnostics.take(),
            outcome,
        });
    }

    fn build_with_loader(
        &self,
        bucket: &mut ArchBucket,
        loader: &dyn DylibLoader,
        ctx: &RunContext,
    ) -> ArchOutcome {
        let arch = bucket.arch;
        verify_bucket(bucket, loader);

        let artifact = self.config.artifact_path(&arch);
        if !ctx.force && existing_cache_up_to_date(&artifact, &bucket.dylibs_for_cache, ctx.verbose) {
            info!("{}: dyld shared cache is up to date", arch);
            return ArchOutcome::UpToDate;
        }

        info!(
            "{} incorporating {} OS dylibs, tracking {} others, building closures for {} executables",
            arch,
            bucket.dylibs_for_cache.len(),
            bucket.other_dylibs.len(),
            bucket.executables.len()
        );

        if let Err(e) = self.identity.clear(&artifact) {
            bucket.diagnostics.warn(e.to_string());
        }

        let mut options = CreateOptions::for_macos(arch, self.config.path_prefixes());
        options.verbose = ctx.verbose;
        options.dylibs_removed_during_mastering = self.config.dylibs_removed_in_mastering;

        let results = self.builder.create(
            &options,
            &bucket.dylibs_for_cache,
            &bucket.other_dylibs,
            &bucket.executables,
        );
        for warning in results.warnings {
            bucket.diagnostics.warn(warning);
        }

        let cache = match (results.cache, results.error_message) {
            (Some(cache), None) => cache,
            (_, message) => {
                return ArchOutcome::Failed(Error::BuildFailed {
                    arch: arch.name.to_string(),
                    message: message.unwrap_or_else(|| "builder produced no cache".to_string()),
                })
            }
        };

        if let Err(e) = self.persist(&arch, &cache, bucket) {
            return ArchOutcome::Failed(e);
        }
        ctx.mark_written();

        ArchOutcome::Written {
            artifact,
            dylibs: bucket.dylibs_for_cache.len(),
        }
    }

    fn persist(&self, arch: &Arch, cache: &BuiltCache, bucket: &mut ArchBucket) -> Result<()> {
        let artifact = self.config.artifact_path(arch);
        write_atomically(&self.config.cache_dir, &artifact, &cache.bytes)?;

        if let Err(e) = self.identity.set(&artifact, &cache.uuid) {
            bucket.diagnostics.warn(e.to_string());
        }

        // The artifact is already in place; a missing map does not undo it.
        let map = self.config.map_path(arch);
        match write_atomically(&self.config.cache_dir, &map, cache.map.as_bytes()) {
            Ok(()) => debug!("{}: wrote {} and {}", arch, artifact.display(), map.display()),
            Err(e) => bucket.diagnostics.warn(e.to_string()),
        }
        Ok(())
    }
}

/// Writes `bytes` to `dest` through a temporary file in `dir`.
fn write_atomically(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let write_err = |source: std::io::Error| Error::FileWrite {
        path: dest.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))
        .map_err(write_err)?;
    tmp.persist(dest).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::builder::{CreateResults, ImageTableBuilder};
    use crate::candidate::CandidateFile;
    use crate::test_support::dylib;

    struct NoTags;

    impl IdentityStore for NoTags {
        fn clear(&self, _: &Path) -> Result<()> {
            Ok(())
        }

        fn set(&self, _: &Path, _: &[u8; 16]) -> Result<()> {
            Ok(())
        }
    }

    struct Failing;

    impl CacheBuilder for Failing {
        fn create(
            &self,
            _: &CreateOptions,
            _: &[CandidateFile],
            _: &[CandidateFile],
            _: &[CandidateFile],
        ) -> CreateResults {
            CreateResults::failed("out of address space")
        }
    }

    fn config(dir: &TempDir) -> BuildConfig {
        BuildConfig {
            cache_dir: dir.path().to_path_buf(),
            archs: vec![Arch::from_name("x86_64").unwrap()],
            ..BuildConfig::default()
        }
    }

    fn bucket_with(dylibs: Vec<CandidateFile>) -> ArchBucket {
        let mut bucket = ArchBucket::new(Arch::from_name("x86_64").unwrap());
        bucket.dylibs_for_cache = dylibs;
        bucket
    }

    fn no_loader(_: &str) -> Option<CandidateFile> {
        None
    }

    #[test]
    fn test_path_prefixes() {
        let mut config = BuildConfig {
            root: PathBuf::from("/Volumes/Target"),
            ..BuildConfig::default()
        };
        assert_eq!(config.path_prefixes(), [PathBuf::from("/Volumes/Target")]);
        assert_eq!(config.symbols_root(), Path::new("/Volumes/Target"));

        config.root = PathBuf::new();
        config.overlay = Some(PathBuf::from("/tmp/overlay"));
        assert_eq!(config.path_prefixes(), [PathBuf::from("/tmp/overlay"), PathBuf::new()]);
        assert_eq!(config.symbols_root(), Path::new("/tmp/overlay"));

        config.overlay = None;
        assert_eq!(config.symbols_root(), Path::new("/"));
    }

    #[test]
    fn test_artifact_names() {
        let config = BuildConfig {
            cache_dir: PathBuf::from("/private/var/db/dyld"),
            ..BuildConfig::default()
        };
        let arch = Arch::from_name("x86_64h").unwrap();
        assert_eq!(
            config.artifact_path(&arch),
            Path::new("/private/var/db/dyld/dyld_shared_cache_x86_64h")
        );
        assert_eq!(
            config.map_path(&arch),
            Path::new("/private/var/db/dyld/dyld_shared_cache_x86_64h.map")
        );
    }

    #[test]
    fn test_writes_artifact_then_is_fresh() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let orch = Orchestrator::new(&config, &ImageTableBuilder, &NoTags);
        let lib = || dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[]);

        let ctx = RunContext::new(false, false);
        let outcome = orch.build_with_loader(&mut bucket_with(vec![lib()]), &no_loader, &ctx);
        assert!(matches!(outcome, ArchOutcome::Written { dylibs: 1, .. }));
        assert!(ctx.wrote_any());
        assert!(config.map_path(&config.archs[0]).exists());

        let ctx = RunContext::new(false, false);
        let outcome = orch.build_with_loader(&mut bucket_with(vec![lib()]), &no_loader, &ctx);
        assert!(matches!(outcome, ArchOutcome::UpToDate));
        assert!(!ctx.wrote_any());

        let ctx = RunContext::new(false, true);
        let outcome = orch.build_with_loader(&mut bucket_with(vec![lib()]), &no_loader, &ctx);
        assert!(matches!(outcome, ArchOutcome::Written { .. }));
    }

    #[test]
    fn test_map_failure_still_counts_as_written() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let map = config.map_path(&config.archs[0]);
        fs::create_dir(&map).unwrap();
        fs::write(map.join("occupied"), b"x").unwrap();

        let orch = Orchestrator::new(&config, &ImageTableBuilder, &NoTags);
        let mut bucket = bucket_with(vec![dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[])]);
        let ctx = RunContext::new(false, false);
        let outcome = orch.build_with_loader(&mut bucket, &no_loader, &ctx);

        assert!(matches!(outcome, ArchOutcome::Written { dylibs: 1, .. }));
        assert!(ctx.wrote_any());
        assert!(config.artifact_path(&config.archs[0]).is_file());
        assert!(bucket
            .diagnostics
            .warnings()
            .iter()
            .any(|w| w.contains("dyld_shared_cache_x86_64.map")));
    }

    #[test]
    fn test_builder_failure_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let orch = Orchestrator::new(&config, &Failing, &NoTags);

        let ctx = RunContext::new(false, false);
        let lib = dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[]);
        let outcome = orch.build_with_loader(&mut bucket_with(vec![lib]), &no_loader, &ctx);

        match outcome {
            ArchOutcome::Failed(Error::BuildFailed { arch, message }) => {
                assert_eq!(arch, "x86_64");
                assert_eq!(message, "out of address space");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!ctx.wrote_any());
        assert!(!config.artifact_path(&config.archs[0]).exists());
    }

    #[test]
    fn test_exclusions_reach_the_report() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let orch = Orchestrator::new(&config, &ImageTableBuilder, &NoTags).with_parallelism(false);

        let bucket = bucket_with(vec![
            dylib("/usr/lib/libA.dylib", "/usr/lib/libA.dylib", &[]),
            dylib("/usr/lib/libC.dylib", "/usr/lib/libC.dylib", &["/usr/lib/libMissing.dylib"]),
        ]);
        let summary = orch.run(vec![bucket], None);

        assert!(!summary.failed());
        assert!(summary.wrote_any);
        let report = &summary.reports[0];
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("/usr/lib/libC.dylib") && w.contains("/usr/lib/libMissing.dylib")));
    }

    #[test]
    fn test_exporter_runs_only_after_a_write() {
        use std::cell::RefCell;

        struct Recorder(RefCell<Vec<PathBuf>>);

        impl SymbolExporter for Recorder {
            fn export(&self, root: &Path) -> Result<()> {
                self.0.borrow_mut().push(root.to_path_buf());
                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let recorder = Recorder(RefCell::new(Vec::new()));

        let failing = Orchestrator::new(&config, &Failing, &NoTags);
        failing.run(vec![bucket_with(vec![])], Some(&recorder as &dyn SymbolExporter));
        assert!(recorder.0.borrow().is_empty());

        let working = Orchestrator::new(&config, &ImageTableBuilder, &NoTags);
        let lib = dylib("/usr/lib/libD.dylib", "/usr/lib/libD.dylib", &[]);
        working.run(vec![bucket_with(vec![lib])], Some(&recorder as &dyn SymbolExporter));
        assert_eq!(*recorder.0.borrow(), [PathBuf::from("/")]);
    }

    #[test]
    fn test_reports_follow_config_order() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.archs = vec![Arch::from_name("i386").unwrap(), Arch::from_name("x86_64").unwrap()];
        let orch = Orchestrator::new(&config, &Failing, &NoTags).with_parallelism(true);

        let buckets: Vec<_> = config.archs.iter().copied().map(ArchBucket::new).collect();
        let summary = orch.run(buckets, None);

        let names: Vec<_> = summary.reports.iter().map(|r| r.arch).collect();
        assert_eq!(names, ["i386", "x86_64"]);
        assert!(summary.failed());
    }
}
