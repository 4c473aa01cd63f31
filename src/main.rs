//! dscbuild - builds dyld shared caches for the dylibs installed on a volume.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use dscbuild::macho::Arch;
use dscbuild::symbols::DSCSYM_LIBRARY;
use dscbuild::{
    discover, ArchOutcome, BuildConfig, DiskScan, DylibSymbolExporter, FileStatus,
    ImageTableBuilder, Inventory, Orchestrator, PathList, SymbolExporter, XattrIdentityStore,
};

/// Where caches live relative to the volume root.
const DEFAULT_CACHE_SUBDIR: &str = "private/var/db/dyld";

/// Builds per-architecture dyld shared caches.
#[derive(Parser, Debug)]
#[command(name = "dscbuild")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Build caches for the volume mounted at this path
    #[arg(long)]
    root: Option<PathBuf>,

    /// Search this directory before the boot volume
    #[arg(long)]
    overlay: Option<PathBuf>,

    /// Directory the caches are written to
    /// (default: <root or overlay>/private/var/db/dyld)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Architecture to build (repeatable)
    #[arg(long = "arch", value_name = "ARCH")]
    archs: Vec<String>,

    /// Build i386, x86_64 and x86_64h
    #[arg(long)]
    universal_boot: bool,

    /// Runtime path of a dylib to leave out of the cache (repeatable)
    #[arg(long = "skip", value_name = "PATH")]
    skip: Vec<String>,

    /// File listing runtime paths to consider, one per line
    #[arg(long, value_name = "FILE")]
    dylib_list: Option<PathBuf>,

    /// Walk the volume for candidates
    #[arg(long)]
    search_disk: bool,

    /// Rebuild even if the existing caches are up to date
    #[arg(long)]
    force: bool,

    /// Log progress and every stale image
    #[arg(short, long)]
    verbose: bool,

    /// Log per-file decisions
    #[arg(long)]
    debug: bool,

    /// Images were removed from the install after mastering
    #[arg(long)]
    dylibs_removed_in_mastering: bool,

    /// Number of parallel jobs (default: number of CPUs)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Library used to save symbols after a cache is written
    #[arg(long, value_name = "DYLIB", default_value = DSCSYM_LIBRARY)]
    symbols_exporter: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.debug);

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(verbose: bool, debug: bool) {
    let level = if debug {
        Level::DEBUG
    } else if verbose {
        Level::INFO
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Returns true if every architecture succeeded.
fn run(cli: Cli) -> Result<bool> {
    let config = build_config(&cli)?;

    if let Some(n) = cli.jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    let inventory: Box<dyn Inventory> = match (&cli.dylib_list, cli.search_disk) {
        (Some(list), _) => Box::new(
            PathList::from_file(list, config.path_prefixes())
                .with_context(|| format!("Failed to read dylib list: {}", list.display()))?,
        ),
        (None, true) => Box::new(DiskScan::new(config.path_prefixes())),
        (None, false) => bail!("Either --dylib-list or --search-disk is required"),
    };

    let start = Instant::now();
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    spinner.set_message("scanning for dylibs");
    spinner.enable_steady_tick(Duration::from_millis(100));
    let buckets = discover(&config, inventory.as_ref());
    spinner.finish_and_clear();
    info!("Discovery finished in {:.2}s", start.elapsed().as_secs_f64());

    let exporter = DylibSymbolExporter::probe(&cli.symbols_exporter);
    let summary = Orchestrator::new(&config, &ImageTableBuilder, &XattrIdentityStore)
        .run(buckets, exporter.as_ref().map(|e| e as &dyn SymbolExporter));

    for report in &summary.reports {
        match &report.outcome {
            ArchOutcome::UpToDate => info!("{}: up to date", report.arch),
            ArchOutcome::Written { artifact, dylibs } => {
                info!("{}: wrote {} ({} dylibs)", report.arch, artifact.display(), dylibs)
            }
            ArchOutcome::Failed(e) => error!("{}: {}", report.arch, e),
        }
    }
    if summary.warning_count() > 0 {
        warn!("{} warnings", summary.warning_count());
    }

    Ok(!summary.failed())
}

fn build_config(cli: &Cli) -> Result<BuildConfig> {
    if cli.root.is_some() && cli.overlay.is_some() {
        bail!("--root and --overlay cannot be used together");
    }

    let root = match &cli.root {
        Some(root) => volume_path(root)?,
        None => PathBuf::new(),
    };
    let overlay = cli.overlay.as_deref().map(volume_path).transpose()?;

    let volume = overlay.clone().unwrap_or_else(|| root.clone());
    let cache_dir = match &cli.cache_dir {
        Some(dir) => dir.clone(),
        None => Path::new("/").join(&volume).join(DEFAULT_CACHE_SUBDIR),
    };
    fs::create_dir_all(&cache_dir)
        .with_context(|| format!("Failed to create cache directory: {}", cache_dir.display()))?;

    let require_protection = FileStatus::of(&cache_dir)
        .map(|s| s.restricted)
        .unwrap_or(false);

    Ok(BuildConfig {
        root,
        overlay,
        cache_dir,
        archs: requested_archs(cli)?,
        skip: cli.skip.iter().cloned().collect::<HashSet<_>>(),
        force: cli.force,
        verbose: cli.verbose || cli.debug,
        dylibs_removed_in_mastering: cli.dylibs_removed_in_mastering,
        require_protection,
    })
}

/// Canonicalizes a volume path. The boot volume becomes the empty prefix.
fn volume_path(path: &Path) -> Result<PathBuf> {
    let real = fs::canonicalize(path)
        .with_context(|| format!("Path does not exist: {}", path.display()))?;
    if real == Path::new("/") {
        Ok(PathBuf::new())
    } else {
        Ok(real)
    }
}

fn requested_archs(cli: &Cli) -> Result<Vec<Arch>> {
    let names: Vec<&str> = if !cli.archs.is_empty() {
        cli.archs.iter().map(String::as_str).collect()
    } else if cli.universal_boot {
        vec!["i386", "x86_64", "x86_64h"]
    } else if host_is_haswell() {
        vec!["i386", "x86_64h"]
    } else {
        vec!["i386", "x86_64"]
    };

    let mut archs: Vec<Arch> = Vec::new();
    for name in names {
        let arch = Arch::from_name(name)?;
        if !archs.contains(&arch) {
            archs.push(arch);
        }
    }
    Ok(archs)
}

#[cfg(target_arch = "x86_64")]
fn host_is_haswell() -> bool {
    std::arch::is_x86_feature_detected!("avx2")
        && std::arch::is_x86_feature_detected!("bmi2")
        && std::arch::is_x86_feature_detected!("fma")
}

#[cfg(not(target_arch = "x86_64"))]
fn host_is_haswell() -> bool {
    false
}
