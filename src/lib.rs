//! dscbuild - builds per-architecture dyld shared caches.
//!
//! The library discovers the Mach-O binaries installed on a volume, sorts
//! them into per-architecture buckets, prunes conflicting or ineligible
//! dylibs, verifies that the packable set is closed under its dependencies,
//! and hands the result to a [`CacheBuilder`] unless the existing cache is
//! already fresh.
//!
//! # Example
//!
//! ```no_run
//! use dscbuild::{
//!     discover, BuildConfig, DiskScan, ImageTableBuilder, Orchestrator, XattrIdentityStore,
//! };
//! use dscbuild::macho::Arch;
//!
//! fn main() -> dscbuild::Result<()> {
//!     let config = BuildConfig {
//!         cache_dir: "/private/var/db/dyld".into(),
//!         archs: vec![Arch::from_name("x86_64")?],
//!         ..BuildConfig::default()
//!     };
//!
//!     let buckets = discover(&config, &DiskScan::new(config.path_prefixes()));
//!     let summary = Orchestrator::new(&config, &ImageTableBuilder, &XattrIdentityStore)
//!         .run(buckets, None);
//!     assert!(!summary.failed());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod candidate;
pub mod classify;
pub mod closure;
pub mod diagnostics;
pub mod dyld;
pub mod error;
pub mod freshness;
pub mod identity;
pub mod inventory;
pub mod macho;
pub mod orchestrator;
pub mod prune;
pub mod symbols;
pub mod util;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use builder::{CacheBuilder, CreateOptions, CreateResults, ImageTableBuilder};
pub use candidate::{ArchBucket, CandidateFile, FileStatus};
pub use classify::Classifier;
pub use closure::{verify_bucket, verify_self_contained, ClosureReport, DylibLoader, ExclusionRecord, FsLoader};
pub use error::{Error, Result};
pub use freshness::{existing_cache_up_to_date, FreshnessWitness};
pub use identity::{IdentityStore, XattrIdentityStore};
pub use inventory::{DiskScan, Inventory, PathList};
pub use orchestrator::{discover, ArchOutcome, ArchReport, BuildConfig, Orchestrator, RunSummary};
pub use prune::{prune_bucket, InstallNameResolver, VolumeResolver};
pub use symbols::{DylibSymbolExporter, SymbolExporter};
