//! Mach-O file format handling.
//!
//! This module is the binary-format collaborator of the cache pipeline: it
//! splits fat containers, validates thin slices for an architecture, and
//! answers the questions the classifier and closure verifier ask (install
//! name, dependencies, executable-ness, cache eligibility).

mod arch;
mod constants;
mod context;
mod fat;
mod structs;

pub use arch::*;
pub use constants::*;
pub use context::*;
pub use fat::*;
pub use structs::*;
