//! Dyld shared cache artifact metadata.
//!
//! A cache file starts with a header naming its architecture and pointing at
//! an image table. Each table entry records the install name of a packed
//! dylib together with the modification time and inode its source file had
//! when the cache was built; that is what the freshness check compares
//! against the current state of the volume.
//!
//! # Cache Files
//!
//! - `dyld_shared_cache_<arch>`: the cache itself
//! - `dyld_shared_cache_<arch>.map`: a text listing of packed images

mod context;
mod structs;
mod writer;

pub use context::*;
pub use structs::*;
pub use writer::*;
