//! Post-build symbol export.
//!
//! When any cache was written, the host may ask a system library to save
//! symbol information for the current caches. The library is optional; a
//! missing library is not an error.

use std::ffi::{c_char, c_int, CString};
use std::path::{Path, PathBuf};

use libloading::{Library, Symbol};
use tracing::debug;

use crate::error::{Error, Result};

/// Default location of the exporter library.
pub const DSCSYM_LIBRARY: &str = "/usr/lib/libdscsym.dylib";

const EXPORT_SYMBOL: &[u8] = b"dscsym_save_dscsyms_for_current_caches\0";

type ExportFn = unsafe extern "C" fn(*const c_char) -> c_int;

/// Saves symbols for freshly built caches.
pub trait SymbolExporter {
    /// Exports symbols for the caches under `root`.
    fn export(&self, root: &Path) -> Result<()>;
}

/// Exporter backed by a dynamically loaded library.
#[derive(Debug, Clone)]
pub struct DylibSymbolExporter {
    library: PathBuf,
}

impl DylibSymbolExporter {
    /// Returns an exporter if `library` exists on this host.
    pub fn probe(library: impl Into<PathBuf>) -> Option<Self> {
        let library = library.into();
        if library.is_file() {
            Some(Self { library })
        } else {
            debug!("symbol exporter {} not present", library.display());
            None
        }
    }

    /// Returns the library path.
    pub fn library(&self) -> &Path {
        &self.library
    }

    fn unavailable(&self, reason: impl ToString) -> Error {
        Error::ExporterUnavailable {
            path: self.library.clone(),
            reason: reason.to_string(),
        }
    }
}

impl SymbolExporter for DylibSymbolExporter {
    fn export(&self, root: &Path) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;

        let root = CString::new(root.as_os_str().as_bytes()).map_err(|e| self.unavailable(e))?;

        // SAFETY: loading runs the library's initializers; the library is a
        // system component at a fixed path.
        let library = unsafe { Library::new(&self.library) }.map_err(|e| self.unavailable(e))?;
        // SAFETY: the exported function has the signature of `ExportFn`.
        let export: Symbol<ExportFn> =
            unsafe { library.get(EXPORT_SYMBOL) }.map_err(|e| self.unavailable(e))?;

        // SAFETY: `root` is a valid NUL-terminated string for the duration of the call.
        let rc = unsafe { export(root.as_ptr()) };
        debug!("{} returned {}", self.library.display(), rc);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_probe_missing_library() {
        let dir = TempDir::new().unwrap();
        assert!(DylibSymbolExporter::probe(dir.path().join("libdscsym.dylib")).is_none());
    }

    #[test]
    fn test_export_from_non_library_fails() {
        let dir = TempDir::new().unwrap();
        let fake = dir.path().join("libdscsym.dylib");
        std::fs::write(&fake, b"not a library").unwrap();

        let exporter = DylibSymbolExporter::probe(&fake).unwrap();
        assert_eq!(exporter.library(), fake);
        assert!(matches!(
            exporter.export(Path::new("/")),
            Err(Error::ExporterUnavailable { .. })
        ));
    }
}
