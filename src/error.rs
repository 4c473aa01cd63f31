//! Error types for shared cache construction.
//!
//! Errors are grouped by the stage that raises them. Discovery and policy
//! problems are normally downgraded to warnings by the caller; only build and
//! persistence failures are fatal, and then only for a single architecture.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for cache construction.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("mach-o file, but for wrong architecture (required {required}, found {found})")]
    WrongArchitecture { required: String, found: String },

    #[error("not a dylib, bundle, or executable (file type {0:#x})")]
    UnsupportedMachoType(u32),

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    // ==================== Fat Container Errors ====================
    #[error("fat file slice {index} [{offset:#x}, +{size:#x}) extends beyond file (size {file_size:#x})")]
    FatSliceOutOfBounds {
        index: usize,
        offset: u64,
        size: u64,
        file_size: u64,
    },

    #[error("fat file has too many slices ({0})")]
    FatTooManySlices(u32),

    // ==================== Cache Artifact Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidCacheMagic([u8; 4]),

    // ==================== Build Errors ====================
    #[error("{arch}: cache build failed: {message}")]
    BuildFailed { arch: String, message: String },

    #[error("identity tag operation failed on '{path}': {source}")]
    IdentityTag {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("symbol exporter '{path}' unavailable: {reason}")]
    ExporterUnavailable { path: PathBuf, reason: String },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for cache construction.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true for validation failures that are expected while probing
    /// every file for every architecture and are not worth reporting.
    #[inline]
    pub fn is_expected_rejection(&self) -> bool {
        matches!(
            self,
            Error::WrongArchitecture { .. } | Error::UnsupportedMachoType(_)
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_rejections() {
        let wrong = Error::WrongArchitecture {
            required: "x86_64".into(),
            found: "arm64".into(),
        };
        assert!(wrong.is_expected_rejection());
        assert!(Error::UnsupportedMachoType(1).is_expected_rejection());
        assert!(!Error::InvalidMachoMagic(0).is_expected_rejection());
        assert!(!Error::LoadCommandOverflow { offset: 32 }.is_expected_rejection());
    }

    #[test]
    fn test_build_failed_message() {
        let err = Error::BuildFailed {
            arch: "i386".into(),
            message: "out of space".into(),
        };
        assert_eq!(err.to_string(), "i386: cache build failed: out of space");
    }
}
