//! Small helpers for binary data and runtime-path handling.
//!
//! Fat headers are big-endian while thin Mach-O and cache metadata are
//! little-endian, so both byte orders are exposed here through `byteorder`.
//! Runtime paths are plain `/`-separated strings rooted at the scanned volume;
//! the path predicates below work on those strings, never on host paths.

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u32 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 4 > data.len()`.
#[inline(always)]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..])
}

/// Reads a big-endian u32 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 4 > data.len()`.
#[inline(always)]
pub fn read_u32_be_at(data: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&data[offset..])
}

/// Reads a big-endian u64 from a byte slice at the given offset.
///
/// # Panics
///
/// Panics if `offset + 8 > data.len()`.
#[inline(always)]
pub fn read_u64_be_at(data: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&data[offset..])
}

// =============================================================================
// C Strings
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` if there is no terminator.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Reads a NUL-terminated string starting at `offset`.
///
/// Invalid UTF-8 is replaced rather than rejected; install names and paths in
/// real binaries are ASCII in practice.
pub fn c_string_at(data: &[u8], offset: usize) -> Option<String> {
    let bytes = data.get(offset..)?;
    let end = memchr_null(bytes);
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

// =============================================================================
// Alignment
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

// =============================================================================
// Runtime Paths
// =============================================================================

/// Returns true if the runtime path lies inside an application bundle.
#[inline]
pub fn is_in_app_bundle(runtime_path: &str) -> bool {
    runtime_path.contains(".app/")
}

/// Returns true if `path` starts with any of the given prefixes.
#[inline]
pub fn has_any_prefix(path: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| path.starts_with(p))
}

/// Resolves a runtime path against a volume prefix.
///
/// An empty prefix stands for the booted volume.
pub fn on_volume(prefix: &Path, runtime_path: &str) -> PathBuf {
    if prefix.as_os_str().is_empty() {
        PathBuf::from(runtime_path)
    } else {
        prefix.join(runtime_path.trim_start_matches('/'))
    }
}

/// Converts a host path under `prefix` back into a runtime path.
pub fn runtime_path_of(prefix: &Path, host_path: &Path) -> Option<String> {
    let rel = if prefix.as_os_str().is_empty() {
        host_path.strip_prefix("/").ok()?
    } else {
        host_path.strip_prefix(prefix).ok()?
    };
    Some(format!("/{}", rel.to_str()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u32_both_orders() {
        let data = [0xCA, 0xFE, 0xBA, 0xBE];
        assert_eq!(read_u32_be_at(&data, 0), 0xCAFEBABE);
        assert_eq!(read_u32_le_at(&data, 0), 0xBEBAFECA);
    }

    #[test]
    fn test_c_string_at() {
        let data = b"junk/usr/lib/libz.dylib\0tail";
        assert_eq!(c_string_at(data, 4).as_deref(), Some("/usr/lib/libz.dylib"));
        assert_eq!(c_string_at(b"abc", 1).as_deref(), Some("bc"));
        assert_eq!(c_string_at(b"abc", 9), None);
    }

    #[test]
    fn test_memchr_null() {
        assert_eq!(memchr_null(b"hello\0world"), 5);
        assert_eq!(memchr_null(b"hello"), 5);
    }

    #[test]
    fn test_path_predicates() {
        assert!(is_in_app_bundle("/Applications/Mail.app/Contents/MacOS/Mail"));
        assert!(!is_in_app_bundle("/usr/lib/libapp.dylib"));
        assert!(has_any_prefix("/usr/local/lib/x", &["/opt/", "/usr/local/"]));
    }

    #[test]
    fn test_volume_paths() {
        assert_eq!(on_volume(Path::new(""), "/usr/lib/libz.dylib"), PathBuf::from("/usr/lib/libz.dylib"));
        let root = Path::new("/Volumes/Target");
        let host = on_volume(root, "/usr/lib/libz.dylib");
        assert_eq!(host, PathBuf::from("/Volumes/Target/usr/lib/libz.dylib"));
        assert_eq!(runtime_path_of(root, &host).as_deref(), Some("/usr/lib/libz.dylib"));
        assert_eq!(runtime_path_of(Path::new(""), Path::new("/usr/bin/true")).as_deref(), Some("/usr/bin/true"));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(0x1000, 0x4000), 0x4000);
    }
}
