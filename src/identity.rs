//! The identity tag attached to a cache artifact.
//!
//! dyld trusts a cache whose `cacheUUID` extended attribute matches its
//! header. The tag is removed before a rebuild starts and set, create-only,
//! after the new artifact is in place, so a half-written state never carries
//! a valid tag.

use std::ffi::CString;
use std::io;
use std::path::Path;

use crate::error::{Error, Result};

/// Name of the identity attribute.
#[cfg(not(target_os = "linux"))]
pub const CACHE_UUID_XATTR: &str = "cacheUUID";

/// Name of the identity attribute. Linux restricts unprivileged attributes to
/// the `user.` namespace.
#[cfg(target_os = "linux")]
pub const CACHE_UUID_XATTR: &str = "user.cacheUUID";

/// Stores the identity tag of an artifact.
pub trait IdentityStore: Sync {
    /// Removes the tag. A missing file or missing tag is not an error.
    fn clear(&self, artifact: &Path) -> Result<()>;

    /// Sets the tag. Fails if a tag is already present.
    fn set(&self, artifact: &Path, uuid: &[u8; 16]) -> Result<()>;
}

/// Identity store backed by extended attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrIdentityStore;

fn c_path(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;

    CString::new(path.as_os_str().as_bytes()).map_err(|e| Error::IdentityTag {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

fn attr_name() -> CString {
    // The constant never contains an interior NUL.
    CString::new(CACHE_UUID_XATTR).unwrap_or_default()
}

fn tag_error(path: &Path) -> Error {
    Error::IdentityTag {
        path: path.to_path_buf(),
        source: io::Error::last_os_error(),
    }
}

#[cfg(target_os = "macos")]
const NO_ATTR: i32 = libc::ENOATTR;
#[cfg(target_os = "linux")]
const NO_ATTR: i32 = libc::ENODATA;
#[cfg(not(any(target_os = "macos", target_os = "linux")))]
const NO_ATTR: i32 = libc::ENOTSUP;

#[cfg(target_os = "macos")]
fn remove_attr(path: &CString, name: &CString) -> libc::c_int {
    // SAFETY: both pointers are valid NUL-terminated strings that outlive the call.
    unsafe { libc::removexattr(path.as_ptr(), name.as_ptr(), 0) }
}

#[cfg(target_os = "linux")]
fn remove_attr(path: &CString, name: &CString) -> libc::c_int {
    // SAFETY: both pointers are valid NUL-terminated strings that outlive the call.
    unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) }
}

#[cfg(target_os = "macos")]
fn create_attr(path: &CString, name: &CString, value: &[u8]) -> libc::c_int {
    // SAFETY: `value` is a live slice of `value.len()` bytes; strings are NUL-terminated.
    unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast::<libc::c_void>(),
            value.len(),
            0,
            libc::XATTR_CREATE,
        )
    }
}

#[cfg(target_os = "linux")]
fn create_attr(path: &CString, name: &CString, value: &[u8]) -> libc::c_int {
    // SAFETY: `value` is a live slice of `value.len()` bytes; strings are NUL-terminated.
    unsafe {
        libc::setxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast::<libc::c_void>(),
            value.len(),
            libc::XATTR_CREATE,
        )
    }
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn remove_attr(_path: &CString, _name: &CString) -> libc::c_int {
    0
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn create_attr(_path: &CString, _name: &CString, _value: &[u8]) -> libc::c_int {
    0
}

impl IdentityStore for XattrIdentityStore {
    fn clear(&self, artifact: &Path) -> Result<()> {
        let path = c_path(artifact)?;
        if remove_attr(&path, &attr_name()) == 0 {
            return Ok(());
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::ENOENT) => Ok(()),
            Some(code) if code == NO_ATTR => Ok(()),
            _ => Err(tag_error(artifact)),
        }
    }

    fn set(&self, artifact: &Path, uuid: &[u8; 16]) -> Result<()> {
        let path = c_path(artifact)?;
        if create_attr(&path, &attr_name(), uuid) == 0 {
            Ok(())
        } else {
            Err(tag_error(artifact))
        }
    }
}
