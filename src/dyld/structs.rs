//! Dyld shared cache binary structures.
//!
//! Only the leading part of the cache header is modelled: enough to locate
//! the image table, whose entries carry the (mtime, inode) pairs recorded when
//! the cache was built. Everything between `cache_type` and the modern image
//! table location is opaque here.

use std::mem::offset_of;

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

/// File name prefix of per-architecture cache files.
pub const CACHE_FILE_PREFIX: &str = "dyld_shared_cache_";

// =============================================================================
// Header Structures
// =============================================================================

/// The leading part of the dyld shared cache header.
///
/// Fields past `mapping_offset` may not exist in older caches; use
/// [`DyldCacheHeader::contains_field`] before trusting them.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// Magic identifier, e.g., "dyld_v1  x86_64"
    pub magic: [u8; 16],
    /// File offset to first mapping info; also the header length
    pub mapping_offset: u32,
    /// Number of mapping entries
    pub mapping_count: u32,
    /// Legacy: file offset to `DyldCacheImageInfo` array
    pub images_offset_old: u32,
    /// Legacy: number of images
    pub images_count_old: u32,
    /// Base address of dyld when cache was built
    pub dyld_base_address: u64,
    /// File offset of code signature
    pub code_signature_offset: u64,
    /// Size of code signature
    pub code_signature_size: u64,
    /// Legacy slide info offset and size
    pub slide_info_unused: [u64; 2],
    /// File offset of local symbols info
    pub local_symbols_offset: u64,
    /// Size of local symbols info
    pub local_symbols_size: u64,
    /// UUID of this cache
    pub uuid: [u8; 16],
    /// Cache type: 0=development, 1=production, 2=multi-cache
    pub cache_type: u64,
    /// Fields this tool does not interpret
    pub opaque: [u8; 0x150],
    /// File offset to image info array (new location)
    pub images_offset: u32,
    /// Number of images (new location)
    pub images_count: u32,
}

impl DyldCacheHeader {
    /// Size of the modelled header prefix.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Creates an empty header for the given architecture.
    pub fn new(arch_name: &str) -> Self {
        let mut header = Self::new_zeroed();
        header.magic = magic_for(arch_name);
        header.mapping_offset = Self::SIZE as u32;
        header
    }

    /// Returns the architecture from the magic string.
    pub fn architecture(&self) -> &str {
        let end = self.magic.iter().position(|&b| b == 0).unwrap_or(16);
        let magic_str = std::str::from_utf8(&self.magic[..end]).unwrap_or("");
        magic_str
            .trim_start_matches("dyld_v0")
            .trim_start_matches("dyld_v1")
            .trim()
    }

    /// Checks if a header field exists based on mapping_offset.
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns true if this is a valid dyld cache header.
    pub fn is_valid(&self) -> bool {
        &self.magic[..4] == DYLD_CACHE_MAGIC_PREFIX
    }

    /// Returns true if this cache uses the new images location.
    pub fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }

    /// Returns the actual images offset (new or legacy location).
    pub fn actual_images_offset(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_offset as u64
        } else {
            self.images_offset_old as u64
        }
    }

    /// Returns the actual images count (new or legacy location).
    pub fn actual_images_count(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_count as u64
        } else {
            self.images_count_old as u64
        }
    }
}

/// Builds the 16-byte magic, e.g. `"dyld_v1  x86_64\0"`.
pub fn magic_for(arch_name: &str) -> [u8; 16] {
    let text = format!("dyld_v1{:>8}", arch_name);
    let mut magic = [0u8; 16];
    let len = text.len().min(15);
    magic[..len].copy_from_slice(&text.as_bytes()[..len]);
    magic
}

// =============================================================================
// Image Structures
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Address of the Mach-O header
    pub address: u64,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
    /// Offset to path string
    pub path_file_offset: u32,
    /// Padding
    pub pad: u32,
}

impl DyldCacheImageInfo {
    /// Size of one image info entry.
    pub const SIZE: usize = 32;
}
