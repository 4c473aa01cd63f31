//! Reading the image table of an existing cache artifact.
//!
//! The freshness check only needs the per-image (path, mtime, inode) triples
//! the builder recorded, so this maps the file and walks the header and image
//! infos without touching mappings, slide info or subcaches.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use zerocopy::FromBytes;

use super::structs::*;
use crate::error::{Error, Result};
use crate::util::c_string_at;

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib recorded in a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Install name of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Modification time recorded at build time
    pub mod_time: u64,
    /// Inode recorded at build time
    pub inode: u64,
}

// =============================================================================
// Cache Images
// =============================================================================

/// The image table of a cache artifact on disk.
#[derive(Debug)]
pub struct CacheImages {
    /// Path to the cache file
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
    /// All images, in table order
    pub images: Vec<ImageEntry>,
}

impl CacheImages {
    /// Opens a cache artifact and reads its image table.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        // SAFETY: the cache directory is only written through atomic renames,
        // so the mapped file is never truncated underneath us.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        Self::parse(&mmap).map(|(header, images)| Self {
            path,
            header,
            images,
        })
    }

    /// Parses the header and image table from raw cache bytes.
    pub fn parse(data: &[u8]) -> Result<(DyldCacheHeader, Vec<ImageEntry>)> {
        let header = Self::parse_header(data)?;
        let images = Self::parse_images(data, &header)?;
        Ok((header, images))
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < DyldCacheHeader::SIZE {
            return Err(Error::buffer_too_small(DyldCacheHeader::SIZE, data.len()));
        }

        let header = DyldCacheHeader::read_from_prefix(data)
            .map_err(|_| Error::parse(0, "failed to parse dyld cache header"))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidCacheMagic([
                header.magic[0],
                header.magic[1],
                header.magic[2],
                header.magic[3],
            ]));
        }

        Ok(header)
    }

    /// Parses image entries.
    fn parse_images(data: &[u8], header: &DyldCacheHeader) -> Result<Vec<ImageEntry>> {
        let offset = header.actual_images_offset() as usize;
        let count = header.actual_images_count() as usize;

        let table_end = count
            .checked_mul(DyldCacheImageInfo::SIZE)
            .and_then(|len| len.checked_add(offset))
            .ok_or_else(|| Error::parse(offset, "image table size overflows"))?;
        if table_end > data.len() {
            return Err(Error::buffer_too_small(table_end, data.len()));
        }

        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            let entry_offset = offset + i * DyldCacheImageInfo::SIZE;
            let info = DyldCacheImageInfo::read_from_prefix(&data[entry_offset..])
                .map_err(|_| Error::parse(entry_offset, "failed to parse image info"))?
                .0;

            let path = c_string_at(data, info.path_file_offset as usize).ok_or_else(|| {
                Error::parse(entry_offset, "image path offset beyond end of cache")
            })?;

            images.push(ImageEntry {
                address: info.address,
                path,
                mod_time: info.mod_time,
                inode: info.inode,
            });
        }

        Ok(images)
    }

    /// Returns the architecture name from the cache magic.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }

    /// Returns the UUID of the cache.
    pub fn uuid(&self) -> [u8; 16] {
        self.header.uuid
    }

    /// Returns the number of images.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Finds an image by its recorded path.
    pub fn find_image(&self, path: &str) -> Option<&ImageEntry> {
        self.images.iter().find(|img| img.path == path)
    }
}
