//! Serializing a cache header and image table.

use std::mem::offset_of;

use sha2::{Digest, Sha256};
use zerocopy::IntoBytes;

use super::structs::*;

/// One image to record in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Install name
    pub path: String,
    /// Address assigned to the image's Mach-O header
    pub address: u64,
    /// Modification time of the source file
    pub mod_time: u64,
    /// Inode of the source file
    pub inode: u64,
}

/// A serialized header plus image table.
#[derive(Debug, Clone)]
pub struct ImageTable {
    /// File contents
    pub bytes: Vec<u8>,
    /// UUID stored in the header
    pub uuid: [u8; 16],
}

/// Writes the header, image infos and path pool in that order.
pub struct ImageTableWriter {
    arch_name: String,
    base_address: u64,
}

impl ImageTableWriter {
    /// Creates a writer for an architecture.
    pub fn new(arch_name: &str) -> Self {
        Self {
            arch_name: arch_name.to_string(),
            base_address: 0,
        }
    }

    /// Sets the address recorded as the dyld base address.
    pub fn with_base_address(mut self, base_address: u64) -> Self {
        self.base_address = base_address;
        self
    }

    /// Serializes `records`.
    ///
    /// The UUID is the first 16 bytes of a SHA-256 over the image table and
    /// path pool, so identical inputs yield identical files.
    pub fn write(&self, records: &[ImageRecord]) -> ImageTable {
        let table_offset = DyldCacheHeader::SIZE;
        let pool_offset = table_offset + records.len() * DyldCacheImageInfo::SIZE;

        let mut table = Vec::with_capacity(records.len() * DyldCacheImageInfo::SIZE);
        let mut pool = Vec::new();
        for record in records {
            let info = DyldCacheImageInfo {
                address: record.address,
                mod_time: record.mod_time,
                inode: record.inode,
                path_file_offset: (pool_offset + pool.len()) as u32,
                pad: 0,
            };
            table.extend_from_slice(info.as_bytes());
            pool.extend_from_slice(record.path.as_bytes());
            pool.push(0);
        }

        let digest = Sha256::new()
            .chain_update(self.arch_name.as_bytes())
            .chain_update(&table)
            .chain_update(&pool)
            .finalize();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&digest[..16]);

        let mut header = DyldCacheHeader::new(&self.arch_name);
        header.images_offset_old = table_offset as u32;
        header.images_count_old = records.len() as u32;
        header.images_offset = table_offset as u32;
        header.images_count = records.len() as u32;
        header.dyld_base_address = self.base_address;
        header.uuid = uuid;
        debug_assert!(header.contains_field(offset_of!(DyldCacheHeader, images_count)));

        let mut bytes = Vec::with_capacity(pool_offset + pool.len());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&table);
        bytes.extend_from_slice(&pool);

        ImageTable { bytes, uuid }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, inode: u64) -> ImageRecord {
        ImageRecord {
            path: path.into(),
            address: 0x9000_0000,
            mod_time: 7,
            inode,
        }
    }

    #[test]
    fn test_uuid_is_deterministic() {
        let writer = ImageTableWriter::new("i386");
        let a = writer.write(&[record("/usr/lib/liba.dylib", 1)]);
        let b = writer.write(&[record("/usr/lib/liba.dylib", 1)]);
        let c = writer.write(&[record("/usr/lib/liba.dylib", 2)]);
        assert_eq!(a.uuid, b.uuid);
        assert_ne!(a.uuid, c.uuid);
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn test_uuid_depends_on_arch() {
        let records = [record("/usr/lib/liba.dylib", 1)];
        let i386 = ImageTableWriter::new("i386").write(&records);
        let x86_64 = ImageTableWriter::new("x86_64").write(&records);
        assert_ne!(i386.uuid, x86_64.uuid);
    }

    #[test]
    fn test_empty_table() {
        let table = ImageTableWriter::new("x86_64").write(&[]);
        assert_eq!(table.bytes.len(), DyldCacheHeader::SIZE);
    }
}
