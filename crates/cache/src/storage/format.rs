//! Chunk file format definitions and header structures
//!
//! A chunk file is a fixed-size bincode header followed by a stream of
//! length-prefixed records, optionally zstd-compressed as one stream.

use crate::errors::{CacheError, RecoveryHint, Result};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

/// Magic number for chunk files: "FEAT"
pub const CHUNK_MAGIC: u32 = 0x4645_4154;

/// Current chunk file format version
pub const CHUNK_FORMAT_VERSION: u16 = 1;

/// Default zstd compression level (3 = fast with good compression)
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// File extension for spilled chunks
pub const CHUNK_FILE_EXTENSION: &str = "fea";

/// Binary header at the start of every chunk file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct ChunkFileHeader {
    /// Magic number for validation
    magic: u32,
    /// Format version
    version: u16,
    /// Flags (bit 0: zstd compressed)
    flags: u16,
    /// CRC32C of the header (excluding this field)
    header_crc: u32,
    /// Timestamp when written
    timestamp: u64,
    /// Chunk this file belongs to
    pub chunk_idx: u64,
    /// Number of records in the stream
    pub record_count: u64,
    /// Total record bytes, excluding length prefixes
    pub payload_bytes: u64,
    /// CRC32C of the uncompressed record stream, length prefixes included
    pub payload_crc: u32,
    /// Reserved for future use
    reserved: [u8; 8],
}

impl ChunkFileHeader {
    const FLAG_COMPRESSED: u16 = 1 << 0;

    pub fn new(
        chunk_idx: u64,
        record_count: u64,
        payload_bytes: u64,
        payload_crc: u32,
        compressed: bool,
    ) -> Self {
        let mut header = Self {
            magic: CHUNK_MAGIC,
            version: CHUNK_FORMAT_VERSION,
            flags: if compressed { Self::FLAG_COMPRESSED } else { 0 },
            header_crc: 0,
            timestamp: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            chunk_idx,
            record_count,
            payload_bytes,
            payload_crc,
            reserved: [0u8; 8],
        };

        header.header_crc = header.calculate_crc();
        header
    }

    /// Header written before the record stream, rewritten once counts are known
    pub fn placeholder(chunk_idx: u64, compressed: bool) -> Self {
        Self::new(chunk_idx, 0, 0, 0, compressed)
    }

    /// Encoded size in bytes; constant because bincode uses fixed-width integers
    pub fn encoded_len() -> u64 {
        bincode::serialized_size(&Self::placeholder(0, false)).unwrap_or(0)
    }

    fn calculate_crc(&self) -> u32 {
        let mut temp = *self;
        temp.header_crc = 0;

        let bytes = match bincode::serialize(&temp) {
            Ok(b) => b,
            Err(_) => return 0,
        };

        crc32c(&bytes)
    }

    pub fn validate(&self, path: &Path) -> Result<()> {
        if self.magic != CHUNK_MAGIC {
            return Err(CacheError::Corruption {
                path: path.to_path_buf(),
                reason: format!(
                    "Invalid magic number: expected {:08x}, got {:08x}",
                    CHUNK_MAGIC, self.magic
                ),
                recovery_hint: RecoveryHint::DiscardChunk,
            });
        }

        if self.version > CHUNK_FORMAT_VERSION {
            return Err(CacheError::Corruption {
                path: path.to_path_buf(),
                reason: format!("Unsupported chunk format version: {}", self.version),
                recovery_hint: RecoveryHint::DiscardChunk,
            });
        }

        let expected_crc = self.calculate_crc();
        if self.header_crc != expected_crc {
            return Err(CacheError::Corruption {
                path: path.to_path_buf(),
                reason: format!(
                    "Header CRC mismatch: expected {:08x}, got {:08x}",
                    expected_crc, self.header_crc
                ),
                recovery_hint: RecoveryHint::DiscardChunk,
            });
        }

        Ok(())
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & Self::FLAG_COMPRESSED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_is_fixed() {
        let small = bincode::serialize(&ChunkFileHeader::placeholder(0, false)).unwrap();
        let large = bincode::serialize(&ChunkFileHeader::new(u64::MAX, 1 << 40, 1 << 50, 7, true))
            .unwrap();
        assert_eq!(small.len(), large.len());
        assert_eq!(small.len() as u64, ChunkFileHeader::encoded_len());
    }

    #[test]
    fn test_tampered_header_is_rejected() {
        let header = ChunkFileHeader::new(3, 10, 100, 0xdead_beef, false);
        header.validate(Path::new("3.fea")).unwrap();

        let mut tampered = header;
        tampered.record_count = 11;
        assert!(matches!(
            tampered.validate(Path::new("3.fea")),
            Err(CacheError::Corruption { .. })
        ));
    }
}
