//! Disk tier: chunk file format and the per-chunk file store
//!
//! - Fixed-size bincode header with CRC32C checksums
//! - Streaming, length-prefixed record body, optionally zstd-compressed
//! - Atomic temp-file-then-rename writes

mod chunk_file;
mod compression;
mod format;

pub use chunk_file::{ChunkFileStats, ChunkFileStore};
pub use compression::CompressionConfig;
pub use format::{
    ChunkFileHeader, CHUNK_FILE_EXTENSION, CHUNK_FORMAT_VERSION, CHUNK_MAGIC,
    DEFAULT_COMPRESSION_LEVEL,
};
