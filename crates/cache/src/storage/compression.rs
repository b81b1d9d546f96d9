//! Compression configuration for chunk files

use super::format::DEFAULT_COMPRESSION_LEVEL;
use serde::{Deserialize, Serialize};

/// Compression configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether the record stream is zstd-compressed
    pub enabled: bool,
    /// Compression level (1-22 for zstd, default 3)
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        // Dense float activations barely compress; spend no CPU on them by default
        Self {
            enabled: false,
            level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl CompressionConfig {
    pub fn zstd(level: i32) -> Self {
        Self {
            enabled: true,
            level,
        }
    }
}
