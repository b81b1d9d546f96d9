//! Display implementations for cache errors

use super::types::CacheError;
use std::fmt;

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { message, .. } => {
                write!(f, "Invalid cache configuration: {message}")
            }
            Self::NotConfigured { operation } => {
                write!(f, "Cache must be configured before {operation}")
            }
            Self::InvalidBatch {
                batch_idx,
                chunk_idx,
                chunk_num,
            } => write!(
                f,
                "Batch {batch_idx} maps to chunk {chunk_idx}, but only {chunk_num} chunks are configured"
            ),
            Self::Protocol { reason, .. } => write!(f, "Control protocol error: {reason}"),
            Self::CacheMiss {
                batch_idx,
                chunk_idx,
                waited,
            } => write!(
                f,
                "No cached feature for batch {batch_idx} (chunk {chunk_idx}) after waiting {waited:?}"
            ),
            Self::CacheConsistency {
                batch_idx,
                chunk_idx,
                reason,
            } => write!(
                f,
                "Cache consistency violated for batch {batch_idx} (chunk {chunk_idx}): {reason}"
            ),
            Self::Io {
                path,
                operation,
                source,
                ..
            } => write!(
                f,
                "I/O error during {} on '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::Serialization {
                path,
                operation,
                source,
                ..
            } => write!(
                f,
                "Serialization error ({:?}) for '{}': {}",
                operation,
                path.display(),
                source
            ),
            Self::Corruption { path, reason, .. } => {
                write!(f, "Chunk file '{}' is corrupted: {}", path.display(), reason)
            }
            Self::Compression {
                operation, source, ..
            } => write!(f, "Compression error during {operation}: {source}"),
            Self::WorkerUnavailable { reason, .. } => {
                write!(f, "Disk spill worker unavailable: {reason}")
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialization { source, .. } => Some(source.as_ref()),
            Self::Compression { source, .. } => Some(source),
            _ => None,
        }
    }
}
