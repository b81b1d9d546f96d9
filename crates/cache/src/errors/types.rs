//! Core error types for the cache system

use std::path::PathBuf;
use std::time::Duration;

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Comprehensive error type for cache operations
#[derive(Debug)]
pub enum CacheError {
    /// Invalid cache geometry or configuration value
    Configuration {
        message: String,
        recovery_hint: RecoveryHint,
    },

    /// The cache was used before `configure` derived its chunk geometry
    NotConfigured { operation: &'static str },

    /// Batch index outside the configured range
    InvalidBatch {
        batch_idx: usize,
        chunk_idx: usize,
        chunk_num: usize,
    },

    /// The spill worker received a message it cannot interpret
    Protocol {
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// No cached item arrived within the read wait
    CacheMiss {
        batch_idx: usize,
        chunk_idx: usize,
        waited: Duration,
    },

    /// Neither a cached nor a recomputed value is available
    CacheConsistency {
        batch_idx: usize,
        chunk_idx: usize,
        reason: String,
    },

    /// I/O errors while spilling or loading chunk files
    Io {
        path: PathBuf,
        operation: &'static str,
        source: std::io::Error,
        recovery_hint: RecoveryHint,
    },

    /// Header encoding or decoding failed
    Serialization {
        path: PathBuf,
        operation: SerializationOp,
        source: Box<dyn std::error::Error + Send + Sync>,
        recovery_hint: RecoveryHint,
    },

    /// Chunk file content does not match its header
    Corruption {
        path: PathBuf,
        reason: String,
        recovery_hint: RecoveryHint,
    },

    /// zstd stream setup or teardown failed
    Compression {
        operation: &'static str,
        source: std::io::Error,
        recovery_hint: RecoveryHint,
    },

    /// The spill worker is gone (channel closed or task panicked)
    WorkerUnavailable {
        reason: String,
        recovery_hint: RecoveryHint,
    },
}

/// Recovery hints for error handling
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryHint {
    /// Fix the configuration and restart the run
    UpdateConfiguration,

    /// Recompute the affected features from source
    Recompute,

    /// Check file permissions on the storage directory
    CheckPermissions { path: PathBuf },

    /// Check free space on the storage volume
    CheckDiskSpace,

    /// Delete the chunk file; the chunk becomes recompute-only
    DiscardChunk,

    /// Orchestrator and worker disagree; the run must abort
    Abort,

    /// No automated recovery possible
    Manual { instructions: String },
}

/// Serialization operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationOp {
    Encode,
    Decode,
}
