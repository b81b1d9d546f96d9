//! Error conversion utilities

use super::types::{CacheError, RecoveryHint, SerializationOp};
use std::path::PathBuf;

impl From<std::io::Error> for CacheError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let path = PathBuf::from(".");
        let recovery_hint = match error.kind() {
            ErrorKind::PermissionDenied => RecoveryHint::CheckPermissions { path: path.clone() },
            ErrorKind::WriteZero | ErrorKind::OutOfMemory => RecoveryHint::CheckDiskSpace,
            ErrorKind::UnexpectedEof | ErrorKind::InvalidData => RecoveryHint::DiscardChunk,
            _ => RecoveryHint::Recompute,
        };

        Self::Io {
            path,
            operation: "unknown",
            source: error,
            recovery_hint,
        }
    }
}

impl From<bincode::Error> for CacheError {
    fn from(error: bincode::Error) -> Self {
        Self::Serialization {
            path: PathBuf::new(),
            operation: SerializationOp::Decode,
            source: error,
            recovery_hint: RecoveryHint::DiscardChunk,
        }
    }
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::WorkerUnavailable {
            reason: error.to_string(),
            recovery_hint: RecoveryHint::Abort,
        }
    }
}
