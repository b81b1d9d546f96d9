//! Recovery utilities for cache errors

use super::types::{CacheError, RecoveryHint};

impl CacheError {
    /// Get the recovery hint for this error
    #[must_use]
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            Self::Configuration { recovery_hint, .. }
            | Self::Protocol { recovery_hint, .. }
            | Self::Io { recovery_hint, .. }
            | Self::Serialization { recovery_hint, .. }
            | Self::Corruption { recovery_hint, .. }
            | Self::Compression { recovery_hint, .. }
            | Self::WorkerUnavailable { recovery_hint, .. } => recovery_hint.clone(),
            Self::NotConfigured { .. } | Self::InvalidBatch { .. } => {
                RecoveryHint::UpdateConfiguration
            }
            Self::CacheMiss { .. } => RecoveryHint::Recompute,
            Self::CacheConsistency { .. } => RecoveryHint::Abort,
        }
    }

    /// Errors that must abort the training run
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::NotConfigured { .. }
                | Self::InvalidBatch { .. }
                | Self::Protocol { .. }
                | Self::CacheConsistency { .. }
                | Self::WorkerUnavailable { .. }
        )
    }

    /// Spill/load failures that degrade a chunk to recompute but never abort
    #[must_use]
    pub const fn is_io_degradation(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Serialization { .. }
                | Self::Corruption { .. }
                | Self::Compression { .. }
        )
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            recovery_hint: RecoveryHint::UpdateConfiguration,
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
            recovery_hint: RecoveryHint::Abort,
        }
    }
}
