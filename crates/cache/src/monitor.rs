//! Host-memory and disk pressure detection
//!
//! Each query re-samples the system; nothing is cached between calls.

use crate::errors::{CacheError, RecoveryHint, Result};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::System;

/// One utilization reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSample {
    pub used: u64,
    pub total: u64,
}

impl UsageSample {
    /// Fraction of capacity in use; an empty device reads as fully used
    pub fn used_fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.used as f64 / self.total as f64
    }
}

/// Source of utilization readings
pub trait ResourceProbe: Send + Sync {
    fn host_memory(&self) -> Result<UsageSample>;
    fn disk(&self, path: &Path) -> Result<UsageSample>;
}

/// Reads real utilization from the operating system
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SystemProbe {
    fn host_memory(&self) -> Result<UsageSample> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        let available = system.available_memory();
        Ok(UsageSample {
            used: total.saturating_sub(available),
            total,
        })
    }

    fn disk(&self, path: &Path) -> Result<UsageSample> {
        let total = fs2::total_space(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            operation: "query total disk space",
            source: e,
            recovery_hint: RecoveryHint::CheckPermissions {
                path: path.to_path_buf(),
            },
        })?;
        let available = fs2::available_space(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            operation: "query available disk space",
            source: e,
            recovery_hint: RecoveryHint::CheckPermissions {
                path: path.to_path_buf(),
            },
        })?;

        Ok(UsageSample {
            used: total.saturating_sub(available),
            total,
        })
    }
}

const FRACTION_SCALE: f64 = 1_000_000.0;

/// Probe whose readings are set by hand, for tests and pressure injection
#[derive(Debug, Clone, Default)]
pub struct ManualProbe {
    host_used_ppm: Arc<AtomicU64>,
    disk_used_ppm: Arc<AtomicU64>,
}

impl ManualProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_host_used_fraction(&self, fraction: f64) {
        self.host_used_ppm
            .store(to_ppm(fraction), Ordering::Release);
    }

    pub fn set_disk_used_fraction(&self, fraction: f64) {
        self.disk_used_ppm
            .store(to_ppm(fraction), Ordering::Release);
    }
}

fn to_ppm(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * FRACTION_SCALE) as u64
}

impl ResourceProbe for ManualProbe {
    fn host_memory(&self) -> Result<UsageSample> {
        Ok(UsageSample {
            used: self.host_used_ppm.load(Ordering::Acquire),
            total: FRACTION_SCALE as u64,
        })
    }

    fn disk(&self, _path: &Path) -> Result<UsageSample> {
        Ok(UsageSample {
            used: self.disk_used_ppm.load(Ordering::Acquire),
            total: FRACTION_SCALE as u64,
        })
    }
}

/// Fractions above which a tier counts as full
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub host_memory: f64,
    pub disk: f64,
}

/// Boolean "tier full" signals over a probe
pub struct ResourceMonitor {
    probe: Arc<dyn ResourceProbe>,
    storage_dir: PathBuf,
    thresholds: RwLock<PressureThresholds>,
}

impl ResourceMonitor {
    pub fn new(
        probe: Arc<dyn ResourceProbe>,
        storage_dir: PathBuf,
        thresholds: PressureThresholds,
    ) -> Self {
        Self {
            probe,
            storage_dir,
            thresholds: RwLock::new(thresholds),
        }
    }

    pub fn thresholds(&self) -> PressureThresholds {
        *self.thresholds.read()
    }

    pub fn set_thresholds(&self, thresholds: PressureThresholds) {
        *self.thresholds.write() = thresholds;
    }

    /// `used/total > host_memory threshold`
    pub fn is_host_memory_full(&self) -> bool {
        let threshold = self.thresholds.read().host_memory;
        match self.probe.host_memory() {
            Ok(sample) => sample.used_fraction() > threshold,
            Err(e) => {
                tracing::warn!("Failed to sample host memory, assuming not full: {}", e);
                false
            }
        }
    }

    /// `used/total > disk threshold`, measured on the cache's storage volume
    pub fn is_disk_full(&self) -> bool {
        let threshold = self.thresholds.read().disk;
        match self.probe.disk(&self.storage_dir) {
            Ok(sample) => sample.used_fraction() > threshold,
            Err(e) => {
                tracing::warn!(
                    "Failed to sample disk usage for {}, assuming not full: {}",
                    self.storage_dir.display(),
                    e
                );
                false
            }
        }
    }
}
