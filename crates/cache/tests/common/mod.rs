//! Shared helpers for the feature cache integration tests

#![allow(dead_code)]

use bytes::Bytes;
use featcache_cache::{CacheConfig, CacheConfigBuilder, FeatureItem, ManualProbe, TwoLevelCache};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// 100-byte chunks of 10-byte records: ten batches per chunk
pub const CHUNK_BYTE_BUDGET: u64 = 100;
pub const ITEM_BYTES: u64 = 10;
pub const CHUNK_SIZE: usize = 10;

/// A cache over a private temp directory with injectable pressure
pub struct TestCache {
    pub cache: TwoLevelCache,
    pub probe: ManualProbe,
    pub dir: TempDir,
}

impl TestCache {
    pub fn new() -> Self {
        Self::with_config(|builder| builder)
    }

    pub fn with_config(customize: impl FnOnce(CacheConfigBuilder) -> CacheConfigBuilder) -> Self {
        let dir = TempDir::new().unwrap();
        let builder = CacheConfigBuilder::new()
            .with_storage_dir(dir.path())
            .with_chunk_byte_budget(CHUNK_BYTE_BUDGET)
            .with_read_wait_timeout(Duration::from_secs(2))
            .with_finish_grace_period(Duration::from_millis(20));
        let config: CacheConfig = customize(builder).build();

        let probe = ManualProbe::new();
        let cache = TwoLevelCache::new(config, Arc::new(probe.clone())).unwrap();
        Self { cache, probe, dir }
    }

    /// Write pass that reports host memory full from `host_full_at` and
    /// both tiers full from `disk_full_at`
    pub fn write_pass(
        &mut self,
        batches: usize,
        host_full_at: Option<usize>,
        disk_full_at: Option<usize>,
    ) {
        for batch_idx in 0..batches {
            let chunk_idx = batch_idx / CHUNK_SIZE;
            if host_full_at.is_some_and(|at| chunk_idx >= at) {
                self.probe.set_host_used_fraction(1.0);
            }
            if disk_full_at.is_some_and(|at| chunk_idx >= at) {
                self.probe.set_disk_used_fraction(1.0);
            }
            let item = self
                .cache
                .write_one_batch(batch_idx, &batch_idx, feature)
                .unwrap();
            assert_eq!(item, feature(&batch_idx));
        }
    }
}

/// Deterministic record for a batch
pub fn feature(batch_idx: &usize) -> FeatureItem {
    let mut bytes = vec![0u8; ITEM_BYTES as usize];
    bytes[..8].copy_from_slice(&(*batch_idx as u64).to_le_bytes());
    Bytes::from(bytes)
}

/// Chunk files currently in `dir`
pub fn chunk_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|ext| ext == "fea"))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
