//! Synthetic training run against the feature cache
//!
//! The first pass computes every batch and fills the cache; the second pass
//! reads it back and checks each feature against a fresh computation.

use anyhow::{bail, Result};
use bytes::Bytes;
use clap::Args;
use featcache_cache::{
    CacheConfig, CompressionConfig, FeatureItem, ManualProbe, ResourceProbe, SystemProbe,
    TwoLevelCache,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of batches per pass
    #[arg(long, default_value = "120")]
    pub batches: usize,

    /// Size of one feature record in bytes
    #[arg(long, default_value = "1024")]
    pub item_bytes: u64,

    /// Byte budget of one chunk (overrides the configured budget)
    #[arg(long)]
    pub chunk_byte_budget: Option<u64>,

    /// Directory for spilled chunk files
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Report host memory as full from this chunk on
    #[arg(long, value_name = "CHUNK")]
    pub host_full_at: Option<usize>,

    /// Report the disk as full from this chunk on
    #[arg(long, value_name = "CHUNK")]
    pub disk_full_at: Option<usize>,

    /// How long a read waits for a chunk to load, in milliseconds
    #[arg(long)]
    pub read_wait_ms: Option<u64>,

    /// Compress spilled chunks with zstd
    #[arg(long)]
    pub compression: bool,

    /// Load spilled chunks back even if the disk never fills
    #[arg(long)]
    pub reload_spilled_chunks: bool,
}

impl SimulateArgs {
    pub async fn execute(self, mut config: CacheConfig) -> Result<()> {
        if let Some(budget) = self.chunk_byte_budget {
            config.chunk_byte_budget = budget;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = dir.clone();
        }
        if let Some(ms) = self.read_wait_ms {
            config.read_wait_timeout = Duration::from_millis(ms);
        }
        if self.compression {
            config.compression = CompressionConfig::zstd(config.compression.level);
        }
        if self.reload_spilled_chunks {
            config.reload_spilled_chunks = true;
        }

        let injected = (self.host_full_at.is_some() || self.disk_full_at.is_some())
            .then(ManualProbe::new);
        let probe: Arc<dyn ResourceProbe> = match &injected {
            Some(manual) => Arc::new(manual.clone()),
            None => Arc::new(SystemProbe::new()),
        };

        let mut cache = TwoLevelCache::new(config, probe)?;
        let geometry = cache.configure(false, self.batches, self.item_bytes)?;
        info!(
            "Simulating {} batches of {} bytes in {} chunks of {}",
            self.batches, self.item_bytes, geometry.chunk_num, geometry.chunk_size
        );

        let started = Instant::now();
        for batch_idx in 0..self.batches {
            if let Some(probe) = &injected {
                let chunk_idx = geometry.chunk_index(batch_idx);
                if self.host_full_at.is_some_and(|at| chunk_idx >= at) {
                    probe.set_host_used_fraction(1.0);
                }
                if self.disk_full_at.is_some_and(|at| chunk_idx >= at) {
                    probe.set_disk_used_fraction(1.0);
                }
            }
            let item_bytes = self.item_bytes;
            cache.get_hidden_feature(batch_idx, &batch_idx, |b: &usize| {
                synthetic_feature(*b, item_bytes)
            })
            .await?;
        }
        info!("Write pass finished in {:?}", started.elapsed());

        cache.set_cache_ready(true);
        let started = Instant::now();
        let mut mismatches = 0usize;
        for batch_idx in 0..self.batches {
            let item_bytes = self.item_bytes;
            let item = cache
                .get_hidden_feature(batch_idx, &batch_idx, |b: &usize| {
                    synthetic_feature(*b, item_bytes)
                })
                .await?;
            if item != synthetic_feature(batch_idx, item_bytes) {
                mismatches += 1;
            }
        }
        info!("Read pass finished in {:?}", started.elapsed());

        info!(
            "disk cache starts at {:?}, recompute starts at {:?}",
            cache.chunk_idx_starting_disk_cache(),
            cache.chunk_idx_starting_recompute()
        );

        let snapshot = cache.finish().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);

        if mismatches > 0 {
            bail!("{mismatches} batches returned a feature that differs from the computed one");
        }
        Ok(())
    }
}

/// Deterministic feature bytes for `batch_idx`
fn synthetic_feature(batch_idx: usize, item_bytes: u64) -> FeatureItem {
    let seed = (batch_idx as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let bytes: Vec<u8> = (0..item_bytes)
        .map(|i| (seed.rotate_left((i % 64) as u32) ^ i) as u8)
        .collect();
    Bytes::from(bytes)
}
