//! Two-level feature cache orchestrator
//!
//! The first pass over a dataset computes every feature and buffers it in a
//! per-chunk queue. As host memory fills, chunks are handed to the disk spill
//! worker; once the disk fills too, the remaining chunks are not cached at
//! all. Later passes consume the queues in batch order, waiting briefly for
//! the worker to bring spilled chunks back and recomputing whatever was
//! never cached.

use crate::chunk::ChunkGeometry;
use crate::config::{CacheConfig, MissPolicy};
use crate::errors::{CacheError, RecoveryHint, Result};
use crate::message::{ChunkPosition, ControlMessage};
use crate::metrics::{CacheMetrics, MetricsSnapshot};
use crate::monitor::{ResourceMonitor, ResourceProbe};
use crate::queue::{ChunkQueue, ChunkQueueStore, FeatureItem};
use crate::storage::ChunkFileStore;
use crate::worker::{DiskSpillWorker, LostChunks, WorkerReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Polling slice while waiting on a chunk queue
const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct TwoLevelCache {
    config: CacheConfig,
    monitor: ResourceMonitor,
    queues: Arc<ChunkQueueStore>,
    files: ChunkFileStore,
    lost: LostChunks,
    metrics: CacheMetrics,
    geometry: Option<ChunkGeometry>,
    is_cache_ready: bool,
    last_chunk: Option<usize>,
    chunk_idx_starting_disk_cache: Option<usize>,
    chunk_idx_starting_recompute: Option<usize>,
    sender: UnboundedSender<ControlMessage>,
    worker: Option<JoinHandle<Result<WorkerReport>>>,
}

impl TwoLevelCache {
    /// Create the cache and start its spill worker on the current runtime.
    ///
    /// The initial (low) pressure thresholds stay in force until the first
    /// [`configure`](Self::configure) call.
    pub fn new(config: CacheConfig, probe: Arc<dyn ResourceProbe>) -> Result<Self> {
        config.validate()?;
        tokio::runtime::Handle::try_current().map_err(|e| CacheError::WorkerUnavailable {
            reason: format!("no tokio runtime to host the spill worker: {e}"),
            recovery_hint: RecoveryHint::Manual {
                instructions: "Create the cache from within a tokio runtime".to_string(),
            },
        })?;

        // The disk probe measures the volume holding this directory
        std::fs::create_dir_all(&config.storage_dir).map_err(|e| CacheError::Io {
            path: config.storage_dir.clone(),
            operation: "create storage directory",
            source: e,
            recovery_hint: RecoveryHint::CheckPermissions {
                path: config.storage_dir.clone(),
            },
        })?;

        let monitor = ResourceMonitor::new(
            probe,
            config.storage_dir.clone(),
            config.initial_thresholds(),
        );
        let files = ChunkFileStore::new(
            config.storage_dir.clone(),
            config.file_prefix.clone(),
            config.compression,
        );
        let queues = Arc::new(ChunkQueueStore::new());
        let lost = LostChunks::new();
        let metrics = CacheMetrics::new();

        let (sender, worker) = DiskSpillWorker::new(
            Arc::clone(&queues),
            files.clone(),
            lost.clone(),
            metrics.clone(),
        )
        .with_reload_spilled_chunks(config.reload_spilled_chunks)
        .spawn();

        info!(
            "Feature cache created in {} with prefix {}",
            config.storage_dir.display(),
            config.file_prefix
        );

        Ok(Self {
            config,
            monitor,
            queues,
            files,
            lost,
            metrics,
            geometry: None,
            is_cache_ready: false,
            last_chunk: None,
            chunk_idx_starting_disk_cache: None,
            chunk_idx_starting_recompute: None,
            sender,
            worker: Some(worker),
        })
    }

    /// Derive the chunk layout and switch to the post-setup thresholds.
    ///
    /// Safe to call repeatedly: existing queues are kept and tier
    /// boundaries are never reset.
    pub fn configure(
        &mut self,
        is_cache_ready: bool,
        batch_count: usize,
        item_byte_size: u64,
    ) -> Result<ChunkGeometry> {
        let geometry =
            ChunkGeometry::derive(self.config.chunk_byte_budget, batch_count, item_byte_size)?;
        self.queues.ensure_chunks(geometry.chunk_num);
        self.monitor.set_thresholds(self.config.active_thresholds());
        self.geometry = Some(geometry);
        self.set_cache_ready(is_cache_ready);

        info!(
            "chunk_size = {}, chunk_num = {}, is_cache_ready = {}",
            geometry.chunk_size, geometry.chunk_num, is_cache_ready
        );
        Ok(geometry)
    }

    /// Switch between the write pass and the read pass
    pub fn set_cache_ready(&mut self, is_cache_ready: bool) {
        if is_cache_ready && !self.is_cache_ready {
            // First read of the pass must position the window
            self.last_chunk = None;
        }
        self.is_cache_ready = is_cache_ready;
    }

    pub fn is_cache_ready(&self) -> bool {
        self.is_cache_ready
    }

    /// Serve one batch: fill the cache on the write pass, consume it afterwards
    pub async fn get_hidden_feature<I, F>(
        &mut self,
        batch_idx: usize,
        input: &I,
        compute: F,
    ) -> Result<FeatureItem>
    where
        I: ?Sized,
        F: FnOnce(&I) -> FeatureItem,
    {
        if self.is_cache_ready {
            self.read_one_batch(batch_idx, input, compute).await
        } else {
            self.write_one_batch(batch_idx, input, compute)
        }
    }

    /// Compute the feature for `batch_idx` and cache it if the tiers allow
    pub fn write_one_batch<I, F>(
        &mut self,
        batch_idx: usize,
        input: &I,
        compute: F,
    ) -> Result<FeatureItem>
    where
        I: ?Sized,
        F: FnOnce(&I) -> FeatureItem,
    {
        let geometry = self.require_geometry("write_one_batch")?;
        let chunk_idx = geometry.checked_chunk_index(batch_idx)?;
        let position = ChunkPosition::new(chunk_idx, geometry.chunk_num);
        let queue = self.chunk_queue(batch_idx, chunk_idx)?;

        let item = compute(input);

        let host_full = self.monitor.is_host_memory_full();
        let disk_full = self.monitor.is_disk_full();

        let past_recompute = self
            .chunk_idx_starting_recompute
            .is_some_and(|start| chunk_idx >= start);

        if past_recompute {
            self.drop_chunk(&queue, chunk_idx);
        } else if host_full && disk_full {
            if self.chunk_idx_starting_recompute.is_some() {
                // Below the boundary: keep what the chunk already holds
                debug!("Both tiers full, not caching batch {}", batch_idx);
                self.metrics.record_write(false);
                return Ok(item);
            }
            info!(
                "Host memory and disk are full at chunk {}, recomputing from here",
                chunk_idx
            );
            self.chunk_idx_starting_recompute = Some(chunk_idx);
            if self.chunk_idx_starting_disk_cache.is_none() {
                self.chunk_idx_starting_disk_cache = Some(chunk_idx);
            }
            self.send(ControlMessage::WritingDiskMemoryFull(position))?;
            self.drop_chunk(&queue, chunk_idx);
        } else {
            if host_full && self.chunk_idx_starting_disk_cache.is_none() {
                info!("Host memory is full at chunk {}, caching to disk", chunk_idx);
                self.chunk_idx_starting_disk_cache = Some(chunk_idx);
                self.send(ControlMessage::WritingHostMemoryFull(position))?;
            }
            queue.push(item.clone());
            self.metrics.record_write(true);
            // Only cached writes move the marker; dropped ones send nothing
            if self.last_chunk != Some(chunk_idx) {
                self.last_chunk = Some(chunk_idx);
                self.send(ControlMessage::Writing(position))?;
            }
        }

        Ok(item)
    }

    /// Return the cached feature for `batch_idx`, or recompute it when the
    /// chunk was never cached or its disk copy was lost
    pub async fn read_one_batch<I, F>(
        &mut self,
        batch_idx: usize,
        input: &I,
        compute: F,
    ) -> Result<FeatureItem>
    where
        I: ?Sized,
        F: FnOnce(&I) -> FeatureItem,
    {
        let geometry = self.require_geometry("read_one_batch")?;
        let chunk_idx = geometry.checked_chunk_index(batch_idx)?;
        if self.last_chunk != Some(chunk_idx) {
            self.last_chunk = Some(chunk_idx);
            self.send(ControlMessage::Reading(ChunkPosition::new(
                chunk_idx,
                geometry.chunk_num,
            )))?;
        }

        if !self.is_served_from_cache(chunk_idx) || self.lost.contains(chunk_idx) {
            debug!("chunk_idx = {} needs to recompute", chunk_idx);
            self.metrics.record_recompute();
            return Ok(compute(input));
        }

        let queue = self.chunk_queue(batch_idx, chunk_idx)?;
        let started = Instant::now();
        if let Some(item) = self.wait_for_record(&queue, chunk_idx).await {
            self.metrics.record_hit(started.elapsed());
            return Ok(item);
        }

        let waited = started.elapsed();
        self.metrics.record_wait_timeout(waited);

        if self.lost.contains(chunk_idx) {
            debug!("Chunk {} was lost while waiting, recomputing", chunk_idx);
            self.metrics.record_recompute();
            return Ok(compute(input));
        }

        let miss = CacheError::CacheMiss {
            batch_idx,
            chunk_idx,
            waited,
        };
        match self.config.miss_policy {
            MissPolicy::Recompute => {
                warn!("{}, recomputing", miss);
                self.metrics.record_recovered_miss();
                self.metrics.record_recompute();
                Ok(compute(input))
            }
            MissPolicy::Fail => Err(CacheError::CacheConsistency {
                batch_idx,
                chunk_idx,
                reason: miss.to_string(),
            }),
        }
    }

    /// Stop the worker and delete every chunk file this cache may have written
    pub async fn finish(mut self) -> Result<MetricsSnapshot> {
        tokio::time::sleep(self.config.finish_grace_period).await;

        let chunk_num = self.position_chunk_num();
        let _ = self
            .sender
            .send(ControlMessage::Terminate(ChunkPosition::new(0, chunk_num)));

        let outcome = match self.worker.take() {
            Some(handle) => handle.await.map_err(CacheError::from).and_then(|r| r),
            None => Ok(WorkerReport::default()),
        };

        let removed = self.files.clear_all(self.queues.chunk_count());
        info!("Feature cache finished, removed {} chunk files", removed);

        let report = outcome?;
        debug!(
            "Spill worker handled {} messages, lost chunks {:?}",
            report.messages_handled, report.lost_chunks
        );
        Ok(self.metrics.snapshot())
    }

    pub fn geometry(&self) -> Option<ChunkGeometry> {
        self.geometry
    }

    pub fn chunk_idx_starting_disk_cache(&self) -> Option<usize> {
        self.chunk_idx_starting_disk_cache
    }

    pub fn chunk_idx_starting_recompute(&self) -> Option<usize> {
        self.chunk_idx_starting_recompute
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn file_store(&self) -> &ChunkFileStore {
        &self.files
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Records currently buffered in host memory for `chunk_idx`
    pub fn resident_len(&self, chunk_idx: usize) -> usize {
        self.queues.queue(chunk_idx).map_or(0, |q| q.len())
    }

    /// Whether reads of `chunk_idx` wait on its queue rather than recompute.
    ///
    /// With only the disk boundary set, spilled chunks are served only when
    /// `reload_spilled_chunks` is on.
    fn is_served_from_cache(&self, chunk_idx: usize) -> bool {
        match (
            self.chunk_idx_starting_disk_cache,
            self.chunk_idx_starting_recompute,
        ) {
            (_, Some(start)) => chunk_idx < start,
            (None, None) => true,
            (Some(_), None) => self.config.reload_spilled_chunks,
        }
    }

    fn require_geometry(&self, operation: &'static str) -> Result<ChunkGeometry> {
        self.geometry
            .ok_or(CacheError::NotConfigured { operation })
    }

    fn chunk_queue(&self, batch_idx: usize, chunk_idx: usize) -> Result<Arc<ChunkQueue>> {
        self.queues
            .queue(chunk_idx)
            .ok_or_else(|| CacheError::CacheConsistency {
                batch_idx,
                chunk_idx,
                reason: "no queue allocated for chunk".to_string(),
            })
    }

    fn position_chunk_num(&self) -> usize {
        self.geometry.map_or(0, |g| g.chunk_num)
    }

    fn drop_chunk(&self, queue: &ChunkQueue, chunk_idx: usize) {
        let dropped = queue.clear();
        if dropped > 0 {
            debug!("Dropped {} buffered records of chunk {}", dropped, chunk_idx);
            self.metrics.record_dropped(dropped as u64);
        }
        self.metrics.record_write(false);
    }

    async fn wait_for_record(&self, queue: &ChunkQueue, chunk_idx: usize) -> Option<FeatureItem> {
        let deadline = Instant::now() + self.config.read_wait_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Some(item) = queue.pop_wait(remaining.min(READ_POLL_INTERVAL)).await {
                return Some(item);
            }
            if remaining.is_zero() || self.lost.contains(chunk_idx) {
                return queue.pop();
            }
            debug!(
                "Waiting for chunk {} to load, {:?} left",
                chunk_idx, remaining
            );
        }
    }

    fn send(&self, message: ControlMessage) -> Result<()> {
        self.metrics.record_message(&message);
        self.sender
            .send(message)
            .map_err(|e| CacheError::WorkerUnavailable {
                reason: format!("spill worker stopped before {}", e.0),
                recovery_hint: RecoveryHint::Abort,
            })
    }
}

impl Drop for TwoLevelCache {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let chunk_num = self.position_chunk_num();
            let _ = self
                .sender
                .send(ControlMessage::Terminate(ChunkPosition::new(0, chunk_num)));
        }
    }
}
