//! Background disk spill worker
//!
//! Consumes control messages strictly in send order. It keeps its own copy
//! of the tier boundaries, learned from the messages themselves, and moves
//! chunk queues between host memory and disk. Nothing is acknowledged back;
//! the orchestrator observes progress only through the chunk queues.

use crate::errors::{CacheError, Result};
use crate::message::{ChunkPosition, ControlMessage};
use crate::metrics::CacheMetrics;
use crate::placement::place_window;
use crate::queue::{ChunkQueueStore, FeatureItem};
use crate::storage::{ChunkFileStats, ChunkFileStore};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Chunks whose disk copy could not be loaded; they are recomputed on read
#[derive(Debug, Clone, Default)]
pub struct LostChunks {
    inner: Arc<RwLock<BTreeSet<usize>>>,
}

impl LostChunks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, chunk_idx: usize) {
        self.inner.write().insert(chunk_idx);
    }

    pub fn contains(&self, chunk_idx: usize) -> bool {
        self.inner.read().contains(&chunk_idx)
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.inner.read().iter().copied().collect()
    }
}

/// Tier boundaries as learned from control messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerState {
    pub chunk_idx_starting_disk_cache: Option<usize>,
    pub chunk_idx_starting_recompute: Option<usize>,
    pub host_memory_window_len: Option<usize>,
    pub chunk_num: Option<usize>,
    /// Chunks that currently have a file on disk
    pub on_disk: BTreeSet<usize>,
}

/// What the worker leaves behind when it exits
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub state: WorkerState,
    pub messages_handled: u64,
    pub lost_chunks: Vec<usize>,
}

pub struct DiskSpillWorker {
    queues: Arc<ChunkQueueStore>,
    files: ChunkFileStore,
    lost: LostChunks,
    metrics: CacheMetrics,
    state: WorkerState,
    messages_handled: u64,
    reload_spilled_chunks: bool,
}

impl DiskSpillWorker {
    pub fn new(
        queues: Arc<ChunkQueueStore>,
        files: ChunkFileStore,
        lost: LostChunks,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            queues,
            files,
            lost,
            metrics,
            state: WorkerState::default(),
            messages_handled: 0,
            reload_spilled_chunks: false,
        }
    }

    /// Load spilled chunks back on `Reading` before any recompute boundary exists
    pub fn with_reload_spilled_chunks(mut self, reload: bool) -> Self {
        self.reload_spilled_chunks = reload;
        self
    }

    /// Spawn the worker on the current tokio runtime
    pub fn spawn(
        self,
    ) -> (
        UnboundedSender<ControlMessage>,
        JoinHandle<Result<WorkerReport>>,
    ) {
        let (sender, inbox) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(inbox));
        (sender, handle)
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Process messages until `Terminate` or until every sender is gone
    pub async fn run(
        mut self,
        mut inbox: UnboundedReceiver<ControlMessage>,
    ) -> Result<WorkerReport> {
        while let Some(message) = inbox.recv().await {
            if let ControlMessage::Terminate(_) = message {
                inbox.close();
                while let Ok(late) = inbox.try_recv() {
                    debug!("Discarding {} received after terminate", late);
                }
                break;
            }

            if let Err(e) = self.handle(message).await {
                error!("Disk spill worker stopping on {}: {}", message, e);
                return Err(e);
            }
        }

        info!(
            "Disk spill worker exiting after {} messages, {} chunks on disk",
            self.messages_handled,
            self.state.on_disk.len()
        );
        Ok(WorkerReport {
            state: self.state,
            messages_handled: self.messages_handled,
            lost_chunks: self.lost.to_vec(),
        })
    }

    /// Apply one control message
    pub async fn handle(&mut self, message: ControlMessage) -> Result<()> {
        let position = message.position();
        self.check_position(&message, position)?;
        self.state.chunk_num = Some(position.chunk_num);
        self.messages_handled += 1;
        debug!("Disk spill worker handling {}", message);

        match message {
            ControlMessage::Writing(p) => self.on_writing(p.chunk_idx).await,
            ControlMessage::WritingHostMemoryFull(p) => {
                self.record_disk_cache_start(p.chunk_idx);
            }
            ControlMessage::WritingDiskMemoryFull(p) => {
                if self.state.chunk_idx_starting_recompute.is_none() {
                    info!("Disk full, recompute starts at chunk {}", p.chunk_idx);
                    self.state.chunk_idx_starting_recompute = Some(p.chunk_idx);
                }
                // Disk may fill before host memory does
                self.record_disk_cache_start(p.chunk_idx);
            }
            ControlMessage::Reading(p) => self.on_reading(p).await,
            ControlMessage::Terminate(_) => {}
        }
        Ok(())
    }

    fn check_position(&self, message: &ControlMessage, position: ChunkPosition) -> Result<()> {
        if position.chunk_num == 0 {
            return Err(CacheError::protocol(format!(
                "{message} carries an empty chunk layout"
            )));
        }
        if position.chunk_idx > position.chunk_num {
            return Err(CacheError::protocol(format!(
                "{message} addresses chunk {} beyond chunk count {}",
                position.chunk_idx, position.chunk_num
            )));
        }
        Ok(())
    }

    fn record_disk_cache_start(&mut self, chunk_idx: usize) {
        if self.state.chunk_idx_starting_disk_cache.is_some() {
            return;
        }
        let window_len = chunk_idx.max(1);
        info!(
            "Host memory full, disk cache starts at chunk {} (window of {} chunks)",
            chunk_idx, window_len
        );
        self.state.chunk_idx_starting_disk_cache = Some(chunk_idx);
        self.state.host_memory_window_len = Some(window_len);
    }

    async fn on_writing(&mut self, chunk_idx: usize) {
        match (
            self.state.chunk_idx_starting_disk_cache,
            self.state.chunk_idx_starting_recompute,
        ) {
            (Some(start), None) => {
                debug!("Spilling chunks {}..{} to disk", start, chunk_idx);
                for idx in start..chunk_idx {
                    self.spill_chunk(idx).await;
                }
            }
            (_, Some(_)) => debug!("Disk is full, nothing to spill"),
            (None, None) => debug!("Using host memory, nothing to spill"),
        }
    }

    async fn on_reading(&mut self, position: ChunkPosition) {
        let Some(window_len) = self.state.host_memory_window_len else {
            debug!(
                "Nothing was spilled, chunk {} is already resident",
                position.chunk_idx
            );
            return;
        };

        let boundary = match self.state.chunk_idx_starting_recompute {
            Some(start) => start,
            None if self.reload_spilled_chunks => position.chunk_num,
            None => {
                debug!(
                    "No recompute boundary, chunk {} is recomputed and nothing moves",
                    position.chunk_idx
                );
                return;
            }
        };
        let plan = place_window(window_len, position.chunk_idx, boundary)
            .moves(&self.state.on_disk);
        if plan.is_empty() {
            return;
        }

        info!(
            "chunk_idx = {}, to_memory = {:?}, to_disk = {:?}",
            position.chunk_idx, plan.to_memory, plan.to_disk
        );

        for idx in plan.to_memory {
            self.load_chunk(idx).await;
        }
        for idx in plan.to_disk {
            self.spill_chunk(idx).await;
        }
    }

    async fn spill_chunk(&mut self, chunk_idx: usize) {
        let Some(queue) = self.queues.queue(chunk_idx) else {
            warn!("No queue for chunk {}, skipping spill", chunk_idx);
            return;
        };

        let drained = queue.drain();
        if drained.is_empty() {
            return;
        }

        let files = self.files.clone();
        let merge = self.state.on_disk.contains(&chunk_idx);
        let outcome =
            tokio::task::spawn_blocking(move || write_merged(&files, chunk_idx, drained, merge))
                .await;

        match outcome {
            Ok((_, Ok(stats))) => {
                info!(
                    "Chunk {} spilled: {} records, {} bytes",
                    chunk_idx, stats.records, stats.payload_bytes
                );
                self.state.on_disk.insert(chunk_idx);
                self.metrics.record_spill(stats.payload_bytes);
            }
            Ok((records, Err(e))) => {
                warn!(
                    "Failed to spill chunk {}, keeping {} records in memory: {}",
                    chunk_idx,
                    records.len(),
                    e
                );
                queue.restore_front(records);
                self.metrics.record_spill_failure();
            }
            Err(e) => {
                error!(
                    "Spill task for chunk {} panicked, chunk is lost: {}",
                    chunk_idx, e
                );
                self.lost.mark(chunk_idx);
                self.metrics.record_spill_failure();
            }
        }
    }

    async fn load_chunk(&mut self, chunk_idx: usize) {
        let Some(queue) = self.queues.queue(chunk_idx) else {
            warn!("No queue for chunk {}, skipping load", chunk_idx);
            return;
        };

        let files = self.files.clone();
        let outcome = tokio::task::spawn_blocking(move || files.load_chunk(chunk_idx)).await;
        self.state.on_disk.remove(&chunk_idx);

        let failure = match outcome {
            Ok(Ok(Some((records, stats)))) => {
                info!(
                    "Chunk {} loaded: {} records, {} bytes",
                    chunk_idx, stats.records, stats.payload_bytes
                );
                queue.extend(records);
                self.metrics.record_load(stats.payload_bytes);
                return;
            }
            Ok(Ok(None)) => {
                warn!("Chunk {} has no file on disk", chunk_idx);
                self.lost.mark(chunk_idx);
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };

        warn!(
            "Failed to load chunk {}, it will be recomputed: {}",
            chunk_idx, failure
        );
        if let Err(e) = self.files.remove_chunk(chunk_idx) {
            warn!("Failed to remove unreadable chunk file {}: {}", chunk_idx, e);
        }
        self.lost.mark(chunk_idx);
        self.metrics.record_load_failure();
    }
}

/// Write `drained` for `chunk_idx`, first folding in any records already on
/// disk. Returns the drained records so a failed write can restore them.
fn write_merged(
    files: &ChunkFileStore,
    chunk_idx: usize,
    drained: Vec<FeatureItem>,
    merge: bool,
) -> (Vec<FeatureItem>, Result<ChunkFileStats>) {
    let mut records = if merge {
        match files.read_chunk(chunk_idx) {
            Ok(existing) => existing,
            Err(e) => return (drained, Err(e)),
        }
    } else {
        Vec::new()
    };

    let existing_len = records.len();
    records.extend(drained);
    let result = files.write_chunk(chunk_idx, &records);
    let drained = records.split_off(existing_len);
    (drained, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CompressionConfig;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        queues: Arc<ChunkQueueStore>,
        files: ChunkFileStore,
        lost: LostChunks,
        metrics: CacheMetrics,
    }

    impl Fixture {
        fn new(chunk_num: usize) -> Self {
            let dir = TempDir::new().unwrap();
            let files = ChunkFileStore::new(
                dir.path().to_path_buf(),
                "worker_test_".to_string(),
                CompressionConfig::default(),
            );
            let queues = Arc::new(ChunkQueueStore::new());
            queues.ensure_chunks(chunk_num);
            Self {
                dir,
                queues,
                files,
                lost: LostChunks::new(),
                metrics: CacheMetrics::new(),
            }
        }

        fn worker(&self) -> DiskSpillWorker {
            DiskSpillWorker::new(
                Arc::clone(&self.queues),
                self.files.clone(),
                self.lost.clone(),
                self.metrics.clone(),
            )
        }

        fn reloading_worker(&self) -> DiskSpillWorker {
            self.worker().with_reload_spilled_chunks(true)
        }

        fn fill(&self, chunk_idx: usize, count: u8) {
            let queue = self.queues.queue(chunk_idx).unwrap();
            for i in 0..count {
                queue.push(Bytes::from(vec![chunk_idx as u8, i]));
            }
        }
    }

    fn at(chunk_idx: usize, chunk_num: usize) -> ChunkPosition {
        ChunkPosition::new(chunk_idx, chunk_num)
    }

    #[tokio::test]
    async fn test_writing_without_boundaries_is_noop() {
        let fx = Fixture::new(4);
        fx.fill(0, 3);
        let mut worker = fx.worker();

        worker.handle(ControlMessage::Writing(at(1, 4))).await.unwrap();
        assert_eq!(fx.queues.queue(0).unwrap().len(), 3);
        assert!(!fx.files.contains(0));
    }

    #[tokio::test]
    async fn test_host_full_boundary_is_recorded_once() {
        let fx = Fixture::new(8);
        let mut worker = fx.worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(3, 8)))
            .await
            .unwrap();
        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(5, 8)))
            .await
            .unwrap();

        assert_eq!(worker.state().chunk_idx_starting_disk_cache, Some(3));
        assert_eq!(worker.state().host_memory_window_len, Some(3));
    }

    #[tokio::test]
    async fn test_disk_full_first_sets_both_boundaries() {
        let fx = Fixture::new(8);
        let mut worker = fx.worker();

        worker
            .handle(ControlMessage::WritingDiskMemoryFull(at(4, 8)))
            .await
            .unwrap();
        worker
            .handle(ControlMessage::WritingDiskMemoryFull(at(6, 8)))
            .await
            .unwrap();

        assert_eq!(worker.state().chunk_idx_starting_recompute, Some(4));
        assert_eq!(worker.state().chunk_idx_starting_disk_cache, Some(4));
    }

    #[tokio::test]
    async fn test_writing_spills_chunks_after_disk_start() {
        let fx = Fixture::new(5);
        for idx in 0..4 {
            fx.fill(idx, 2);
        }
        let mut worker = fx.worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(1, 5)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(3, 5))).await.unwrap();

        assert_eq!(fx.queues.queue(0).unwrap().len(), 2);
        assert!(fx.queues.queue(1).unwrap().is_empty());
        assert!(fx.queues.queue(2).unwrap().is_empty());
        assert_eq!(fx.queues.queue(3).unwrap().len(), 2);
        assert!(fx.files.contains(1) && fx.files.contains(2));
        assert_eq!(worker.state().on_disk, BTreeSet::from([1, 2]));
        assert_eq!(fx.metrics.snapshot().chunks_spilled, 2);
    }

    #[tokio::test]
    async fn test_writing_after_recompute_boundary_is_noop() {
        let fx = Fixture::new(5);
        fx.fill(1, 2);
        let mut worker = fx.worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(1, 5)))
            .await
            .unwrap();
        worker
            .handle(ControlMessage::WritingDiskMemoryFull(at(2, 5)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(3, 5))).await.unwrap();

        assert_eq!(fx.queues.queue(1).unwrap().len(), 2);
        assert!(!fx.files.contains(1));
    }

    #[tokio::test]
    async fn test_spill_then_load_round_trip() {
        let fx = Fixture::new(4);
        fx.fill(2, 5);
        let before: Vec<FeatureItem> = {
            let queue = fx.queues.queue(2).unwrap();
            let items = queue.drain();
            queue.extend(items.clone());
            items
        };
        let mut worker = fx.reloading_worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(2, 4)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(3, 4))).await.unwrap();
        assert!(fx.files.contains(2));

        // Window of 2 at chunk 2 keeps {2, 3} resident
        worker.handle(ControlMessage::Reading(at(2, 4))).await.unwrap();

        assert!(!fx.files.contains(2));
        assert_eq!(fx.queues.queue(2).unwrap().drain(), before);
        assert_eq!(fx.metrics.snapshot().chunks_loaded, 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_marks_chunk_lost() {
        let fx = Fixture::new(4);
        fx.fill(1, 3);
        let mut worker = fx.reloading_worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(1, 4)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(2, 4))).await.unwrap();
        std::fs::write(fx.files.chunk_path(1), b"garbage").unwrap();

        worker.handle(ControlMessage::Reading(at(1, 4))).await.unwrap();

        assert!(fx.lost.contains(1));
        assert!(!fx.files.contains(1));
        assert!(fx.queues.queue(1).unwrap().is_empty());
        assert_eq!(fx.metrics.snapshot().load_failures, 1);
    }

    #[tokio::test]
    async fn test_reading_leaves_spills_without_recompute_boundary() {
        let fx = Fixture::new(4);
        fx.fill(2, 5);
        let mut worker = fx.worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(2, 4)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(3, 4))).await.unwrap();
        worker.handle(ControlMessage::Reading(at(2, 4))).await.unwrap();

        assert!(fx.files.contains(2));
        assert!(fx.queues.queue(2).unwrap().is_empty());
        assert_eq!(worker.state().on_disk, BTreeSet::from([2]));
        assert_eq!(fx.metrics.snapshot().chunks_loaded, 0);
    }

    #[tokio::test]
    async fn test_reading_loads_below_recompute_boundary() {
        let fx = Fixture::new(4);
        fx.fill(1, 3);
        let mut worker = fx.worker();

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(1, 4)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(2, 4))).await.unwrap();
        worker
            .handle(ControlMessage::WritingDiskMemoryFull(at(3, 4)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Reading(at(1, 4))).await.unwrap();

        assert!(!fx.files.contains(1));
        assert_eq!(fx.queues.queue(1).unwrap().len(), 3);
        assert_eq!(fx.metrics.snapshot().chunks_loaded, 1);
    }

    #[tokio::test]
    async fn test_failed_spill_restores_records() {
        let fx = Fixture::new(3);
        fx.fill(0, 4);
        // A regular file where the storage directory should be
        let blocked = fx.dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let files = ChunkFileStore::new(blocked, "x_".to_string(), CompressionConfig::default());
        let mut worker = DiskSpillWorker::new(
            Arc::clone(&fx.queues),
            files,
            fx.lost.clone(),
            fx.metrics.clone(),
        );

        worker
            .handle(ControlMessage::WritingHostMemoryFull(at(0, 3)))
            .await
            .unwrap();
        worker.handle(ControlMessage::Writing(at(1, 3))).await.unwrap();

        assert_eq!(fx.queues.queue(0).unwrap().len(), 4);
        assert!(worker.state().on_disk.is_empty());
        assert_eq!(fx.metrics.snapshot().spill_failures, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_chunk_is_protocol_error() {
        let fx = Fixture::new(2);
        let mut worker = fx.worker();
        let result = worker.handle(ControlMessage::Writing(at(9, 2))).await;
        assert!(matches!(result, Err(CacheError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_run_stops_on_terminate() {
        let fx = Fixture::new(2);
        let (sender, handle) = fx.worker().spawn();

        sender.send(ControlMessage::Writing(at(1, 2))).unwrap();
        sender.send(ControlMessage::Terminate(at(0, 2))).unwrap();
        let _ = sender.send(ControlMessage::Writing(at(1, 2)));

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.messages_handled, 1);
        assert_eq!(report.state.chunk_num, Some(2));
    }

    #[tokio::test]
    async fn test_run_propagates_protocol_error() {
        let fx = Fixture::new(2);
        let (sender, handle) = fx.worker().spawn();

        sender.send(ControlMessage::Reading(at(7, 2))).unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CacheError::Protocol { .. })));
    }
}
