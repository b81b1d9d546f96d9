//! Per-chunk FIFO queues: the host-memory tier
//!
//! The orchestrator pushes during the write pass and pops during the read
//! pass; the spill worker drains queues to disk and refills them on load.
//! Every operation takes the queue lock exactly once, so a drain racing a
//! push never interleaves records.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A single cached feature record
pub type FeatureItem = Bytes;

/// Ordered queue of feature records for one chunk
#[derive(Debug, Default)]
pub struct ChunkQueue {
    items: Mutex<VecDeque<FeatureItem>>,
    available: Notify,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: FeatureItem) {
        self.items.lock().push_back(item);
        self.available.notify_waiters();
    }

    /// Append records loaded from disk, preserving their order
    pub fn extend(&self, records: Vec<FeatureItem>) {
        if records.is_empty() {
            return;
        }
        self.items.lock().extend(records);
        self.available.notify_waiters();
    }

    /// Put records back in front of whatever is queued, preserving order
    pub fn restore_front(&self, records: Vec<FeatureItem>) {
        if records.is_empty() {
            return;
        }
        {
            let mut items = self.items.lock();
            for record in records.into_iter().rev() {
                items.push_front(record);
            }
        }
        self.available.notify_waiters();
    }

    pub fn pop(&self) -> Option<FeatureItem> {
        self.items.lock().pop_front()
    }

    /// Take every queued record in FIFO order
    pub fn drain(&self) -> Vec<FeatureItem> {
        self.items.lock().drain(..).collect()
    }

    /// Drop everything queued, returning how many records were discarded
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let dropped = items.len();
        items.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Pop the next record, waiting up to `timeout` for one to arrive.
    ///
    /// After the deadline one final pop is attempted before giving up.
    pub async fn pop_wait(&self, timeout: Duration) -> Option<FeatureItem> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push between check and await is not lost
            notified.as_mut().enable();

            if let Some(item) = self.pop() {
                return Some(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }
}

/// The set of chunk queues shared by the orchestrator and the spill worker
#[derive(Debug, Default)]
pub struct ChunkQueueStore {
    queues: RwLock<Vec<Arc<ChunkQueue>>>,
}

impl ChunkQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure one queue exists per chunk. Existing queues are kept, so
    /// repeated configuration never duplicates or discards buffered data.
    pub fn ensure_chunks(&self, chunk_num: usize) {
        let mut queues = self.queues.write();
        while queues.len() < chunk_num {
            queues.push(Arc::new(ChunkQueue::new()));
        }
    }

    pub fn queue(&self, chunk_idx: usize) -> Option<Arc<ChunkQueue>> {
        self.queues.read().get(chunk_idx).cloned()
    }

    pub fn chunk_count(&self) -> usize {
        self.queues.read().len()
    }

    /// Total records buffered across all chunks
    pub fn total_len(&self) -> usize {
        self.queues.read().iter().map(|q| q.len()).sum()
    }
}
