//! Chunk geometry: mapping logical batch indices onto fixed-budget chunks

use crate::errors::{CacheError, Result};

/// Default per-chunk byte budget (4 GB), kept well under the single-object
/// limits of common serialization backends.
pub const DEFAULT_CHUNK_BYTE_BUDGET: u64 = 4_000_000_000;

/// Chunk layout derived once per `configure` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkGeometry {
    /// Number of batches per chunk
    pub chunk_size: usize,
    /// Number of chunks covering all batches
    pub chunk_num: usize,
    /// Number of batches the geometry was derived for
    pub batch_count: usize,
}

impl ChunkGeometry {
    /// Derive `chunk_size = floor(budget / item_bytes)` and
    /// `chunk_num = ceil(batch_count / chunk_size)`.
    pub fn derive(byte_budget: u64, batch_count: usize, item_byte_size: u64) -> Result<Self> {
        if batch_count == 0 {
            return Err(CacheError::configuration("batch count must be positive"));
        }
        if item_byte_size == 0 {
            return Err(CacheError::configuration("item byte size must be positive"));
        }
        if byte_budget == 0 {
            return Err(CacheError::configuration("chunk byte budget must be positive"));
        }

        let chunk_size = usize::try_from(byte_budget / item_byte_size).map_err(|_| {
            CacheError::configuration(format!(
                "chunk size {} does not fit in usize",
                byte_budget / item_byte_size
            ))
        })?;
        if chunk_size == 0 {
            return Err(CacheError::configuration(format!(
                "item byte size {item_byte_size} exceeds the chunk byte budget {byte_budget}"
            )));
        }

        Ok(Self {
            chunk_size,
            chunk_num: batch_count.div_ceil(chunk_size),
            batch_count,
        })
    }

    /// Chunk that owns `batch_idx`
    #[inline]
    pub fn chunk_index(&self, batch_idx: usize) -> usize {
        batch_idx / self.chunk_size
    }

    /// Chunk that owns `batch_idx`, rejecting indices past the last chunk
    pub fn checked_chunk_index(&self, batch_idx: usize) -> Result<usize> {
        let chunk_idx = self.chunk_index(batch_idx);
        if chunk_idx >= self.chunk_num {
            return Err(CacheError::InvalidBatch {
                batch_idx,
                chunk_idx,
                chunk_num: self.chunk_num,
            });
        }
        Ok(chunk_idx)
    }

    /// Batch index range covered by `chunk_idx`
    pub fn batch_range(&self, chunk_idx: usize) -> std::ops::Range<usize> {
        let start = chunk_idx.saturating_mul(self.chunk_size).min(self.batch_count);
        let end = start.saturating_add(self.chunk_size).min(self.batch_count);
        start..end
    }
}
