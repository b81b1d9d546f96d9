//! Control messages sent from the orchestrator to the disk spill worker

use crate::errors::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Chunk coordinates carried by every control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub chunk_idx: usize,
    pub chunk_num: usize,
}

impl ChunkPosition {
    pub fn new(chunk_idx: usize, chunk_num: usize) -> Self {
        Self {
            chunk_idx,
            chunk_num,
        }
    }
}

/// Tier-transition and chunk-boundary events, consumed once, in send order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// The write pass crossed into `chunk_idx`; earlier chunks may spill
    Writing(ChunkPosition),
    /// Host memory filled up at `chunk_idx`; disk caching starts there
    WritingHostMemoryFull(ChunkPosition),
    /// Disk filled up at `chunk_idx`; everything from there is recomputed
    WritingDiskMemoryFull(ChunkPosition),
    /// The read pass moved to `chunk_idx`; slide the resident window
    Reading(ChunkPosition),
    /// Stop after draining
    Terminate(ChunkPosition),
}

impl ControlMessage {
    pub const TAG_WRITING: u8 = 0;
    pub const TAG_WRITING_HOST_MEMORY_FULL: u8 = 1;
    pub const TAG_WRITING_DISK_MEMORY_FULL: u8 = 2;
    pub const TAG_READING: u8 = 3;
    pub const TAG_TERMINATE: u8 = 4;

    /// Decode a numeric message tag; unknown tags are a protocol error
    pub fn from_raw(tag: u8, chunk_idx: usize, chunk_num: usize) -> Result<Self> {
        let position = ChunkPosition::new(chunk_idx, chunk_num);
        match tag {
            Self::TAG_WRITING => Ok(Self::Writing(position)),
            Self::TAG_WRITING_HOST_MEMORY_FULL => Ok(Self::WritingHostMemoryFull(position)),
            Self::TAG_WRITING_DISK_MEMORY_FULL => Ok(Self::WritingDiskMemoryFull(position)),
            Self::TAG_READING => Ok(Self::Reading(position)),
            Self::TAG_TERMINATE => Ok(Self::Terminate(position)),
            other => Err(CacheError::protocol(format!(
                "unrecognized control message tag {other}"
            ))),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Writing(_) => Self::TAG_WRITING,
            Self::WritingHostMemoryFull(_) => Self::TAG_WRITING_HOST_MEMORY_FULL,
            Self::WritingDiskMemoryFull(_) => Self::TAG_WRITING_DISK_MEMORY_FULL,
            Self::Reading(_) => Self::TAG_READING,
            Self::Terminate(_) => Self::TAG_TERMINATE,
        }
    }

    pub fn position(&self) -> ChunkPosition {
        match self {
            Self::Writing(p)
            | Self::WritingHostMemoryFull(p)
            | Self::WritingDiskMemoryFull(p)
            | Self::Reading(p)
            | Self::Terminate(p) => *p,
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Writing(_) => "Writing",
            Self::WritingHostMemoryFull(_) => "WritingHostMemoryFull",
            Self::WritingDiskMemoryFull(_) => "WritingDiskMemoryFull",
            Self::Reading(_) => "Reading",
            Self::Terminate(_) => "Terminate",
        };
        let position = self.position();
        write!(
            f,
            "{name}(chunk {}/{})",
            position.chunk_idx, position.chunk_num
        )
    }
}
