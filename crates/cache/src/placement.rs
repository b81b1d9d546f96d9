//! Sliding-window chunk placement for the read pass
//!
//! The window keeps `window_len` chunks of the cached region `[0, N)`
//! resident, where `N` is the recompute boundary. Near the end of the
//! region the window wraps and pulls the earliest chunks back into memory.

use std::collections::BTreeSet;

/// Target tier for every chunk of the cached region
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// Chunks that must be in host memory, ascending
    pub resident: Vec<usize>,
    /// Chunks that belong on disk, ascending
    pub evicted: Vec<usize>,
}

/// Chunks whose tier actually changes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementPlan {
    pub to_disk: Vec<usize>,
    pub to_memory: Vec<usize>,
}

impl PlacementPlan {
    pub fn is_empty(&self) -> bool {
        self.to_disk.is_empty() && self.to_memory.is_empty()
    }
}

/// Compute the target placement when the reader is at `chunk_idx`.
///
/// A zero `window_len` is treated as one so the chunk being read is always
/// kept resident.
pub fn place_window(window_len: usize, chunk_idx: usize, recompute_boundary: usize) -> Placement {
    if chunk_idx > recompute_boundary {
        return Placement::default();
    }

    let window_len = window_len.max(1);
    let cached = recompute_boundary;

    if chunk_idx + window_len <= cached {
        Placement {
            resident: (chunk_idx..chunk_idx + window_len).collect(),
            evicted: (0..chunk_idx)
                .chain(chunk_idx + window_len..cached)
                .collect(),
        }
    } else {
        // Window overruns the cached region: wrap to the front
        let disk_start = (chunk_idx + window_len - cached).min(chunk_idx);
        Placement {
            resident: (0..disk_start).chain(chunk_idx..cached).collect(),
            evicted: (disk_start..chunk_idx).collect(),
        }
    }
}

impl Placement {
    pub fn is_empty(&self) -> bool {
        self.resident.is_empty() && self.evicted.is_empty()
    }

    /// Restrict the placement to moves, given which chunks are on disk now
    pub fn moves(&self, on_disk: &BTreeSet<usize>) -> PlacementPlan {
        PlacementPlan {
            to_disk: self
                .evicted
                .iter()
                .copied()
                .filter(|idx| !on_disk.contains(idx))
                .collect(),
            to_memory: self
                .resident
                .iter()
                .copied()
                .filter(|idx| on_disk.contains(idx))
                .collect(),
        }
    }
}
