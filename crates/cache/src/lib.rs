//! Two-level feature cache
//!
//! Caches the per-batch output of an expensive computation across training
//! epochs. Records live in host memory while it lasts, spill to disk once
//! memory is under pressure, and are recomputed once the disk fills as well.
//!
//! - [`TwoLevelCache`] decides the tier of every batch and serves reads
//! - [`DiskSpillWorker`] moves whole chunks between memory and disk
//! - [`ResourceMonitor`] turns memory and disk usage into "full" signals
//! - [`place_window`] computes the sliding window of resident chunks

pub mod chunk;
pub mod config;
pub mod errors;
pub mod message;
pub mod metrics;
pub mod monitor;
pub mod placement;
pub mod queue;
pub mod storage;
pub mod two_level;
pub mod worker;

pub use chunk::{ChunkGeometry, DEFAULT_CHUNK_BYTE_BUDGET};
pub use config::{CacheConfig, CacheConfigBuilder, CacheConfigLoader, MissPolicy};
pub use errors::{CacheError, RecoveryHint, Result};
pub use message::{ChunkPosition, ControlMessage};
pub use metrics::{CacheMetrics, MetricsSnapshot};
pub use monitor::{
    ManualProbe, PressureThresholds, ResourceMonitor, ResourceProbe, SystemProbe, UsageSample,
};
pub use placement::{place_window, Placement, PlacementPlan};
pub use queue::{ChunkQueue, ChunkQueueStore, FeatureItem};
pub use storage::{ChunkFileStats, ChunkFileStore, CompressionConfig};
pub use two_level::TwoLevelCache;
pub use worker::{DiskSpillWorker, LostChunks, WorkerReport, WorkerState};
