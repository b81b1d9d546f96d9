//! Cache configuration management with precedence and validation
use crate::chunk::DEFAULT_CHUNK_BYTE_BUDGET;
use crate::errors::{CacheError, RecoveryHint, Result, SerializationOp};
use crate::monitor::PressureThresholds;
use crate::storage::CompressionConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the read path does when a cached chunk yields nothing in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissPolicy {
    /// Surface `CacheError::CacheConsistency`
    Fail,
    /// Recompute the feature and count a recovered miss
    Recompute,
}

impl std::str::FromStr for MissPolicy {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "recompute" => Ok(Self::Recompute),
            other => Err(CacheError::configuration(format!(
                "unknown miss policy '{other}' (expected 'fail' or 'recompute')"
            ))),
        }
    }
}

/// Configuration for one two-level cache instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory that holds spilled chunk files
    pub storage_dir: PathBuf,
    /// Per-instance file name prefix; files are `<prefix><chunk_idx>.fea`
    pub file_prefix: String,
    /// Byte budget of one chunk; `chunk_size = budget / item_byte_size`
    pub chunk_byte_budget: u64,
    /// Host memory fraction treated as full before `configure`
    pub initial_host_memory_threshold: f64,
    /// Disk fraction treated as full before `configure`
    pub initial_disk_threshold: f64,
    /// Host memory fraction treated as full once configured
    pub host_memory_threshold: f64,
    /// Disk fraction treated as full once configured
    pub disk_threshold: f64,
    /// How long a read waits for its chunk to be loaded from disk
    #[serde(with = "duration_ms", rename = "read_wait_timeout_ms")]
    pub read_wait_timeout: Duration,
    /// Delay before `finish` terminates the worker
    #[serde(with = "duration_ms", rename = "finish_grace_period_ms")]
    pub finish_grace_period: Duration,
    pub miss_policy: MissPolicy,
    pub compression: CompressionConfig,
    /// Serve spilled chunks from disk even when the disk never filled.
    /// Off: once host memory fills, reads recompute until a recompute
    /// boundary exists.
    pub reload_spilled_chunks: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            file_prefix: unique_file_prefix(),
            chunk_byte_budget: DEFAULT_CHUNK_BYTE_BUDGET,
            initial_host_memory_threshold: 0.2,
            initial_disk_threshold: 0.2,
            host_memory_threshold: 0.8,
            disk_threshold: 0.8,
            // Roughly the time to load one 4 GB chunk file
            read_wait_timeout: Duration::from_secs(4),
            finish_grace_period: Duration::from_secs(5),
            miss_policy: MissPolicy::Fail,
            compression: CompressionConfig::default(),
            reload_spilled_chunks: false,
        }
    }
}

fn default_storage_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("featcache")
}

/// A prefix no other cache instance will share
pub fn unique_file_prefix() -> String {
    format!("feature_cache_{}_", uuid::Uuid::new_v4().simple())
}

impl CacheConfig {
    pub fn initial_thresholds(&self) -> PressureThresholds {
        PressureThresholds {
            host_memory: self.initial_host_memory_threshold,
            disk: self.initial_disk_threshold,
        }
    }

    pub fn active_thresholds(&self) -> PressureThresholds {
        PressureThresholds {
            host_memory: self.host_memory_threshold,
            disk: self.disk_threshold,
        }
    }

    /// Reject values that would make the cache misbehave
    pub fn validate(&self) -> Result<()> {
        let fractions = [
            ("initial_host_memory_threshold", self.initial_host_memory_threshold),
            ("initial_disk_threshold", self.initial_disk_threshold),
            ("host_memory_threshold", self.host_memory_threshold),
            ("disk_threshold", self.disk_threshold),
        ];
        for (name, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(CacheError::configuration(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }

        if self.chunk_byte_budget == 0 {
            return Err(CacheError::configuration(
                "chunk_byte_budget must be positive",
            ));
        }

        if self.file_prefix.is_empty() {
            return Err(CacheError::configuration("file_prefix must not be empty"));
        }
        if self.file_prefix.contains(std::path::is_separator) {
            return Err(CacheError::configuration(format!(
                "file_prefix '{}' must not contain a path separator",
                self.file_prefix
            )));
        }

        if !(1..=22).contains(&self.compression.level) {
            return Err(CacheError::configuration(format!(
                "zstd level must be in 1..=22, got {}",
                self.compression.level
            )));
        }

        Ok(())
    }
}

/// Builder for creating cache configurations
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
        }
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage_dir = dir.into();
        self
    }

    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.file_prefix = prefix.into();
        self
    }

    pub fn with_chunk_byte_budget(mut self, budget: u64) -> Self {
        self.config.chunk_byte_budget = budget;
        self
    }

    pub fn with_initial_thresholds(mut self, host_memory: f64, disk: f64) -> Self {
        self.config.initial_host_memory_threshold = host_memory;
        self.config.initial_disk_threshold = disk;
        self
    }

    pub fn with_thresholds(mut self, host_memory: f64, disk: f64) -> Self {
        self.config.host_memory_threshold = host_memory;
        self.config.disk_threshold = disk;
        self
    }

    pub fn with_read_wait_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_wait_timeout = timeout;
        self
    }

    pub fn with_finish_grace_period(mut self, grace: Duration) -> Self {
        self.config.finish_grace_period = grace;
        self
    }

    pub fn with_miss_policy(mut self, policy: MissPolicy) -> Self {
        self.config.miss_policy = policy;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn with_reload_spilled_chunks(mut self, reload: bool) -> Self {
        self.config.reload_spilled_chunks = reload;
        self
    }

    /// Build the configuration
    pub fn build(self) -> CacheConfig {
        self.config
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration loader that handles precedence:
/// defaults < config file < `FEATCACHE_*` environment variables
pub struct CacheConfigLoader;

impl CacheConfigLoader {
    /// Load configuration with full precedence handling
    pub fn load() -> Result<CacheConfig> {
        let path = Self::config_file_path();
        let config = match path {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => CacheConfig::default(),
        };

        let config = Self::apply_env(config)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file; missing fields keep their defaults
    pub fn load_from_file(path: &Path) -> Result<CacheConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| CacheError::Io {
            path: path.to_path_buf(),
            operation: "read config file",
            source: e,
            recovery_hint: RecoveryHint::CheckPermissions {
                path: path.to_path_buf(),
            },
        })?;

        serde_json::from_str(&content).map_err(|e| CacheError::Serialization {
            path: path.to_path_buf(),
            operation: SerializationOp::Decode,
            source: Box::new(e),
            recovery_hint: RecoveryHint::Manual {
                instructions: "Check config file syntax".to_string(),
            },
        })
    }

    /// Override fields from `FEATCACHE_*` environment variables
    pub fn apply_env(mut config: CacheConfig) -> Result<CacheConfig> {
        if let Ok(dir) = std::env::var("FEATCACHE_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }

        if let Ok(prefix) = std::env::var("FEATCACHE_FILE_PREFIX") {
            config.file_prefix = prefix;
        }

        if let Some(budget) = parse_env::<u64>("FEATCACHE_CHUNK_BYTE_BUDGET")? {
            config.chunk_byte_budget = budget;
        }

        if let Some(threshold) = parse_env::<f64>("FEATCACHE_HOST_MEMORY_THRESHOLD")? {
            config.host_memory_threshold = threshold;
        }

        if let Some(threshold) = parse_env::<f64>("FEATCACHE_DISK_THRESHOLD")? {
            config.disk_threshold = threshold;
        }

        if let Some(ms) = parse_env::<u64>("FEATCACHE_READ_WAIT_MS")? {
            config.read_wait_timeout = Duration::from_millis(ms);
        }

        if let Ok(policy) = std::env::var("FEATCACHE_MISS_POLICY") {
            config.miss_policy = policy.parse()?;
        }

        if let Ok(value) = std::env::var("FEATCACHE_COMPRESSION") {
            config.compression.enabled = matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "zstd" | "on"
            );
        }

        if let Some(reload) = parse_env::<bool>("FEATCACHE_RELOAD_SPILLED_CHUNKS")? {
            config.reload_spilled_chunks = reload;
        }

        Ok(config)
    }

    /// `$FEATCACHE_CONFIG`, else `<config_dir>/featcache/config.json`
    pub fn config_file_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("FEATCACHE_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("featcache").join("config.json"))
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            CacheError::configuration(format!("{name}='{raw}' is not a valid value"))
        }),
        Err(_) => Ok(None),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "FEATCACHE_CONFIG",
        "FEATCACHE_STORAGE_DIR",
        "FEATCACHE_FILE_PREFIX",
        "FEATCACHE_CHUNK_BYTE_BUDGET",
        "FEATCACHE_HOST_MEMORY_THRESHOLD",
        "FEATCACHE_DISK_THRESHOLD",
        "FEATCACHE_READ_WAIT_MS",
        "FEATCACHE_MISS_POLICY",
        "FEATCACHE_COMPRESSION",
        "FEATCACHE_RELOAD_SPILLED_CHUNKS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = CacheConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_byte_budget, 4_000_000_000);
        assert_eq!(config.read_wait_timeout, Duration::from_secs(4));
        assert_eq!(config.initial_thresholds().host_memory, 0.2);
        assert_eq!(config.active_thresholds().disk, 0.8);
        assert!(!config.reload_spilled_chunks);
    }

    #[test]
    fn test_default_prefixes_are_unique() {
        assert_ne!(CacheConfig::default().file_prefix, CacheConfig::default().file_prefix);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = CacheConfigBuilder::new().with_thresholds(0.0, 0.8).build();
        assert!(bad.validate().is_err());

        let bad = CacheConfigBuilder::new().with_thresholds(0.8, 1.5).build();
        assert!(bad.validate().is_err());

        let bad = CacheConfigBuilder::new().with_chunk_byte_budget(0).build();
        assert!(bad.validate().is_err());

        let bad = CacheConfigBuilder::new().with_file_prefix("a/b").build();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_file_config_keeps_missing_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "chunk_byte_budget": 1000, "read_wait_timeout_ms": 250, "miss_policy": "recompute" }"#,
        )
        .unwrap();

        let config = CacheConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(config.chunk_byte_budget, 1000);
        assert_eq!(config.read_wait_timeout, Duration::from_millis(250));
        assert_eq!(config.miss_policy, MissPolicy::Recompute);
        assert_eq!(config.host_memory_threshold, 0.8);
    }

    #[test]
    fn test_malformed_file_is_serialization_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            CacheConfigLoader::load_from_file(&path),
            Err(CacheError::Serialization { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{ "disk_threshold": 0.5, "chunk_byte_budget": 10 }"#).unwrap();

        std::env::set_var("FEATCACHE_CONFIG", &path);
        std::env::set_var("FEATCACHE_DISK_THRESHOLD", "0.9");
        std::env::set_var("FEATCACHE_READ_WAIT_MS", "100");
        std::env::set_var("FEATCACHE_COMPRESSION", "zstd");
        std::env::set_var("FEATCACHE_RELOAD_SPILLED_CHUNKS", "true");

        let config = CacheConfigLoader::load().unwrap();
        clear_env();

        assert_eq!(config.disk_threshold, 0.9);
        assert_eq!(config.chunk_byte_budget, 10);
        assert_eq!(config.read_wait_timeout, Duration::from_millis(100));
        assert!(config.compression.enabled);
        assert!(config.reload_spilled_chunks);
    }

    #[test]
    #[serial]
    fn test_unparsable_env_is_configuration_error() {
        clear_env();
        std::env::set_var("FEATCACHE_CONFIG", "/nonexistent/featcache.json");
        std::env::set_var("FEATCACHE_HOST_MEMORY_THRESHOLD", "lots");

        let result = CacheConfigLoader::load();
        clear_env();

        assert!(matches!(result, Err(CacheError::Configuration { .. })));
    }
}
