//! Storage Configuration
//!
//! Serde-backed configuration for the tiered store. Values can be loaded from
//! YAML and are then overridden by environment variables:
//!
//! | Variable | Effect |
//! |---|---|
//! | `EMBSTORE_SSD_IO_SCHEME` | `buffered`, `mmap`, `mmap_and_madvise` or `directio` |
//! | `EMBSTORE_SSD_ASYNC_COMPACTION` | `true` for background compaction |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::storage::compression::CompressionAlgorithm;
use crate::storage::pool::MemoryPoolConfig;
use crate::storage::{CacheStrategy, DEFAULT_EVICTION_BATCH, DEFAULT_SHARD_GRANULARITY};

/// Environment override for the SSD read path
pub const ENV_SSD_IO_SCHEME: &str = "EMBSTORE_SSD_IO_SCHEME";

/// Environment override for the SSD compaction mode
pub const ENV_SSD_ASYNC_COMPACTION: &str = "EMBSTORE_SSD_ASYNC_COMPACTION";

// =============================================================================
// SSD
// =============================================================================

/// How sealed SSD segments are read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SsdIoScheme {
    /// Positioned reads through the page cache
    #[default]
    Buffered,
    /// Memory-mapped sealed segments
    Mmap,
    /// Memory-mapped sealed segments with read-ahead advice
    MmapAndMadvise,
    /// O_DIRECT reads bypassing the page cache
    #[serde(rename = "directio")]
    DirectIo,
}

impl SsdIoScheme {
    pub fn name(&self) -> &'static str {
        match self {
            SsdIoScheme::Buffered => "buffered",
            SsdIoScheme::Mmap => "mmap",
            SsdIoScheme::MmapAndMadvise => "mmap_and_madvise",
            SsdIoScheme::DirectIo => "directio",
        }
    }

    /// Whether sealed segments are memory-mapped
    pub fn is_mapped(&self) -> bool {
        matches!(self, SsdIoScheme::Mmap | SsdIoScheme::MmapAndMadvise)
    }
}

impl FromStr for SsdIoScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffered" | "" => Ok(SsdIoScheme::Buffered),
            "mmap" => Ok(SsdIoScheme::Mmap),
            "mmap_and_madvise" => Ok(SsdIoScheme::MmapAndMadvise),
            "directio" | "direct_io" => Ok(SsdIoScheme::DirectIo),
            other => Err(Error::Config(format!("unknown SSD io scheme: {}", other))),
        }
    }
}

impl std::fmt::Display for SsdIoScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where compaction of sealed segments runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionMode {
    /// Inline on the commit path
    #[default]
    Sync,
    /// On a dedicated background thread
    Async,
}

/// SSD tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdConfig {
    /// Directory holding segment files
    pub path: PathBuf,
    /// Read path for sealed segments
    pub io_scheme: SsdIoScheme,
    /// Compaction mode
    pub compaction: CompactionMode,
    /// Size at which the active segment is sealed
    pub segment_size_bytes: u64,
    /// Sealed segments whose live/total ratio falls below this are compacted
    pub compaction_ratio: f64,
    /// Payload compression
    pub compression: CompressionAlgorithm,
    /// Payloads smaller than this are stored uncompressed
    pub compression_min_bytes: usize,
}

impl Default for SsdConfig {
    fn default() -> Self {
        Self {
            path: std::env::temp_dir().join("embstore"),
            io_scheme: SsdIoScheme::Buffered,
            compaction: CompactionMode::Sync,
            segment_size_bytes: 64 * 1024 * 1024,
            compaction_ratio: 0.5,
            compression: CompressionAlgorithm::None,
            compression_min_bytes: 256,
        }
    }
}

// =============================================================================
// Storage
// =============================================================================

/// Memory pool settings as they appear in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub chunk_blocks: usize,
    pub max_blocks: Option<usize>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = MemoryPoolConfig::default();
        Self {
            chunk_blocks: defaults.chunk_blocks,
            max_blocks: defaults.max_blocks,
        }
    }
}

impl From<&PoolSettings> for MemoryPoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        MemoryPoolConfig {
            chunk_blocks: settings.chunk_blocks,
            max_blocks: settings.max_blocks,
        }
    }
}

/// Tiered storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Name used in logs and metric labels
    pub name: String,
    /// HBM budget in bytes
    pub hbm_capacity_bytes: u64,
    /// DRAM budget in bytes
    pub dram_capacity_bytes: u64,
    /// HBM eviction strategy
    pub cache_strategy: CacheStrategy,
    /// Worker threads for sharded batch work (0 = available parallelism)
    pub worker_threads: usize,
    /// Keys per shard in batch lookups
    pub shard_granularity: usize,
    /// Upper bound on keys moved by one eviction pass
    pub eviction_batch_size: usize,
    /// Periodic background eviction (None = only when scheduled)
    pub eviction_interval_ms: Option<u64>,
    /// HBM memory pool
    pub pool: PoolSettings,
    /// SSD tier
    pub ssd: SsdConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "embedding".to_string(),
            hbm_capacity_bytes: 1024 * 1024 * 1024,
            dram_capacity_bytes: 4 * 1024 * 1024 * 1024,
            cache_strategy: CacheStrategy::Lfu,
            worker_threads: 0,
            shard_granularity: DEFAULT_SHARD_GRANULARITY,
            eviction_batch_size: DEFAULT_EVICTION_BATCH,
            eviction_interval_ms: None,
            pool: PoolSettings::default(),
            ssd: SsdConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: StorageConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        info!("Loaded storage configuration from {}", path.display());
        Self::from_yaml_str(&text)
    }

    /// Apply environment overrides on top of this configuration
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(scheme) = lookup(ENV_SSD_IO_SCHEME) {
            self.ssd.io_scheme = scheme.parse()?;
            info!("SSD io scheme overridden to {}", self.ssd.io_scheme);
        }
        if let Some(flag) = lookup(ENV_SSD_ASYNC_COMPACTION) {
            self.ssd.compaction = match flag.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => CompactionMode::Async,
                "false" | "0" | "no" | "" => CompactionMode::Sync,
                other => {
                    warn!(
                        "Ignoring {}={}, expected true or false",
                        ENV_SSD_ASYNC_COMPACTION, other
                    );
                    self.ssd.compaction
                }
            };
        }
        Ok(())
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<()> {
        if self.shard_granularity == 0 {
            return Err(Error::Config("shard_granularity must be positive".into()));
        }
        if self.eviction_batch_size == 0 {
            return Err(Error::Config("eviction_batch_size must be positive".into()));
        }
        if self.pool.chunk_blocks == 0 {
            return Err(Error::Config("pool.chunk_blocks must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.ssd.compaction_ratio) {
            return Err(Error::Config(format!(
                "ssd.compaction_ratio must be within [0, 1], got {}",
                self.ssd.compaction_ratio
            )));
        }
        if self.ssd.segment_size_bytes < 4096 {
            return Err(Error::Config(
                "ssd.segment_size_bytes must be at least 4096".into(),
            ));
        }
        Ok(())
    }

    /// Worker thread count with the automatic default resolved
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = StorageConfig::default();
        config.validate().unwrap();
        assert_eq!(config.shard_granularity, 1000);
        assert_eq!(config.eviction_batch_size, 10_000);
        assert_eq!(config.ssd.io_scheme, SsdIoScheme::Buffered);
    }

    #[test]
    fn test_yaml_partial_document() {
        let yaml = r#"
name: user_emb
hbm_capacity_bytes: 4096
cache_strategy: lru
ssd:
  path: /tmp/emb
  io_scheme: mmap_and_madvise
  compaction: async
  compression: lz4
"#;
        let config = StorageConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name, "user_emb");
        assert_eq!(config.hbm_capacity_bytes, 4096);
        assert_eq!(config.cache_strategy, CacheStrategy::Lru);
        assert_eq!(config.ssd.path, PathBuf::from("/tmp/emb"));
        assert_eq!(config.ssd.io_scheme, SsdIoScheme::MmapAndMadvise);
        assert_eq!(config.ssd.compaction, CompactionMode::Async);
        assert_eq!(config.ssd.compression, CompressionAlgorithm::Lz4);
        // Untouched fields keep their defaults
        assert_eq!(config.shard_granularity, 1000);
    }

    #[test]
    fn test_yaml_directio_name() {
        let config = StorageConfig::from_yaml_str("ssd:\n  io_scheme: directio\n").unwrap();
        assert_eq!(config.ssd.io_scheme, SsdIoScheme::DirectIo);
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        assert_matches!(
            StorageConfig::from_yaml_str("shard_granularity: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            StorageConfig::from_yaml_str("shard_granularity: [1\n"),
            Err(Error::Yaml(_))
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SSD_IO_SCHEME, "directio"),
            (ENV_SSD_ASYNC_COMPACTION, "true"),
        ]
        .into_iter()
        .collect();

        let mut config = StorageConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.ssd.io_scheme, SsdIoScheme::DirectIo);
        assert_eq!(config.ssd.compaction, CompactionMode::Async);
    }

    #[test]
    fn test_env_override_bad_scheme() {
        let mut config = StorageConfig::default();
        let result = config.apply_overrides(|name| {
            (name == ENV_SSD_IO_SCHEME).then(|| "tape".to_string())
        });
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_io_scheme_parse() {
        assert_eq!("MMAP".parse::<SsdIoScheme>().unwrap(), SsdIoScheme::Mmap);
        assert!(SsdIoScheme::MmapAndMadvise.is_mapped());
        assert!(!SsdIoScheme::DirectIo.is_mapped());
    }
}
