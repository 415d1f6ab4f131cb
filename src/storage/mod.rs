//! Tiered Embedding Storage
//!
//! Three tiers of decreasing speed and increasing capacity:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        TieredStorage                            │
//! │   get / get_or_create / batch_get / batch_get_or_create         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   evict    ┌──────────────┐   spill   ┌─────┐ │
//! │  │ HBM          │──────────▶│ DRAM         │─────────▶│ SSD │ │
//! │  │ pooled slots │◀──────────│ heap slots   │◀─────────│ log │ │
//! │  └──────────────┘  promote   └──────────────┘  promote  └─────┘ │
//! │         ▲                           ▲                           │
//! │   CachePolicy (LRU/LFU)      LruCache (DRAM)                    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  EvictionManager (background thread)   rayon worker pool        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A key is resident in at most one tier once all moves have completed.

pub mod compression;
pub mod dram;
pub mod eviction;
pub mod hbm;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod shard;
pub mod slot;
pub mod ssd;
pub mod tier;
pub mod tiered;
pub mod types;

pub use compression::CompressionAlgorithm;
pub use eviction::{EvictionHandler, EvictionManager, EvictionScheduler, EvictionTask};
pub use metrics::{export_prometheus, MetricsSnapshot, StorageMetrics};
pub use policy::{CachePolicy, CacheStrategy, CachedIds, LfuCache, LruCache};
pub use pool::{MemoryPool, MemoryPoolConfig, MemoryPoolStats};
pub use slot::{SlotHeader, SlotLayout, ValueSlot, UNSTAMPED_VERSION};
pub use ssd::{RecordLocation, SsdStats, SsdStore};
pub use tier::{ShrinkArgs, SnapshotEntry, TierStore};
pub use tiered::{Lookup, Snapshot, TieredStorage};
pub use types::{CopyBack, EmbeddingKey, EmbeddingValue, TierKind};

/// Cache line size used to pad hot per-shard state
pub const CACHE_LINE_SIZE: usize = 64;

/// Every embedding starts on a multiple of this many bytes
pub const VALUE_ALIGNMENT: usize = 16;

/// Default shard count of the in-memory tier maps
pub const SHARD_COUNT: usize = 256;

/// Default number of keys moved per eviction pass
pub const DEFAULT_EVICTION_BATCH: usize = 10_000;

/// Default number of keys probed per worker task in batch lookups
pub const DEFAULT_SHARD_GRANULARITY: usize = 1_000;

// =============================================================================
// Tests
// =============================================================================
