//! embstore - Tiered Embedding Storage
//!
//! A key to embedding store for sparse model training. Embeddings live in one
//! of three tiers and migrate between them as the training loop touches keys:
//! hot keys are promoted into pooled HBM buffers, cold keys are evicted to host
//! DRAM and eventually spilled to an append-only log on SSD.
//!
//! # Architecture
//!
//! ```text
//! EmbeddingVar ──▶ TieredStorage ──▶ HBM │ DRAM │ SSD
//!                        │
//!                        └──▶ CachePolicy + EvictionManager
//! ```
//!
//! # Modules
//!
//! - [`config`] - Storage configuration (YAML, environment overrides)
//! - [`embedding`] - Per-variable facade used by the training operators
//! - [`error`] - Error types
//! - [`storage`] - Tiers, cache policies, eviction and the orchestrator

pub mod config;
pub mod embedding;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use config::{CompactionMode, PoolSettings, SsdConfig, SsdIoScheme, StorageConfig};
pub use embedding::{EmbeddingConfig, EmbeddingVar};
pub use error::{Error, Result};
pub use storage::{
    CacheStrategy, CopyBack, EmbeddingKey, EmbeddingValue, Lookup, MetricsSnapshot, ShrinkArgs,
    TierKind, TieredStorage, ValueSlot,
};
