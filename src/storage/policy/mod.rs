//! Cache Eviction Policies
//!
//! Tracks which keys are resident in the HBM tier and in what order they
//! should leave it. Two strategies are provided:
//!
//! - [`LruCache`]: evicts the least recently touched key first
//! - [`LfuCache`]: evicts the least frequently touched key first, ties broken
//!   by recency
//!
//! Both keep a separate prefetch list of keys expected to arrive soon. Prefetched
//! keys do not count toward [`CachePolicy::size`] and are never chosen for
//! eviction; their pending count seeds the frequency when they become resident.

mod lfu;
mod lru;

pub use lfu::LfuCache;
pub use lru::LruCache;

use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::EmbeddingKey;

/// Eviction strategy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// Least recently used
    #[default]
    Lru,
    /// Least frequently used
    Lfu,
}

impl CacheStrategy {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CacheStrategy::Lru => "lru",
            CacheStrategy::Lfu => "lfu",
        }
    }

    /// Build a policy instance for this strategy
    pub fn build<K: EmbeddingKey>(&self) -> Box<dyn CachePolicy<K>> {
        match self {
            CacheStrategy::Lru => Box::new(LruCache::new()),
            CacheStrategy::Lfu => Box::new(LfuCache::new()),
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(CacheStrategy::Lru),
            "lfu" => Ok(CacheStrategy::Lfu),
            other => Err(format!("unknown cache strategy: {}", other)),
        }
    }
}

/// Resident keys with their access counts, most valuable first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIds<K> {
    pub ids: Vec<K>,
    pub freqs: Vec<u64>,
}

impl<K> Default for CachedIds<K> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            freqs: Vec::new(),
        }
    }
}

impl<K> CachedIds<K> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Residency tracker consulted by batch eviction.
pub trait CachePolicy<K: EmbeddingKey>: Send + Sync {
    /// Policy name
    fn name(&self) -> &'static str;

    /// Record one access per occurrence, inserting absent keys
    fn update(&self, keys: &[K]);

    /// Record `counts[i]` accesses of `keys[i]`; mismatched lengths are ignored
    fn update_with_counts(&self, keys: &[K], counts: &[u64]);

    /// Register new residents; keys already resident keep their priority
    fn add_to_cache(&self, keys: &[K]);

    /// Record keys expected to become resident soon
    fn add_to_prefetch_list(&self, keys: &[K]);

    /// Remove and return up to `k` eviction victims, best victim first
    fn get_evic_ids(&self, k: usize) -> Vec<K>;

    /// Non-mutating snapshot of up to `capacity` residents
    fn get_cached_ids(&self, capacity: usize) -> CachedIds<K>;

    /// Forget keys (explicit removal or shrink)
    fn remove(&self, keys: &[K]);

    /// Whether `key` is resident
    fn contains(&self, key: &K) -> bool;

    /// Number of resident keys
    fn size(&self) -> usize;
}

// =============================================================================
// Tests
// =============================================================================
