//! Sharded Map Implementation
//!
//! Concurrent key→slot map used by the HBM and DRAM tiers.
//!
//! # Design
//!
//! - Each shard has its own RwLock, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Cache-line padding between shards prevents false sharing
//! - `try_insert` never overwrites, so racing creators agree on one winner

use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CACHE_LINE_SIZE, SHARD_COUNT};

/// Single shard containing a hashmap and statistics
#[repr(C)]
pub struct Shard<K, V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<K, V>>,
    /// Number of entries
    count: AtomicU64,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
    /// Padding to prevent false sharing
    _padding: [u8; CACHE_LINE_SIZE - 24],
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_SIZE - 24],
        }
    }

    /// Get the number of entries in this shard
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V: Clone> Shard<K, V> {
    /// Get a value from the shard
    pub fn get(&self, key: &K) -> Option<V> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().contains_key(key)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let old = self.map.write().insert(key, value);
        if old.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    /// Insert only if absent; on conflict the resident value is returned
    pub fn try_insert(&self, key: K, value: V) -> Result<(), V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        match guard.entry(key) {
            Entry::Occupied(existing) => Err(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(value);
                self.count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Remove a value, returning it if present
    pub fn remove(&self, key: &K) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let removed = self.map.write().remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove a value only if `pred` accepts the resident value
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        if !guard.get(key).map(pred).unwrap_or(false) {
            return None;
        }
        let removed = guard.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every entry rejected by `keep`, returning the removed entries
    pub fn retain<F>(&self, mut keep: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let mut guard = self.map.write();
        let doomed: Vec<K> = guard
            .iter()
            .filter(|(k, v)| !keep(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }
        self.writes.fetch_add(doomed.len() as u64, Ordering::Relaxed);
        let removed: Vec<(K, V)> = doomed
            .into_iter()
            .filter_map(|k| guard.remove(&k).map(|v| (k, v)))
            .collect();
        self.count.fetch_sub(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Clear all entries
    pub fn clear(&self) {
        let mut guard = self.map.write();
        guard.clear();
        self.count.store(0, Ordering::Relaxed);
    }

    /// Get all keys (for iteration)
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.map.read().keys().cloned().collect()
    }

    /// Get all entries (for iteration)
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        self.map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Sharded map with configurable shard count
pub struct ShardedMap<K, V, const N: usize = SHARD_COUNT> {
    /// Shards
    shards: Box<[Shard<K, V>]>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two());
        Self {
            shards: (0..N).map(|_| Shard::new()).collect(),
        }
    }

    /// Get the shard count
    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Get total read count
    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    /// Get total write count
    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Get a reference to a specific shard
    #[inline]
    pub fn shard(&self, index: usize) -> &Shard<K, V> {
        &self.shards[index % N]
    }
}

impl<K: Eq + Hash, V: Clone, const N: usize> ShardedMap<K, V, N> {
    /// Compute shard index from hash
    #[inline]
    fn shard_index(&self, key: &K) -> usize {
        use std::hash::Hasher;
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (N - 1)
    }

    /// Get a value
    pub fn get(&self, key: &K) -> Option<V> {
        self.shards[self.shard_index(key)].get(key)
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.shards[self.shard_index(key)].contains_key(key)
    }

    /// Insert a value, overwriting any resident one
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let idx = self.shard_index(&key);
        self.shards[idx].insert(key, value)
    }

    /// Insert if absent, otherwise return the resident value
    pub fn try_insert(&self, key: K, value: V) -> Result<(), V> {
        let idx = self.shard_index(&key);
        self.shards[idx].try_insert(key, value)
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shards[self.shard_index(key)].remove(key)
    }

    /// Remove a value only if `pred` accepts it
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        self.shards[self.shard_index(key)].remove_if(key, pred)
    }

    /// Remove every entry rejected by `keep` across all shards
    pub fn retain<F>(&self, mut keep: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        self.shards
            .iter()
            .flat_map(|s| s.retain(&mut keep))
            .collect()
    }

    /// Snapshot of every entry
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
    {
        self.shards.iter().flat_map(|s| s.entries()).collect()
    }

    /// Snapshot of every key
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.shards.iter().flat_map(|s| s.keys()).collect()
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }
}

/// Statistics for a sharded map
#[derive(Debug, Clone)]
pub struct ShardedMapStats {
    /// Total entries
    pub total_entries: usize,
    /// Total reads
    pub total_reads: u64,
    /// Total writes
    pub total_writes: u64,
    /// Per-shard entry counts
    pub shard_entry_counts: Vec<usize>,
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Get detailed statistics
    pub fn stats(&self) -> ShardedMapStats {
        let shard_entry_counts: Vec<usize> = self.shards.iter().map(|s| s.len()).collect();
        ShardedMapStats {
            total_entries: shard_entry_counts.iter().sum(),
            total_reads: self.total_reads(),
            total_writes: self.total_writes(),
            shard_entry_counts,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
