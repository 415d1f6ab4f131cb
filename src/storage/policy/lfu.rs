//! Least-frequently-used residency tracker.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::warn;

use super::{CachePolicy, CachedIds};
use crate::storage::types::EmbeddingKey;

#[derive(Debug, Clone, Copy)]
struct LfuEntry {
    freq: u64,
    tick: u64,
}

struct LfuState<K> {
    clock: u64,
    resident: HashMap<K, LfuEntry>,
    /// (freq, tick, key), coldest first
    order: BTreeSet<(u64, u64, K)>,
    prefetch: HashMap<K, u64>,
}

impl<K: EmbeddingKey> LfuState<K> {
    fn new() -> Self {
        Self {
            clock: 0,
            resident: HashMap::new(),
            order: BTreeSet::new(),
            prefetch: HashMap::new(),
        }
    }

    fn touch(&mut self, key: K, count: u64) {
        self.clock += 1;
        let tick = self.clock;
        let entry = match self.resident.get(&key) {
            Some(old) => {
                self.order.remove(&(old.freq, old.tick, key));
                LfuEntry {
                    freq: old.freq + count,
                    tick,
                }
            }
            None => LfuEntry {
                freq: self.prefetch.remove(&key).unwrap_or(0) + count,
                tick,
            },
        };
        self.resident.insert(key, entry);
        self.order.insert((entry.freq, entry.tick, key));
    }

    /// Raise frequency without refreshing recency
    fn bump(&mut self, key: K) {
        if let Some(entry) = self.resident.get_mut(&key) {
            self.order.remove(&(entry.freq, entry.tick, key));
            entry.freq += 1;
            self.order.insert((entry.freq, entry.tick, key));
        }
    }

    fn forget(&mut self, key: &K) {
        if let Some(entry) = self.resident.remove(key) {
            self.order.remove(&(entry.freq, entry.tick, *key));
        }
    }
}

/// LFU policy: the least frequently touched resident is evicted first.
pub struct LfuCache<K> {
    state: Mutex<LfuState<K>>,
}

impl<K: EmbeddingKey> Default for LfuCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EmbeddingKey> LfuCache<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LfuState::new()),
        }
    }

    /// Current frequency of a resident key
    pub fn frequency(&self, key: &K) -> Option<u64> {
        self.state.lock().resident.get(key).map(|e| e.freq)
    }
}

impl<K: EmbeddingKey> CachePolicy<K> for LfuCache<K> {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn update(&self, keys: &[K]) {
        let mut state = self.state.lock();
        for &key in keys {
            state.touch(key, 1);
        }
    }

    fn update_with_counts(&self, keys: &[K], counts: &[u64]) {
        if keys.len() != counts.len() {
            warn!(
                "{} update skipped: {} keys but {} counts",
                self.name(),
                keys.len(),
                counts.len()
            );
            return;
        }
        let mut state = self.state.lock();
        for (&key, &count) in keys.iter().zip(counts) {
            state.touch(key, count);
        }
    }

    fn add_to_cache(&self, keys: &[K]) {
        let mut state = self.state.lock();
        let mut fresh: HashSet<K> = HashSet::new();
        for &key in keys {
            if fresh.contains(&key) {
                state.bump(key);
            } else if !state.resident.contains_key(&key) {
                state.touch(key, 1);
                fresh.insert(key);
            }
        }
    }

    fn add_to_prefetch_list(&self, keys: &[K]) {
        let mut state = self.state.lock();
        for key in keys {
            if !state.resident.contains_key(key) {
                *state.prefetch.entry(*key).or_insert(0) += 1;
            }
        }
    }

    fn get_evic_ids(&self, k: usize) -> Vec<K> {
        let mut state = self.state.lock();
        let mut victims = Vec::with_capacity(k.min(state.resident.len()));
        while victims.len() < k {
            let Some((_, _, key)) = state.order.pop_first() else {
                break;
            };
            state.resident.remove(&key);
            victims.push(key);
        }
        victims
    }

    fn get_cached_ids(&self, capacity: usize) -> CachedIds<K> {
        let state = self.state.lock();
        let mut cached = CachedIds::default();
        for &(freq, _, key) in state.order.iter().rev().take(capacity) {
            cached.ids.push(key);
            cached.freqs.push(freq);
        }
        cached
    }

    fn remove(&self, keys: &[K]) {
        let mut state = self.state.lock();
        for key in keys {
            state.forget(key);
            state.prefetch.remove(key);
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.state.lock().resident.contains_key(key)
    }

    fn size(&self) -> usize {
        self.state.lock().resident.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
