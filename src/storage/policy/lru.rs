//! Least-recently-used residency tracker.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use super::{CachePolicy, CachedIds};
use crate::storage::types::EmbeddingKey;

#[derive(Debug, Clone, Copy)]
struct LruEntry {
    tick: u64,
    freq: u64,
}

struct LruState<K> {
    clock: u64,
    resident: HashMap<K, LruEntry>,
    /// tick -> key, oldest first
    order: BTreeMap<u64, K>,
    prefetch: HashMap<K, u64>,
}

impl<K: EmbeddingKey> LruState<K> {
    fn new() -> Self {
        Self {
            clock: 0,
            resident: HashMap::new(),
            order: BTreeMap::new(),
            prefetch: HashMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: K, count: u64) {
        let tick = self.next_tick();
        match self.resident.get_mut(&key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                entry.tick = tick;
                entry.freq += count;
            }
            None => {
                let seed = self.prefetch.remove(&key).unwrap_or(0);
                self.resident.insert(
                    key,
                    LruEntry {
                        tick,
                        freq: seed + count,
                    },
                );
            }
        }
        self.order.insert(tick, key);
    }

    fn forget(&mut self, key: &K) {
        if let Some(entry) = self.resident.remove(key) {
            self.order.remove(&entry.tick);
        }
    }
}

/// LRU policy: the least recently touched resident is evicted first.
pub struct LruCache<K> {
    state: Mutex<LruState<K>>,
}

impl<K: EmbeddingKey> Default for LruCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EmbeddingKey> LruCache<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LruState::new()),
        }
    }

    /// Number of keys waiting on the prefetch list
    pub fn prefetch_len(&self) -> usize {
        self.state.lock().prefetch.len()
    }
}

impl<K: EmbeddingKey> CachePolicy<K> for LruCache<K> {
    fn name(&self) -> &'static str {
        "lru"
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
                if let Some(entry) = state.resident.get_mut(&key) {
                    entry.freq += 1;
                }
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
            let Some((_, key)) = state.order.pop_first() else {
                break;
            };
            state.resident.remove(&key);
            victims.push(key);
        }
        victims
    }

    fn get_cached_ids(&self, capacity: usize) -> CachedIds<K> {
        let state = self.state.lock();
        let mut cached = CachedIds {
            ids: Vec::with_capacity(capacity.min(state.resident.len())),
            freqs: Vec::with_capacity(capacity.min(state.resident.len())),
        };
        for key in state.order.values().rev().take(capacity) {
            cached.ids.push(*key);
            cached
                .freqs
                .push(state.resident.get(key).map(|e| e.freq).unwrap_or(0));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lru_basic_order() {
        let lru = LruCache::<i64>::new();
        lru.update(&[1, 2, 3]);
        lru.update(&[1]);

        assert_eq!(lru.get_evic_ids(2), vec![2, 3]);
        assert_eq!(lru.size(), 1);
        assert!(lru.contains(&1));
    }

    #[test]
    fn test_lru_add_to_cache_keeps_priority() {
        let lru = LruCache::<i64>::new();
        lru.update(&[1, 2]);
        // 1 is already resident: registering it again is not a touch
        lru.add_to_cache(&[1, 3]);

        assert_eq!(lru.get_evic_ids(3), vec![1, 2, 3]);
    }

    #[test]
    fn test_lru_prefetch_not_resident() {
        let lru = LruCache::<i64>::new();
        lru.add_to_prefetch_list(&[7, 7, 8]);
        assert_eq!(lru.size(), 0);
        assert_eq!(lru.prefetch_len(), 2);

        lru.update(&[7]);
        assert_eq!(lru.size(), 1);
        assert_eq!(lru.prefetch_len(), 1);
        assert_eq!(lru.get_cached_ids(10).freqs, vec![3]);
    }

    #[test]
    fn test_lru_update_with_counts() {
        let lru = LruCache::<i64>::new();
        lru.update_with_counts(&[4, 5], &[10, 2]);
        let cached = lru.get_cached_ids(2);
        assert_eq!(cached.ids, vec![5, 4]);
        assert_eq!(cached.freqs, vec![2, 10]);
    }

    #[test]
    fn test_lru_remove() {
        let lru = LruCache::<i64>::new();
        lru.update(&[1, 2, 3]);
        lru.remove(&[2, 9]);
        assert_eq!(lru.size(), 2);
        assert_eq!(lru.get_evic_ids(5), vec![1, 3]);
    }

    #[test]
    fn test_lru_evict_more_than_resident() {
        let lru = LruCache::<i32>::new();
        lru.update(&[1]);
        assert_eq!(lru.get_evic_ids(10), vec![1]);
        assert!(lru.get_evic_ids(10).is_empty());
    }
}
