//! DRAM Tier
//!
//! Host-memory tier receiving keys evicted from HBM. Slots own heap buffers
//! and are freed when the last `Arc` goes away.

use parking_lot::Mutex;
use std::sync::Arc;

use super::shard::ShardedMap;
use super::slot::{SlotLayout, ValueSlot};
use super::tier::{ShrinkArgs, SnapshotEntry, TierStore};
use super::types::{EmbeddingKey, EmbeddingValue, TierKind};
use crate::error::{Error, Result};

/// Host-memory tier
pub struct DramStore<K, V> {
    map: ShardedMap<K, Arc<ValueSlot<V>>>,
    lock: Mutex<()>,
}

impl<K: EmbeddingKey, V: EmbeddingValue> Default for DramStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> DramStore<K, V> {
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new(),
            lock: Mutex::new(()),
        }
    }

    /// Remove `key` only if it still maps to `expected`.
    ///
    /// A promotion uses this so that a newer copy committed by a concurrent
    /// eviction is not lost.
    pub fn remove_if_same(&self, key: K, expected: &Arc<ValueSlot<V>>) -> bool {
        self.map
            .remove_if(&key, |resident| Arc::ptr_eq(resident, expected))
            .is_some()
    }

    /// Resident keys
    pub fn keys(&self) -> Vec<K> {
        self.map.keys()
    }

    fn copy_of(slot: &ValueSlot<V>) -> Arc<ValueSlot<V>> {
        let fresh = match slot.to_vec() {
            Some(values) => ValueSlot::with_buffer(values.into_boxed_slice()),
            None => ValueSlot::new(slot.len()),
        };
        fresh.copy_header_from(slot);
        Arc::new(fresh)
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> TierStore<K, V> for DramStore<K, V> {
    fn kind(&self) -> TierKind {
        TierKind::Dram
    }

    fn get(&self, key: K) -> Result<Arc<ValueSlot<V>>> {
        self.map.get(&key).ok_or(Error::NotFound { key: key.to_i64() })
    }

    fn contains(&self, key: K) -> bool {
        self.map.contains_key(&key)
    }

    fn try_insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()> {
        self.map
            .try_insert(key, slot)
            .map_err(|_| Error::AlreadyExists { key: key.to_i64() })
    }

    fn insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()> {
        self.map.insert(key, slot);
        Ok(())
    }

    fn remove(&self, key: K) -> bool {
        self.map.remove(&key).is_some()
    }

    fn commit(&self, key: K, slot: &ValueSlot<V>) -> Result<()> {
        self.map.insert(key, Self::copy_of(slot));
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<SnapshotEntry<K, V>>> {
        Ok(self
            .map
            .entries()
            .into_iter()
            .map(|(key, slot)| SnapshotEntry::capture(key, &slot))
            .collect())
    }

    fn shrink(&self, args: &ShrinkArgs, layout: &SlotLayout) -> Result<Vec<K>> {
        Ok(self
            .map
            .retain(|_, slot| !args.should_remove(slot, layout))
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn structure_lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_is_a_copy() {
        let dram: DramStore<i64, f32> = DramStore::new();
        let src = ValueSlot::from_values(&[1.0f32, 2.0]);
        src.set_version(4);

        dram.commit(1, &src).unwrap();
        src.copy_from_slice(&[9.0, 9.0]);

        let resident = dram.get(1).unwrap();
        assert_eq!(resident.to_vec().unwrap(), vec![1.0, 2.0]);
        assert_eq!(resident.version(), 4);
    }

    #[test]
    fn test_batch_commit() {
        let dram: DramStore<i64, f32> = DramStore::new();
        let slots: Vec<_> = (0..3)
            .map(|i| Arc::new(ValueSlot::from_values(&[i as f32; 4])))
            .collect();
        dram.batch_commit(&[10, 11, 12], &slots).unwrap();

        assert_eq!(dram.size(), 3);
        assert_eq!(dram.get(12).unwrap().to_vec().unwrap(), vec![2.0; 4]);
    }

    #[test]
    fn test_remove_if_same() {
        let dram: DramStore<i64, f32> = DramStore::new();
        let src = ValueSlot::from_values(&[1.0f32]);
        dram.commit(1, &src).unwrap();
        let stale = dram.get(1).unwrap();

        // A newer commit replaces the resident slot
        dram.commit(1, &src).unwrap();
        assert!(!dram.remove_if_same(1, &stale));
        assert!(dram.contains(1));

        let current = dram.get(1).unwrap();
        assert!(dram.remove_if_same(1, &current));
        assert!(!dram.contains(1));
    }

    #[test]
    fn test_get_missing() {
        let dram: DramStore<i32, f64> = DramStore::new();
        assert!(dram.get(3).unwrap_err().is_not_found());
        assert!(!dram.remove(3));
    }

    #[test]
    fn test_snapshot() {
        let dram: DramStore<i64, f32> = DramStore::new();
        dram.commit(5, &ValueSlot::from_values(&[0.5f32, 0.25])).unwrap();
        let snapshot = dram.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, 5);
        assert_eq!(snapshot[0].values, vec![0.5, 0.25]);
    }
}
