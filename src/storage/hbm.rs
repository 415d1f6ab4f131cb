//! HBM Tier
//!
//! Fastest tier. Slot buffers come from the shared [`MemoryPool`]; slots that
//! leave the map are parked in a [`ReleaseQueue`] until their last reader is
//! gone, then their buffers are recycled.
//!
//! Bulk promotions land here through a two-step copy: source payloads are
//! packed into a contiguous host staging buffer, then unpacked into the
//! destination pool buffers.

use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug;

use super::pool::{MemoryPool, ReleaseQueue};
use super::shard::ShardedMap;
use super::slot::{SlotLayout, ValueSlot};
use super::tier::{ShrinkArgs, SnapshotEntry, TierStore};
use super::types::{EmbeddingKey, EmbeddingValue, TierKind};
use crate::error::{Error, Result};

/// Pooled device-memory tier
pub struct HbmStore<K, V> {
    map: ShardedMap<K, Arc<ValueSlot<V>>>,
    pool: Arc<MemoryPool<V>>,
    release: ReleaseQueue<V>,
    lock: Mutex<()>,
}

impl<K: EmbeddingKey, V: EmbeddingValue> HbmStore<K, V> {
    pub fn new(pool: Arc<MemoryPool<V>>) -> Self {
        Self {
            map: ShardedMap::new(),
            pool,
            release: ReleaseQueue::new(),
            lock: Mutex::new(()),
        }
    }

    /// Backing memory pool
    pub fn pool(&self) -> &Arc<MemoryPool<V>> {
        &self.pool
    }

    /// Mint an unmapped slot backed by a pool buffer
    pub fn create_slot(&self) -> Result<Arc<ValueSlot<V>>> {
        Ok(Arc::new(ValueSlot::with_buffer(self.pool.allocate()?)))
    }

    /// Mint `n` unmapped slots with one pool lock acquisition
    pub fn create_slots(&self, n: usize) -> Result<Vec<Arc<ValueSlot<V>>>> {
        Ok(self
            .pool
            .allocate_batch(n)?
            .into_iter()
            .map(|buffer| Arc::new(ValueSlot::with_buffer(buffer)))
            .collect())
    }

    /// Give back a slot that never made it into the map
    pub fn discard(&self, slot: Arc<ValueSlot<V>>) {
        match Arc::try_unwrap(slot) {
            Ok(slot) => {
                if let Some(buffer) = slot.take_buffer() {
                    self.pool.deallocate(buffer);
                }
            }
            Err(shared) => self.release.retire(shared),
        }
    }

    /// Recycle buffers of retired slots nobody observes anymore
    pub fn reclaim(&self) -> usize {
        let reclaimed = self.release.reclaim(&self.pool);
        if reclaimed > 0 {
            debug!("Reclaimed {} retired HBM buffers", reclaimed);
        }
        reclaimed
    }

    /// Retired slots still referenced by readers
    pub fn pending_release(&self) -> usize {
        self.release.len()
    }

    /// Scatter a packed staging buffer into destination slots.
    ///
    /// `staging` holds `slots.len()` consecutive runs of `total_dims` elements.
    pub fn batch_unpack(
        &self,
        staging: &[V],
        total_dims: usize,
        slots: &[Arc<ValueSlot<V>>],
    ) -> Result<()> {
        if total_dims == 0 || staging.len() != total_dims * slots.len() {
            return Err(Error::InvalidArgument(format!(
                "staging buffer of {} elements does not match {} slots of {}",
                staging.len(),
                slots.len(),
                total_dims
            )));
        }
        staging
            .par_chunks(total_dims)
            .zip(slots.par_iter())
            .for_each(|(chunk, slot)| {
                slot.copy_from_slice(chunk);
            });
        Ok(())
    }

    /// Resident keys
    pub fn keys(&self) -> Vec<K> {
        self.map.keys()
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> TierStore<K, V> for HbmStore<K, V> {
    fn kind(&self) -> TierKind {
        TierKind::Hbm
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
        if let Some(old) = self.map.insert(key, slot) {
            self.release.retire(old);
        }
        Ok(())
    }

    fn remove(&self, key: K) -> bool {
        match self.map.remove(&key) {
            Some(slot) => {
                self.release.retire(slot);
                true
            }
            None => false,
        }
    }

    fn commit(&self, key: K, slot: &ValueSlot<V>) -> Result<()> {
        let fresh = self.create_slot()?;
        fresh.copy_header_from(slot);
        fresh.copy_payload_from(slot);
        self.insert(key, fresh)
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
        let removed = self.map.retain(|_, slot| !args.should_remove(slot, layout));
        let keys = removed.iter().map(|(k, _)| *k).collect();
        self.release
            .retire_batch(removed.into_iter().map(|(_, slot)| slot));
        Ok(keys)
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
