//! Tier abstraction shared by the HBM, DRAM and SSD stores.

use parking_lot::Mutex;
use std::sync::Arc;

use super::slot::{SlotLayout, ValueSlot, UNSTAMPED_VERSION};
use super::types::{EmbeddingKey, EmbeddingValue, TierKind};
use crate::error::Result;

/// Removal criteria applied by `shrink`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShrinkArgs {
    /// Current training step
    pub global_step: i64,
    /// Keys untouched for more than this many steps are dropped (<= 0 disables)
    pub steps_to_live: i64,
    /// Keys whose `0.5 * |v|^2` falls below this are dropped
    pub l2_weight_threshold: Option<f64>,
}

impl ShrinkArgs {
    pub fn by_step(global_step: i64, steps_to_live: i64) -> Self {
        Self {
            global_step,
            steps_to_live,
            l2_weight_threshold: None,
        }
    }

    pub fn by_l2_weight(threshold: f64) -> Self {
        Self {
            global_step: 0,
            steps_to_live: 0,
            l2_weight_threshold: Some(threshold),
        }
    }

    /// Decide whether a key with this header/payload must go.
    ///
    /// Slots never stamped with a step get the current one instead.
    pub(crate) fn should_remove<V: EmbeddingValue>(
        &self,
        slot: &ValueSlot<V>,
        layout: &SlotLayout,
    ) -> bool {
        if self.steps_to_live > 0 {
            let version = slot.version();
            if version == UNSTAMPED_VERSION {
                slot.set_version(self.global_step);
            } else if self.global_step - version > self.steps_to_live {
                return true;
            }
        }
        if let Some(threshold) = self.l2_weight_threshold {
            if let Some(values) = slot.embedding(layout, 0) {
                if l2_weight(&values) < threshold {
                    return true;
                }
            }
        }
        false
    }
}

/// Half squared L2 norm of an embedding
pub fn l2_weight<V: EmbeddingValue>(values: &[V]) -> f64 {
    0.5 * values
        .iter()
        .map(|v| {
            let x = v.to_f64();
            x * x
        })
        .sum::<f64>()
}

/// One key as captured by a snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEntry<K, V> {
    pub key: K,
    pub values: Vec<V>,
    pub version: i64,
    pub freq: u64,
}

impl<K: EmbeddingKey, V: EmbeddingValue> SnapshotEntry<K, V> {
    pub(crate) fn capture(key: K, slot: &ValueSlot<V>) -> Self {
        Self {
            key,
            values: slot.to_vec().unwrap_or_default(),
            version: slot.version(),
            freq: slot.freq(),
        }
    }
}

/// A storage tier mapping keys to value slots.
pub trait TierStore<K: EmbeddingKey, V: EmbeddingValue>: Send + Sync {
    /// Which tier this is
    fn kind(&self) -> TierKind;

    /// Fetch the slot for `key` (`Error::NotFound` on miss)
    fn get(&self, key: K) -> Result<Arc<ValueSlot<V>>>;

    fn contains(&self, key: K) -> bool;

    /// Insert only if absent (`Error::AlreadyExists` otherwise)
    fn try_insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()>;

    /// Insert, replacing any resident slot
    fn insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()>;

    /// Remove `key`; returns whether it was resident
    fn remove(&self, key: K) -> bool;

    /// Copy `slot`'s header and payload into tier-owned storage
    fn commit(&self, key: K, slot: &ValueSlot<V>) -> Result<()>;

    /// Commit many keys
    fn batch_commit(&self, keys: &[K], slots: &[Arc<ValueSlot<V>>]) -> Result<()> {
        for (key, slot) in keys.iter().zip(slots) {
            self.commit(*key, slot)?;
        }
        Ok(())
    }

    /// Capture every resident key
    fn snapshot(&self) -> Result<Vec<SnapshotEntry<K, V>>>;

    /// Drop keys matching `args`, returning them
    fn shrink(&self, args: &ShrinkArgs, layout: &SlotLayout) -> Result<Vec<K>>;

    /// Number of resident keys
    fn size(&self) -> usize;

    /// Structural lock held by eviction and snapshot passes
    fn structure_lock(&self) -> &Mutex<()>;
}

// =============================================================================
// Tests
// =============================================================================
