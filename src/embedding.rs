//! Embedding Variable
//!
//! Per-variable view over a shared [`TieredStorage`]. Several variables (for
//! example a weight and its optimizer accumulator) share one store, each owning
//! one embedding index inside every slot.

use parking_lot::MappedRwLockWriteGuard;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{
    EmbeddingKey, EmbeddingValue, ShrinkArgs, SlotLayout, TieredStorage, ValueSlot,
};

/// Shape and admission settings of one embedding variable
#[derive(Debug, Clone)]
pub struct EmbeddingConfig<V> {
    /// Position of this variable inside each slot
    pub emb_index: usize,
    /// Number of variables sharing each slot
    pub slot_num: usize,
    /// Embedding width
    pub value_len: usize,
    /// Keys untouched for longer are dropped by `shrink` (<= 0 disables)
    pub steps_to_live: i64,
    /// Optional `0.5 * |v|^2` floor applied by `shrink`
    pub l2_weight_threshold: Option<f64>,
    /// Accesses needed before a key gets its own embedding (0 admits all)
    pub filter_freq: u64,
    /// `default_value_dim` rows of `value_len` initial values
    pub default_value: Vec<V>,
    pub default_value_dim: usize,
}

impl<V: EmbeddingValue> EmbeddingConfig<V> {
    /// Single-slot variable with a zero default row
    pub fn new(value_len: usize) -> Self {
        Self {
            emb_index: 0,
            slot_num: 1,
            value_len,
            steps_to_live: 0,
            l2_weight_threshold: None,
            filter_freq: 0,
            default_value: vec![V::default(); value_len],
            default_value_dim: 1,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.emb_index >= self.slot_num {
            return Err(Error::InvalidArgument(format!(
                "emb_index {} out of range for {} slots",
                self.emb_index, self.slot_num
            )));
        }
        if self.default_value_dim == 0
            || self.default_value.len() != self.default_value_dim * self.value_len
        {
            return Err(Error::InvalidArgument(format!(
                "default value table has {} elements, expected {} rows of {}",
                self.default_value.len(),
                self.default_value_dim,
                self.value_len
            )));
        }
        Ok(())
    }
}

/// Embedding variable backed by tiered storage
pub struct EmbeddingVar<K: EmbeddingKey, V: EmbeddingValue> {
    storage: Arc<TieredStorage<K, V>>,
    config: EmbeddingConfig<V>,
}

impl<K: EmbeddingKey, V: EmbeddingValue> EmbeddingVar<K, V> {
    /// Attach a variable to `storage`, fixing the slot layout on first use
    pub fn new(storage: Arc<TieredStorage<K, V>>, config: EmbeddingConfig<V>) -> Result<Self> {
        config.validate()?;
        let shared = storage.set_alloc_len(config.value_len, config.slot_num)?;
        if config.emb_index >= shared.slot_num || config.value_len > shared.alloc_len {
            return Err(Error::InvalidArgument(format!(
                "embedding {} of width {} does not fit the store's {} slots of {}",
                config.emb_index, config.value_len, shared.slot_num, shared.alloc_len
            )));
        }
        Ok(Self { storage, config })
    }

    /// Shared layout narrowed to this variable's width.
    ///
    /// Read on every access: a later variable may still widen the layout
    /// while the store is empty.
    fn layout(&self) -> Result<SlotLayout> {
        let shared = self.storage.layout().ok_or_else(|| {
            Error::Internal("slot layout vanished after set_alloc_len".into())
        })?;
        Ok(SlotLayout {
            value_len: self.config.value_len,
            ..shared
        })
    }

    pub fn storage(&self) -> &Arc<TieredStorage<K, V>> {
        &self.storage
    }

    pub fn config(&self) -> &EmbeddingConfig<V> {
        &self.config
    }

    pub fn value_len(&self) -> usize {
        self.config.value_len
    }

    /// Default row assigned to `key`
    pub fn default_value(&self, key: K) -> &[V] {
        let row = key
            .to_i64()
            .rem_euclid(self.config.default_value_dim as i64) as usize;
        let start = row * self.config.value_len;
        &self.config.default_value[start..start + self.config.value_len]
    }

    /// Fetch or create the slot of `key` and count `count` accesses.
    ///
    /// Returns the slot and whether the key passed the frequency filter.
    /// Admitted keys always have an initialized embedding.
    pub fn lookup_or_create_key(&self, key: K, count: u64) -> Result<(Arc<ValueSlot<V>>, bool)> {
        let slot = self.storage.get_or_create(key)?;
        let admitted = self.admit(key, &slot, count)?;
        Ok((slot, admitted))
    }

    /// Batch form of [`lookup_or_create_key`](Self::lookup_or_create_key).
    ///
    /// Every position counts one access unless `counts` is given.
    pub fn batch_lookup_or_create(
        &self,
        keys: &[K],
        counts: Option<&[u64]>,
    ) -> Result<Vec<(Arc<ValueSlot<V>>, bool)>> {
        if let Some(counts) = counts {
            if counts.len() != keys.len() {
                return Err(Error::InvalidArgument(format!(
                    "{} counts for {} keys",
                    counts.len(),
                    keys.len()
                )));
            }
        }
        let slots = self.storage.batch_get_or_create(keys)?;
        keys.iter()
            .zip(slots)
            .enumerate()
            .map(|(i, (&key, slot))| {
                let count = counts.map_or(1, |c| c[i]);
                let admitted = self.admit(key, &slot, count)?;
                Ok((slot, admitted))
            })
            .collect()
    }

    fn admit(&self, key: K, slot: &ValueSlot<V>, count: u64) -> Result<bool> {
        let freq = slot.add_freq(count);
        let admitted = self.config.filter_freq == 0 || freq >= self.config.filter_freq;
        if admitted && !slot.is_initialized(self.config.emb_index) {
            let layout = self.layout()?;
            let mut view = slot
                .embedding_mut(&layout, self.config.emb_index)
                .ok_or_else(|| {
                    Error::Internal(format!("slot of key {} has no buffer", key.to_i64()))
                })?;
            view.copy_from_slice(self.default_value(key));
            drop(view);
            slot.set_initialized(self.config.emb_index);
            debug!("Initialized embedding {} of key {:?}", self.config.emb_index, key);
        }
        Ok(admitted)
    }

    /// Current values of `key`, or its default row if it has none yet
    pub fn lookup(&self, key: K) -> Result<Vec<V>> {
        match self.storage.get(key) {
            Ok(found) if found.slot.is_initialized(self.config.emb_index) => found
                .slot
                .embedding(&self.layout()?, self.config.emb_index)
                .ok_or_else(|| {
                    Error::Internal(format!("slot of key {} has no buffer", key.to_i64()))
                }),
            Ok(_) => Ok(self.default_value(key).to_vec()),
            Err(e) if e.is_not_found() => Ok(self.default_value(key).to_vec()),
            Err(e) => Err(e),
        }
    }

    /// Stamp `slot` with the step that last touched it
    pub fn update_version(&self, slot: &ValueSlot<V>, global_step: i64) {
        slot.set_version(global_step);
    }

    /// Forward touched keys to the cache policy
    pub fn update_cache(&self, keys: &[K], counts: Option<&[u64]>) -> Result<()> {
        self.storage.update_cache(keys, counts)
    }

    /// Mutable view of this variable's embedding inside `slot`
    pub fn flat<'a>(&self, slot: &'a ValueSlot<V>) -> Result<MappedRwLockWriteGuard<'a, [V]>> {
        slot.embedding_mut(&self.layout()?, self.config.emb_index)
            .ok_or_else(|| Error::InvalidArgument("slot has no buffer for this layout".into()))
    }

    /// Drop keys that expired at `global_step` or fell under the L2 floor
    pub fn shrink(&self, global_step: i64) -> Result<usize> {
        let args = ShrinkArgs {
            global_step,
            steps_to_live: self.config.steps_to_live,
            l2_weight_threshold: self.config.l2_weight_threshold,
        };
        self.storage.shrink(&args)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use assert_matches::assert_matches;

    fn storage(dir: &std::path::Path) -> Arc<TieredStorage<i64, f32>> {
        let mut config = StorageConfig::default();
        config.name = "var".into();
        config.ssd.path = dir.to_path_buf();
        config.worker_threads = 2;
        config.pool.chunk_blocks = 16;
        Arc::new(TieredStorage::new(config).unwrap())
    }

    fn var_config(emb_index: usize) -> EmbeddingConfig<f32> {
        EmbeddingConfig {
            emb_index,
            slot_num: 2,
            value_len: 3,
            steps_to_live: 0,
            l2_weight_threshold: None,
            filter_freq: 0,
            default_value: vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0],
            default_value_dim: 2,
        }
    }

    #[test]
    fn test_new_key_gets_default_row() {
        let dir = tempfile::tempdir().unwrap();
        let var = EmbeddingVar::new(storage(dir.path()), var_config(0)).unwrap();

        let (slot, admitted) = var.lookup_or_create_key(5, 1).unwrap();
        assert!(admitted);
        assert_eq!(var.flat(&slot).unwrap().to_vec(), vec![2.0, 2.0, 2.0]);
        assert_eq!(var.lookup(4).unwrap(), vec![1.0, 1.0, 1.0]);
        assert_eq!(var.default_value(-1), &[2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_variables_share_slots() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(dir.path());
        let weights = EmbeddingVar::new(Arc::clone(&store), var_config(0)).unwrap();
        let accum = EmbeddingVar::new(Arc::clone(&store), var_config(1)).unwrap();

        let (slot, _) = weights.lookup_or_create_key(2, 1).unwrap();
        let (same, _) = accum.lookup_or_create_key(2, 1).unwrap();
        assert!(Arc::ptr_eq(&slot, &same));

        weights.flat(&slot).unwrap()[0] = 7.0;
        accum.flat(&same).unwrap()[0] = -7.0;
        assert_eq!(weights.lookup(2).unwrap(), vec![7.0, 1.0, 1.0]);
        assert_eq!(accum.lookup(2).unwrap(), vec![-7.0, 1.0, 1.0]);
        assert_eq!(slot.freq(), 2);
    }

    #[test]
    fn test_wider_variable_does_not_overlap_neighbours() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(dir.path());
        let narrow = EmbeddingVar::new(
            Arc::clone(&store),
            EmbeddingConfig {
                emb_index: 1,
                slot_num: 4,
                default_value: vec![1.0; 4],
                ..EmbeddingConfig::new(4)
            },
        )
        .unwrap();
        let wide = EmbeddingVar::new(
            Arc::clone(&store),
            EmbeddingConfig {
                slot_num: 2,
                ..EmbeddingConfig::new(8)
            },
        )
        .unwrap();
        let layout = store.layout().unwrap();
        assert_eq!((layout.alloc_len, layout.slot_num), (8, 4));

        let (slot, _) = narrow.lookup_or_create_key(7, 1).unwrap();
        let (same, _) = wide.lookup_or_create_key(7, 1).unwrap();
        assert!(Arc::ptr_eq(&slot, &same));
        wide.flat(&same).unwrap().fill(9.0);

        assert_eq!(narrow.lookup(7).unwrap(), vec![1.0; 4]);
        assert_eq!(wide.lookup(7).unwrap(), vec![9.0; 8]);

        // Keys exist now, so the layout can no longer grow
        assert_matches!(
            EmbeddingVar::new(Arc::clone(&store), EmbeddingConfig::new(16)).err(),
            Some(Error::InvalidArgument(_))
        );
        assert_eq!(narrow.lookup(7).unwrap(), vec![1.0; 4]);
    }

    #[test]
    fn test_frequency_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = var_config(0);
        config.filter_freq = 3;
        let var = EmbeddingVar::new(storage(dir.path()), config).unwrap();

        let (slot, admitted) = var.lookup_or_create_key(1, 2).unwrap();
        assert!(!admitted);
        assert!(!slot.is_initialized(0));
        var.flat(&slot).unwrap()[0] = 9.0;
        assert_eq!(var.lookup(1).unwrap(), vec![2.0, 2.0, 2.0]);

        let (_, admitted) = var.lookup_or_create_key(1, 1).unwrap();
        assert!(admitted);
        assert_eq!(var.lookup(1).unwrap(), vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_batch_lookup_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = var_config(0);
        config.filter_freq = 2;
        let var = EmbeddingVar::new(storage(dir.path()), config).unwrap();

        let out = var.batch_lookup_or_create(&[3, 4, 3], None).unwrap();
        assert_eq!(
            out.iter().map(|(_, admitted)| *admitted).collect::<Vec<_>>(),
            vec![false, false, true]
        );
        assert!(Arc::ptr_eq(&out[0].0, &out[2].0));

        let out = var.batch_lookup_or_create(&[4], Some(&[5])).unwrap();
        assert!(out[0].1);
        assert_eq!(out[0].0.freq(), 6);
        assert_matches!(
            var.batch_lookup_or_create(&[1, 2], Some(&[1])),
            Err(Error::InvalidArgument(_))
        );
    }

    #[test]
    fn test_shrink_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = var_config(0);
        config.steps_to_live = 5;
        let var = EmbeddingVar::new(storage(dir.path()), config).unwrap();

        let (old, _) = var.lookup_or_create_key(1, 1).unwrap();
        var.update_version(&old, 1);
        let (fresh, _) = var.lookup_or_create_key(2, 1).unwrap();
        var.update_version(&fresh, 9);
        drop((old, fresh));

        assert_eq!(var.shrink(10).unwrap(), 1);
        assert_eq!(var.storage().lookup_tier(1), None);
        assert!(var.storage().lookup_tier(2).is_some());
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = var_config(2);
        assert_matches!(
            EmbeddingVar::new(storage(dir.path()), config.clone()).err(),
            Some(Error::InvalidArgument(_))
        );
        config.emb_index = 0;
        config.default_value.pop();
        assert_matches!(
            EmbeddingVar::new(storage(dir.path()), config).err(),
            Some(Error::InvalidArgument(_))
        );
    }
}
