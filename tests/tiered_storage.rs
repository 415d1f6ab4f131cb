//! Tiered Storage Integration Tests
//!
//! End-to-end behaviour of the HBM/DRAM/SSD store:
//! - Tier placement and cross-tier moves
//! - Eviction and background demotion
//! - Concurrent access
//! - Shrink and snapshots

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use embstore::{
    CacheStrategy, CompactionMode, CopyBack, EmbeddingConfig, EmbeddingVar, ShrinkArgs,
    SsdIoScheme, StorageConfig, TierKind, TieredStorage,
};

const VALUE_LEN: usize = 4;

fn config(dir: &Path, hbm_keys: u64, dram_keys: u64) -> StorageConfig {
    let mut config = StorageConfig::default();
    config.name = "it".into();
    config.ssd.path = dir.to_path_buf();
    config.worker_threads = 4;
    config.shard_granularity = 8;
    config.pool.chunk_blocks = 16;
    config.cache_strategy = CacheStrategy::Lru;
    let slot_bytes = (VALUE_LEN * std::mem::size_of::<f32>()) as u64;
    config.hbm_capacity_bytes = hbm_keys * slot_bytes;
    config.dram_capacity_bytes = dram_keys * slot_bytes;
    config
}

fn open_with(config: StorageConfig) -> TieredStorage<i64, f32> {
    let storage = TieredStorage::new(config).unwrap();
    storage.set_alloc_len(VALUE_LEN, 1).unwrap();
    storage
}

fn open(dir: &Path, hbm_keys: u64, dram_keys: u64) -> TieredStorage<i64, f32> {
    open_with(config(dir, hbm_keys, dram_keys))
}

/// Create `key` in HBM holding `key` in every element
fn create(storage: &TieredStorage<i64, f32>, key: i64) {
    let slot = storage.get_or_create(key).unwrap();
    assert!(slot.copy_from_slice(&[key as f32; VALUE_LEN]));
    slot.set_version(key);
}

/// Key -> tiers it appears in
fn residency(storage: &TieredStorage<i64, f32>) -> HashMap<i64, Vec<TierKind>> {
    let mut out: HashMap<i64, Vec<TierKind>> = HashMap::new();
    for (tier, entry) in storage.snapshot().unwrap().iter() {
        out.entry(entry.key).or_default().push(tier);
    }
    out
}

// =============================================================================
// Tier Placement Tests
// =============================================================================

mod placement_tests {
    use super::*;

    #[test]
    fn test_keys_live_in_exactly_one_tier() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 4, 4);
        for key in 0..12 {
            create(&storage, key);
        }

        assert_eq!(storage.batch_eviction().unwrap(), 8);
        storage.flush_background();

        assert_eq!(storage.size_at_level(0), Some(4));
        assert_eq!(storage.size_at_level(1), Some(4));
        assert_eq!(storage.size_at_level(2), Some(4));
        assert_eq!(storage.size_at_level(3), None);
        assert_eq!(storage.size(), 12);

        for key in 0..4 {
            assert_eq!(storage.lookup_tier(key), Some(TierKind::Ssd));
        }
        for key in 4..8 {
            assert_eq!(storage.lookup_tier(key), Some(TierKind::Dram));
        }
        for key in 8..12 {
            assert_eq!(storage.lookup_tier(key), Some(TierKind::Hbm));
        }

        let placed = residency(&storage);
        assert_eq!(placed.len(), 12);
        assert!(placed.values().all(|tiers| tiers.len() == 1));
    }

    #[test]
    fn test_promotion_round_trip_from_ssd() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 4, 4);
        for key in 0..12 {
            create(&storage, key);
        }
        storage.batch_eviction().unwrap();
        storage.flush_background();

        let peek = storage.get(1).unwrap();
        assert_eq!(peek.tier, TierKind::Ssd);
        assert_eq!(peek.copyback, CopyBack::CopybackAndDestroy);
        assert_eq!(storage.lookup_tier(1), Some(TierKind::Ssd));

        let slot = storage.get_or_create(1).unwrap();
        assert_eq!(slot.to_vec().unwrap(), vec![1.0; VALUE_LEN]);
        assert_eq!(slot.version(), 1);
        assert_eq!(storage.lookup_tier(1), Some(TierKind::Hbm));
        assert_eq!(storage.size_of(TierKind::Ssd), 3);

        let lookup = storage.get(1).unwrap();
        assert_eq!(lookup.copyback, CopyBack::NotCopyback);
        assert!(Arc::ptr_eq(&lookup.slot, &slot));
        assert_eq!(storage.metrics().promotions_ssd_to_hbm, 1);
    }

    #[test]
    fn test_batch_promotes_from_every_tier() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 4, 4);
        for key in 0..12 {
            create(&storage, key);
        }
        storage.batch_eviction().unwrap();
        storage.flush_background();

        let keys = [0, 5, 9, 100, 5];
        let slots = storage.batch_get_or_create(&keys).unwrap();
        assert_eq!(slots[0].to_vec().unwrap(), vec![0.0; VALUE_LEN]);
        assert_eq!(slots[1].to_vec().unwrap(), vec![5.0; VALUE_LEN]);
        assert_eq!(slots[2].to_vec().unwrap(), vec![9.0; VALUE_LEN]);
        assert!(Arc::ptr_eq(&slots[1], &slots[4]));
        for key in keys {
            assert_eq!(storage.lookup_tier(key), Some(TierKind::Hbm));
        }
        assert!(residency(&storage).values().all(|tiers| tiers.len() == 1));
    }

    #[test]
    fn test_io_schemes_serve_promotions() {
        for scheme in [
            SsdIoScheme::Buffered,
            SsdIoScheme::Mmap,
            SsdIoScheme::MmapAndMadvise,
            SsdIoScheme::DirectIo,
        ] {
            let dir = tempfile::tempdir().unwrap();
            let mut config = config(dir.path(), 2, 2);
            config.ssd.io_scheme = scheme;
            config.ssd.segment_size_bytes = 4096;
            let storage = open_with(config);
            for key in 0..64 {
                create(&storage, key);
                storage.batch_eviction().unwrap();
            }
            storage.flush_background();
            assert!(storage.size_of(TierKind::Ssd) > 0, "{}", scheme);

            for key in 0..64 {
                let slot = storage.get_or_create(key).unwrap();
                assert_eq!(slot.to_vec().unwrap(), vec![key as f32; VALUE_LEN], "{}", scheme);
            }
        }
    }
}

// =============================================================================
// Eviction Tests
// =============================================================================

mod eviction_tests {
    use super::*;

    #[test]
    fn test_eviction_moves_at_most_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3, 0);
        config.eviction_batch_size = 2;
        let storage = open_with(config);

        // DRAM already five keys over its capacity
        for key in 100..105 {
            let slot = embstore::ValueSlot::from_values(&[key as f32; VALUE_LEN]);
            storage.insert_to_dram(key, &slot).unwrap();
        }
        for key in 0..8 {
            create(&storage, key);
        }

        let mut moved_to_dram = Vec::new();
        let mut ssd_sizes = Vec::new();
        loop {
            let n = storage.batch_eviction().unwrap();
            storage.flush_background();
            if n == 0 {
                break;
            }
            moved_to_dram.push(n);
            ssd_sizes.push(storage.size_of(TierKind::Ssd));
        }

        assert_eq!(moved_to_dram, vec![2, 2, 1]);
        // Each DRAM stage is over by more than the cap and spills exactly two
        assert_eq!(ssd_sizes, vec![2, 4, 6]);
        assert_eq!(storage.size_of(TierKind::Hbm), 3);
        assert_eq!(storage.size_of(TierKind::Dram), 4);
        assert_eq!(storage.size(), 13);
    }

    #[test]
    fn test_eviction_exactly_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 5, 100);
        for key in 0..5 {
            create(&storage, key);
        }
        assert_eq!(storage.batch_eviction().unwrap(), 0);

        create(&storage, 5);
        assert_eq!(storage.batch_eviction().unwrap(), 1);
        assert_eq!(storage.size_of(TierKind::Hbm), 5);
        assert_eq!(storage.lookup_tier(0), Some(TierKind::Dram));

        storage.update_cache(&[1], None).unwrap();
        create(&storage, 6);
        assert_eq!(storage.batch_eviction().unwrap(), 1);
        assert_eq!(storage.lookup_tier(1), Some(TierKind::Hbm));
        assert_eq!(storage.lookup_tier(2), Some(TierKind::Dram));
        assert_eq!(storage.cached_ids(100).len(), 5);
    }

    #[test]
    fn test_background_demotion_to_ssd() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 2, 2);
        for key in 0..6 {
            create(&storage, key);
        }

        storage.schedule_eviction();
        storage.flush_background();

        assert_eq!(storage.size_of(TierKind::Hbm), 2);
        assert_eq!(storage.size_of(TierKind::Dram), 2);
        assert_eq!(storage.size_of(TierKind::Ssd), 2);
        assert_eq!(storage.lookup_tier(0), Some(TierKind::Ssd));
        assert_eq!(storage.lookup_tier(1), Some(TierKind::Ssd));

        let m = storage.metrics();
        assert_eq!(m.demotions_hbm_to_dram, 4);
        assert_eq!(m.demotions_dram_to_ssd, 2);
        assert_eq!(m.ssd_keys, 2);
    }

    #[test]
    fn test_periodic_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 3, 100);
        config.eviction_interval_ms = Some(5);
        let storage = open_with(config);
        for key in 0..10 {
            create(&storage, key);
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while storage.size_of(TierKind::Hbm) > 3 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(storage.size_of(TierKind::Hbm), 3);
        assert_eq!(storage.size_of(TierKind::Dram), 7);
    }

    #[test]
    fn test_async_compaction_keeps_latest_values() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 1, 1);
        config.ssd.compaction = CompactionMode::Async;
        config.ssd.segment_size_bytes = 4096;
        let storage = open_with(config);

        for round in 0..4 {
            for key in 0..40 {
                let slot = storage.get_or_create(key).unwrap();
                slot.copy_from_slice(&[(round * 100 + key) as f32; VALUE_LEN]);
                storage.batch_eviction().unwrap();
            }
            storage.flush_background();
        }

        for key in 0..40 {
            let lookup = storage.get(key).unwrap();
            assert_eq!(
                lookup.slot.to_vec().unwrap(),
                vec![(300 + key) as f32; VALUE_LEN]
            );
        }
        assert!(storage.ssd_stats().compactions > 0);
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_get_or_create_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open(dir.path(), 1024, 1024));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    storage.get_or_create(42).unwrap()
                })
            })
            .collect();
        let slots: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(slots.iter().all(|s| Arc::ptr_eq(s, &slots[0])));
        assert_eq!(storage.size_of(TierKind::Hbm), 1);
        drop(slots);

        storage.batch_eviction().unwrap();
        assert_eq!(storage.pool_stats().in_use_blocks, 1);
        assert_eq!(storage.cached_ids(10).ids, vec![42]);
    }

    #[test]
    fn test_concurrent_batches_share_slots() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open(dir.path(), 1024, 1024));
        let keys: Vec<i64> = (0..200).collect();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let storage = Arc::clone(&storage);
                let mut keys = keys.clone();
                keys.rotate_left(i * 37);
                thread::spawn(move || {
                    let slots = storage.batch_get_or_create(&keys).unwrap();
                    keys.into_iter().zip(slots).collect::<HashMap<_, _>>()
                })
            })
            .collect();
        let maps: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for key in &keys {
            let first = &maps[0][key];
            assert!(maps.iter().all(|m| Arc::ptr_eq(&m[key], first)));
        }
        assert_eq!(storage.size_of(TierKind::Hbm), 200);
        drop(maps);

        storage.batch_eviction().unwrap();
        assert_eq!(storage.pool_stats().in_use_blocks, 200);
    }

    #[test]
    fn test_remove_racing_lookups() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open(dir.path(), 8, 8));
        let barrier = Arc::new(Barrier::new(6));

        let mut handles = Vec::new();
        for worker in 0..4i64 {
            let storage = Arc::clone(&storage);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..500i64 {
                    let key = (i * 7 + worker) % 32;
                    if let Ok(slot) = storage.get_or_create(key) {
                        slot.copy_from_slice(&[key as f32; VALUE_LEN]);
                    }
                    if let Ok(lookup) = storage.get(key) {
                        // Slots stay readable after concurrent removal
                        let _ = lookup.slot.to_vec();
                    }
                }
            }));
        }
        {
            let storage = Arc::clone(&storage);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..500i64 {
                    storage.remove(i % 32);
                }
            }));
        }
        {
            let storage = Arc::clone(&storage);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    let _ = storage.batch_eviction();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        storage.flush_background();
        assert!(residency(&storage).values().all(|tiers| tiers.len() == 1));
        for (_, entry) in storage.snapshot().unwrap().iter() {
            assert!(entry.values.iter().all(|v| *v == 0.0 || *v == entry.key as f32));
        }
    }
}

// =============================================================================
// Shrink and Snapshot Tests
// =============================================================================

mod maintenance_tests {
    use super::*;

    #[test]
    fn test_shrink_by_step_across_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 1, 1);
        for (key, version) in [(1, 1), (2, 2), (3, 10)] {
            let slot = storage.get_or_create(key).unwrap();
            slot.set_version(version);
        }
        storage.batch_eviction().unwrap();
        storage.flush_background();
        assert_eq!(storage.lookup_tier(1), Some(TierKind::Ssd));
        assert_eq!(storage.lookup_tier(2), Some(TierKind::Dram));
        assert_eq!(storage.lookup_tier(3), Some(TierKind::Hbm));

        let unstamped = embstore::ValueSlot::from_values(&[1.0f32; VALUE_LEN]);
        storage.insert_to_dram(4, &unstamped).unwrap();

        let args = ShrinkArgs {
            global_step: 10,
            steps_to_live: 5,
            l2_weight_threshold: None,
        };
        assert_eq!(storage.shrink(&args).unwrap(), 2);
        assert_eq!(storage.lookup_tier(1), None);
        assert_eq!(storage.lookup_tier(2), None);
        assert_eq!(storage.size(), 2);
        assert_eq!(storage.get(4).unwrap().slot.version(), 10);
    }

    #[test]
    fn test_shrink_by_l2_weight() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 10, 10);
        let small = storage.get_or_create(1).unwrap();
        small.copy_from_slice(&[0.1; VALUE_LEN]);
        let large = storage.get_or_create(2).unwrap();
        large.copy_from_slice(&[1.0; VALUE_LEN]);
        drop((small, large));

        let args = ShrinkArgs {
            global_step: 0,
            steps_to_live: 0,
            l2_weight_threshold: Some(0.5),
        };
        assert_eq!(storage.shrink(&args).unwrap(), 1);
        assert_eq!(storage.lookup_tier(1), None);
        assert_eq!(storage.lookup_tier(2), Some(TierKind::Hbm));
        assert_eq!(storage.cached_ids(10).ids, vec![2]);
    }

    #[test]
    fn test_snapshot_covers_all_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(dir.path(), 2, 2);
        for key in 0..6 {
            create(&storage, key);
        }
        storage.batch_eviction().unwrap();
        storage.flush_background();

        let snapshot = storage.snapshot().unwrap();
        assert_eq!(snapshot.len(), 6);
        assert_eq!(snapshot.hbm.len(), 2);
        assert_eq!(snapshot.dram.len(), 2);
        assert_eq!(snapshot.ssd.len(), 2);
        for (_, entry) in snapshot.iter() {
            assert_eq!(entry.values, vec![entry.key as f32; VALUE_LEN]);
            assert_eq!(entry.version, entry.key);
        }
    }
}

// =============================================================================
// Embedding Variable Tests
// =============================================================================

mod embedding_tests {
    use super::*;

    #[test]
    fn test_embedding_survives_tier_moves() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open(dir.path(), 2, 2));
        let mut var_config = EmbeddingConfig::new(VALUE_LEN);
        var_config.default_value = vec![0.5; VALUE_LEN];
        let var = EmbeddingVar::new(Arc::clone(&storage), var_config).unwrap();

        for key in 0..8 {
            let (slot, admitted) = var.lookup_or_create_key(key, 1).unwrap();
            assert!(admitted);
            var.flat(&slot).unwrap()[0] = key as f32;
            var.update_version(&slot, 1);
        }
        var.update_cache(&(0..8).collect::<Vec<_>>(), None).unwrap();
        storage.schedule_eviction();
        storage.flush_background();
        assert!(storage.size_of(TierKind::Ssd) > 0);

        for key in 0..8 {
            assert_eq!(var.lookup(key).unwrap(), vec![key as f32, 0.5, 0.5, 0.5]);
        }
        assert_eq!(var.lookup(99).unwrap(), vec![0.5; VALUE_LEN]);
    }
}
