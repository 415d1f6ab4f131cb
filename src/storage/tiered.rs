//! Tiered Storage Orchestrator
//!
//! Routes every lookup through HBM → DRAM → SSD and keeps keys flowing
//! between the tiers:
//!
//! - Hits in a slower tier are copied back into HBM (promotion)
//! - Misses everywhere mint a fresh HBM slot from the memory pool
//! - Batch eviction moves the coldest HBM keys into DRAM, and a second stage
//!   on the eviction thread spills the coldest DRAM keys to SSD
//!
//! Every move is insert-into-destination then remove-from-source, and the
//! source removal only happens if the source still holds the copy that was
//! moved.

use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::dram::DramStore;
use super::eviction::{EvictionHandler, EvictionManager, EvictionScheduler, EvictionTask};
use super::hbm::HbmStore;
use super::metrics::{LatencyTracker, MetricsSnapshot, StorageMetrics};
use super::policy::{CachePolicy, CachedIds, LruCache};
use super::pool::{MemoryPool, MemoryPoolConfig, MemoryPoolStats};
use super::slot::{SlotLayout, ValueSlot};
use super::ssd::{RecordLocation, SsdStats, SsdStore};
use super::tier::{ShrinkArgs, SnapshotEntry, TierStore};
use super::types::{CopyBack, EmbeddingKey, EmbeddingValue, TierKind};
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Result of a flag-returning lookup
#[derive(Debug, Clone)]
pub struct Lookup<V> {
    pub slot: Arc<ValueSlot<V>>,
    pub tier: TierKind,
    pub copyback: CopyBack,
}

/// Contents of every tier at one point in time
#[derive(Debug, Clone, Default)]
pub struct Snapshot<K, V> {
    pub hbm: Vec<SnapshotEntry<K, V>>,
    pub dram: Vec<SnapshotEntry<K, V>>,
    pub ssd: Vec<SnapshotEntry<K, V>>,
}

impl<K, V> Snapshot<K, V> {
    pub fn len(&self) -> usize {
        self.hbm.len() + self.dram.len() + self.ssd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries of all tiers, fastest tier first
    pub fn iter(&self) -> impl Iterator<Item = (TierKind, &SnapshotEntry<K, V>)> {
        self.hbm
            .iter()
            .map(|e| (TierKind::Hbm, e))
            .chain(self.dram.iter().map(|e| (TierKind::Dram, e)))
            .chain(self.ssd.iter().map(|e| (TierKind::Ssd, e)))
    }
}

/// Where a probe found a key
enum Source {
    Hbm,
    Dram,
    Ssd(RecordLocation),
}

impl Source {
    fn tier(&self) -> TierKind {
        match self {
            Source::Hbm => TierKind::Hbm,
            Source::Dram => TierKind::Dram,
            Source::Ssd(_) => TierKind::Ssd,
        }
    }
}

struct Hit<V> {
    slot: Arc<ValueSlot<V>>,
    source: Source,
}

/// Per-shard outcome of a batch probe; positions are shard-relative
struct ShardScan<K, V> {
    found: Vec<Option<Arc<ValueSlot<V>>>>,
    copybacks: Vec<(usize, K, Hit<V>)>,
    missing: Vec<(usize, K)>,
}

struct TieredInner<K: EmbeddingKey, V: EmbeddingValue> {
    config: StorageConfig,
    hbm: HbmStore<K, V>,
    dram: DramStore<K, V>,
    ssd: SsdStore<K, V>,
    cache: Box<dyn CachePolicy<K>>,
    dram_cache: LruCache<K>,
    layout: Mutex<Option<SlotLayout>>,
    ready: AtomicBool,
    total_dims: AtomicUsize,
    hbm_capacity: AtomicUsize,
    dram_capacity: AtomicUsize,
    workers: rayon::ThreadPool,
    metrics: Arc<StorageMetrics>,
    scheduler: OnceLock<EvictionScheduler<K>>,
}

/// Three-tier embedding store
pub struct TieredStorage<K: EmbeddingKey, V: EmbeddingValue> {
    // Joined before the tiers are torn down
    eviction: EvictionManager<K>,
    inner: Arc<TieredInner<K, V>>,
}

impl<K: EmbeddingKey, V: EmbeddingValue> TieredStorage<K, V> {
    /// Build the tiers, the worker pool and the eviction thread
    pub fn new(config: StorageConfig) -> Result<Self> {
        config.validate()?;

        let pool = Arc::new(MemoryPool::new(MemoryPoolConfig::from(&config.pool)));
        let ssd = SsdStore::open(
            &config.name,
            config.ssd.path.join(&config.name),
            config.ssd.clone(),
        )?;

        let threads = config.resolved_worker_threads();
        let prefix = config.name.clone();
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{}-worker-{}", prefix, i))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build worker pool: {}", e)))?;

        info!(
            "Creating tiered storage {} ({} policy, {} workers, HBM {} bytes, DRAM {} bytes)",
            config.name,
            config.cache_strategy,
            threads,
            config.hbm_capacity_bytes,
            config.dram_capacity_bytes
        );

        let inner = Arc::new(TieredInner {
            hbm: HbmStore::new(pool),
            dram: DramStore::new(),
            ssd,
            cache: config.cache_strategy.build(),
            dram_cache: LruCache::new(),
            layout: Mutex::new(None),
            ready: AtomicBool::new(false),
            total_dims: AtomicUsize::new(0),
            hbm_capacity: AtomicUsize::new(0),
            dram_capacity: AtomicUsize::new(0),
            workers,
            metrics: Arc::new(StorageMetrics::new()),
            scheduler: OnceLock::new(),
            config,
        });

        let handler: Weak<TieredInner<K, V>> = Arc::downgrade(&inner);
        let handler: Weak<dyn EvictionHandler<K>> = handler;
        let interval = inner.config.eviction_interval_ms.map(Duration::from_millis);
        let eviction = EvictionManager::start(&inner.config.name, handler, interval)?;
        if let Some(scheduler) = eviction.scheduler() {
            let _ = inner.scheduler.set(scheduler);
        }

        Ok(Self { eviction, inner })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Fix the slot layout and derive the tier capacities from it.
    ///
    /// A layout that fits within the current one is a no-op. Otherwise the
    /// layout grows to cover both, which is only accepted while the store
    /// holds no keys and no HBM buffer is in use.
    pub fn set_alloc_len(&self, value_len: usize, slot_num: usize) -> Result<SlotLayout> {
        self.inner.set_alloc_len(value_len, slot_num)
    }

    /// Current layout, if set
    pub fn layout(&self) -> Option<SlotLayout> {
        *self.inner.layout.lock()
    }

    /// Key capacity of `tier` derived from its byte budget (SSD is unbounded)
    pub fn capacity(&self, tier: TierKind) -> Option<usize> {
        match tier {
            TierKind::Hbm => Some(self.inner.hbm_capacity.load(Ordering::Acquire)),
            TierKind::Dram => Some(self.inner.dram_capacity.load(Ordering::Acquire)),
            TierKind::Ssd => None,
        }
    }

    /// Probe HBM → DRAM → SSD without side effects
    pub fn get(&self, key: K) -> Result<Lookup<V>> {
        match self.inner.probe(key)? {
            Some(hit) => {
                let tier = hit.source.tier();
                self.inner.metrics.record_hit(tier);
                Ok(Lookup {
                    slot: hit.slot,
                    tier,
                    copyback: tier.copyback(),
                })
            }
            None => {
                self.inner.metrics.record_miss();
                Err(Error::NotFound { key: key.to_i64() })
            }
        }
    }

    /// Fetch the HBM slot of `key`, promoting or creating it as needed
    pub fn get_or_create(&self, key: K) -> Result<Arc<ValueSlot<V>>> {
        self.inner.require_layout()?;
        match self.inner.probe(key)? {
            Some(Hit {
                slot,
                source: Source::Hbm,
            }) => {
                self.inner.metrics.record_hit(TierKind::Hbm);
                Ok(slot)
            }
            Some(hit) => {
                self.inner.metrics.record_hit(hit.source.tier());
                let mut promoted = self.inner.copy_embeddings_to_hbm(vec![(key, hit)])?;
                promoted
                    .pop()
                    .ok_or_else(|| Error::Internal("promotion returned no slot".into()))
            }
            None => {
                self.inner.metrics.record_miss();
                let mut created = self.inner.create_in_hbm(&[key])?;
                created
                    .pop()
                    .ok_or_else(|| Error::Internal("creation returned no slot".into()))
            }
        }
    }

    /// Like [`get`](Self::get), but a total miss creates the key in HBM.
    ///
    /// Slower-tier hits are returned with their copy-back flag and left where
    /// they are.
    pub fn get_or_create_flagged(&self, key: K) -> Result<Lookup<V>> {
        match self.get(key) {
            Ok(lookup) => Ok(lookup),
            Err(e) if e.is_not_found() => {
                self.inner.require_layout()?;
                let mut created = self.inner.create_in_hbm(&[key])?;
                let slot = created
                    .pop()
                    .ok_or_else(|| Error::Internal("creation returned no slot".into()))?;
                Ok(Lookup {
                    slot,
                    tier: TierKind::Hbm,
                    copyback: CopyBack::NotCopyback,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Look up many keys; slower-tier hits are promoted, misses stay `None`
    pub fn batch_get(&self, keys: &[K]) -> Result<Vec<Option<Arc<ValueSlot<V>>>>> {
        self.inner.batch_lookup(keys, false)
    }

    /// Look up many keys, promoting slower-tier hits and creating misses
    pub fn batch_get_or_create(&self, keys: &[K]) -> Result<Vec<Arc<ValueSlot<V>>>> {
        self.inner
            .batch_lookup(keys, true)?
            .into_iter()
            .zip(keys)
            .map(|(slot, key)| {
                slot.ok_or_else(|| {
                    Error::Internal(format!("no slot produced for key {}", key.to_i64()))
                })
            })
            .collect()
    }

    /// Promote DRAM-resident keys into HBM; returns how many moved
    pub fn import_to_hbm(&self, keys: &[K]) -> Result<usize> {
        self.inner.require_layout()?;
        let mut hits = Vec::new();
        let mut seen = HashSet::new();
        for &key in keys {
            if !seen.insert(key) || self.inner.hbm.contains(key) {
                continue;
            }
            if let Ok(slot) = self.inner.dram.get(key) {
                hits.push((
                    key,
                    Hit {
                        slot,
                        source: Source::Dram,
                    },
                ));
            }
        }
        let n = hits.len();
        self.inner.copy_embeddings_to_hbm(hits)?;
        Ok(n)
    }

    /// Place a copy of `slot` in HBM, replacing any resident copy
    pub fn insert(&self, key: K, slot: &ValueSlot<V>) -> Result<()> {
        self.inner.require_layout()?;
        self.inner.hbm.commit(key, slot)?;
        self.inner.cache.add_to_cache(&[key]);
        if self.inner.dram.remove(key) {
            self.inner.dram_cache.remove(&[key]);
        }
        self.inner.ssd.remove(key);
        Ok(())
    }

    /// Place a copy of `slot` in DRAM, replacing any resident copy
    pub fn insert_to_dram(&self, key: K, slot: &ValueSlot<V>) -> Result<()> {
        self.inner.dram.commit(key, slot)?;
        self.inner.dram_cache.add_to_cache(&[key]);
        if self.inner.hbm.remove(key) {
            self.inner.cache.remove(&[key]);
        }
        self.inner.ssd.remove(key);
        Ok(())
    }

    /// Drop `key` from every tier and tracker
    pub fn remove(&self, key: K) {
        let inner = &self.inner;
        if inner.hbm.remove(key) {
            inner.cache.remove(&[key]);
        }
        if inner.dram.remove(key) {
            inner.dram_cache.remove(&[key]);
        }
        inner.ssd.remove(key);
    }

    /// Total keys across all tiers
    pub fn size(&self) -> usize {
        TierKind::ALL.iter().map(|t| self.size_of(*t)).sum()
    }

    pub fn size_of(&self, tier: TierKind) -> usize {
        match tier {
            TierKind::Hbm => self.inner.hbm.size(),
            TierKind::Dram => self.inner.dram.size(),
            TierKind::Ssd => self.inner.ssd.size(),
        }
    }

    /// Key count of tier `level` (0 = HBM, 1 = DRAM, 2 = SSD)
    pub fn size_at_level(&self, level: usize) -> Option<usize> {
        TierKind::from_level(level).map(|tier| self.size_of(tier))
    }

    /// Fastest tier holding `key`
    pub fn lookup_tier(&self, key: K) -> Option<TierKind> {
        let inner = &self.inner;
        if inner.hbm.contains(key) {
            Some(TierKind::Hbm)
        } else if inner.dram.contains(key) {
            Some(TierKind::Dram)
        } else if inner.ssd.contains(key) {
            Some(TierKind::Ssd)
        } else {
            None
        }
    }

    /// Remove expired or negligible keys from every tier
    pub fn shrink(&self, args: &ShrinkArgs) -> Result<usize> {
        self.inner.shrink(args)
    }

    /// Capture all tiers, one tier at a time
    pub fn snapshot(&self) -> Result<Snapshot<K, V>> {
        let inner = &self.inner;
        let hbm = {
            let _guard = inner.hbm.structure_lock().lock();
            inner.hbm.snapshot()?
        };
        let dram = {
            let _guard = inner.dram.structure_lock().lock();
            inner.dram.snapshot()?
        };
        let ssd = {
            let _guard = inner.ssd.structure_lock().lock();
            inner.ssd.snapshot()?
        };
        Ok(Snapshot { hbm, dram, ssd })
    }

    /// Record accesses with the HBM cache policy; keys not in HBM are skipped
    pub fn update_cache(&self, keys: &[K], counts: Option<&[u64]>) -> Result<()> {
        let hbm = &self.inner.hbm;
        match counts {
            Some(counts) if counts.len() != keys.len() => Err(Error::InvalidArgument(format!(
                "{} counts supplied for {} keys",
                counts.len(),
                keys.len()
            ))),
            Some(counts) => {
                let (resident, counts): (Vec<K>, Vec<u64>) = keys
                    .iter()
                    .zip(counts)
                    .filter(|(key, _)| hbm.contains(**key))
                    .map(|(&key, &count)| (key, count))
                    .unzip();
                self.inner.cache.update_with_counts(&resident, &counts);
                Ok(())
            }
            None => {
                let resident: Vec<K> =
                    keys.iter().copied().filter(|&key| hbm.contains(key)).collect();
                self.inner.cache.update(&resident);
                Ok(())
            }
        }
    }

    /// Record keys about to be looked up
    pub fn add_to_prefetch_list(&self, keys: &[K]) {
        self.inner.cache.add_to_prefetch_list(keys);
    }

    /// HBM residents, most valuable first
    pub fn cached_ids(&self, capacity: usize) -> CachedIds<K> {
        self.inner.cache.get_cached_ids(capacity)
    }

    /// Run one HBM eviction pass on the calling thread
    pub fn batch_eviction(&self) -> Result<usize> {
        self.inner.batch_eviction()
    }

    /// Queue an HBM eviction pass on the eviction thread
    pub fn schedule_eviction(&self) {
        self.eviction.schedule(EvictionTask::Evict);
    }

    /// Wait for queued eviction and compaction work to finish
    pub fn flush_background(&self) {
        // Evict passes queue their DemoteDram behind the first flush
        self.eviction.flush();
        self.eviction.flush();
        self.inner.ssd.wait_for_compaction();
    }

    /// Metrics with current tier sizes
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.update_tier_sizes(
            self.size_of(TierKind::Hbm),
            self.size_of(TierKind::Dram),
            self.size_of(TierKind::Ssd),
        );
        self.inner.metrics.snapshot()
    }

    pub fn pool_stats(&self) -> MemoryPoolStats {
        self.inner.hbm.pool().stats()
    }

    pub fn ssd_stats(&self) -> SsdStats {
        self.inner.ssd.stats()
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> TieredInner<K, V> {
    fn set_alloc_len(&self, value_len: usize, slot_num: usize) -> Result<SlotLayout> {
        let mut requested = SlotLayout::new::<V>(value_len, slot_num)?;
        let mut current = self.layout.lock();
        if let Some(existing) = *current {
            if requested.fits_within(&existing) {
                return Ok(existing);
            }
            requested = existing.merge(&requested);
            // Stored slots and SSD records keep the old width
            let keys = self.hbm.size() + self.dram.size() + self.ssd.size();
            let in_use = self.hbm.pool().stats().in_use_blocks;
            if keys > 0 || in_use > 0 {
                return Err(Error::InvalidArgument(format!(
                    "cannot grow slots from {} x {} to {} x {} with {} keys stored and {} HBM buffers in use",
                    existing.slot_num,
                    existing.alloc_len,
                    requested.slot_num,
                    requested.alloc_len,
                    keys,
                    in_use
                )));
            }
        }

        let slot_bytes = requested.slot_bytes::<V>().max(1);
        let hbm_capacity = (self.config.hbm_capacity_bytes / slot_bytes) as usize;
        let dram_capacity = (self.config.dram_capacity_bytes / slot_bytes) as usize;

        self.hbm.pool().set_block_len(requested.total_dims)?;
        self.ssd.set_total_dims(requested.total_dims);
        self.total_dims
            .store(requested.total_dims, Ordering::Release);
        self.hbm_capacity.store(hbm_capacity, Ordering::Release);
        self.dram_capacity.store(dram_capacity, Ordering::Release);
        *current = Some(requested);
        self.ready.store(true, Ordering::Release);

        info!(
            "{}: slot layout {} x {} (alloc {}), capacity HBM {} keys, DRAM {} keys",
            self.config.name,
            requested.slot_num,
            requested.value_len,
            requested.alloc_len,
            hbm_capacity,
            dram_capacity
        );
        Ok(requested)
    }

    fn require_layout(&self) -> Result<usize> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument(
                "slot layout not set; call set_alloc_len first".into(),
            ));
        }
        Ok(self.total_dims.load(Ordering::Acquire))
    }

    fn schedule(&self, task: EvictionTask<K>) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.schedule(task);
        }
    }

    fn probe(&self, key: K) -> Result<Option<Hit<V>>> {
        if let Ok(slot) = self.hbm.get(key) {
            return Ok(Some(Hit {
                slot,
                source: Source::Hbm,
            }));
        }
        if let Ok(slot) = self.dram.get(key) {
            return Ok(Some(Hit {
                slot,
                source: Source::Dram,
            }));
        }
        match self.ssd.get_with_location(key) {
            Ok((slot, loc)) => Ok(Some(Hit {
                slot,
                source: Source::Ssd(loc),
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn scan_shard(&self, keys: &[K]) -> Result<ShardScan<K, V>> {
        let mut scan = ShardScan {
            found: Vec::with_capacity(keys.len()),
            copybacks: Vec::new(),
            missing: Vec::new(),
        };
        for (pos, &key) in keys.iter().enumerate() {
            match self.probe(key)? {
                Some(Hit {
                    slot,
                    source: Source::Hbm,
                }) => {
                    self.metrics.record_hit(TierKind::Hbm);
                    scan.found.push(Some(slot));
                }
                Some(hit) => {
                    self.metrics.record_hit(hit.source.tier());
                    scan.found.push(None);
                    scan.copybacks.push((pos, key, hit));
                }
                None => {
                    self.metrics.record_miss();
                    scan.found.push(None);
                    scan.missing.push((pos, key));
                }
            }
        }
        Ok(scan)
    }

    fn batch_lookup(&self, keys: &[K], create: bool) -> Result<Vec<Option<Arc<ValueSlot<V>>>>> {
        self.require_layout()?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let tracker = LatencyTracker::start();
        let granularity = self.config.shard_granularity.max(1);

        let shards: Vec<Result<ShardScan<K, V>>> = self.workers.install(|| {
            keys.par_chunks(granularity)
                .map(|chunk| self.scan_shard(chunk))
                .collect()
        });

        let mut out = Vec::with_capacity(keys.len());
        let mut copybacks = Vec::new();
        let mut missing = Vec::new();
        for (index, shard) in shards.into_iter().enumerate() {
            let shard = shard?;
            let base = index * granularity;
            out.extend(shard.found);
            copybacks.extend(
                shard
                    .copybacks
                    .into_iter()
                    .map(|(pos, key, hit)| (base + pos, key, hit)),
            );
            missing.extend(shard.missing.into_iter().map(|(pos, key)| (base + pos, key)));
        }

        if !copybacks.is_empty() {
            let mut unique = Vec::new();
            let mut positions: Vec<Vec<usize>> = Vec::new();
            let mut seen: HashMap<K, usize> = HashMap::new();
            for (pos, key, hit) in copybacks {
                match seen.entry(key) {
                    Entry::Occupied(e) => positions[*e.get()].push(pos),
                    Entry::Vacant(e) => {
                        e.insert(unique.len());
                        unique.push((key, hit));
                        positions.push(vec![pos]);
                    }
                }
            }
            let promoted = self.copy_embeddings_to_hbm(unique)?;
            for (slot, at) in promoted.into_iter().zip(positions) {
                for pos in at {
                    out[pos] = Some(Arc::clone(&slot));
                }
            }
        }

        if create && !missing.is_empty() {
            let mut unique = Vec::new();
            let mut positions: Vec<Vec<usize>> = Vec::new();
            let mut seen: HashMap<K, usize> = HashMap::new();
            for (pos, key) in missing {
                match seen.entry(key) {
                    Entry::Occupied(e) => positions[*e.get()].push(pos),
                    Entry::Vacant(e) => {
                        e.insert(unique.len());
                        unique.push(key);
                        positions.push(vec![pos]);
                    }
                }
            }
            let created = self.create_in_hbm(&unique)?;
            for (slot, at) in created.into_iter().zip(positions) {
                for pos in at {
                    out[pos] = Some(Arc::clone(&slot));
                }
            }
        }

        self.metrics.record_lookup_latency(tracker.elapsed());
        Ok(out)
    }

    /// Insert `slot` under `key`, or adopt the slot a concurrent insert won with.
    ///
    /// Returns the resident slot and whether ours was the one inserted.
    fn insert_or_adopt(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<(Arc<ValueSlot<V>>, bool)> {
        for _ in 0..3 {
            match self.hbm.try_insert(key, Arc::clone(&slot)) {
                Ok(()) => return Ok((slot, true)),
                Err(e) if e.is_already_exists() => {
                    if let Ok(winner) = self.hbm.get(key) {
                        self.hbm.discard(slot);
                        self.metrics.record_lost_race();
                        return Ok((winner, false));
                    }
                    // The winner left HBM again before we could read it
                }
                Err(e) => {
                    self.hbm.discard(slot);
                    return Err(e);
                }
            }
        }
        self.hbm.discard(slot);
        Err(Error::Internal(format!(
            "key {} kept changing while inserting into HBM",
            key.to_i64()
        )))
    }

    /// Mint HBM slots for keys found nowhere
    fn create_in_hbm(&self, keys: &[K]) -> Result<Vec<Arc<ValueSlot<V>>>> {
        let slots = self.hbm.create_slots(keys.len())?;
        let results: Vec<Result<(Arc<ValueSlot<V>>, bool)>> = self.workers.install(|| {
            keys.par_iter()
                .zip(slots.into_par_iter())
                .map(|(&key, slot)| self.insert_or_adopt(key, slot))
                .collect()
        });

        let mut out = Vec::with_capacity(keys.len());
        let mut created = Vec::new();
        let mut failure = None;
        for (key, result) in keys.iter().zip(results) {
            match result {
                Ok((slot, won)) => {
                    if won {
                        created.push(*key);
                    }
                    out.push(slot);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        // Registered even on failure so the policy matches HBM residency
        self.cache.add_to_cache(&created);
        self.metrics.record_creations(created.len() as u64);
        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    /// Copy slower-tier hits into HBM and drop them from their source tier.
    ///
    /// Returns the resident HBM slot of every key, in input order.
    fn copy_embeddings_to_hbm(&self, hits: Vec<(K, Hit<V>)>) -> Result<Vec<Arc<ValueSlot<V>>>> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let total_dims = self.require_layout()?;

        // Destination buffers come out of the pool in one lock acquisition
        let dests = self.hbm.create_slots(hits.len())?;
        for (dst, (_, hit)) in dests.iter().zip(&hits) {
            dst.copy_header_from(&hit.slot);
        }

        let mut staging = vec![V::default(); total_dims * hits.len()];
        self.workers.install(|| {
            staging
                .par_chunks_mut(total_dims)
                .zip(hits.par_iter())
                .for_each(|(chunk, (_, hit))| {
                    hit.slot.copy_to(chunk);
                })
        });
        if let Err(e) = self.hbm.batch_unpack(&staging, total_dims, &dests) {
            for dst in dests {
                self.hbm.discard(dst);
            }
            return Err(e);
        }
        drop(staging);

        let results: Vec<Result<(Arc<ValueSlot<V>>, bool)>> = self.workers.install(|| {
            hits.par_iter()
                .zip(dests.into_par_iter())
                .map(|((key, _), dst)| self.insert_or_adopt(*key, dst))
                .collect()
        });

        let mut out = Vec::with_capacity(hits.len());
        let mut promoted = Vec::new();
        let mut dram_keys = Vec::new();
        let mut from_dram = 0u64;
        let mut from_ssd = 0u64;
        let mut failure = None;
        // Holding the DRAM lock keeps eviction and demotion passes out while
        // source copies are dropped.
        let dram_guard = self.dram.structure_lock().lock();
        for ((key, hit), result) in hits.into_iter().zip(results) {
            let (slot, won) = match result {
                Ok(resident) => resident,
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            };
            match &hit.source {
                Source::Dram => {
                    if self.dram.remove_if_same(key, &hit.slot) {
                        from_dram += 1;
                    } else if self.hbm.get(key).is_ok_and(|s| Arc::ptr_eq(&s, &slot)) {
                        // Spilled to SSD while being promoted
                        self.ssd.remove(key);
                    }
                    dram_keys.push(key);
                }
                Source::Ssd(loc) => {
                    if self.ssd.remove_if_at(key, loc) {
                        from_ssd += 1;
                    }
                }
                Source::Hbm => {}
            }
            if won {
                promoted.push(key);
            }
            out.push(slot);
        }
        drop(dram_guard);

        self.dram_cache.remove(&dram_keys);
        self.cache.add_to_cache(&promoted);
        self.metrics.record_promotions(TierKind::Dram, from_dram);
        self.metrics.record_promotions(TierKind::Ssd, from_ssd);
        debug!(
            "{}: promoted {} keys ({} from DRAM, {} from SSD)",
            self.config.name,
            promoted.len(),
            from_dram,
            from_ssd
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    #[instrument(skip(self), fields(storage = %self.config.name))]
    fn batch_eviction(&self) -> Result<usize> {
        if !self.ready.load(Ordering::Acquire) {
            return Ok(0);
        }
        let tracker = LatencyTracker::start();
        self.hbm.reclaim();

        let capacity = self.hbm_capacity.load(Ordering::Acquire);
        let evicted = {
            let _hbm = self.hbm.structure_lock().lock();
            let _dram = self.dram.structure_lock().lock();

            let resident = self.hbm.size();
            if resident <= capacity {
                return Ok(0);
            }
            let wanted = (resident - capacity).min(self.config.eviction_batch_size);

            let mut keys = Vec::with_capacity(wanted);
            let mut slots = Vec::with_capacity(wanted);
            while keys.len() < wanted {
                let victims = self.cache.get_evic_ids(wanted - keys.len());
                if victims.is_empty() {
                    break;
                }
                // Entries for keys that already left HBM are just dropped
                for key in victims {
                    if let Ok(slot) = self.hbm.get(key) {
                        keys.push(key);
                        slots.push(slot);
                    }
                }
            }

            if let Err(e) = self.dram.batch_commit(&keys, &slots) {
                warn!(
                    "{}: moving {} keys to DRAM failed, keeping them in HBM: {}",
                    self.config.name,
                    keys.len(),
                    e
                );
                self.cache.add_to_cache(&keys);
                self.metrics.record_eviction_failure();
                return Err(e);
            }
            for &key in &keys {
                self.hbm.remove(key);
            }
            keys
        };
        self.hbm.reclaim();

        let n = evicted.len();
        self.metrics.record_demotions_to_dram(n as u64);
        self.metrics.record_eviction_pass(tracker.elapsed());
        debug!("{}: evicted {} keys from HBM", self.config.name, n);
        if n > 0 {
            self.schedule(EvictionTask::DemoteDram { keys: evicted });
        }
        Ok(n)
    }

    #[instrument(skip(self, keys), fields(storage = %self.config.name, keys = keys.len()))]
    fn demote_dram(&self, keys: Vec<K>) -> Result<usize> {
        let _ssd = self.ssd.structure_lock().lock();
        let _dram = self.dram.structure_lock().lock();

        let arrived: Vec<K> = keys
            .into_iter()
            .filter(|key| self.dram.contains(*key))
            .collect();
        self.dram_cache.update(&arrived);

        let capacity = self.dram_capacity.load(Ordering::Acquire);
        let resident = self.dram_cache.size();
        if resident <= capacity {
            return Ok(0);
        }
        let wanted = (resident - capacity).min(self.config.eviction_batch_size);

        let mut moved = 0usize;
        for key in self.dram_cache.get_evic_ids(wanted) {
            let Ok(slot) = self.dram.get(key) else {
                continue;
            };
            if let Err(e) = self.ssd.commit(key, &slot) {
                warn!(
                    "{}: spilling key {} to SSD failed, keeping it in DRAM: {}",
                    self.config.name,
                    key.to_i64(),
                    e
                );
                self.dram_cache.add_to_cache(&[key]);
                continue;
            }
            if self.dram.remove_if_same(key, &slot) {
                moved += 1;
            } else if let Some(loc) = self.ssd.location(key) {
                // Promoted meanwhile; the SSD copy would shadow nothing
                self.ssd.remove_if_at(key, &loc);
            }
        }

        self.metrics.record_demotions_to_ssd(moved as u64);
        debug!("{}: spilled {} keys from DRAM to SSD", self.config.name, moved);
        Ok(moved)
    }

    fn shrink(&self, args: &ShrinkArgs) -> Result<usize> {
        let layout = (*self.layout.lock()).ok_or_else(|| {
            Error::InvalidArgument("slot layout not set; call set_alloc_len first".into())
        })?;

        let hbm_removed = {
            let _guard = self.hbm.structure_lock().lock();
            self.hbm.shrink(args, &layout)?
        };
        self.cache.remove(&hbm_removed);
        self.hbm.reclaim();

        let dram_removed = {
            let _guard = self.dram.structure_lock().lock();
            self.dram.shrink(args, &layout)?
        };
        self.dram_cache.remove(&dram_removed);

        let ssd_removed = {
            let _guard = self.ssd.structure_lock().lock();
            self.ssd.shrink(args, &layout)?
        };

        let total = hbm_removed.len() + dram_removed.len() + ssd_removed.len();
        info!(
            "{}: shrink at step {} removed {} keys (HBM {}, DRAM {}, SSD {})",
            self.config.name,
            args.global_step,
            total,
            hbm_removed.len(),
            dram_removed.len(),
            ssd_removed.len()
        );
        Ok(total)
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> EvictionHandler<K> for TieredInner<K, V> {
    fn batch_eviction(&self) -> Result<usize> {
        TieredInner::batch_eviction(self)
    }

    fn demote_dram(&self, keys: Vec<K>) -> Result<usize> {
        TieredInner::demote_dram(self, keys)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CacheStrategy;
    use assert_matches::assert_matches;

    const VALUE_LEN: usize = 4;

    fn config(dir: &std::path::Path, hbm_keys: u64, dram_keys: u64) -> StorageConfig {
        let mut config = StorageConfig::default();
        config.name = "unit".into();
        config.ssd.path = dir.to_path_buf();
        config.worker_threads = 2;
        config.shard_granularity = 3;
        config.pool.chunk_blocks = 8;
        config.cache_strategy = CacheStrategy::Lru;
        let slot_bytes = (VALUE_LEN * std::mem::size_of::<f32>()) as u64;
        config.hbm_capacity_bytes = hbm_keys * slot_bytes;
        config.dram_capacity_bytes = dram_keys * slot_bytes;
        config
    }

    fn storage(dir: &std::path::Path, hbm_keys: u64, dram_keys: u64) -> TieredStorage<i64, f32> {
        let storage = TieredStorage::new(config(dir, hbm_keys, dram_keys)).unwrap();
        storage.set_alloc_len(VALUE_LEN, 1).unwrap();
        storage
    }

    fn filled(value: f32) -> ValueSlot<f32> {
        ValueSlot::from_values(&[value; VALUE_LEN])
    }

    #[test]
    fn test_layout_required() {
        let dir = tempfile::tempdir().unwrap();
        let storage: TieredStorage<i64, f32> =
            TieredStorage::new(config(dir.path(), 4, 4)).unwrap();
        assert_matches!(storage.get_or_create(1), Err(Error::InvalidArgument(_)));
        assert_eq!(storage.batch_eviction().unwrap(), 0);
    }

    #[test]
    fn test_set_alloc_len_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        assert_eq!(storage.capacity(TierKind::Hbm), Some(4));

        let same = storage.set_alloc_len(2, 1).unwrap();
        assert_eq!(same.value_len, VALUE_LEN);

        storage.get_or_create(1).unwrap();
        assert_matches!(storage.set_alloc_len(64, 2), Err(Error::InvalidArgument(_)));
    }

    #[test]
    fn test_layout_grows_to_cover_every_variable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);

        let wide = storage.set_alloc_len(8, 1).unwrap();
        assert_eq!((wide.alloc_len, wide.slot_num), (8, 1));

        // Same element count, but more embeddings than the current layout holds
        let merged = storage.set_alloc_len(4, 2).unwrap();
        assert_eq!((merged.alloc_len, merged.slot_num, merged.total_dims), (8, 2, 16));
        assert_eq!(storage.layout(), Some(merged));
        assert_eq!(storage.get_or_create(1).unwrap().len(), 16);
    }

    #[test]
    fn test_layout_growth_refused_with_spilled_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 0, 0);
        for key in 0..4i64 {
            storage
                .inner
                .ssd
                .commit(key, &filled(key as f32))
                .unwrap();
        }

        assert_matches!(storage.set_alloc_len(8, 2), Err(Error::InvalidArgument(_)));
        assert_eq!(storage.layout().unwrap().total_dims, VALUE_LEN);
        let found = storage.get(0).unwrap();
        assert_eq!(found.tier, TierKind::Ssd);
        assert_eq!(found.slot.to_vec().unwrap(), vec![0.0; VALUE_LEN]);
    }

    #[test]
    fn test_layout_growth_refused_with_dram_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        storage.insert_to_dram(2, &filled(2.0)).unwrap();
        assert_eq!(storage.pool_stats().in_use_blocks, 0);

        assert_matches!(storage.set_alloc_len(8, 1), Err(Error::InvalidArgument(_)));
        assert_eq!(
            storage.get(2).unwrap().slot.to_vec().unwrap(),
            vec![2.0; VALUE_LEN]
        );
    }

    #[test]
    fn test_get_flags_by_tier() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        storage.insert(1, &filled(1.0)).unwrap();
        storage.insert_to_dram(2, &filled(2.0)).unwrap();

        assert_eq!(storage.get(1).unwrap().copyback, CopyBack::NotCopyback);
        let dram = storage.get(2).unwrap();
        assert_eq!(dram.tier, TierKind::Dram);
        assert_eq!(dram.copyback, CopyBack::Copyback);
        assert!(storage.get(3).unwrap_err().is_not_found());

        // get has no side effects
        assert_eq!(storage.lookup_tier(2), Some(TierKind::Dram));
    }

    #[test]
    fn test_get_or_create_promotes() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        let src = filled(2.5);
        src.set_version(3);
        storage.insert_to_dram(2, &src).unwrap();

        let slot = storage.get_or_create(2).unwrap();
        assert_eq!(slot.to_vec().unwrap(), vec![2.5; VALUE_LEN]);
        assert_eq!(slot.version(), 3);
        assert_eq!(storage.lookup_tier(2), Some(TierKind::Hbm));
        assert_eq!(storage.size_of(TierKind::Dram), 0);
        assert_eq!(storage.metrics().promotions_dram_to_hbm, 1);
    }

    #[test]
    fn test_flagged_lookup_leaves_slower_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        storage.insert_to_dram(2, &filled(2.0)).unwrap();

        let lookup = storage.get_or_create_flagged(2).unwrap();
        assert_eq!(lookup.copyback, CopyBack::Copyback);
        assert_eq!(storage.lookup_tier(2), Some(TierKind::Dram));

        let created = storage.get_or_create_flagged(7).unwrap();
        assert_eq!(created.tier, TierKind::Hbm);
        assert_eq!(storage.lookup_tier(7), Some(TierKind::Hbm));
    }

    #[test]
    fn test_batch_get_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 64, 64);
        for key in 0..10 {
            storage.insert_to_dram(key, &filled(key as f32)).unwrap();
        }

        let keys: Vec<i64> = vec![9, 3, 3, 12, 0, 7, 9, 5];
        let slots = storage.batch_get(&keys).unwrap();
        for (key, slot) in keys.iter().zip(&slots) {
            match slot {
                Some(slot) => assert_eq!(slot.to_vec().unwrap()[0], *key as f32),
                None => assert_eq!(*key, 12),
            }
        }
        assert!(Arc::ptr_eq(
            slots[1].as_ref().unwrap(),
            slots[2].as_ref().unwrap()
        ));
        assert_eq!(storage.size_of(TierKind::Hbm), 5);
        assert_eq!(storage.size_of(TierKind::Dram), 5);
        assert_eq!(storage.lookup_tier(12), None);
    }

    #[test]
    fn test_batch_get_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 64, 64);
        storage.insert_to_dram(4, &filled(4.0)).unwrap();

        let keys: Vec<i64> = (0..10).chain(0..3).collect();
        let slots = storage.batch_get_or_create(&keys).unwrap();
        assert_eq!(slots.len(), keys.len());
        assert!(Arc::ptr_eq(&slots[0], &slots[10]));
        assert_eq!(slots[4].to_vec().unwrap(), vec![4.0; VALUE_LEN]);
        assert_eq!(storage.size_of(TierKind::Hbm), 10);
        assert_eq!(storage.cached_ids(100).len(), 10);
        assert_eq!(storage.metrics().creations, 9);
    }

    #[test]
    fn test_eviction_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 100);
        for key in 0..10 {
            storage.get_or_create(key).unwrap();
        }

        assert_eq!(storage.batch_eviction().unwrap(), 6);
        assert_eq!(storage.size_of(TierKind::Hbm), 4);
        assert_eq!(storage.size_of(TierKind::Dram), 6);
        assert_eq!(storage.batch_eviction().unwrap(), 0);
        // Oldest keys left first
        assert_eq!(storage.lookup_tier(0), Some(TierKind::Dram));
        assert_eq!(storage.lookup_tier(9), Some(TierKind::Hbm));
    }

    #[test]
    fn test_update_cache_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        assert_matches!(
            storage.update_cache(&[1, 2], Some(&[1])),
            Err(Error::InvalidArgument(_))
        );
        storage.update_cache(&[1, 2], Some(&[1, 2])).unwrap();
        storage.update_cache(&[3], None).unwrap();
    }

    #[test]
    fn test_update_cache_skips_keys_outside_hbm() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        for key in 0..4 {
            storage.get_or_create(key).unwrap();
        }
        storage.insert_to_dram(50, &filled(5.0)).unwrap();

        storage.update_cache(&[99, 50], None).unwrap();
        storage.update_cache(&[99, 2], Some(&[3, 1])).unwrap();
        assert_eq!(storage.cached_ids(100).len(), 4);

        assert_eq!(storage.batch_eviction().unwrap(), 0);
        assert_eq!(storage.size_of(TierKind::Hbm), 4);
        assert_eq!(storage.lookup_tier(50), Some(TierKind::Dram));
    }

    #[test]
    fn test_eviction_skips_stale_policy_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 100);
        storage.inner.cache.update(&[99]);
        for key in 0..5 {
            storage.get_or_create(key).unwrap();
        }

        assert_eq!(storage.batch_eviction().unwrap(), 1);
        assert_eq!(storage.size_of(TierKind::Hbm), 4);
        assert_eq!(storage.lookup_tier(0), Some(TierKind::Dram));
        let cached = storage.cached_ids(100);
        assert_eq!(cached.len(), 4);
        assert!(!cached.ids.contains(&99));
    }

    #[test]
    fn test_remove_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        storage.insert(1, &filled(1.0)).unwrap();
        storage.insert_to_dram(2, &filled(2.0)).unwrap();

        storage.remove(1);
        storage.remove(2);
        storage.remove(3);
        assert_eq!(storage.size(), 0);
        assert!(storage.cached_ids(10).is_empty());
    }

    #[test]
    fn test_size_at_level() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path(), 4, 4);
        storage.insert_to_dram(2, &filled(2.0)).unwrap();
        assert_eq!(storage.size_at_level(0), Some(0));
        assert_eq!(storage.size_at_level(1), Some(1));
        assert_eq!(storage.size_at_level(2), Some(0));
        assert_eq!(storage.size_at_level(3), None);
    }
}
