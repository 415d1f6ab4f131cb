//! SSD Tier - Append-Only Segment Log
//!
//! Slowest tier. Every commit appends a checksummed record to the active
//! segment and points the in-memory index at it; older records of the same key
//! become garbage. Sealed segments whose live ratio drops below the configured
//! threshold are compacted: their live records are re-appended and the segment
//! is reclaimed.
//!
//! ```text
//!            commit                     get
//!              │                         │
//!              ▼                         ▼
//!   ┌──────────────────┐        ┌─────────────────┐
//!   │  active segment  │◀───────│  index (DashMap)│ key → (segment, offset, len)
//!   └────────┬─────────┘        └─────────────────┘
//!            │ seal at segment_size_bytes
//!            ▼
//!   ┌──────────────────┐  live ratio < threshold   ┌───────────┐
//!   │  sealed segments │──────────────────────────▶│ compactor │ (sync or async)
//!   └──────────────────┘                           └───────────┘
//! ```
//!
//! Every index mutation happens under the active-segment lock, so a compaction
//! rewrite can never clobber a newer commit of the same key.

mod compaction;
pub mod record;
pub mod segment;

pub use record::{DecodedRecord, RecordHeader};
pub use segment::{Segment, SegmentState};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use self::compaction::CompactionWorker;
use super::compression::PayloadCompressor;
use super::slot::{SlotLayout, ValueSlot, UNSTAMPED_VERSION};
use super::tier::{l2_weight, ShrinkArgs, SnapshotEntry, TierStore};
use super::types::{EmbeddingKey, EmbeddingValue, TierKind};
use crate::config::{CompactionMode, SsdConfig};
use crate::error::{Error, Result};

/// Where the latest record of a key lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub segment: u64,
    pub offset: u64,
    pub len: u32,
    pub version: i64,
    /// Commit sequence number; kept when compaction relocates the record
    pub seq: u64,
}

/// SSD tier statistics
#[derive(Debug, Clone, Default)]
pub struct SsdStats {
    pub keys: usize,
    pub segments: usize,
    pub sealed_segments: usize,
    pub total_bytes: u64,
    pub live_bytes: u64,
    pub compactions: u64,
    pub records_rewritten: u64,
    pub segments_reclaimed: u64,
    pub corrupt_reads: u64,
}

struct ActiveSegment {
    segment: Arc<Segment>,
    writer: BufWriter<File>,
    offset: u64,
}

#[derive(Default)]
struct SsdCounters {
    compactions: AtomicU64,
    records_rewritten: AtomicU64,
    segments_reclaimed: AtomicU64,
    corrupt_reads: AtomicU64,
}

struct SsdInner<K, V> {
    name: String,
    dir: PathBuf,
    config: SsdConfig,
    total_dims: AtomicUsize,
    index: DashMap<K, RecordLocation>,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
    active: Mutex<ActiveSegment>,
    next_segment: AtomicU64,
    next_seq: AtomicU64,
    compressor: PayloadCompressor,
    lock: Mutex<()>,
    counters: SsdCounters,
    _values: PhantomData<fn() -> V>,
}

/// Append-only SSD tier
pub struct SsdStore<K: EmbeddingKey, V: EmbeddingValue> {
    // Declared first so the worker is joined before the store goes away.
    compactor: Option<CompactionWorker>,
    inner: Arc<SsdInner<K, V>>,
}

impl<K: EmbeddingKey, V: EmbeddingValue> SsdStore<K, V> {
    /// Open a fresh segment log in `dir`, discarding stale segment files
    pub fn open(name: &str, dir: impl AsRef<Path>, config: SsdConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut stale = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if segment::is_segment_file(&path) {
                std::fs::remove_file(&path)?;
                stale += 1;
            }
        }
        if stale > 0 {
            warn!("Removed {} stale segment files from {}", stale, dir.display());
        }

        let (first, writer) = Segment::create(&dir, 0, config.io_scheme)?;
        let first = Arc::new(first);
        let mut segments = BTreeMap::new();
        segments.insert(0, Arc::clone(&first));

        info!(
            "Opened SSD tier {} at {} (io scheme {}, {:?} compaction, compression {})",
            name,
            dir.display(),
            config.io_scheme,
            config.compaction,
            config.compression
        );

        let inner = Arc::new(SsdInner {
            name: name.to_string(),
            compressor: PayloadCompressor::new(config.compression, config.compression_min_bytes),
            dir,
            total_dims: AtomicUsize::new(0),
            index: DashMap::new(),
            segments: RwLock::new(segments),
            active: Mutex::new(ActiveSegment {
                segment: first,
                writer: BufWriter::new(writer),
                offset: 0,
            }),
            next_segment: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            lock: Mutex::new(()),
            counters: SsdCounters::default(),
            config,
            _values: PhantomData,
        });

        let compactor = match inner.config.compaction {
            CompactionMode::Sync => None,
            CompactionMode::Async => {
                let weak: Weak<SsdInner<K, V>> = Arc::downgrade(&inner);
                Some(CompactionWorker::spawn(name, move |ids| {
                    if let Some(inner) = weak.upgrade() {
                        inner.compact_segments(ids);
                    }
                })?)
            }
        };

        Ok(Self { compactor, inner })
    }

    /// Set the element count of every record payload
    pub fn set_total_dims(&self, total_dims: usize) {
        self.inner.total_dims.store(total_dims, Ordering::Release);
    }

    pub fn total_dims(&self) -> usize {
        self.inner.total_dims.load(Ordering::Acquire)
    }

    /// Segment directory
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn config(&self) -> &SsdConfig {
        &self.inner.config
    }

    /// Location of the latest record of `key`
    pub fn location(&self, key: K) -> Option<RecordLocation> {
        self.inner.index.get(&key).map(|loc| *loc)
    }

    /// Fetch the transient slot together with where it was read from
    pub fn get_with_location(&self, key: K) -> Result<(Arc<ValueSlot<V>>, RecordLocation)> {
        let (record, loc) = self.inner.read_record(key)?;
        Ok((Arc::new(record.into_slot(self.total_dims())), loc))
    }

    /// Remove `key` only if its latest record is still the one `loc` names
    pub fn remove_if_at(&self, key: K, loc: &RecordLocation) -> bool {
        let _active = self.inner.active.lock();
        match self.inner.index.remove_if(&key, |_, current| current.seq == loc.seq) {
            Some((_, removed)) => {
                self.inner.drop_live(&removed);
                true
            }
            None => false,
        }
    }

    /// Ids of all segments not yet reclaimed
    pub fn segment_ids(&self) -> Vec<u64> {
        self.inner.segments.read().keys().copied().collect()
    }

    /// State of segment `id`, if still tracked
    pub fn segment_state(&self, id: u64) -> Option<SegmentState> {
        self.inner.segment(id).map(|s| s.state())
    }

    /// File path of segment `id`, if still tracked
    pub fn segment_path(&self, id: u64) -> Option<PathBuf> {
        self.inner.segment(id).map(|s| s.path().to_path_buf())
    }

    /// Block until queued background compactions have finished
    pub fn wait_for_compaction(&self) {
        if let Some(compactor) = &self.compactor {
            compactor.flush();
        }
    }

    /// Compact every eligible sealed segment now, on the calling thread
    pub fn compact_now(&self) -> usize {
        let candidates = self.inner.compaction_candidates();
        let count = candidates.len();
        self.inner.compact_segments(candidates);
        count
    }

    /// Get SSD statistics
    pub fn stats(&self) -> SsdStats {
        let segments = self.inner.segments.read();
        let counters = &self.inner.counters;
        SsdStats {
            keys: self.inner.index.len(),
            segments: segments.len(),
            sealed_segments: segments
                .values()
                .filter(|s| s.state() != SegmentState::Active)
                .count(),
            total_bytes: segments.values().map(|s| s.len()).sum(),
            live_bytes: segments.values().map(|s| s.live_bytes()).sum(),
            compactions: counters.compactions.load(Ordering::Relaxed),
            records_rewritten: counters.records_rewritten.load(Ordering::Relaxed),
            segments_reclaimed: counters.segments_reclaimed.load(Ordering::Relaxed),
            corrupt_reads: counters.corrupt_reads.load(Ordering::Relaxed),
        }
    }

    fn commit_slots(&self, keys: &[K], slots: &[&ValueSlot<V>]) -> Result<()> {
        let sealed = self.inner.append_records(keys, slots)?;
        if !sealed.is_empty() {
            self.schedule_compaction();
        }
        Ok(())
    }

    fn schedule_compaction(&self) {
        let candidates = self.inner.compaction_candidates();
        if candidates.is_empty() {
            return;
        }
        match &self.compactor {
            Some(compactor) => compactor.submit(candidates),
            None => self.inner.compact_segments(candidates),
        }
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> SsdInner<K, V> {
    fn segment(&self, id: u64) -> Option<Arc<Segment>> {
        self.segments.read().get(&id).cloned()
    }

    fn drop_live(&self, loc: &RecordLocation) {
        if let Some(segment) = self.segment(loc.segment) {
            segment.drop_live(loc.len as u64);
        }
    }

    /// Point the index at a freshly published record. Caller holds `active`.
    fn install_locked(&self, active: &ActiveSegment, key: K, loc: RecordLocation) {
        if let Some(old) = self.index.insert(key, loc) {
            self.drop_live(&old);
        }
        if loc.segment == active.segment.id() {
            active.segment.add_live(loc.len as u64);
        } else if let Some(segment) = self.segment(loc.segment) {
            segment.add_live(loc.len as u64);
        }
    }

    fn append_locked(&self, active: &mut ActiveSegment, bytes: &[u8]) -> Result<u64> {
        let offset = active.offset;
        active.writer.write_all(bytes)?;
        active.offset += bytes.len() as u64;
        Ok(offset)
    }

    fn publish_locked(&self, active: &mut ActiveSegment) -> Result<()> {
        active.writer.flush()?;
        active.segment.set_len(active.offset);
        Ok(())
    }

    fn flush_pending_locked(
        &self,
        active: &mut ActiveSegment,
        pending: &mut Vec<(K, RecordLocation)>,
    ) -> Result<()> {
        self.publish_locked(active)?;
        for (key, loc) in pending.drain(..) {
            self.install_locked(active, key, loc);
        }
        Ok(())
    }

    /// Seal the active segment and open the next one. Caller holds `active`.
    fn rotate_locked(&self, active: &mut ActiveSegment) -> Result<u64> {
        self.publish_locked(active)?;
        let id = self.next_segment.fetch_add(1, Ordering::Relaxed);
        let (segment, writer) = Segment::create(&self.dir, id, self.config.io_scheme)?;
        let segment = Arc::new(segment);
        self.segments.write().insert(id, Arc::clone(&segment));

        let old = std::mem::replace(
            active,
            ActiveSegment {
                segment,
                writer: BufWriter::new(writer),
                offset: 0,
            },
        );
        old.segment.seal()?;
        debug!(
            "{}: sealed segment {} ({} bytes, live ratio {:.2})",
            self.name,
            old.segment.id(),
            old.segment.len(),
            old.segment.live_ratio()
        );
        Ok(old.segment.id())
    }

    /// Append one record per key, returning ids of segments sealed on the way
    fn append_records(&self, keys: &[K], slots: &[&ValueSlot<V>]) -> Result<Vec<u64>> {
        let encoded: Vec<_> = keys
            .iter()
            .zip(slots)
            .map(|(key, slot)| {
                (
                    *key,
                    slot.version(),
                    record::encode(key.to_i64(), slot, &self.compressor),
                )
            })
            .collect();

        let limit = self.config.segment_size_bytes;
        let mut sealed = Vec::new();
        let mut pending = Vec::with_capacity(encoded.len());
        let mut active = self.active.lock();
        for (key, version, bytes) in encoded {
            let offset = self.append_locked(&mut active, &bytes)?;
            pending.push((
                key,
                RecordLocation {
                    segment: active.segment.id(),
                    offset,
                    len: bytes.len() as u32,
                    version,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                },
            ));
            if active.offset >= limit {
                self.flush_pending_locked(&mut active, &mut pending)?;
                sealed.push(self.rotate_locked(&mut active)?);
            }
        }
        self.flush_pending_locked(&mut active, &mut pending)?;
        Ok(sealed)
    }

    fn read_record(&self, key: K) -> Result<(DecodedRecord<V>, RecordLocation)> {
        let total_dims = self.total_dims.load(Ordering::Acquire);
        // A concurrent compaction may move the record between the index lookup
        // and the segment lookup; the retry picks up the new location.
        for _ in 0..3 {
            let loc = match self.index.get(&key) {
                Some(loc) => *loc,
                None => return Err(Error::NotFound { key: key.to_i64() }),
            };
            let Some(segment) = self.segment(loc.segment) else {
                continue;
            };
            let bytes = segment.read_at(loc.offset, loc.len as usize)?;
            let record = record::decode::<V>(&bytes, &self.compressor, total_dims)
                .and_then(|record| {
                    if record.header.key == key.to_i64() {
                        Ok(record)
                    } else {
                        Err(format!(
                            "record holds key {}, expected {}",
                            record.header.key,
                            key.to_i64()
                        ))
                    }
                })
                .map_err(|reason| {
                    self.counters.corrupt_reads.fetch_add(1, Ordering::Relaxed);
                    Error::Corruption {
                        segment: loc.segment,
                        offset: loc.offset,
                        reason,
                    }
                })?;
            return Ok((record, loc));
        }
        Err(Error::Internal(format!(
            "index entry for key {} keeps pointing at reclaimed segments",
            key.to_i64()
        )))
    }

    fn compaction_candidates(&self) -> Vec<u64> {
        let threshold = self.config.compaction_ratio;
        self.segments
            .read()
            .values()
            .filter(|s| s.state() == SegmentState::Sealed && s.live_ratio() < threshold)
            .map(|s| s.id())
            .collect()
    }

    fn compact_segments(&self, ids: Vec<u64>) {
        for id in ids {
            match self.compact_one(id) {
                Ok(Some(moved)) => debug!(
                    "{}: compacted segment {}, {} live records rewritten",
                    self.name, id, moved
                ),
                Ok(None) => {}
                Err(e) => warn!("{}: compaction of segment {} failed: {}", self.name, id, e),
            }
        }
    }

    /// Rewrite the live records of sealed segment `id` and reclaim it.
    ///
    /// Returns `None` if the segment was not eligible (already compacting,
    /// reclaimed or still active).
    fn compact_one(&self, id: u64) -> Result<Option<usize>> {
        let Some(segment) = self.segment(id) else {
            return Ok(None);
        };
        if !segment.try_transition(SegmentState::Sealed, SegmentState::Compacting) {
            return Ok(None);
        }

        let abort = |e: Error| {
            let _ = segment.transition(SegmentState::Sealed);
            e
        };

        let data = segment.read_all().map_err(abort)?;
        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let header = RecordHeader::parse(&data[offset..]).map_err(|reason| {
                abort(Error::Corruption {
                    segment: id,
                    offset: offset as u64,
                    reason,
                })
            })?;
            let len = header.record_len();
            if offset + len > data.len() {
                return Err(abort(Error::Corruption {
                    segment: id,
                    offset: offset as u64,
                    reason: "record runs past segment end".into(),
                }));
            }
            records.push((offset, len, header));
            offset += len;
        }

        let limit = self.config.segment_size_bytes;
        let mut moved = 0usize;
        {
            let mut active = self.active.lock();
            let mut pending = Vec::new();
            for (offset, len, header) in records {
                let key = K::from_i64(header.key);
                let Some(seq) = self
                    .index
                    .get(&key)
                    .filter(|loc| loc.segment == id && loc.offset == offset as u64)
                    .map(|loc| loc.seq)
                else {
                    continue;
                };
                let new_offset = self
                    .append_locked(&mut active, &data[offset..offset + len])
                    .map_err(abort)?;
                pending.push((
                    key,
                    RecordLocation {
                        segment: active.segment.id(),
                        offset: new_offset,
                        len: len as u32,
                        version: header.slot.version,
                        seq,
                    },
                ));
                moved += 1;
                if active.offset >= limit {
                    self.flush_pending_locked(&mut active, &mut pending)
                        .map_err(abort)?;
                    self.rotate_locked(&mut active).map_err(abort)?;
                }
            }
            self.flush_pending_locked(&mut active, &mut pending)
                .map_err(abort)?;
        }

        segment.transition(SegmentState::Reclaimed)?;
        self.segments.write().remove(&id);
        if let Err(e) = segment.delete_file() {
            warn!("{}: failed to unlink segment {}: {}", self.name, id, e);
        }

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        self.counters
            .records_rewritten
            .fetch_add(moved as u64, Ordering::Relaxed);
        self.counters
            .segments_reclaimed
            .fetch_add(1, Ordering::Relaxed);
        Ok(Some(moved))
    }
}

impl<K: EmbeddingKey, V: EmbeddingValue> TierStore<K, V> for SsdStore<K, V> {
    fn kind(&self) -> TierKind {
        TierKind::Ssd
    }

    fn get(&self, key: K) -> Result<Arc<ValueSlot<V>>> {
        self.get_with_location(key).map(|(slot, _)| slot)
    }

    fn contains(&self, key: K) -> bool {
        self.inner.index.contains_key(&key)
    }

    fn try_insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()> {
        if self.contains(key) {
            return Err(Error::AlreadyExists { key: key.to_i64() });
        }
        self.commit(key, &slot)
    }

    fn insert(&self, key: K, slot: Arc<ValueSlot<V>>) -> Result<()> {
        self.commit(key, &slot)
    }

    fn remove(&self, key: K) -> bool {
        let _active = self.inner.active.lock();
        match self.inner.index.remove(&key) {
            Some((_, loc)) => {
                self.inner.drop_live(&loc);
                true
            }
            None => false,
        }
    }

    fn commit(&self, key: K, slot: &ValueSlot<V>) -> Result<()> {
        self.commit_slots(&[key], &[slot])
    }

    fn batch_commit(&self, keys: &[K], slots: &[Arc<ValueSlot<V>>]) -> Result<()> {
        let refs: Vec<&ValueSlot<V>> = slots.iter().map(|s| s.as_ref()).collect();
        self.commit_slots(keys, &refs)
    }

    fn snapshot(&self) -> Result<Vec<SnapshotEntry<K, V>>> {
        let keys: Vec<K> = self.inner.index.iter().map(|e| *e.key()).collect();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match self.inner.read_record(key) {
                Ok((record, _)) => entries.push(SnapshotEntry {
                    key,
                    version: record.header.slot.version,
                    freq: record.header.slot.freq,
                    values: record.values,
                }),
                // Removed between listing and reading
                Err(Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    fn shrink(&self, args: &ShrinkArgs, layout: &SlotLayout) -> Result<Vec<K>> {
        let entries: Vec<(K, RecordLocation)> = self
            .inner
            .index
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        let mut removed = Vec::new();
        for (key, loc) in entries {
            let expired = args.steps_to_live > 0
                && loc.version != UNSTAMPED_VERSION
                && args.global_step - loc.version > args.steps_to_live;
            let light = match args.l2_weight_threshold {
                Some(threshold) if !expired => match self.inner.read_record(key) {
                    Ok((record, _)) => {
                        let start = layout.offset(0);
                        let end = (start + layout.value_len).min(record.values.len());
                        !record.values.is_empty()
                            && l2_weight(&record.values[start..end]) < threshold
                    }
                    Err(e) if e.is_not_found() => false,
                    Err(e) => return Err(e),
                },
                _ => false,
            };
            if (expired || light) && self.remove_if_at(key, &loc) {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    fn size(&self) -> usize {
        self.inner.index.len()
    }

    fn structure_lock(&self) -> &Mutex<()> {
        &self.inner.lock
    }
}

// =============================================================================
// Tests
// =============================================================================
