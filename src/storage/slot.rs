//! Value Slots
//!
//! A [`ValueSlot`] holds the embedding buffer for one feature id together with
//! an atomic header (access frequency, last-update version, per-embedding
//! initialization bits). Slots are shared as `Arc<ValueSlot<V>>`; a reader
//! that still holds an `Arc` keeps the slot valid after the tier map dropped it.
//!
//! ```text
//! ┌──────────────────────────── total_dims ─────────────────────────────┐
//! │ emb 0 [alloc_len] │ emb 1 [alloc_len] │ ... │ emb slot_num-1        │
//! └─────────────────────────────────────────────────────────────────────┘
//!   value_len <= alloc_len, alloc_len * size_of::<V>() % 16 == 0
//! ```

use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use super::types::EmbeddingValue;
use super::VALUE_ALIGNMENT;
use crate::error::{Error, Result};

/// Version of a slot that has never been stamped by a training step
pub const UNSTAMPED_VERSION: i64 = -1;

/// Maximum number of embeddings sharing one slot (one init bit each)
pub const MAX_SLOT_NUM: usize = 64;

// =============================================================================
// Layout
// =============================================================================

/// Per-slot element layout, fixed once by `set_alloc_len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    /// Logical embedding width
    pub value_len: usize,
    /// Padded width of one embedding
    pub alloc_len: usize,
    /// Number of embeddings per slot
    pub slot_num: usize,
    /// Elements per slot buffer
    pub total_dims: usize,
}

impl SlotLayout {
    /// Compute the layout for `slot_num` embeddings of `value_len` elements.
    pub fn new<V: EmbeddingValue>(value_len: usize, slot_num: usize) -> Result<Self> {
        if value_len == 0 {
            return Err(Error::InvalidArgument("value_len must be positive".into()));
        }
        if slot_num == 0 || slot_num > MAX_SLOT_NUM {
            return Err(Error::InvalidArgument(format!(
                "slot_num must be in 1..={}, got {}",
                MAX_SLOT_NUM, slot_num
            )));
        }
        let alloc_len = Self::compute_alloc_len::<V>(value_len);
        Ok(Self {
            value_len,
            alloc_len,
            slot_num,
            total_dims: alloc_len * slot_num,
        })
    }

    /// Round `value_len` up so that one embedding spans a multiple of 16 bytes.
    pub fn compute_alloc_len<V: EmbeddingValue>(value_len: usize) -> usize {
        let bytes = value_len * V::BYTES;
        let rem = bytes % VALUE_ALIGNMENT;
        if rem == 0 {
            value_len
        } else {
            value_len + (VALUE_ALIGNMENT - rem) / V::BYTES
        }
    }

    /// Element offset of embedding `emb_index` inside a slot buffer
    #[inline]
    pub fn offset(&self, emb_index: usize) -> usize {
        emb_index * self.alloc_len
    }

    /// Bytes occupied by one slot buffer
    pub fn slot_bytes<V: EmbeddingValue>(&self) -> u64 {
        (self.total_dims * V::BYTES) as u64
    }

    /// Whether every embedding of `self` sits inside its own region of `other`
    pub fn fits_within(&self, other: &SlotLayout) -> bool {
        self.alloc_len <= other.alloc_len && self.slot_num <= other.slot_num
    }

    /// Smallest layout that both `self` and `other` fit within
    pub fn merge(&self, other: &SlotLayout) -> SlotLayout {
        let alloc_len = self.alloc_len.max(other.alloc_len);
        let slot_num = self.slot_num.max(other.slot_num);
        SlotLayout {
            value_len: self.value_len.max(other.value_len),
            alloc_len,
            slot_num,
            total_dims: alloc_len * slot_num,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Plain copy of a slot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHeader {
    pub freq: u64,
    pub version: i64,
    pub init_flags: u64,
}

impl Default for SlotHeader {
    fn default() -> Self {
        Self {
            freq: 0,
            version: UNSTAMPED_VERSION,
            init_flags: 0,
        }
    }
}

#[derive(Debug)]
struct AtomicHeader {
    freq: AtomicU64,
    version: AtomicI64,
    init_flags: AtomicU64,
}

impl AtomicHeader {
    fn new(header: SlotHeader) -> Self {
        Self {
            freq: AtomicU64::new(header.freq),
            version: AtomicI64::new(header.version),
            init_flags: AtomicU64::new(header.init_flags),
        }
    }
}

// =============================================================================
// Slot
// =============================================================================

/// Embedding storage for one key.
#[derive(Debug)]
pub struct ValueSlot<V> {
    header: AtomicHeader,
    len: usize,
    data: RwLock<Option<Box<[V]>>>,
}

impl<V: EmbeddingValue> ValueSlot<V> {
    /// Create a slot of `len` elements whose buffer is allocated later
    pub fn new(len: usize) -> Self {
        Self {
            header: AtomicHeader::new(SlotHeader::default()),
            len,
            data: RwLock::new(None),
        }
    }

    /// Create a slot backed by `buffer`
    pub fn with_buffer(buffer: Box<[V]>) -> Self {
        Self {
            header: AtomicHeader::new(SlotHeader::default()),
            len: buffer.len(),
            data: RwLock::new(Some(buffer)),
        }
    }

    /// Create a heap-backed slot holding a copy of `values`
    pub fn from_values(values: &[V]) -> Self {
        Self::with_buffer(values.to_vec().into_boxed_slice())
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the buffer has been attached
    pub fn is_allocated(&self) -> bool {
        self.data.read().is_some()
    }

    /// Attach a buffer. Fails, handing the buffer back, if one is already set.
    pub fn set_buffer(&self, buffer: Box<[V]>) -> std::result::Result<(), Box<[V]>> {
        if buffer.len() != self.len {
            return Err(buffer);
        }
        let mut guard = self.data.write();
        if guard.is_some() {
            return Err(buffer);
        }
        *guard = Some(buffer);
        Ok(())
    }

    /// Detach the buffer, leaving the slot unallocated
    pub fn take_buffer(&self) -> Option<Box<[V]>> {
        self.data.write().take()
    }

    /// Shared view of the whole buffer
    pub fn read(&self) -> Option<MappedRwLockReadGuard<'_, [V]>> {
        RwLockReadGuard::try_map(self.data.read(), |data| data.as_deref()).ok()
    }

    /// Exclusive view of the whole buffer
    pub fn write(&self) -> Option<MappedRwLockWriteGuard<'_, [V]>> {
        RwLockWriteGuard::try_map(self.data.write(), |data| data.as_deref_mut()).ok()
    }

    /// Exclusive view of one embedding
    pub fn embedding_mut(
        &self,
        layout: &SlotLayout,
        emb_index: usize,
    ) -> Option<MappedRwLockWriteGuard<'_, [V]>> {
        let start = layout.offset(emb_index);
        let end = start + layout.value_len;
        if end > self.len {
            return None;
        }
        RwLockWriteGuard::try_map(self.data.write(), |data| {
            data.as_deref_mut().map(|buf| &mut buf[start..end])
        })
        .ok()
    }

    /// Copy of one embedding's logical values
    pub fn embedding(&self, layout: &SlotLayout, emb_index: usize) -> Option<Vec<V>> {
        let start = layout.offset(emb_index);
        let end = start + layout.value_len;
        let guard = self.read()?;
        guard.get(start..end).map(|values| values.to_vec())
    }

    /// Copy of the whole buffer
    pub fn to_vec(&self) -> Option<Vec<V>> {
        self.read().map(|values| values.to_vec())
    }

    /// Overwrite the buffer prefix with `values`
    pub fn copy_from_slice(&self, values: &[V]) -> bool {
        match self.write() {
            Some(mut dst) => {
                let n = values.len().min(dst.len());
                dst[..n].copy_from_slice(&values[..n]);
                true
            }
            None => false,
        }
    }

    /// Copy this slot's payload into `dst`
    pub fn copy_to(&self, dst: &mut [V]) -> bool {
        match self.read() {
            Some(src) => {
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                true
            }
            None => false,
        }
    }

    /// Copy another slot's payload into this one
    pub fn copy_payload_from(&self, other: &ValueSlot<V>) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        match (other.read(), self.write()) {
            (Some(src), Some(mut dst)) => {
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
                true
            }
            _ => false,
        }
    }

    // Header access

    pub fn header(&self) -> SlotHeader {
        SlotHeader {
            freq: self.freq(),
            version: self.version(),
            init_flags: self.init_flags(),
        }
    }

    pub fn set_header(&self, header: SlotHeader) {
        self.header.freq.store(header.freq, Ordering::Relaxed);
        self.header.version.store(header.version, Ordering::Relaxed);
        self.header
            .init_flags
            .store(header.init_flags, Ordering::Release);
    }

    /// Copy header fields from another slot
    pub fn copy_header_from(&self, other: &ValueSlot<V>) {
        self.set_header(other.header());
    }

    pub fn freq(&self) -> u64 {
        self.header.freq.load(Ordering::Relaxed)
    }

    /// Add `count` accesses, returning the new frequency
    pub fn add_freq(&self, count: u64) -> u64 {
        self.header.freq.fetch_add(count, Ordering::Relaxed) + count
    }

    pub fn version(&self) -> i64 {
        self.header.version.load(Ordering::Relaxed)
    }

    pub fn set_version(&self, version: i64) {
        self.header.version.store(version, Ordering::Relaxed);
    }

    pub fn init_flags(&self) -> u64 {
        self.header.init_flags.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self, emb_index: usize) -> bool {
        emb_index < MAX_SLOT_NUM && self.init_flags() & (1u64 << emb_index) != 0
    }

    pub fn set_initialized(&self, emb_index: usize) {
        if emb_index < MAX_SLOT_NUM {
            self.header
                .init_flags
                .fetch_or(1u64 << emb_index, Ordering::Release);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
