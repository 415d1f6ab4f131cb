//! HBM Memory Pool
//!
//! Fixed-size buffer allocator backing the HBM tier. Buffers are created in
//! chunks and recycled through a LIFO free list, so a deallocated buffer is the
//! first one handed out again.
//!
//! Slots evicted or removed from HBM are not returned to the pool right away:
//! they go to a [`ReleaseQueue`] and their buffer is reclaimed once no reader
//! holds the slot anymore.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::slot::ValueSlot;
use super::types::EmbeddingValue;
use crate::error::{Error, Result};

/// Memory pool configuration
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Buffers created per growth step
    pub chunk_blocks: usize,
    /// Upper bound on buffers ever created (None = unbounded)
    pub max_blocks: Option<usize>,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            chunk_blocks: 4096,
            max_blocks: None,
        }
    }
}

struct PoolInner<V> {
    block_len: usize,
    free: Vec<Box<[V]>>,
    total_blocks: usize,
}

/// Free-list allocator of `block_len`-element buffers.
pub struct MemoryPool<V> {
    config: MemoryPoolConfig,
    inner: Mutex<PoolInner<V>>,
    allocations: AtomicU64,
    deallocations: AtomicU64,
}

impl<V: EmbeddingValue> MemoryPool<V> {
    /// Create a pool whose block length is configured later
    pub fn new(config: MemoryPoolConfig) -> Self {
        Self::with_block_len(config, 0)
    }

    /// Create a pool of `block_len`-element buffers
    pub fn with_block_len(config: MemoryPoolConfig, block_len: usize) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                block_len,
                free: Vec::new(),
                total_blocks: 0,
            }),
            allocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
        }
    }

    /// Current block length
    pub fn block_len(&self) -> usize {
        self.inner.lock().block_len
    }

    /// Change the block length. Only allowed while no buffer is checked out;
    /// idle buffers of the old length are discarded.
    pub fn set_block_len(&self, block_len: usize) -> Result<()> {
        if block_len == 0 {
            return Err(Error::InvalidArgument("block length must be positive".into()));
        }
        let mut inner = self.inner.lock();
        if inner.block_len == block_len {
            return Ok(());
        }
        let in_use = inner.total_blocks - inner.free.len();
        if in_use > 0 {
            return Err(Error::InvalidArgument(format!(
                "cannot resize pool blocks from {} to {} with {} buffers in use",
                inner.block_len, block_len, in_use
            )));
        }
        inner.free.clear();
        inner.total_blocks = 0;
        inner.block_len = block_len;
        Ok(())
    }

    fn grow(&self, inner: &mut PoolInner<V>, wanted: usize) -> Result<()> {
        if inner.block_len == 0 {
            return Err(Error::InvalidArgument(
                "memory pool block length not configured".into(),
            ));
        }
        let mut step = self.config.chunk_blocks.max(wanted).max(1);
        if let Some(max) = self.config.max_blocks {
            let headroom = max.saturating_sub(inner.total_blocks);
            if headroom < wanted {
                return Err(Error::ResourceExhausted(format!(
                    "memory pool limit of {} blocks reached ({} requested)",
                    max, wanted
                )));
            }
            step = step.min(headroom);
        }
        let block_len = inner.block_len;
        inner
            .free
            .extend((0..step).map(|_| vec![V::default(); block_len].into_boxed_slice()));
        inner.total_blocks += step;
        debug!(
            "Memory pool grew by {} blocks to {}",
            step, inner.total_blocks
        );
        Ok(())
    }

    /// Hand out one buffer
    pub fn allocate(&self) -> Result<Box<[V]>> {
        let mut inner = self.inner.lock();
        if inner.free.is_empty() {
            self.grow(&mut inner, 1)?;
        }
        let block = inner
            .free
            .pop()
            .ok_or_else(|| Error::Internal("memory pool free list empty after growth".into()))?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(block)
    }

    /// Hand out `n` buffers under a single lock acquisition
    pub fn allocate_batch(&self, n: usize) -> Result<Vec<Box<[V]>>> {
        let mut inner = self.inner.lock();
        if inner.free.len() < n {
            let missing = n - inner.free.len();
            self.grow(&mut inner, missing)?;
        }
        let at = inner.free.len() - n;
        let blocks = inner.free.split_off(at);
        self.allocations.fetch_add(n as u64, Ordering::Relaxed);
        Ok(blocks)
    }

    /// Return one buffer to the free list
    pub fn deallocate(&self, block: Box<[V]>) {
        let mut inner = self.inner.lock();
        self.push_locked(&mut inner, block);
    }

    /// Return many buffers under a single lock acquisition
    pub fn deallocate_batch<I>(&self, blocks: I)
    where
        I: IntoIterator<Item = Box<[V]>>,
    {
        let mut inner = self.inner.lock();
        for block in blocks {
            self.push_locked(&mut inner, block);
        }
    }

    fn push_locked(&self, inner: &mut PoolInner<V>, block: Box<[V]>) {
        if block.len() != inner.block_len {
            warn!(
                "Dropping buffer of {} elements returned to pool of {}-element blocks",
                block.len(),
                inner.block_len
            );
            // The block it replaced is gone for good
            if inner.total_blocks > inner.free.len() {
                inner.total_blocks -= 1;
            }
            return;
        }
        inner.free.push(block);
        self.deallocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get pool statistics
    pub fn stats(&self) -> MemoryPoolStats {
        let inner = self.inner.lock();
        MemoryPoolStats {
            block_len: inner.block_len,
            total_blocks: inner.total_blocks,
            free_blocks: inner.free.len(),
            in_use_blocks: inner.total_blocks - inner.free.len(),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
        }
    }
}

/// Memory pool statistics
#[derive(Debug, Clone, Default)]
pub struct MemoryPoolStats {
    pub block_len: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub in_use_blocks: usize,
    pub allocations: u64,
    pub deallocations: u64,
}

// =============================================================================
// Deferred Release
// =============================================================================

/// Slots retired from a pooled tier, awaiting their last reader.
pub struct ReleaseQueue<V> {
    retired: Mutex<VecDeque<Arc<ValueSlot<V>>>>,
}

impl<V: EmbeddingValue> Default for ReleaseQueue<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: EmbeddingValue> ReleaseQueue<V> {
    pub fn new() -> Self {
        Self {
            retired: Mutex::new(VecDeque::new()),
        }
    }

    /// Park a slot that left the tier map
    pub fn retire(&self, slot: Arc<ValueSlot<V>>) {
        self.retired.lock().push_back(slot);
    }

    pub fn retire_batch<I>(&self, slots: I)
    where
        I: IntoIterator<Item = Arc<ValueSlot<V>>>,
    {
        self.retired.lock().extend(slots);
    }

    /// Number of slots still waiting
    pub fn len(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the buffers of unobserved slots to `pool`, returning how many
    /// were reclaimed.
    pub fn reclaim(&self, pool: &MemoryPool<V>) -> usize {
        let ready: Vec<Box<[V]>> = {
            let mut retired = self.retired.lock();
            let mut ready = Vec::new();
            retired.retain(|slot| {
                // The queue holds the only reference: no reader can reach it.
                if Arc::strong_count(slot) == 1 {
                    if let Some(buffer) = slot.take_buffer() {
                        ready.push(buffer);
                    }
                    false
                } else {
                    true
                }
            });
            ready
        };
        let reclaimed = ready.len();
        if reclaimed > 0 {
            pool.deallocate_batch(ready);
        }
        reclaimed
    }
}

// =============================================================================
// Tests
// =============================================================================
