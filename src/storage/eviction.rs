//! Background eviction.
//!
//! A dedicated thread drains a task queue and calls back into the
//! orchestrator through a weak handle, so an eviction pass can never keep the
//! storage alive after its owner drops it.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::EmbeddingKey;
use crate::error::{Error, Result};

/// Work items for the eviction thread
#[derive(Debug)]
pub enum EvictionTask<K> {
    /// Run one HBM eviction pass
    Evict,
    /// Push keys just demoted into DRAM through the DRAM policy
    DemoteDram { keys: Vec<K> },
    /// Acknowledge once every earlier task has run
    Flush(Sender<()>),
    /// Stop the thread; tasks queued behind it are discarded
    Shutdown,
}

/// Receiver of eviction work
pub trait EvictionHandler<K>: Send + Sync {
    /// Evict HBM overage into DRAM; returns the number of keys moved
    fn batch_eviction(&self) -> Result<usize>;

    /// Admit demoted keys into the DRAM policy and spill DRAM overage to SSD
    fn demote_dram(&self, keys: Vec<K>) -> Result<usize>;
}

/// Cloneable handle for queueing tasks from inside the handler
#[derive(Clone)]
pub struct EvictionScheduler<K> {
    tx: Sender<EvictionTask<K>>,
}

impl<K: EmbeddingKey> EvictionScheduler<K> {
    pub fn schedule(&self, task: EvictionTask<K>) {
        if self.tx.send(task).is_err() {
            debug!("Eviction thread gone, dropping task");
        }
    }
}

/// Owns the eviction thread
pub struct EvictionManager<K: EmbeddingKey> {
    tx: Option<Sender<EvictionTask<K>>>,
    handle: Option<JoinHandle<()>>,
}

impl<K: EmbeddingKey> EvictionManager<K> {
    /// Start the eviction thread.
    ///
    /// With an `interval`, an HBM pass also runs whenever the queue stays idle
    /// that long.
    pub fn start(
        name: &str,
        handler: Weak<dyn EvictionHandler<K>>,
        interval: Option<Duration>,
    ) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("{}-eviction", name))
            .spawn(move || run(rx, handler, interval))
            .map_err(|e| Error::Internal(format!("failed to spawn eviction thread: {}", e)))?;
        info!(
            "Started eviction thread for {} (periodic: {:?})",
            name, interval
        );
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a task; silently dropped once the thread is gone
    pub fn schedule(&self, task: EvictionTask<K>) {
        if let Some(tx) = &self.tx {
            if tx.send(task).is_err() {
                debug!("Eviction thread gone, dropping task");
            }
        }
    }

    /// Handle that can outlive a borrow of the manager
    pub fn scheduler(&self) -> Option<EvictionScheduler<K>> {
        self.tx.as_ref().map(|tx| EvictionScheduler { tx: tx.clone() })
    }

    /// Block until all tasks queued so far have run
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = channel::bounded(1);
        if tx.send(EvictionTask::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl<K: EmbeddingKey> Drop for EvictionManager<K> {
    fn drop(&mut self) {
        // Schedulers may still hold senders, so closing ours is not enough
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(EvictionTask::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<K: EmbeddingKey>(
    rx: Receiver<EvictionTask<K>>,
    handler: Weak<dyn EvictionHandler<K>>,
    interval: Option<Duration>,
) {
    loop {
        let task = match interval {
            Some(every) => match rx.recv_timeout(every) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => EvictionTask::Evict,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        match task {
            EvictionTask::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            EvictionTask::Shutdown => break,
            _ => {}
        }

        let Some(handler) = handler.upgrade() else {
            break;
        };
        let outcome = match task {
            EvictionTask::Evict => handler.batch_eviction(),
            EvictionTask::DemoteDram { keys } => handler.demote_dram(keys),
            EvictionTask::Flush(_) | EvictionTask::Shutdown => Ok(0),
        };
        if let Err(e) = outcome {
            warn!("Eviction task failed: {}", e);
        }
    }
    debug!("Eviction thread exiting");
}

// =============================================================================
// Tests
// =============================================================================
