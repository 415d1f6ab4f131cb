//! Background compaction worker.
//!
//! In async mode sealed segment ids are handed to a dedicated thread that
//! runs the same compaction routine the sync mode runs inline.

use crossbeam::channel::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

enum CompactionRequest {
    Compact(Vec<u64>),
    Flush(Sender<()>),
}

/// Handle to the compaction thread; dropping it stops the thread.
pub(crate) struct CompactionWorker {
    tx: Option<Sender<CompactionRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl CompactionWorker {
    /// Spawn a worker that calls `compact` for every submitted batch
    pub fn spawn<F>(name: &str, compact: F) -> Result<Self>
    where
        F: Fn(Vec<u64>) + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let handle = std::thread::Builder::new()
            .name(format!("{}-compactor", name))
            .spawn(move || run(rx, compact))
            .map_err(|e| Error::Internal(format!("failed to spawn compaction thread: {}", e)))?;
        info!("Started async SSD compaction for {}", name);
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue segments for compaction
    pub fn submit(&self, segments: Vec<u64>) {
        if segments.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(CompactionRequest::Compact(segments)).is_err() {
                debug!("Compaction thread gone, dropping request");
            }
        }
    }

    /// Block until every request queued so far has been processed
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (ack_tx, ack_rx) = channel::bounded(1);
        if tx.send(CompactionRequest::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for CompactionWorker {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run<F>(rx: Receiver<CompactionRequest>, compact: F)
where
    F: Fn(Vec<u64>),
{
    for request in rx {
        match request {
            CompactionRequest::Compact(segments) => compact(segments),
            CompactionRequest::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("Compaction thread exiting");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_requests_processed_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let worker = CompactionWorker::spawn("test", move |ids| sink.lock().extend(ids)).unwrap();

        worker.submit(vec![1, 2]);
        worker.submit(Vec::new());
        worker.submit(vec![3]);
        worker.flush();

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_drop_joins_thread() {
        let worker = CompactionWorker::spawn("test", |_| {}).unwrap();
        worker.submit(vec![9]);
        drop(worker);
    }
}
