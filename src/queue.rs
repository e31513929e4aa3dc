//! Bounded hand-off queue between the binlog listener and the worker pool.
//!
//! One producer (the listener), one consuming stage (the pool's partitioner,
//! which fans out to per-worker queues by table hash). The queue enforces
//! backpressure: when full, [`ChangeSender::send`] suspends until space
//! frees up or the run's shutdown signal fires. Events are never dropped
//! or reordered.
//!
//! Closure is signalled by dropping the sender; receivers drain whatever is
//! still buffered before observing end-of-stream.

use crate::error::{Result, SyncError};
use crate::event::RowChange;
use crate::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Default queue capacity (events).
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Create a bounded change queue with the given capacity.
pub fn change_queue(capacity: usize) -> (ChangeSender, ChangeReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        ChangeSender {
            tx,
            depth: Arc::clone(&depth),
            capacity,
        },
        ChangeReceiver { rx, depth },
    )
}

/// Producer end of the change queue. Held by the listener.
pub struct ChangeSender {
    tx: mpsc::Sender<RowChange>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl ChangeSender {
    /// Enqueue a change, blocking while the queue is full.
    ///
    /// Cancellable: returns [`SyncError::Shutdown`] if the shutdown signal
    /// fires while suspended. The change is not enqueued in that case.
    pub async fn send(&self, change: RowChange, shutdown: &watch::Receiver<bool>) -> Result<()> {
        if *shutdown.borrow() {
            return Err(SyncError::Shutdown);
        }
        let mut shutdown = shutdown.clone();
        tokio::select! {
            biased;

            _ = shutdown.changed() => Err(SyncError::Shutdown),

            permit = self.tx.reserve() => match permit {
                Ok(permit) => {
                    permit.send(change);
                    let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::set_queue_depth(depth);
                    Ok(())
                }
                Err(_) => Err(SyncError::Internal("change queue closed".to_string())),
            },
        }
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of buffered events.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Consumer end of the change queue. Held by the worker pool.
pub struct ChangeReceiver {
    rx: mpsc::Receiver<RowChange>,
    depth: Arc<AtomicUsize>,
}

impl ChangeReceiver {
    /// Receive the next change in FIFO order.
    ///
    /// Returns `None` once the producer is gone and the buffer is drained.
    pub async fn recv(&mut self) -> Option<RowChange> {
        let change = self.rx.recv().await;
        if change.is_some() {
            let depth = self.depth.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            metrics::set_queue_depth(depth);
        }
        change
    }

    /// Approximate number of buffered events.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}
