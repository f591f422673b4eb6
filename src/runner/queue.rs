//! Bounded in-memory queue of task ids feeding the worker pool.

use parking_lot::Mutex as SyncMutex;
use std::collections::HashSet;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;

/// Why an id could not be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushError {
    /// The caller's token fired while waiting for capacity.
    Cancelled,
    /// The queue was closed; nothing will read the id.
    Closed,
}

/// FIFO of task ids with a fixed capacity.
///
/// Workers share the single receiver. The set of queued ids lets recovery
/// paths skip ids that are already waiting. Once `closed` fires, pushes fail
/// and pops return `None`.
pub(crate) struct TaskQueue {
    tx: mpsc::Sender<TaskId>,
    rx: Mutex<mpsc::Receiver<TaskId>>,
    queued: SyncMutex<HashSet<TaskId>>,
    closed: CancellationToken,
    capacity: usize,
}

impl TaskQueue {
    pub(crate) fn new(capacity: usize, closed: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            queued: SyncMutex::new(HashSet::new()),
            closed,
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of ids waiting.
    pub(crate) fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Queue `id`, waiting for capacity until `cancel` fires or the queue
    /// closes.
    pub(crate) async fn push(&self, id: TaskId, cancel: &CancellationToken) -> Result<(), PushError> {
        self.queued.lock().insert(id);
        let sent = tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(PushError::Closed),
            _ = cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.tx.send(id) => sent.map_err(|_| PushError::Closed),
        };
        if sent.is_err() {
            self.queued.lock().remove(&id);
        }
        sent
    }

    /// Queue `id` unless it is already waiting. Returns whether it was queued.
    pub(crate) async fn push_if_absent(
        &self,
        id: TaskId,
        cancel: &CancellationToken,
    ) -> Result<bool, PushError> {
        if self.queued.lock().contains(&id) {
            return Ok(false);
        }
        self.push(id, cancel).await.map(|_| true)
    }

    /// Take the next id, or `None` once the queue is closed.
    ///
    /// Closing is checked first so no new work is taken after a stop.
    pub(crate) async fn pop(&self) -> Option<TaskId> {
        let next = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            id = async { self.rx.lock().await.recv().await } => id,
        };
        if let Some(id) = next {
            self.queued.lock().remove(&id);
        }
        next
    }
}
