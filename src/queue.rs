//! The bounded FIFO admission queue. Plain data living inside the
//! Pool's single coarse mutex — there is no separate lock here; the Pool is
//! the only thing that ever touches a `QueueEntry`.

use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::error::AppError;
use crate::worker::OcrOutcome;

/// A pending job awaiting a free Worker.
pub struct QueueEntry {
    /// Internal FIFO identity, used to remove an entry "by identity" on
    /// timeout even though the client-supplied id is not guaranteed unique.
    pub seq: u64,
    /// Client-supplied (or generated) 4-hex correlation id, distinct from a
    /// Worker's own 16-hex request ids.
    pub request_id: String,
    pub pdf_path: PathBuf,
    pub tx: oneshot::Sender<Result<OcrOutcome, AppError>>,
}

/// Strict FIFO queue of pending jobs. `queue_max` entries at most.
pub struct AdmissionQueue {
    entries: std::collections::VecDeque<QueueEntry>,
    queue_max: usize,
}

impl AdmissionQueue {
    pub fn new(queue_max: usize) -> Self {
        Self {
            entries: std::collections::VecDeque::new(),
            queue_max,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.queue_max
    }

    /// Enqueue at the tail. Caller must have already checked `!is_full()`.
    pub fn push_back(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    /// Put an entry back at the head, preserving FIFO order for the rest of
    /// the queue. Used when a dispatch attempt races a Worker crash.
    pub fn push_front(&mut self, entry: QueueEntry) {
        self.entries.push_front(entry);
    }

    pub fn pop_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Remove an entry by its FIFO identity, wherever it sits in the queue.
    /// Used by the per-entry timeout; a no-op if the entry already dispatched
    /// (the "cancel the timer" half of the contract is implicit: a timeout
    /// that fires after dequeue simply finds nothing to remove).
    pub fn remove_by_seq(&mut self, seq: u64) -> Option<QueueEntry> {
        let idx = self.entries.iter().position(|e| e.seq == seq)?;
        self.entries.remove(idx)
    }
}
