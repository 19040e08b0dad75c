//! Per-partition lock queue ordered by transaction id.
//!
//! Transaction ids are the global sequence: releasing transactions to
//! executors in id order is what serializes cross-partition work. This queue
//! is the in-core stand-in for the lock-queue manager interface the executor
//! consumes (`check_lock_queue`, `lock_queue_insert`, `lock_queue_finished`).

use std::collections::BTreeMap;
use std::ops::Bound;

use hornet_common::error::{HornetError, HornetResult, Status};
use hornet_common::ids::{PartitionId, ProcedureId, TxnId};

/// Scheduling metadata for one queued transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTxn {
    /// Transaction id.
    pub id: TxnId,
    /// Base partition of the transaction.
    pub base_partition: PartitionId,
    /// Stored procedure it runs.
    pub procedure: ProcedureId,
    /// Whether the initializer predicted a single-partition run.
    pub predict_single_partition: bool,
    /// Estimated remaining execution time for policy-driven selection.
    pub estimated_remaining_us: Option<u64>,
}

/// Priority queue of transactions waiting on one partition's lock.
#[derive(Debug, Default)]
pub struct PartitionLockQueue {
    entries: BTreeMap<TxnId, QueuedTxn>,
}

impl PartitionLockQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a transaction into the queue.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is already queued.
    pub fn insert(&mut self, entry: QueuedTxn) -> HornetResult<()> {
        if self.entries.insert(entry.id, entry).is_some() {
            return Err(HornetError::InvalidState(
                "transaction is already in the lock queue",
            ));
        }
        Ok(())
    }

    /// Non-blocking poll: removes and returns the next transaction that may
    /// take this partition's lock.
    pub fn check_lock_queue(&mut self) -> Option<QueuedTxn> {
        self.entries.pop_first().map(|(_, entry)| entry)
    }

    /// Removes a specific transaction, e.g. when the speculative scheduler
    /// claims it from the middle of the queue.
    pub fn remove(&mut self, id: TxnId) -> Option<QueuedTxn> {
        self.entries.remove(&id)
    }

    /// Notification that a transaction reached its terminal state.
    pub fn finished(&mut self, id: TxnId, _status: Status) {
        let _ = self.entries.remove(&id);
    }

    /// Whether a transaction is queued.
    #[must_use]
    pub fn contains(&self, id: TxnId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in id order, starting after `cursor` when given.
    pub fn iter_from(&self, cursor: Option<TxnId>) -> impl Iterator<Item = &QueuedTxn> {
        let lower = match cursor {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        self.entries.range((lower, Bound::Unbounded)).map(|(_, entry)| entry)
    }
}
