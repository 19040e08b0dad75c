//! Partition-local transaction arena.
//!
//! Each executor owns one arena holding every transaction it currently knows
//! about: full state for transactions based at its partition, lightweight
//! remote handles for everything else. All other components refer to
//! transactions by id and look them up here, which keeps ownership acyclic.

use hashbrown::HashMap;

use hornet_common::ids::{NULL_UNDO_TOKEN, PartitionId, ProcedureId, TxnId, UndoToken};

use crate::transaction::{PartitionWorkState, RemoteTransaction, Transaction};

/// Arena slot: an owned local transaction or a borrowed remote handle.
#[derive(Debug)]
pub enum TxnSlot {
    /// Transaction based at this partition.
    Local(Transaction),
    /// Handle for a transaction based elsewhere.
    Remote(RemoteTransaction),
}

impl TxnSlot {
    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        match self {
            TxnSlot::Local(txn) => txn.id(),
            TxnSlot::Remote(txn) => txn.id(),
        }
    }

    /// The transaction's base partition.
    #[must_use]
    pub fn base_partition(&self) -> PartitionId {
        match self {
            TxnSlot::Local(txn) => txn.base_partition(),
            TxnSlot::Remote(txn) => txn.base_partition(),
        }
    }

    /// Stored procedure the transaction runs.
    #[must_use]
    pub fn procedure(&self) -> ProcedureId {
        match self {
            TxnSlot::Local(txn) => txn.procedure(),
            TxnSlot::Remote(txn) => txn.procedure(),
        }
    }

    /// Whether this is a system procedure.
    #[must_use]
    pub fn is_sysproc(&self) -> bool {
        match self {
            TxnSlot::Local(txn) => txn.is_sysproc(),
            TxnSlot::Remote(txn) => txn.is_sysproc(),
        }
    }

    /// Whether the slot holds a locally-based transaction.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, TxnSlot::Local(_))
    }

    /// Whether the transaction was predicted single-partition. Remote handles
    /// are multi-partition by construction.
    #[must_use]
    pub fn predict_single_partition(&self) -> bool {
        match self {
            TxnSlot::Local(txn) => txn.predict_single_partition(),
            TxnSlot::Remote(_) => false,
        }
    }

    /// Whether the transaction executes speculatively. Only locally-based
    /// transactions can.
    #[must_use]
    pub fn is_speculative(&self) -> bool {
        match self {
            TxnSlot::Local(txn) => txn.is_speculative(),
            TxnSlot::Remote(_) => false,
        }
    }

    /// Whether the procedure started running. For remote handles this means
    /// work was submitted at the holding partition.
    #[must_use]
    pub fn is_executed(&self) -> bool {
        match self {
            TxnSlot::Local(txn) => txn.is_executed(),
            TxnSlot::Remote(txn) => txn.work.executed_work,
        }
    }

    /// Whether the transaction was marked aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        match self {
            TxnSlot::Local(txn) => txn.is_aborted(),
            TxnSlot::Remote(txn) => txn.is_aborted(),
        }
    }

    /// Work state at the given partition, if any round ran there.
    #[must_use]
    pub fn work_state(&self, partition: PartitionId) -> Option<&PartitionWorkState> {
        match self {
            TxnSlot::Local(txn) => txn.work_state(partition),
            TxnSlot::Remote(txn) => Some(&txn.work),
        }
    }

    /// Mutable work state at the given partition.
    pub fn work_state_mut(&mut self, partition: PartitionId) -> &mut PartitionWorkState {
        match self {
            TxnSlot::Local(txn) => txn.work_state_mut(partition),
            TxnSlot::Remote(txn) => &mut txn.work,
        }
    }

    /// First undo token used at the partition.
    #[must_use]
    pub fn first_undo_token(&self, partition: PartitionId) -> UndoToken {
        self.work_state(partition)
            .map_or(NULL_UNDO_TOKEN, |work| work.first_undo_token)
    }

    /// Most recent undo token used at the partition.
    #[must_use]
    pub fn last_undo_token(&self, partition: PartitionId) -> UndoToken {
        self.work_state(partition)
            .map_or(NULL_UNDO_TOKEN, |work| work.last_undo_token)
    }

    /// Whether every round at the partition was read-only.
    #[must_use]
    pub fn is_exec_read_only(&self, partition: PartitionId) -> bool {
        self.work_state(partition).is_none_or(|work| work.exec_read_only)
    }

    /// Whether the transaction submitted engine work at the partition.
    #[must_use]
    pub fn has_executed_work(&self, partition: PartitionId) -> bool {
        self.work_state(partition).is_some_and(|work| work.executed_work)
    }

    /// Whether the partition must push a commit/abort into the engine for
    /// this transaction.
    #[must_use]
    pub fn needs_finish(&self, partition: PartitionId) -> bool {
        self.work_state(partition)
            .is_some_and(|work| work.executed_work && !work.finished)
    }

    /// Marks 2PC prepare. Returns `false` when already prepared, making the
    /// transition idempotent.
    pub fn mark_prepared(&mut self, partition: PartitionId) -> bool {
        let work = self.work_state_mut(partition);
        if work.prepared {
            return false;
        }
        work.prepared = true;
        true
    }

    /// Whether the transaction is prepared at the partition.
    #[must_use]
    pub fn is_prepared(&self, partition: PartitionId) -> bool {
        self.work_state(partition).is_some_and(|work| work.prepared)
    }

    /// Marks the terminal state at the partition.
    pub fn mark_finished(&mut self, partition: PartitionId) {
        self.work_state_mut(partition).finished = true;
    }

    /// Whether the transaction finished at the partition.
    #[must_use]
    pub fn is_finished(&self, partition: PartitionId) -> bool {
        self.work_state(partition).is_some_and(|work| work.finished)
    }
}

/// Id-indexed storage for every transaction a partition knows about.
#[derive(Debug, Default)]
pub struct TransactionArena {
    slots: HashMap<TxnId, TxnSlot>,
}

impl TransactionArena {
    /// Creates an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a locally-based transaction.
    pub fn insert_local(&mut self, txn: Transaction) {
        let _ = self.slots.insert(txn.id(), TxnSlot::Local(txn));
    }

    /// Inserts a remote handle.
    pub fn insert_remote(&mut self, txn: RemoteTransaction) {
        let _ = self.slots.insert(txn.id(), TxnSlot::Remote(txn));
    }

    /// Looks up any slot.
    #[must_use]
    pub fn get(&self, id: TxnId) -> Option<&TxnSlot> {
        self.slots.get(&id)
    }

    /// Looks up any slot mutably.
    pub fn get_mut(&mut self, id: TxnId) -> Option<&mut TxnSlot> {
        self.slots.get_mut(&id)
    }

    /// Looks up a local transaction.
    #[must_use]
    pub fn local(&self, id: TxnId) -> Option<&Transaction> {
        match self.slots.get(&id) {
            Some(TxnSlot::Local(txn)) => Some(txn),
            _ => None,
        }
    }

    /// Looks up a local transaction mutably.
    pub fn local_mut(&mut self, id: TxnId) -> Option<&mut Transaction> {
        match self.slots.get_mut(&id) {
            Some(TxnSlot::Local(txn)) => Some(txn),
            _ => None,
        }
    }

    /// Looks up a remote handle mutably.
    pub fn remote_mut(&mut self, id: TxnId) -> Option<&mut RemoteTransaction> {
        match self.slots.get_mut(&id) {
            Some(TxnSlot::Remote(txn)) => Some(txn),
            _ => None,
        }
    }

    /// Removes a slot once every finish callback arrived.
    pub fn remove(&mut self, id: TxnId) -> Option<TxnSlot> {
        self.slots.remove(&id)
    }

    /// Number of live slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns whether the arena holds no transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
