//! Internal messages destined for one partition's work queue.

use std::sync::mpsc;

use hornet_common::error::Status;
use hornet_common::ids::{FragmentId, TableId, TxnId};
use hornet_engine::value::{ParameterSet, RowSet};
use hornet_txn::transaction::{RemoteTransaction, Transaction};
use hornet_txn::work::WorkFragment;

/// Reference to a transaction, carrying the remote handle on the first
/// message that introduces it to this partition.
#[derive(Debug)]
pub struct TxnRef {
    /// Transaction id.
    pub id: TxnId,
    /// Remote handle, present only on first contact.
    pub remote: Option<Box<RemoteTransaction>>,
}

impl TxnRef {
    /// Reference to a transaction this partition already knows.
    #[must_use]
    pub fn known(id: TxnId) -> Self {
        Self { id, remote: None }
    }

    /// Reference introducing a remote transaction to this partition.
    #[must_use]
    pub fn remote(handle: RemoteTransaction) -> Self {
        Self {
            id: handle.id(),
            remote: Some(Box::new(handle)),
        }
    }
}

/// Everything that can appear in a partition's work queue.
#[derive(Debug)]
pub enum InternalMessage {
    /// New client invocation built by the transaction initializer.
    InitializeRequest(Box<Transaction>),
    /// Register a transaction and insert it into this partition's lock queue.
    InitializeTxn(Box<Transaction>),
    /// Run a locally-based transaction that was released to this partition.
    StartTxn(TxnId),
    /// Install the given transaction as the current distributed transaction.
    SetDistributedTxn(TxnRef),
    /// Execute plan fragments on behalf of a distributed transaction.
    WorkFragment {
        /// The owning transaction.
        txn: TxnRef,
        /// The unit of work.
        fragment: WorkFragment,
        /// Batch parameters referenced by the fragment's param indices.
        params: Vec<ParameterSet>,
    },
    /// 2PC phase one for the given transaction.
    Prepare(TxnId),
    /// Terminal commit/abort decision for the given transaction.
    Finish {
        /// The transaction to finish.
        txn: TxnId,
        /// Commit or abort.
        status: Status,
    },
    /// Idle-time execution of a query a procedure deferred.
    DeferredQuery {
        /// Transaction the query was deferred by.
        txn: TxnId,
        /// Fragment to run.
        fragment: FragmentId,
        /// Fragment parameters.
        params: ParameterSet,
    },
    /// Wake-up poke with no payload.
    UtilityWork,
    /// Refresh memory statistics from the engine.
    UpdateMemory,
    /// Collect table statistics and reply on the given channel.
    TableStatsRequest {
        /// Tables to report on.
        table_ids: Vec<TableId>,
        /// Where to deliver the statistics rows.
        reply: mpsc::Sender<RowSet>,
    },
    /// Snapshot maintenance opportunity.
    SnapshotWork,
}

impl InternalMessage {
    /// Returns whether the arrival of this message should interrupt an
    /// in-progress speculative scan.
    #[must_use]
    pub fn interrupts_speculative_scan(&self) -> bool {
        matches!(
            self,
            InternalMessage::StartTxn(_)
                | InternalMessage::SetDistributedTxn(_)
                | InternalMessage::WorkFragment { .. }
        )
    }

    /// Transaction this message belongs to, when it is transactional work.
    #[must_use]
    pub fn txn_id(&self) -> Option<TxnId> {
        match self {
            InternalMessage::InitializeRequest(txn) | InternalMessage::InitializeTxn(txn) => {
                Some(txn.id())
            }
            InternalMessage::StartTxn(id)
            | InternalMessage::Prepare(id)
            | InternalMessage::Finish { txn: id, .. }
            | InternalMessage::DeferredQuery { txn: id, .. } => Some(*id),
            InternalMessage::SetDistributedTxn(txn_ref)
            | InternalMessage::WorkFragment { txn: txn_ref, .. } => Some(txn_ref.id),
            InternalMessage::UtilityWork
            | InternalMessage::UpdateMemory
            | InternalMessage::TableStatsRequest { .. }
            | InternalMessage::SnapshotWork => None,
        }
    }
}
