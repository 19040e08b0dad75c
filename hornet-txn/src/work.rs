//! Wire-level work messages exchanged between executors and sites.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

use hornet_common::error::{AbortReason, HornetError, HornetResult, Status};
use hornet_common::ids::{DependencyId, FragmentId, PartitionId, ProcedureId, TxnId};

/// One unit of plan-fragment work destined for a single partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFragment {
    /// Destination partition.
    pub partition: PartitionId,
    /// Fragments to run, in order.
    pub fragment_ids: Vec<FragmentId>,
    /// Index into the batch parameter array, one per fragment.
    pub param_indices: Vec<usize>,
    /// Input dependency per fragment; `None` for leaves.
    pub input_dep_ids: Vec<Option<DependencyId>>,
    /// Output dependency id per fragment.
    pub output_dep_ids: Vec<DependencyId>,
    /// Whether every fragment in this unit is read-only.
    pub read_only: bool,
    /// Whether this is the last work the transaction will send to this
    /// partition; triggers an early 2PC prepare.
    pub last_fragment: bool,
    /// Whether this unit is a speculative prefetch.
    pub prefetch: bool,
    /// Whether input dependencies must be attached before execution.
    pub needs_input: bool,
    /// Statement estimates for remote speculation, as (fragment, invocation
    /// count) pairs.
    pub future_statements: Option<Vec<(FragmentId, u32)>>,
}

impl WorkFragment {
    /// Number of fragments in this unit.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fragment_ids.len()
    }

    /// Returns whether the unit carries no fragments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fragment_ids.is_empty()
    }
}

/// Result of executing one [`WorkFragment`] at its destination partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkResult {
    /// Partition that executed the work.
    pub partition: PartitionId,
    /// Outcome status.
    pub status: Status,
    /// Output dependency ids, aligned with `dep_data`.
    pub dep_ids: Vec<DependencyId>,
    /// Length-prefixed serialized row sets, one per dependency id.
    pub dep_data: Vec<Vec<u8>>,
    /// Failure cause when `status` is not [`Status::Ok`].
    pub error: Option<AbortReason>,
}

/// Batched work request for one destination site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionWorkRequest {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// The transaction's base partition.
    pub base_partition: PartitionId,
    /// Stored procedure the transaction runs.
    pub procedure: ProcedureId,
    /// Whether it is a system procedure.
    pub sysproc: bool,
    /// Work units for partitions at the destination site.
    pub fragments: Vec<WorkFragment>,
    /// Serialized parameter sets shared by all units in this request.
    pub serialized_params: Vec<Vec<u8>>,
    /// Input dependency ids attached to this request.
    pub attached_dep_ids: Vec<DependencyId>,
    /// Serialized row sets for the attached dependencies, aligned with
    /// `attached_dep_ids`.
    pub attached_dep_data: Vec<Vec<u8>>,
}

/// Sender half for routing [`WorkResult`]s back to the dispatching executor.
///
/// Every send also raises the dispatcher's scan-interrupt flag so an
/// in-progress speculative scan yields to the arriving result.
#[derive(Debug, Clone)]
pub struct WorkResultSender {
    inner: mpsc::Sender<WorkResult>,
    interrupt: Arc<AtomicBool>,
}

impl WorkResultSender {
    /// Creates a connected sender/receiver pair plus the interrupt flag the
    /// sender raises.
    #[must_use]
    pub fn channel(interrupt: Arc<AtomicBool>) -> (Self, mpsc::Receiver<WorkResult>) {
        let (inner, receiver) = mpsc::channel();
        (Self { inner, interrupt }, receiver)
    }

    /// Delivers one work result.
    ///
    /// # Errors
    ///
    /// Returns an error when the dispatching executor is gone.
    pub fn send(&self, result: WorkResult) -> HornetResult<()> {
        self.interrupt.store(true, Ordering::Release);
        self.inner
            .send(result)
            .map_err(|_| HornetError::Disconnected("work-result receiver dropped"))
    }
}
