//! Per-transaction state tracked by the owning executor.

use std::sync::mpsc;

use hashbrown::HashMap;

use hornet_common::error::AbortReason;
use hornet_common::ids::{
    ClientHandle, DISABLE_UNDO_TOKEN, DependencyId, NULL_UNDO_TOKEN, PartitionId, PartitionSet,
    ProcedureId, TxnId, UndoToken,
};
use hornet_engine::value::{ParameterSet, RowSet};

use crate::response::{ClientResponse, ResponseSender};
use crate::work::WorkResultSender;

/// Where a speculatively executed transaction sits relative to the current
/// distributed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeculationType {
    /// No distributed transaction holds the partition.
    Idle,
    /// Local dtxn is mid-execution here.
    Sp1Local,
    /// Remote dtxn has not run at this partition yet.
    Sp2RemoteBefore,
    /// Remote dtxn has already run at this partition.
    Sp2RemoteAfter,
    /// Local dtxn is prepared here.
    Sp3Local,
    /// Remote dtxn is prepared here.
    Sp3Remote,
}

impl SpeculationType {
    /// Returns whether candidates scheduled under this type must pass the
    /// conflict checker. The other types are stall points where any
    /// single-partition transaction is safe.
    #[must_use]
    pub fn requires_conflict_check(self) -> bool {
        matches!(self, SpeculationType::Sp1Local | SpeculationType::Sp2RemoteAfter)
    }
}

/// Estimator verdict about the not-yet-executed remainder of a transaction.
///
/// Drives the undo-logging fast path: when the remainder is valid,
/// non-abortable, and read-only at a partition, a write round may reuse its
/// prior token with logging disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemainderEstimate {
    /// Whether the estimate can be trusted at all.
    pub valid: bool,
    /// Whether the remainder might still abort.
    pub abortable: bool,
    /// Whether the remainder is read-only at the base partition.
    pub read_only_remainder: bool,
}

/// Execution state of one transaction at one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionWorkState {
    /// First undo token used at this partition.
    pub first_undo_token: UndoToken,
    /// Most recent undo token used at this partition.
    pub last_undo_token: UndoToken,
    /// Whether every round so far was read-only.
    pub exec_read_only: bool,
    /// Whether the transaction submitted any engine work here.
    pub executed_work: bool,
    /// Whether work for the transaction is sitting in the work queue.
    pub queued_work: bool,
    /// Whether the lock queue released the transaction to the executor.
    pub released: bool,
    /// 2PC phase-one mark.
    pub prepared: bool,
    /// Terminal mark; no further work is accepted once set.
    pub finished: bool,
}

impl Default for PartitionWorkState {
    fn default() -> Self {
        Self {
            first_undo_token: NULL_UNDO_TOKEN,
            last_undo_token: NULL_UNDO_TOKEN,
            exec_read_only: true,
            executed_work: false,
            queued_work: false,
            released: false,
            prepared: false,
            finished: false,
        }
    }
}

impl PartitionWorkState {
    /// Starts a new execution round under the given token.
    ///
    /// The disable sentinel never becomes the first token: rollback decisions
    /// key off the first *undoable* round.
    pub fn init_round(&mut self, token: UndoToken) {
        if self.first_undo_token == NULL_UNDO_TOKEN && token != DISABLE_UNDO_TOKEN {
            self.first_undo_token = token;
        }
        self.last_undo_token = token;
    }
}

/// A transaction owned by its base partition's executor.
#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    client_handle: ClientHandle,
    base_partition: PartitionId,
    procedure: ProcedureId,
    params: ParameterSet,
    sysproc: bool,
    predict_touched: PartitionSet,
    predict_single_partition: bool,
    speculation: Option<SpeculationType>,
    executed: bool,
    aborted: bool,
    pending_error: Option<AbortReason>,
    touched: PartitionSet,
    done_partitions: PartitionSet,
    work: HashMap<PartitionId, PartitionWorkState>,
    restarts: u32,
    estimated_remaining_us: Option<u64>,
    remainder_estimate: Option<RemainderEstimate>,
    response_tx: Option<ResponseSender>,
    held_response: Option<ClientResponse>,
    prepare_ack_tx: Option<mpsc::Sender<PartitionId>>,
}

impl Transaction {
    /// Creates a freshly initialized transaction.
    #[must_use]
    pub fn new(
        id: TxnId,
        client_handle: ClientHandle,
        base_partition: PartitionId,
        procedure: ProcedureId,
        params: ParameterSet,
        sysproc: bool,
        predict_touched: PartitionSet,
        predict_single_partition: bool,
    ) -> Self {
        Self {
            id,
            client_handle,
            base_partition,
            procedure,
            params,
            sysproc,
            predict_touched,
            predict_single_partition,
            speculation: None,
            executed: false,
            aborted: false,
            pending_error: None,
            touched: PartitionSet::new(),
            done_partitions: PartitionSet::new(),
            work: HashMap::new(),
            restarts: 0,
            estimated_remaining_us: None,
            remainder_estimate: None,
            response_tx: None,
            held_response: None,
            prepare_ack_tx: None,
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Client request handle echoed on the response.
    #[must_use]
    pub fn client_handle(&self) -> ClientHandle {
        self.client_handle
    }

    /// Partition that owns this transaction.
    #[must_use]
    pub fn base_partition(&self) -> PartitionId {
        self.base_partition
    }

    /// Stored procedure this transaction runs.
    #[must_use]
    pub fn procedure(&self) -> ProcedureId {
        self.procedure
    }

    /// Invocation parameters.
    #[must_use]
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    /// Whether this is a system procedure.
    #[must_use]
    pub fn is_sysproc(&self) -> bool {
        self.sysproc
    }

    /// Predicted partition footprint.
    #[must_use]
    pub fn predict_touched(&self) -> &PartitionSet {
        &self.predict_touched
    }

    /// Whether the initializer predicted a single-partition run.
    #[must_use]
    pub fn predict_single_partition(&self) -> bool {
        self.predict_single_partition
    }

    /// Whether the predicted footprint stays within one site.
    #[must_use]
    pub fn predict_all_local(&self, partitions_per_site: u16) -> bool {
        let site = hornet_common::ids::site_for_partition(self.base_partition, partitions_per_site);
        self.predict_touched
            .iter()
            .all(|partition| hornet_common::ids::site_for_partition(partition, partitions_per_site) == site)
    }

    /// Marks the transaction as speculatively executing.
    pub fn set_speculative(&mut self, speculation: SpeculationType) {
        self.speculation = Some(speculation);
    }

    /// Speculation type, when speculative.
    #[must_use]
    pub fn speculation(&self) -> Option<SpeculationType> {
        self.speculation
    }

    /// Whether this transaction runs speculatively.
    #[must_use]
    pub fn is_speculative(&self) -> bool {
        self.speculation.is_some()
    }

    /// Marks that the executor started running the procedure.
    pub fn mark_executed(&mut self) {
        self.executed = true;
    }

    /// Whether the procedure started running.
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Marks the transaction aborted; later non-finish messages are dropped.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Whether the transaction was aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Records the first error hit by this transaction. Later errors are
    /// dropped so the original cause survives to the response.
    pub fn set_pending_error(&mut self, error: AbortReason) {
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
    }

    /// Currently pending error, if any.
    #[must_use]
    pub fn pending_error(&self) -> Option<&AbortReason> {
        self.pending_error.as_ref()
    }

    /// Removes and returns the pending error.
    pub fn take_pending_error(&mut self) -> Option<AbortReason> {
        self.pending_error.take()
    }

    /// Records that work for this transaction was dispatched to a partition.
    pub fn record_touched(&mut self, partition: PartitionId) {
        let _ = self.touched.insert(partition);
    }

    /// Partitions this transaction actually touched.
    #[must_use]
    pub fn touched(&self) -> &PartitionSet {
        &self.touched
    }

    /// Marks a partition as done: the transaction promised to send no more
    /// work there.
    pub fn mark_done(&mut self, partition: PartitionId) {
        let _ = self.done_partitions.insert(partition);
    }

    /// Partitions declared done.
    #[must_use]
    pub fn done_partitions(&self) -> &PartitionSet {
        &self.done_partitions
    }

    /// Per-partition work state, if the partition saw any round.
    #[must_use]
    pub fn work_state(&self, partition: PartitionId) -> Option<&PartitionWorkState> {
        self.work.get(&partition)
    }

    /// Mutable per-partition work state, created on first use.
    pub fn work_state_mut(&mut self, partition: PartitionId) -> &mut PartitionWorkState {
        self.work.entry(partition).or_default()
    }

    /// Number of times this transaction was restarted.
    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Estimated remaining execution time, used by the SHORTEST/LONGEST
    /// scheduler policies.
    #[must_use]
    pub fn estimated_remaining_us(&self) -> Option<u64> {
        self.estimated_remaining_us
    }

    /// Installs the remaining-time estimate.
    pub fn set_estimated_remaining_us(&mut self, micros: u64) {
        self.estimated_remaining_us = Some(micros);
    }

    /// Current remainder estimate, if the estimator produced one.
    #[must_use]
    pub fn remainder_estimate(&self) -> Option<RemainderEstimate> {
        self.remainder_estimate
    }

    /// Installs a remainder estimate.
    pub fn set_remainder_estimate(&mut self, estimate: RemainderEstimate) {
        self.remainder_estimate = Some(estimate);
    }

    /// Installs the one-shot client response sender.
    pub fn set_response_sender(&mut self, sender: ResponseSender) {
        self.response_tx = Some(sender);
    }

    /// Removes the client response sender for delivery.
    pub fn take_response_sender(&mut self) -> Option<ResponseSender> {
        self.response_tx.take()
    }

    /// Parks the client response until two-phase commit resolves.
    pub fn hold_response(&mut self, response: ClientResponse) {
        self.held_response = Some(response);
    }

    /// Removes the parked client response for delivery.
    pub fn take_held_response(&mut self) -> Option<ClientResponse> {
        self.held_response.take()
    }

    /// Installs the 2PC prepare acknowledgement channel.
    pub fn set_prepare_ack_sender(&mut self, sender: mpsc::Sender<PartitionId>) {
        self.prepare_ack_tx = Some(sender);
    }

    /// Acknowledges prepare at a partition, exactly once per partition.
    pub fn send_prepare_ack(&self, partition: PartitionId) {
        if let Some(sender) = &self.prepare_ack_tx {
            // A dropped receiver means the coordinator already resolved the
            // transaction; the ack is moot.
            let _ = sender.send(partition);
        }
    }

    /// Resets the transaction for a restart with a widened prediction.
    ///
    /// Keeps the id, parameters, and response channel; clears all execution
    /// state and marks the transaction multi-partition.
    pub fn restart(&mut self, predict_touched: PartitionSet) {
        self.predict_touched = predict_touched;
        self.predict_single_partition = false;
        self.speculation = None;
        self.executed = false;
        self.aborted = false;
        self.pending_error = None;
        self.touched = PartitionSet::new();
        self.done_partitions = PartitionSet::new();
        self.work.clear();
        self.restarts += 1;
    }
}

/// Lightweight handle for a transaction executing at a non-base partition.
///
/// Borrows the id and parameters; all bookkeeping is scoped to the one
/// partition holding the handle.
#[derive(Debug)]
pub struct RemoteTransaction {
    id: TxnId,
    base_partition: PartitionId,
    procedure: ProcedureId,
    sysproc: bool,
    attached_params: Vec<ParameterSet>,
    prefetch_params: Vec<ParameterSet>,
    attached_inputs: Vec<(DependencyId, RowSet)>,
    /// Work state at the partition holding this handle.
    pub work: PartitionWorkState,
    aborted: bool,
    work_result_tx: WorkResultSender,
    prepare_ack_tx: Option<mpsc::Sender<PartitionId>>,
}

impl RemoteTransaction {
    /// Creates a remote handle.
    #[must_use]
    pub fn new(
        id: TxnId,
        base_partition: PartitionId,
        procedure: ProcedureId,
        sysproc: bool,
        work_result_tx: WorkResultSender,
    ) -> Self {
        Self {
            id,
            base_partition,
            procedure,
            sysproc,
            attached_params: Vec::new(),
            prefetch_params: Vec::new(),
            attached_inputs: Vec::new(),
            work: PartitionWorkState::default(),
            aborted: false,
            work_result_tx,
            prepare_ack_tx: None,
        }
    }

    /// Transaction id.
    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The transaction's base partition.
    #[must_use]
    pub fn base_partition(&self) -> PartitionId {
        self.base_partition
    }

    /// Stored procedure the transaction runs.
    #[must_use]
    pub fn procedure(&self) -> ProcedureId {
        self.procedure
    }

    /// Whether this is a system procedure.
    #[must_use]
    pub fn is_sysproc(&self) -> bool {
        self.sysproc
    }

    /// Parameter sets attached by the work request.
    #[must_use]
    pub fn attached_params(&self) -> &[ParameterSet] {
        &self.attached_params
    }

    /// Replaces the attached parameter sets.
    pub fn attach_params(&mut self, params: Vec<ParameterSet>) {
        self.attached_params = params;
    }

    /// Parameter sets attached for prefetch fragments.
    #[must_use]
    pub fn prefetch_params(&self) -> &[ParameterSet] {
        &self.prefetch_params
    }

    /// Replaces the prefetch parameter sets.
    pub fn attach_prefetch_params(&mut self, params: Vec<ParameterSet>) {
        self.prefetch_params = params;
    }

    /// Input dependencies the work request shipped alongside its fragments.
    #[must_use]
    pub fn attached_inputs(&self) -> &[(DependencyId, RowSet)] {
        &self.attached_inputs
    }

    /// Attaches input dependencies for upcoming work units.
    pub fn attach_inputs(&mut self, inputs: Vec<(DependencyId, RowSet)>) {
        self.attached_inputs = inputs;
    }

    /// Sender for work results back to the base partition.
    #[must_use]
    pub fn work_result_sender(&self) -> &WorkResultSender {
        &self.work_result_tx
    }

    /// Marks the transaction aborted at this partition.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
    }

    /// Whether the transaction was aborted at this partition.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Installs the 2PC prepare acknowledgement channel.
    pub fn set_prepare_ack_sender(&mut self, sender: mpsc::Sender<PartitionId>) {
        self.prepare_ack_tx = Some(sender);
    }

    /// Acknowledges prepare at this handle's partition.
    pub fn send_prepare_ack(&self, partition: PartitionId) {
        if let Some(sender) = &self.prepare_ack_tx {
            let _ = sender.send(partition);
        }
    }
}
