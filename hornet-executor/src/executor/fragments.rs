//! Plan-fragment processing on behalf of distributed transactions.

use tracing::{debug, warn};

use hornet_common::error::{HornetError, HornetResult, Status};
use hornet_common::ids::{DISABLE_UNDO_TOKEN, FragmentId, TxnId};
use hornet_engine::engine::{
    DependencySet, EngineError, ExecutionEngine, FragmentExecRequest,
};
use hornet_engine::value::ParameterSet;
use hornet_engine::wire;
use hornet_txn::arena::TxnSlot;
use hornet_txn::work::{WorkFragment, WorkResult};

use crate::coordinator::Coordinator;
use crate::executor::{ExecutionMode, PartitionExecutor};
use crate::messages::{InternalMessage, TxnRef};

impl<E: ExecutionEngine, C: Coordinator> PartitionExecutor<E, C> {
    /// 2PC phase one at this partition (idempotent).
    pub(crate) fn prepare_transaction(&mut self, id: TxnId) -> HornetResult<()> {
        let Some(slot) = self.arena.get_mut(id) else {
            warn!(partition = self.partition_id, txn = id, "prepare for unknown transaction");
            return Ok(());
        };
        if slot.is_finished(self.partition_id) {
            return Err(HornetError::InvalidState(
                "prepare arrived after the transaction finished here",
            ));
        }

        if slot.mark_prepared(self.partition_id) {
            match slot {
                TxnSlot::Local(txn) => txn.send_prepare_ack(self.partition_id),
                TxnSlot::Remote(txn) => txn.send_prepare_ack(self.partition_id),
            }
            let read_only = self.arena.get(id).is_some_and(|slot| {
                slot.is_exec_read_only(self.partition_id)
            });
            let new_mode = if self.config.specexec_enable && read_only {
                ExecutionMode::CommitReadonly
            } else {
                ExecutionMode::CommitNone
            };
            if self.current_dtxn.is_some() {
                self.set_execution_mode(new_mode)?;
            }
        } else {
            debug!(
                partition = self.partition_id,
                txn = id,
                "already prepared at this partition"
            );
        }
        Ok(())
    }

    pub(crate) fn process_work_fragment_message(
        &mut self,
        txn: TxnRef,
        fragment: WorkFragment,
        params: Vec<ParameterSet>,
    ) -> HornetResult<()> {
        let id = txn.id;
        if let Some(handle) = txn.remote
            && self.arena.get(id).is_none()
        {
            self.arena.insert_remote(*handle);
        }
        let Some(slot) = self.arena.get(id) else {
            warn!(
                partition = self.partition_id,
                txn = id,
                "work fragment for unknown transaction"
            );
            return Ok(());
        };

        // Prefetch fragments carry their parameters on the remote handle.
        let params = if fragment.prefetch && params.is_empty() {
            match slot {
                TxnSlot::Remote(remote) => remote.prefetch_params().to_vec(),
                TxnSlot::Local(_) => params,
            }
        } else {
            params
        };

        // Read-only work on a so-far read-only transaction keeps speculative
        // responses flowing; anything else queues them.
        let new_mode = if self.config.specexec_enable {
            if fragment.read_only && slot.is_exec_read_only(self.partition_id) {
                ExecutionMode::CommitReadonly
            } else {
                ExecutionMode::CommitNone
            }
        } else {
            ExecutionMode::Disabled
        };

        if self.current_dtxn.is_none() {
            self.set_current_dtxn(id)?;
        } else if self.current_dtxn != Some(id) {
            debug!(
                partition = self.partition_id,
                txn = id,
                current = ?self.current_dtxn,
                "blocking work fragment until the current dtxn finishes"
            );
            self.blocked_messages.push_back(InternalMessage::WorkFragment {
                txn: TxnRef::known(id),
                fragment,
                params,
            });
            return Ok(());
        }
        self.set_execution_mode(new_mode)?;
        self.process_work_fragment(id, &fragment, &params)
    }

    /// Executes one work fragment for a transaction based at another
    /// partition and routes the result back.
    pub(crate) fn process_work_fragment(
        &mut self,
        id: TxnId,
        fragment: &WorkFragment,
        params: &[ParameterSet],
    ) -> HornetResult<()> {
        if fragment.partition != self.partition_id {
            return Err(HornetError::InvalidState(
                "work fragment routed to the wrong partition",
            ));
        }
        let Some(slot) = self.arena.get(id) else {
            return Err(HornetError::InvalidState(
                "work fragment for unknown transaction",
            ));
        };
        if slot.is_prepared(self.partition_id) {
            return Err(HornetError::InvalidState(
                "work fragment arrived after 2PC prepare",
            ));
        }

        let base_local = slot.base_partition() == self.partition_id;
        if !base_local {
            let token =
                self.undo
                    .calculate_next(slot, self.partition_id, fragment.read_only, &self.config);
            if let Some(slot) = self.arena.get_mut(id) {
                slot.work_state_mut(self.partition_id).init_round(token);
            }
        }

        let outcome = self.execute_work_fragment(id, fragment, params);
        let (status, deps, error) = match outcome {
            Ok(deps) => (Status::Ok, Some(deps), None),
            Err(EngineFault(fault)) => return Err(fault),
            Err(Abort(engine_error)) => {
                let reason = engine_error.abort_reason();
                warn!(
                    partition = self.partition_id,
                    txn = id,
                    %engine_error,
                    "work fragment aborted"
                );
                (reason.status(), None, Some(reason))
            }
        };

        if fragment.prefetch {
            if let (Status::Ok, Some(deps)) = (status, &deps) {
                self.cache_prefetch_results(id, fragment, params, deps);
                let result = build_work_result(self.partition_id, status, deps.clone(), None);
                self.coordinator.transaction_prefetch_result(id, result)?;
            }
            return Ok(());
        }

        if let Some(TxnSlot::Remote(remote)) = self.arena.get(id) {
            let result = build_work_result(
                self.partition_id,
                status,
                deps.unwrap_or_default(),
                error,
            );
            if let Err(send_error) = remote.work_result_sender().send(result) {
                warn!(
                    partition = self.partition_id,
                    txn = id,
                    %send_error,
                    "base partition gone before work result delivery"
                );
            }
        }

        // The transaction promised this was its last work here, so start 2PC
        // early instead of waiting for the coordinator's prepare.
        if !base_local && fragment.last_fragment {
            self.self_sender.send(InternalMessage::Prepare(id))?;
        }
        Ok(())
    }

    /// Runs the fragment batch against the engine (or the sysproc registry)
    /// under the transaction's current undo token.
    pub(crate) fn execute_work_fragment(
        &mut self,
        id: TxnId,
        fragment: &WorkFragment,
        params: &[ParameterSet],
    ) -> Result<DependencySet, FragmentFailure> {
        let Some(slot) = self.arena.get(id) else {
            return Err(EngineFault(HornetError::InvalidState(
                "executing a fragment for an unknown transaction",
            )));
        };
        let token = slot.last_undo_token(self.partition_id);

        let mut fragment_params = Vec::with_capacity(fragment.len());
        for index in &fragment.param_indices {
            let Some(param) = params.get(*index) else {
                return Err(Abort(EngineError::Fault(format!(
                    "parameter index {index} out of range"
                ))));
            };
            fragment_params.push(param.clone());
        }

        if slot.is_sysproc() {
            return self.execute_sysproc_fragment(id, fragment, &fragment_params);
        }

        // Track the table footprint so read-only status and conflict state
        // stay accurate.
        let mut batch_read_only = true;
        for fragment_id in &fragment.fragment_ids {
            let read_only = self
                .catalog
                .fragment(*fragment_id)
                .is_none_or(|def| def.read_only);
            batch_read_only = batch_read_only && read_only;
        }
        if let Some(slot) = self.arena.get_mut(id) {
            let work = slot.work_state_mut(self.partition_id);
            if work.exec_read_only {
                if !batch_read_only {
                    work.exec_read_only = false;
                }
                work.executed_work = true;
            }
        }

        // Undo-token monotonicity is a cluster-wide invariant; a violation
        // here is fatal, not an abort.
        if token != DISABLE_UNDO_TOKEN && token <= self.undo.last_committed() {
            return Err(EngineFault(HornetError::EngineFault(format!(
                "undo token {token} is not above last committed {}",
                self.undo.last_committed()
            ))));
        }

        // Inputs shipped with the work request get stashed ahead of the unit
        // that consumes them.
        if fragment.needs_input
            && let Some(TxnSlot::Remote(remote)) = self.arena.get(id)
        {
            let mut stash: hashbrown::HashMap<_, Vec<_>> = hashbrown::HashMap::new();
            for (dep, rows) in remote.attached_inputs() {
                if fragment.input_dep_ids.contains(&Some(*dep)) {
                    stash.entry(*dep).or_default().push(rows.clone());
                }
            }
            if !stash.is_empty() {
                self.engine.stash_work_unit_dependencies(stash);
            }
        }

        let request = FragmentExecRequest {
            fragment_ids: fragment.fragment_ids.clone(),
            params: fragment_params,
            input_dep_ids: fragment.input_dep_ids.clone(),
            output_dep_ids: fragment.output_dep_ids.clone(),
            txn_id: id,
            last_committed_txn: self.last_committed_txn,
            undo_token: token,
        };
        self.engine.execute_plan_fragments(&request).map_err(Abort)
    }

    fn execute_sysproc_fragment(
        &mut self,
        id: TxnId,
        fragment: &WorkFragment,
        params: &[ParameterSet],
    ) -> Result<DependencySet, FragmentFailure> {
        if fragment.len() != 1 {
            return Err(Abort(EngineError::Fault(
                "sysproc work units carry exactly one fragment".to_owned(),
            )));
        }
        let fragment_id = fragment.fragment_ids[0];
        let Some(handler) = self.sysprocs.get(fragment_id).cloned() else {
            return Err(EngineFault(HornetError::InvalidState(
                "no sysproc handle exists for this fragment",
            )));
        };
        if let Some(slot) = self.arena.get_mut(id) {
            let work = slot.work_state_mut(self.partition_id);
            work.exec_read_only = false;
            work.executed_work = true;
        }
        let rows = handler
            .execute(id, &params[0], &[])
            .map_err(Abort)?;
        Ok(DependencySet {
            dep_ids: fragment.output_dep_ids.clone(),
            rowsets: vec![rows],
        })
    }

    pub(crate) fn cache_prefetch_results(
        &mut self,
        id: TxnId,
        fragment: &WorkFragment,
        params: &[ParameterSet],
        deps: &DependencySet,
    ) {
        for (index, fragment_id) in fragment.fragment_ids.iter().enumerate() {
            let Some(rows) = deps.rowsets.get(index) else {
                continue;
            };
            let param_hash = fragment
                .param_indices
                .get(index)
                .and_then(|param_index| params.get(*param_index))
                .map_or(0, ParameterSet::param_hash);
            self.query_cache.add_result(
                id,
                *fragment_id,
                self.partition_id,
                param_hash,
                rows.clone(),
            );
        }
    }

    /// Idle-time execution of a deferred query. Failures are logged, never
    /// surfaced: the deferring transaction already answered its client.
    pub(crate) fn process_deferred_query(
        &mut self,
        id: TxnId,
        fragment: FragmentId,
        params: &ParameterSet,
    ) {
        let request = FragmentExecRequest {
            fragment_ids: vec![fragment],
            params: vec![params.clone()],
            input_dep_ids: vec![None],
            output_dep_ids: vec![0],
            txn_id: id,
            last_committed_txn: self.last_committed_txn,
            undo_token: DISABLE_UNDO_TOKEN,
        };
        match self.engine.execute_plan_fragments(&request) {
            Ok(_) => debug!(partition = self.partition_id, txn = id, "deferred query executed"),
            Err(error) => {
                warn!(partition = self.partition_id, txn = id, %error, "deferred query failed");
            }
        }
    }
}

/// How a fragment execution can fail: a transaction-scoped abort or a fatal
/// executor fault.
pub(crate) enum FragmentFailure {
    /// The fragment aborted; the transaction rolls back and may restart.
    Abort(EngineError),
    /// An invariant broke; the executor must crash the cluster.
    EngineFault(HornetError),
}

pub(crate) use FragmentFailure::{Abort, EngineFault};

pub(crate) fn build_work_result(
    partition: hornet_common::ids::PartitionId,
    status: Status,
    deps: DependencySet,
    error: Option<hornet_common::error::AbortReason>,
) -> WorkResult {
    let dep_data = deps.rowsets.iter().map(wire::encode_row_set).collect();
    WorkResult {
        partition,
        status,
        dep_ids: deps.dep_ids,
        dep_data,
        error,
    }
}
