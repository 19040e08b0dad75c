//! Fragment dispatch for multi-partition batches, and the runner surface
//! procedure control code executes against.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::time::Instant;

use hashbrown::HashMap;
use tracing::{debug, warn};

use hornet_common::error::{AbortReason, Status};
use hornet_common::ids::{DependencyId, FragmentId, PartitionId, SiteId, TableId, TxnId};
use hornet_engine::engine::ExecutionEngine;
use hornet_engine::value::{ParameterSet, RowSet};
use hornet_engine::wire;
use hornet_txn::transaction::RemoteTransaction;
use hornet_txn::work::{TransactionWorkRequest, WorkFragment, WorkResult, WorkResultSender};

use crate::coordinator::Coordinator;
use crate::executor::PartitionExecutor;
use crate::executor::fragments::{Abort, EngineFault};
use crate::messages::{InternalMessage, TxnRef};
use crate::procedures::{BatchPlan, ProcedureRunner};

static EMPTY_PARAMS: ParameterSet = ParameterSet { values: Vec::new() };

/// Runner handed to stored-procedure control code.
pub(crate) struct ProcedureContext<'a, E: ExecutionEngine, C: Coordinator> {
    exec: &'a mut PartitionExecutor<E, C>,
    txn_id: TxnId,
}

impl<'a, E: ExecutionEngine, C: Coordinator> ProcedureContext<'a, E, C> {
    pub(crate) fn new(exec: &'a mut PartitionExecutor<E, C>, txn_id: TxnId) -> Self {
        Self { exec, txn_id }
    }
}

impl<E: ExecutionEngine, C: Coordinator> ProcedureRunner for ProcedureContext<'_, E, C> {
    fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    fn partition_id(&self) -> PartitionId {
        self.exec.partition_id()
    }

    fn proc_params(&self) -> &ParameterSet {
        self.exec
            .arena
            .local(self.txn_id)
            .map_or(&EMPTY_PARAMS, hornet_txn::transaction::Transaction::params)
    }

    fn execute_batch(&mut self, plan: BatchPlan) -> Result<Vec<RowSet>, AbortReason> {
        self.exec.execute_batch(self.txn_id, plan)
    }

    fn load_table(&mut self, table: TableId, rows: &RowSet) -> Result<(), AbortReason> {
        self.exec.load_table_for(self.txn_id, table, rows)
    }

    fn defer_query(&mut self, fragment: FragmentId, params: ParameterSet) {
        let message = InternalMessage::DeferredQuery {
            txn: self.txn_id,
            fragment,
            params,
        };
        if let Err(error) = self.exec.self_sender.send(message) {
            warn!(txn = self.txn_id, %error, "failed to defer query");
        }
    }
}

/// Outstanding-dependency bookkeeping for one dispatched batch: the
/// count-down latch the dispatcher blocks on.
#[derive(Debug, Default)]
struct DependencyTracker {
    remaining: HashMap<DependencyId, usize>,
    results: HashMap<DependencyId, Vec<RowSet>>,
}

impl DependencyTracker {
    fn expect(&mut self, dep: DependencyId) {
        *self.remaining.entry(dep).or_insert(0) += 1;
    }

    fn record(&mut self, dep: DependencyId, rows: RowSet) {
        let Some(count) = self.remaining.get_mut(&dep) else {
            warn!(dep, "result for an unexpected dependency");
            return;
        };
        if *count == 0 {
            warn!(dep, "duplicate result for dependency");
            return;
        }
        *count -= 1;
        self.results.entry(dep).or_default().push(rows);
    }

    fn is_complete(&self) -> bool {
        self.remaining.values().all(|count| *count == 0)
    }

    fn available(&self, dep: DependencyId) -> Option<&Vec<RowSet>> {
        self.results.get(&dep)
    }

    fn take_merged(&mut self, dep: DependencyId) -> RowSet {
        let mut merged = RowSet::empty();
        for rowset in self.results.remove(&dep).unwrap_or_default() {
            merged.rows.extend(rowset.rows);
        }
        merged
    }
}

impl<E: ExecutionEngine, C: Coordinator> PartitionExecutor<E, C> {
    /// Executes one planned statement batch for a locally-based transaction.
    pub(crate) fn execute_batch(
        &mut self,
        id: TxnId,
        plan: BatchPlan,
    ) -> Result<Vec<RowSet>, AbortReason> {
        if plan.is_single_partition_local(self.partition_id) {
            self.execute_local_plan(id, &plan)
        } else {
            self.dispatch_work_fragments(id, &plan)
        }
    }

    /// Fast path: the whole batch stays on this partition, so it goes
    /// straight into the engine without any dispatch bookkeeping.
    fn execute_local_plan(
        &mut self,
        id: TxnId,
        plan: &BatchPlan,
    ) -> Result<Vec<RowSet>, AbortReason> {
        let read_only = plan.is_read_only();
        if let Some(slot) = self.arena.get(id) {
            let token = self
                .undo
                .calculate_next(slot, self.partition_id, read_only, &self.config);
            if let Some(slot) = self.arena.get_mut(id) {
                slot.work_state_mut(self.partition_id).init_round(token);
            }
        }
        if let Some(txn) = self.arena.local_mut(id) {
            txn.record_touched(self.partition_id);
        }

        let mut results_by_dep: HashMap<DependencyId, RowSet> = HashMap::new();
        for unit in &plan.fragments {
            match self.execute_work_fragment(id, unit, &plan.params) {
                Ok(deps) => {
                    for (dep, rows) in deps.dep_ids.into_iter().zip(deps.rowsets) {
                        let _ = results_by_dep.insert(dep, rows);
                    }
                }
                Err(Abort(engine_error)) => {
                    let reason = engine_error.abort_reason();
                    if let Some(txn) = self.arena.local_mut(id) {
                        txn.set_pending_error(reason.clone());
                    }
                    return Err(reason);
                }
                Err(EngineFault(fault)) => {
                    self.fatal(fault);
                    return Err(AbortReason::Unexpected(
                        "executor fault during local batch".to_owned(),
                    ));
                }
            }
        }

        Ok(plan
            .result_deps
            .iter()
            .map(|dep| results_by_dep.remove(dep).unwrap_or_default())
            .collect())
    }

    /// Slow path: classify each unit as local, same-site, or remote-site,
    /// push the non-local ones out, execute the local ones inline, then block
    /// on the dependency latch while filling idle time with utility work.
    fn dispatch_work_fragments(
        &mut self,
        id: TxnId,
        plan: &BatchPlan,
    ) -> Result<Vec<RowSet>, AbortReason> {
        self.check_for_misprediction(id, plan)?;

        let local_read_only = plan.is_read_only_at(self.partition_id);
        if let Some(slot) = self.arena.get(id) {
            let token =
                self.undo
                    .calculate_next(slot, self.partition_id, local_read_only, &self.config);
            if let Some(slot) = self.arena.get_mut(id) {
                slot.work_state_mut(self.partition_id).init_round(token);
            }
        }

        let (result_tx, result_rx) =
            WorkResultSender::channel(self.work_queue.interrupt_flag());
        let mut tracker = DependencyTracker::default();
        for unit in &plan.fragments {
            for dep in &unit.output_dep_ids {
                tracker.expect(*dep);
            }
        }

        let mut local_units = Vec::new();
        let mut site_units = Vec::new();
        let mut remote_by_site: BTreeMap<SiteId, Vec<WorkFragment>> = BTreeMap::new();
        let prefetching = !self.query_cache.is_empty();
        for unit in &plan.fragments {
            if let Some(txn) = self.arena.local_mut(id) {
                txn.record_touched(unit.partition);
            }
            if unit.partition == self.partition_id {
                local_units.push(unit.clone());
                continue;
            }
            if prefetching && self.try_prefetch_skip(id, unit, &plan.params, &mut tracker) {
                debug!(
                    partition = self.partition_id,
                    txn = id,
                    target = unit.partition,
                    "prefetched results cover the whole unit; skipping send"
                );
                continue;
            }
            if self.peers.is_local_site(self.partition_id, unit.partition) {
                site_units.push(unit.clone());
            } else {
                remote_by_site
                    .entry(self.peers.site_of(unit.partition))
                    .or_default()
                    .push(unit.clone());
            }
        }

        // Remote sites first: one batched request per destination.
        if !remote_by_site.is_empty() {
            let serialized_params = plan
                .params
                .iter()
                .map(wire::encode_parameter_set)
                .collect::<Vec<_>>();
            for (site, units) in remote_by_site {
                let request =
                    self.build_work_request(id, units, serialized_params.clone(), &tracker);
                if let Err(error) = self
                    .coordinator
                    .transaction_work(request, site, result_tx.clone())
                {
                    self.fatal(error);
                    return Err(AbortReason::Unexpected(
                        "failed to ship work to remote site".to_owned(),
                    ));
                }
            }
        }

        // Then same-site peers, so their queues fill while we run our own
        // fragments.
        for unit in site_units {
            let handle = self.remote_handle_for(id, result_tx.clone());
            let target = unit.partition;
            let message = InternalMessage::WorkFragment {
                txn: match handle {
                    Some(handle) => TxnRef::remote(handle),
                    None => TxnRef::known(id),
                },
                fragment: unit,
                params: plan.params.clone(),
            };
            if let Err(error) = self.peers.queue_to(target, message) {
                self.fatal(error);
                return Err(AbortReason::Unexpected(
                    "failed to queue work on peer executor".to_owned(),
                ));
            }
        }

        // Local fragments run inline.
        for unit in &local_units {
            match self.execute_work_fragment(id, unit, &plan.params) {
                Ok(deps) => {
                    for (dep, rows) in deps.dep_ids.into_iter().zip(deps.rowsets) {
                        tracker.record(dep, rows);
                    }
                }
                Err(Abort(engine_error)) => {
                    let reason = engine_error.abort_reason();
                    if let Some(txn) = self.arena.local_mut(id) {
                        txn.set_pending_error(reason.clone());
                    }
                    return Err(reason);
                }
                Err(EngineFault(fault)) => {
                    self.fatal(fault);
                    return Err(AbortReason::Unexpected(
                        "executor fault during dispatch".to_owned(),
                    ));
                }
            }
        }

        self.await_dependencies(id, &mut tracker, &result_rx)?;

        if let Some(reason) = self.arena.local_mut(id).and_then(|txn| txn.take_pending_error()) {
            return Err(reason);
        }
        Ok(plan
            .result_deps
            .iter()
            .map(|dep| tracker.take_merged(*dep))
            .collect())
    }

    /// A single-partition prediction that reaches for another partition, or a
    /// partition already declared done, aborts the batch before anything is
    /// sent.
    fn check_for_misprediction(&mut self, id: TxnId, plan: &BatchPlan) -> Result<(), AbortReason> {
        let Some(txn) = self.arena.local(id) else {
            return Ok(());
        };
        let predict_single = txn.predict_single_partition();
        let mut mispredicted = false;
        for unit in &plan.fragments {
            if predict_single && unit.partition != self.partition_id {
                debug!(
                    partition = self.partition_id,
                    txn = id,
                    target = unit.partition,
                    "single-partition transaction reached another partition"
                );
                mispredicted = true;
                break;
            }
            if txn.done_partitions().contains(unit.partition) {
                debug!(
                    partition = self.partition_id,
                    txn = id,
                    target = unit.partition,
                    "transaction went back to a partition it declared done"
                );
                mispredicted = true;
                break;
            }
        }
        if !mispredicted {
            return Ok(());
        }

        let Some(txn) = self.arena.local_mut(id) else {
            return Ok(());
        };
        txn.record_touched(self.partition_id);
        for unit in &plan.fragments {
            txn.record_touched(unit.partition);
        }
        let reason = AbortReason::Misprediction {
            touched: txn.touched().clone(),
        };
        txn.set_pending_error(reason.clone());
        Err(reason)
    }

    /// Skips the remote send when the prefetch cache covers every fragment of
    /// the unit.
    fn try_prefetch_skip(
        &mut self,
        id: TxnId,
        unit: &WorkFragment,
        params: &[ParameterSet],
        tracker: &mut DependencyTracker,
    ) -> bool {
        let mut cached = Vec::with_capacity(unit.len());
        for (index, fragment_id) in unit.fragment_ids.iter().enumerate() {
            let param_hash = unit
                .param_indices
                .get(index)
                .and_then(|param_index| params.get(*param_index))
                .map_or(0, ParameterSet::param_hash);
            let Some(rows) =
                self.query_cache
                    .get_result(id, *fragment_id, unit.partition, param_hash)
            else {
                return false;
            };
            cached.push(rows.clone());
        }
        for (dep, rows) in unit.output_dep_ids.iter().zip(cached) {
            tracker.record(*dep, rows);
        }
        true
    }

    fn build_work_request(
        &self,
        id: TxnId,
        units: Vec<WorkFragment>,
        serialized_params: Vec<Vec<u8>>,
        tracker: &DependencyTracker,
    ) -> TransactionWorkRequest {
        let (procedure, sysproc) = self
            .arena
            .get(id)
            .map_or((0, false), |slot| (slot.procedure(), slot.is_sysproc()));

        // Attach whatever input dependencies the units need and we already
        // hold, serialized once per dependency.
        let mut attached_dep_ids = Vec::new();
        let mut attached_dep_data = Vec::new();
        for unit in &units {
            if !unit.needs_input {
                continue;
            }
            for dep in unit.input_dep_ids.iter().flatten() {
                if attached_dep_ids.contains(dep) {
                    continue;
                }
                if let Some(rowsets) = tracker.available(*dep) {
                    for rowset in rowsets {
                        attached_dep_ids.push(*dep);
                        attached_dep_data.push(wire::encode_row_set(rowset));
                    }
                }
            }
        }

        TransactionWorkRequest {
            txn_id: id,
            base_partition: self.partition_id,
            procedure,
            sysproc,
            fragments: units,
            serialized_params,
            attached_dep_ids,
            attached_dep_data,
        }
    }

    fn remote_handle_for(
        &self,
        id: TxnId,
        result_tx: WorkResultSender,
    ) -> Option<RemoteTransaction> {
        let slot = self.arena.get(id)?;
        Some(RemoteTransaction::new(
            id,
            self.partition_id,
            slot.procedure(),
            slot.is_sysproc(),
            result_tx,
        ))
    }

    /// Blocks on the dependency latch, filling idle time with utility work
    /// and polling for arriving results.
    fn await_dependencies(
        &mut self,
        id: TxnId,
        tracker: &mut DependencyTracker,
        result_rx: &mpsc::Receiver<WorkResult>,
    ) -> Result<(), AbortReason> {
        let started = Instant::now();
        loop {
            if tracker.is_complete() {
                return Ok(());
            }
            if self
                .arena
                .local(id)
                .is_some_and(|txn| txn.pending_error().is_some())
            {
                return Ok(());
            }
            if self.shutdown {
                return Err(AbortReason::Unexpected(
                    "executor shut down mid-dispatch".to_owned(),
                ));
            }

            match result_rx.try_recv() {
                Ok(result) => {
                    self.process_dispatch_result(id, result, tracker);
                    continue;
                }
                Err(mpsc::TryRecvError::Empty) => {}
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(AbortReason::Unexpected(
                        "work-result channel closed mid-dispatch".to_owned(),
                    ));
                }
            }

            // Fill the stall with speculative work when possible, otherwise
            // wait briefly for results.
            if self.config.specexec_enable && self.utility_work() {
                continue;
            }
            match result_rx.recv_timeout(self.config.work_queue_poll) {
                Ok(result) => self.process_dispatch_result(id, result, tracker),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(AbortReason::Unexpected(
                        "work-result channel closed mid-dispatch".to_owned(),
                    ));
                }
            }

            if started.elapsed() > self.config.response_timeout {
                // The cluster is presumed unhealthy; this is not a
                // transaction-level problem.
                warn!(
                    partition = self.partition_id,
                    txn = id,
                    "work results never arrived"
                );
                self.fatal(hornet_common::error::HornetError::InvalidState(
                    "timed out waiting for remote work results",
                ));
                return Err(AbortReason::Unexpected(
                    "work results never arrived".to_owned(),
                ));
            }
        }
    }

    fn process_dispatch_result(
        &mut self,
        id: TxnId,
        result: WorkResult,
        tracker: &mut DependencyTracker,
    ) {
        if result.status != Status::Ok {
            let reason = result.error.unwrap_or_else(|| {
                AbortReason::Unexpected("remote work failed without a cause".to_owned())
            });
            if let Some(txn) = self.arena.local_mut(id) {
                txn.set_pending_error(reason);
            }
            return;
        }
        for (dep, payload) in result.dep_ids.iter().zip(&result.dep_data) {
            match wire::decode_row_set(payload) {
                Ok(rows) => tracker.record(*dep, rows),
                Err(error) => {
                    warn!(
                        partition = self.partition_id,
                        txn = id,
                        source = result.partition,
                        %error,
                        "undecodable dependency payload"
                    );
                    if let Some(txn) = self.arena.local_mut(id) {
                        txn.set_pending_error(AbortReason::Unexpected(
                            "undecodable dependency payload".to_owned(),
                        ));
                    }
                    return;
                }
            }
        }
    }

    /// Bulk-load path procedures use to seed tables.
    pub(crate) fn load_table_for(
        &mut self,
        id: TxnId,
        table: TableId,
        rows: &RowSet,
    ) -> Result<(), AbortReason> {
        let Some(slot) = self.arena.get(id) else {
            return Err(AbortReason::Unexpected(
                "load for unknown transaction".to_owned(),
            ));
        };
        let mut token = slot.last_undo_token(self.partition_id);
        if token == hornet_common::ids::NULL_UNDO_TOKEN {
            token = self
                .undo
                .calculate_next(slot, self.partition_id, false, &self.config);
            if let Some(slot) = self.arena.get_mut(id) {
                slot.work_state_mut(self.partition_id).init_round(token);
            }
        }
        if let Some(slot) = self.arena.get_mut(id) {
            let work = slot.work_state_mut(self.partition_id);
            work.exec_read_only = false;
            work.executed_work = true;
        }
        self.engine
            .load_table(table, rows, id, self.last_committed_txn, token, false)
            .map_err(|error| error.abort_reason())
    }
}
