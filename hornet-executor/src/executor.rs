//! The partition executor: single-threaded owner of one partition's work.

mod dispatch;
mod fragments;
mod transactions;


use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use hornet_common::config::ExecutorConfig;
use hornet_common::error::{AbortReason, HornetError, HornetResult, Status};
use hornet_common::ids::{PartitionId, SiteId, TxnId, site_for_partition};
use hornet_engine::catalog::CatalogContext;
use hornet_engine::engine::{ExecutionEngine, StatsSelector};
use hornet_engine::sysproc::SysprocRegistry;
use hornet_engine::value::RowSet;
use hornet_txn::arena::{TransactionArena, TxnSlot};
use hornet_txn::response::ClientResponse;
use hornet_txn::transaction::{SpeculationType, Transaction};

use crate::conflict::ConflictChecker;
use crate::coordinator::{Coordinator, PeerExecutorMap};
use crate::lock_queue::{PartitionLockQueue, QueuedTxn};
use crate::messages::{InternalMessage, TxnRef};
use crate::procedures::ProcedureRegistry;
use crate::query_cache::QueryCache;
use crate::scheduler::SpecExecScheduler;
use crate::undo::UndoTokenManager;
use crate::work_queue::{WorkQueue, WorkSender};

/// What the partition currently allows, and whether speculative responses may
/// leave immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Speculation halted after a speculative abort; all new work blocks.
    Disabled,
    /// Halt mode: new non-sysproc transactions are rejected outright.
    DisabledReject,
    /// No dtxn active; single-partition transactions commit and respond
    /// immediately.
    CommitAll,
    /// Dtxn active but read-only here; read-only speculative responses may
    /// leave immediately.
    CommitReadonly,
    /// Dtxn active; non-conflicting speculative responses may leave. Gated
    /// conservatively like [`ExecutionMode::CommitNone`] because undo tokens
    /// are not fine-grained enough to release them early.
    CommitNonconflicting,
    /// Dtxn active and has written; every speculative response queues.
    CommitNone,
}

/// Single-threaded executor owning one partition.
pub struct PartitionExecutor<E: ExecutionEngine, C: Coordinator> {
    partition_id: PartitionId,
    site_id: SiteId,
    config: ExecutorConfig,
    catalog: Arc<CatalogContext>,
    sysprocs: Arc<SysprocRegistry>,
    procedures: Arc<ProcedureRegistry>,
    engine: E,
    coordinator: C,
    peers: PeerExecutorMap,
    work_queue: WorkQueue,
    self_sender: WorkSender,
    lock_queue: PartitionLockQueue,
    arena: TransactionArena,
    undo: UndoTokenManager,
    scheduler: SpecExecScheduler,
    checker: Box<dyn ConflictChecker>,
    query_cache: QueryCache,
    current_dtxn: Option<TxnId>,
    exec_mode: ExecutionMode,
    blocked_messages: VecDeque<InternalMessage>,
    /// Responses of speculatively executed transactions, in blocked order.
    spec_blocked: Vec<(TxnId, ClientResponse)>,
    /// Whether any blocked speculative transaction wrote in this window.
    spec_modified: bool,
    /// Whether the current dtxn is one speculation should not reason about.
    spec_ignore_current: bool,
    last_executed_txn: Option<TxnId>,
    last_committed_txn: TxnId,
    last_stats: Option<RowSet>,
    last_tick_ms: u64,
    last_stats_ms: u64,
    shutdown: bool,
}

impl<E: ExecutionEngine, C: Coordinator> PartitionExecutor<E, C> {
    /// Creates the executor and loads the catalog into its engine.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine rejects the catalog.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        partition_id: PartitionId,
        config: ExecutorConfig,
        catalog: Arc<CatalogContext>,
        sysprocs: Arc<SysprocRegistry>,
        procedures: Arc<ProcedureRegistry>,
        mut engine: E,
        coordinator: C,
        peers: PeerExecutorMap,
        checker: Box<dyn ConflictChecker>,
    ) -> HornetResult<Self> {
        engine.load_catalog(&catalog)?;
        let (work_queue, self_sender) = WorkQueue::new();
        let scheduler =
            SpecExecScheduler::new(partition_id, &config, work_queue.interrupt_flag());
        let site_id = site_for_partition(partition_id, config.partitions_per_site);
        let query_cache = QueryCache::new(config.query_cache_entries);
        Ok(Self {
            partition_id,
            site_id,
            undo: UndoTokenManager::new(partition_id),
            config,
            catalog,
            sysprocs,
            procedures,
            engine,
            coordinator,
            peers,
            work_queue,
            self_sender,
            lock_queue: PartitionLockQueue::new(),
            arena: TransactionArena::new(),
            scheduler,
            checker,
            query_cache,
            current_dtxn: None,
            exec_mode: ExecutionMode::CommitAll,
            blocked_messages: VecDeque::new(),
            spec_blocked: Vec::new(),
            spec_modified: false,
            spec_ignore_current: false,
            last_executed_txn: None,
            last_committed_txn: 0,
            last_stats: None,
            last_tick_ms: 0,
            last_stats_ms: 0,
            shutdown: false,
        })
    }

    /// Partition this executor owns.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    /// Site hosting this executor.
    #[must_use]
    pub fn site_id(&self) -> SiteId {
        self.site_id
    }

    /// Producer handle for this executor's work queue.
    #[must_use]
    pub fn work_sender(&self) -> WorkSender {
        self.self_sender.clone()
    }

    /// Current execution mode.
    #[must_use]
    pub fn exec_mode(&self) -> ExecutionMode {
        self.exec_mode
    }

    /// Current distributed transaction, if one holds the partition.
    #[must_use]
    pub fn current_dtxn(&self) -> Option<TxnId> {
        self.current_dtxn
    }

    /// The engine, for inspection.
    #[must_use]
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The engine, for test setup.
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// The coordinator endpoint, for inspection.
    #[must_use]
    pub fn coordinator(&self) -> &C {
        &self.coordinator
    }

    /// The undo-token manager, for inspection.
    #[must_use]
    pub fn undo_manager(&self) -> &UndoTokenManager {
        &self.undo
    }

    /// The transaction arena, for inspection.
    #[must_use]
    pub fn arena(&self) -> &TransactionArena {
        &self.arena
    }

    /// The partition lock queue, for inspection.
    #[must_use]
    pub fn lock_queue(&self) -> &PartitionLockQueue {
        &self.lock_queue
    }

    /// Number of responses blocked behind the current dtxn.
    #[must_use]
    pub fn spec_blocked_len(&self) -> usize {
        self.spec_blocked.len()
    }

    /// Number of messages blocked behind the current dtxn.
    #[must_use]
    pub fn blocked_messages_len(&self) -> usize {
        self.blocked_messages.len()
    }

    /// Id of the last transaction committed at this partition.
    #[must_use]
    pub fn last_committed_txn(&self) -> TxnId {
        self.last_committed_txn
    }

    /// Id of the last transaction whose message this executor processed.
    #[must_use]
    pub fn last_executed_txn(&self) -> Option<TxnId> {
        self.last_executed_txn
    }

    /// Whether a fatal error stopped this executor.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Most recent table statistics snapshot.
    #[must_use]
    pub fn last_stats(&self) -> Option<&RowSet> {
        self.last_stats.as_ref()
    }

    /// Runs the executor until a fatal error stops it. Must be called from the
    /// one thread that owns this partition.
    pub fn run(&mut self) {
        debug!(partition = self.partition_id, "starting partition executor loop");
        while !self.shutdown {
            let now_ms = wall_clock_ms();
            let _ = self.run_once(now_ms);
        }
    }

    /// One iteration of the executor loop. Returns whether any work was done.
    pub fn run_once(&mut self, now_ms: u64) -> bool {
        let mut next_work: Option<InternalMessage> = None;

        // With no dtxn holding the partition, pull the next transaction off
        // the lock queue. Single-partition transactions start right away;
        // distributed ones become the current dtxn.
        if self.current_dtxn.is_none() {
            self.tick(now_ms);
            if let Some(entry) = self.lock_queue.check_lock_queue() {
                if entry.predict_single_partition && entry.base_partition == self.partition_id {
                    next_work = Some(InternalMessage::StartTxn(entry.id));
                } else if let Err(fault) = self.install_dtxn_from_queue(entry) {
                    self.fatal(fault);
                    return true;
                }
            }
        }

        if next_work.is_none() {
            next_work = self.work_queue.poll(self.config.work_queue_poll);
        }

        if let Some(message) = next_work {
            let txn_id = message.txn_id();
            if let Err(fault) = self.process_internal_message(message) {
                self.fatal(fault);
                return true;
            }
            if let Some(id) = txn_id {
                self.last_executed_txn = Some(id);
            }
            true
        } else if self.config.specexec_enable {
            self.utility_work()
        } else {
            false
        }
    }

    fn install_dtxn_from_queue(&mut self, entry: QueuedTxn) -> HornetResult<()> {
        if self.arena.get(entry.id).is_none() {
            // The transaction's handle has not reached this partition yet;
            // put it back and let the work queue deliver the handle first.
            warn!(
                partition = self.partition_id,
                txn = entry.id,
                "lock queue released an unknown dtxn; requeueing"
            );
            return self.lock_queue.insert(entry);
        }
        let id = entry.id;
        let local = self.arena.get(id).is_some_and(TxnSlot::is_local);
        self.set_current_dtxn(id)?;
        if local {
            // The control code runs here; schedule it behind whatever is
            // already queued.
            self.self_sender.send(InternalMessage::StartTxn(id))?;
        }
        Ok(())
    }

    /// Periodic engine maintenance, at most once per tick interval.
    pub fn tick(&mut self, now_ms: u64) {
        if now_ms.saturating_sub(self.last_tick_ms) < self.config.tick_interval.as_millis() as u64 {
            return;
        }
        if self.last_tick_ms != 0 {
            self.engine.tick(now_ms, self.last_committed_txn);
            if now_ms.saturating_sub(self.last_stats_ms)
                >= self.config.stats_interval.as_millis() as u64
            {
                self.update_memory_stats(now_ms);
            }
        }
        self.last_tick_ms = now_ms;
    }

    fn update_memory_stats(&mut self, now_ms: u64) {
        let table_ids = self.catalog.table_ids();
        match self.engine.get_stats(StatsSelector::Table, &table_ids, now_ms) {
            Ok(stats) => self.last_stats = Some(stats),
            Err(error) => {
                warn!(partition = self.partition_id, %error, "failed to refresh table stats");
            }
        }
        self.last_stats_ms = now_ms;
    }

    fn process_internal_message(&mut self, message: InternalMessage) -> HornetResult<()> {
        // A transaction that already aborted gets nothing but its finish.
        if let Some(id) = message.txn_id()
            && !matches!(
                message,
                InternalMessage::Finish { .. }
                    | InternalMessage::InitializeRequest(_)
                    | InternalMessage::InitializeTxn(_)
            )
            && self.arena.get(id).is_some_and(TxnSlot::is_aborted)
        {
            debug!(
                partition = self.partition_id,
                txn = id,
                "dropping message for aborted transaction"
            );
            return Ok(());
        }

        match message {
            InternalMessage::InitializeRequest(txn) => self.process_initialize_request(*txn),
            InternalMessage::InitializeTxn(txn) => {
                let entry = queued_entry(&txn);
                self.arena.insert_local(*txn);
                self.lock_queue.insert(entry)
            }
            InternalMessage::StartTxn(id) => self.process_start_txn(id),
            InternalMessage::SetDistributedTxn(txn_ref) => self.process_set_dtxn(txn_ref),
            InternalMessage::WorkFragment {
                txn,
                fragment,
                params,
            } => self.process_work_fragment_message(txn, fragment, params),
            InternalMessage::Prepare(id) => self.prepare_transaction(id),
            InternalMessage::Finish { txn, status } => {
                self.finish_distributed_transaction(txn, status)
            }
            InternalMessage::DeferredQuery {
                txn,
                fragment,
                params,
            } => {
                self.process_deferred_query(txn, fragment, &params);
                Ok(())
            }
            InternalMessage::UtilityWork => Ok(()),
            InternalMessage::UpdateMemory => {
                let now_ms = self.last_tick_ms.max(1);
                self.update_memory_stats(now_ms);
                Ok(())
            }
            InternalMessage::TableStatsRequest { table_ids, reply } => {
                let stats =
                    self.engine
                        .get_stats(StatsSelector::Table, &table_ids, self.last_tick_ms)?;
                let _ = reply.send(stats);
                Ok(())
            }
            InternalMessage::SnapshotWork => {
                // Snapshot coordination lives outside the core; the message
                // only exists so the owner thread wakes up for it.
                debug!(partition = self.partition_id, "snapshot work requested");
                Ok(())
            }
        }
    }

    fn process_initialize_request(&mut self, txn: Transaction) -> HornetResult<()> {
        if self.exec_mode == ExecutionMode::DisabledReject && !txn.is_sysproc() {
            let mut txn = txn;
            self.reject_transaction(&mut txn);
            return Ok(());
        }

        let id = txn.id();
        let fast_path = txn.predict_single_partition() && !txn.is_sysproc();
        let entry = queued_entry(&txn);
        self.arena.insert_local(txn);

        if fast_path {
            if self.current_dtxn.is_some() {
                self.blocked_messages.push_back(InternalMessage::StartTxn(id));
            } else {
                self.execute_transaction(id)?;
            }
        } else {
            // Distributed transactions wait for their global turn. Remote
            // partitions learn about the transaction via their own lock
            // queues.
            self.lock_queue.insert(entry)?;
        }
        Ok(())
    }

    fn process_start_txn(&mut self, id: TxnId) -> HornetResult<()> {
        if self.config.specexec_enable
            && self.arena.get(id).is_some_and(TxnSlot::predict_single_partition)
        {
            self.scheduler.reset();
        }
        self.execute_transaction(id)
    }

    fn process_set_dtxn(&mut self, txn_ref: TxnRef) -> HornetResult<()> {
        let id = txn_ref.id;
        if let Some(handle) = txn_ref.remote
            && self.arena.get(id).is_none()
        {
            self.arena.insert_remote(*handle);
        }
        if let Some(current) = self.current_dtxn
            && current != id
        {
            self.blocked_messages
                .push_back(InternalMessage::SetDistributedTxn(TxnRef::known(id)));
            return Ok(());
        }
        if self.current_dtxn.is_none() {
            self.set_current_dtxn(id)?;
        }
        Ok(())
    }

    pub(crate) fn set_current_dtxn(&mut self, id: TxnId) -> HornetResult<()> {
        if self.current_dtxn.is_some() {
            return Err(HornetError::InvalidState(
                "second distributed transaction installed while one is active",
            ));
        }
        if !self.blocked_messages.is_empty() {
            return Err(HornetError::InvalidState(
                "blocked messages left over from the previous dtxn",
            ));
        }
        let Some(slot) = self.arena.get(id) else {
            return Err(HornetError::InvalidState(
                "installing an unknown transaction as the current dtxn",
            ));
        };
        self.spec_ignore_current = !self.config.specexec_enable
            || slot.is_sysproc()
            || self.checker.should_ignore_procedure(slot.procedure());
        self.current_dtxn = Some(id);
        debug!(
            partition = self.partition_id,
            txn = id,
            spec_ignore = self.spec_ignore_current,
            "installed current dtxn"
        );
        Ok(())
    }

    pub(crate) fn reset_current_dtxn(&mut self) {
        debug!(
            partition = self.partition_id,
            txn = ?self.current_dtxn,
            "clearing current dtxn"
        );
        self.current_dtxn = None;
    }

    pub(crate) fn set_execution_mode(&mut self, mode: ExecutionMode) -> HornetResult<()> {
        if mode == ExecutionMode::CommitReadonly && self.current_dtxn.is_none() {
            return Err(HornetError::InvalidState(
                "read-only commit mode requires a current dtxn",
            ));
        }
        if self.exec_mode != mode {
            debug!(
                partition = self.partition_id,
                from = ?self.exec_mode,
                to = ?mode,
                "execution mode transition"
            );
        }
        self.exec_mode = mode;
        Ok(())
    }

    /// Fills an idle slot with one speculative transaction, when a safe
    /// candidate exists.
    pub(crate) fn utility_work(&mut self) -> bool {
        if self.lock_queue.is_empty() {
            return false;
        }
        if self.current_dtxn.is_some() && self.spec_ignore_current {
            return false;
        }
        let spec_type = self.calculate_speculation_type();
        let chosen = self.scheduler.next(
            &mut self.lock_queue,
            &mut self.arena,
            self.current_dtxn,
            spec_type,
            self.checker.as_ref(),
        );
        let Some(id) = chosen else {
            return false;
        };
        if let Some(txn) = self.arena.local_mut(id) {
            txn.set_speculative(spec_type);
        }
        if let Err(fault) = self.execute_transaction(id) {
            self.fatal(fault);
        }
        true
    }

    /// Where the current dtxn sits in its lifecycle at this partition, which
    /// decides how aggressively speculation may proceed.
    pub(crate) fn calculate_speculation_type(&self) -> SpeculationType {
        let Some(dtxn) = self.current_dtxn.and_then(|id| self.arena.get(id)) else {
            return SpeculationType::Idle;
        };
        if dtxn.base_partition() == self.partition_id {
            if !dtxn.is_executed() {
                SpeculationType::Idle
            } else if dtxn.is_prepared(self.partition_id) {
                SpeculationType::Sp3Local
            } else {
                SpeculationType::Sp1Local
            }
        } else if dtxn.is_prepared(self.partition_id) {
            SpeculationType::Sp3Remote
        } else if !dtxn.has_executed_work(self.partition_id) {
            SpeculationType::Sp2RemoteBefore
        } else {
            SpeculationType::Sp2RemoteAfter
        }
    }

    /// Halts transaction processing: rejects queued starts, keeps everything
    /// else, and leaves the partition in reject mode.
    pub fn halt_processing(&mut self) -> HornetResult<()> {
        warn!(partition = self.partition_id, "halting transaction processing");
        self.set_execution_mode(ExecutionMode::DisabledReject)?;

        let mut kept = Vec::new();
        while let Some(message) = self.work_queue.try_poll() {
            match message {
                InternalMessage::InitializeRequest(txn) => {
                    let mut txn = *txn;
                    self.reject_transaction(&mut txn);
                }
                InternalMessage::InitializeTxn(txn) => {
                    let mut txn = *txn;
                    self.reject_transaction(&mut txn);
                }
                InternalMessage::StartTxn(id) => {
                    self.lock_queue.finished(id, Status::AbortReject);
                    if let Some(mut slot) = self.arena.remove(id)
                        && let TxnSlot::Local(txn) = &mut slot
                    {
                        self.reject_transaction(txn);
                    }
                }
                other => kept.push(other),
            }
        }
        self.work_queue.push_back_all(kept);
        Ok(())
    }

    fn reject_transaction(&mut self, txn: &mut Transaction) {
        let response = ClientResponse {
            txn_id: txn.id(),
            client_handle: txn.client_handle(),
            status: Status::AbortReject,
            results: Vec::new(),
            abort: Some(AbortReason::Reject("partition is in halt mode")),
            speculative: false,
        };
        if let Some(sender) = txn.take_response_sender()
            && let Err(error) = sender.send(response)
        {
            warn!(partition = self.partition_id, txn = txn.id(), %error, "client gone during reject");
        }
    }

    pub(crate) fn send_response(&mut self, id: TxnId, response: ClientResponse) {
        let Some(sender) = self
            .arena
            .local_mut(id)
            .and_then(Transaction::take_response_sender)
        else {
            warn!(
                partition = self.partition_id,
                txn = id,
                "no response channel for transaction"
            );
            return;
        };
        if let Err(error) = sender.send(response) {
            warn!(partition = self.partition_id, txn = id, %error, "client gone during response");
        }
    }

    /// Stores a prefetch result forwarded from a remote partition so a later
    /// dispatch of the same query can skip its send.
    pub fn add_prefetch_result(
        &mut self,
        txn_id: TxnId,
        fragment: hornet_common::ids::FragmentId,
        partition: PartitionId,
        param_hash: u64,
        rows: RowSet,
    ) {
        debug!(
            partition = self.partition_id,
            txn = txn_id,
            source = partition,
            "storing prefetch result"
        );
        self.query_cache
            .add_result(txn_id, fragment, partition, param_hash, rows);
    }

    /// Records a fatal fault: logs, stops this executor, and asks the
    /// coordinator to take the cluster down.
    pub(crate) fn fatal(&mut self, fault: HornetError) {
        error!(
            partition = self.partition_id,
            current_dtxn = ?self.current_dtxn,
            last_executed = ?self.last_executed_txn,
            %fault,
            "fatal executor fault; shutting down cluster"
        );
        self.shutdown = true;
        self.coordinator.shutdown_cluster(fault);
    }
}

pub(crate) fn queued_entry(txn: &Transaction) -> QueuedTxn {
    QueuedTxn {
        id: txn.id(),
        base_partition: txn.base_partition(),
        procedure: txn.procedure(),
        predict_single_partition: txn.predict_single_partition(),
        estimated_remaining_us: txn.estimated_remaining_us(),
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}
