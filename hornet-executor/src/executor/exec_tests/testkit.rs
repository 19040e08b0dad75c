use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;

use hashbrown::HashMap;

use hornet_common::config::ExecutorConfig;
use hornet_common::error::{AbortReason, HornetError, HornetResult, Status};
use hornet_common::ids::{
    FragmentId, PartitionCount, PartitionId, ProcedureId, SiteId, TableId, TxnId,
};
use hornet_engine::catalog::{CatalogContext, FragmentDef, ProcedureDef, TableDef};
use hornet_engine::memory::{FragmentCtx, InMemoryEngine};
use hornet_engine::sysproc::SysprocRegistry;
use hornet_engine::value::{ParameterSet, RowSet, Value};
use hornet_engine::wire;
use hornet_txn::response::{ClientResponse, ResponseSender};
use hornet_txn::transaction::{RemoteTransaction, Transaction};
use hornet_txn::work::{TransactionWorkRequest, WorkFragment, WorkResult, WorkResultSender};

use crate::conflict::TableConflictChecker;
use crate::coordinator::{Coordinator, PeerExecutorMap};
use crate::executor::PartitionExecutor;
use crate::messages::InternalMessage;
use crate::procedures::{BatchPlan, ProcedureRegistry, ProcedureRunner, StoredProcedure};
use crate::work_queue::WorkSender;

pub(super) const TABLE_A: TableId = 1;
pub(super) const TABLE_B: TableId = 2;

pub(super) const FRAG_READ_A: FragmentId = 10;
pub(super) const FRAG_WRITE_A: FragmentId = 11;
pub(super) const FRAG_READ_B: FragmentId = 20;
pub(super) const FRAG_WRITE_B: FragmentId = 21;
pub(super) const FRAG_FAIL_B: FragmentId = 22;

pub(super) const PROC_READ_A: ProcedureId = 1;
pub(super) const PROC_WRITE_A: ProcedureId = 2;
pub(super) const PROC_READ_B: ProcedureId = 3;
pub(super) const PROC_WRITE_B: ProcedureId = 4;
pub(super) const PROC_USER_ABORT: ProcedureId = 5;
pub(super) const PROC_REMOTE_WRITE_A: ProcedureId = 6;
pub(super) const PROC_FAIL_B: ProcedureId = 7;
pub(super) const PROC_REMOTE_READ_A: ProcedureId = 8;
pub(super) const PROC_SYS_STATUS: ProcedureId = 9;

pub(super) const OUT_DEP: u32 = 1;

pub(super) fn catalog() -> Arc<CatalogContext> {
    let mut catalog = CatalogContext::new();
    for (id, name) in [(TABLE_A, "alpha"), (TABLE_B, "beta")] {
        catalog
            .add_table(TableDef {
                id,
                name: name.to_owned(),
            })
            .expect("fresh table id must register");
    }
    for (id, read_only, reads, writes) in [
        (FRAG_READ_A, true, vec![TABLE_A], vec![]),
        (FRAG_WRITE_A, false, vec![TABLE_A], vec![TABLE_A]),
        (FRAG_READ_B, true, vec![TABLE_B], vec![]),
        (FRAG_WRITE_B, false, vec![TABLE_B], vec![TABLE_B]),
        (FRAG_FAIL_B, false, vec![TABLE_B], vec![TABLE_B]),
    ] {
        catalog
            .add_fragment(FragmentDef {
                id,
                read_only,
                read_tables: reads,
                write_tables: writes,
            })
            .expect("fresh fragment id must register");
    }
    for (id, name, sysproc, reads, writes) in [
        (PROC_READ_A, "GetAlpha", false, vec![TABLE_A], vec![]),
        (PROC_WRITE_A, "PutAlpha", false, vec![TABLE_A], vec![TABLE_A]),
        (PROC_READ_B, "GetBeta", false, vec![TABLE_B], vec![]),
        (PROC_WRITE_B, "PutBeta", false, vec![TABLE_B], vec![TABLE_B]),
        (PROC_USER_ABORT, "PutAlphaAbort", false, vec![TABLE_A], vec![TABLE_A]),
        (PROC_REMOTE_WRITE_A, "PutAlphaRemote", false, vec![TABLE_A], vec![TABLE_A]),
        (PROC_FAIL_B, "PutBetaBroken", false, vec![TABLE_B], vec![TABLE_B]),
        (PROC_REMOTE_READ_A, "GetAlphaRemote", false, vec![TABLE_A], vec![]),
        (PROC_SYS_STATUS, "Status", true, vec![], vec![]),
    ] {
        catalog
            .add_procedure(ProcedureDef {
                id,
                name: name.to_owned(),
                sysproc,
                read_tables: reads,
                write_tables: writes,
            })
            .expect("fresh procedure id must register");
    }
    Arc::new(catalog)
}

pub(super) fn engine() -> InMemoryEngine {
    let mut engine = InMemoryEngine::new();
    for (fragment, table) in [(FRAG_WRITE_A, TABLE_A), (FRAG_WRITE_B, TABLE_B)] {
        engine.register_fragment(fragment, move |ctx: &mut FragmentCtx<'_>| {
            let row = ctx.params.values.clone();
            ctx.table_mut(table).push(row);
            Ok(RowSet::single_bigint(1))
        });
    }
    for (fragment, table) in [(FRAG_READ_A, TABLE_A), (FRAG_READ_B, TABLE_B)] {
        engine.register_fragment(fragment, move |ctx: &mut FragmentCtx<'_>| {
            Ok(RowSet {
                rows: ctx.read_table(table).to_vec(),
            })
        });
    }
    engine.register_fragment(FRAG_FAIL_B, |_ctx: &mut FragmentCtx<'_>| {
        Err(hornet_engine::engine::EngineError::ConstraintViolation(
            "beta uniqueness violated".to_owned(),
        ))
    });
    engine
}

pub(super) fn work_unit(
    partition: PartitionId,
    fragment: FragmentId,
    read_only: bool,
) -> WorkFragment {
    WorkFragment {
        partition,
        fragment_ids: vec![fragment],
        param_indices: vec![0],
        input_dep_ids: vec![None],
        output_dep_ids: vec![OUT_DEP],
        read_only,
        last_fragment: false,
        prefetch: false,
        needs_input: false,
        future_statements: None,
    }
}

fn single_unit_plan(unit: WorkFragment, params: ParameterSet) -> BatchPlan {
    BatchPlan {
        fragments: vec![unit],
        params: vec![params],
        result_deps: vec![OUT_DEP],
    }
}

/// Reads one table at the caller's own partition.
struct ReadTable {
    fragment: FragmentId,
}

impl StoredProcedure for ReadTable {
    fn run(&self, runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason> {
        let unit = work_unit(runner.partition_id(), self.fragment, true);
        runner.execute_batch(single_unit_plan(unit, runner.proc_params().clone()))
    }
}

/// Writes the invocation parameters as one row at the caller's own partition.
struct WriteTable {
    fragment: FragmentId,
}

impl StoredProcedure for WriteTable {
    fn run(&self, runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason> {
        let unit = work_unit(runner.partition_id(), self.fragment, false);
        runner.execute_batch(single_unit_plan(unit, runner.proc_params().clone()))
    }
}

/// Writes locally, then aborts voluntarily.
struct WriteThenUserAbort;

impl StoredProcedure for WriteThenUserAbort {
    fn run(&self, runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason> {
        let unit = work_unit(runner.partition_id(), FRAG_WRITE_A, false);
        let _ = runner.execute_batch(single_unit_plan(unit, runner.proc_params().clone()))?;
        Err(AbortReason::User("changed my mind".to_owned()))
    }
}

/// Writes table alpha on partition 1, wherever the caller runs.
struct WriteAlphaOnPartitionOne;

impl StoredProcedure for WriteAlphaOnPartitionOne {
    fn run(&self, runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason> {
        let unit = work_unit(1, FRAG_WRITE_A, false);
        runner.execute_batch(single_unit_plan(unit, runner.proc_params().clone()))
    }
}

/// Reads table alpha on partition 1, wherever the caller runs.
struct ReadAlphaOnPartitionOne;

impl StoredProcedure for ReadAlphaOnPartitionOne {
    fn run(&self, runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason> {
        let unit = work_unit(1, FRAG_READ_A, true);
        runner.execute_batch(single_unit_plan(unit, runner.proc_params().clone()))
    }
}

/// System procedure that answers without touching the engine.
struct StatusSysproc;

impl StoredProcedure for StatusSysproc {
    fn run(&self, _runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason> {
        Ok(vec![RowSet::single_bigint(1)])
    }
}

pub(super) fn procedures() -> Arc<ProcedureRegistry> {
    let mut registry = ProcedureRegistry::new();
    registry.register(PROC_READ_A, Arc::new(ReadTable { fragment: FRAG_READ_A }));
    registry.register(PROC_WRITE_A, Arc::new(WriteTable { fragment: FRAG_WRITE_A }));
    registry.register(PROC_READ_B, Arc::new(ReadTable { fragment: FRAG_READ_B }));
    registry.register(PROC_WRITE_B, Arc::new(WriteTable { fragment: FRAG_WRITE_B }));
    registry.register(PROC_USER_ABORT, Arc::new(WriteThenUserAbort));
    registry.register(PROC_REMOTE_WRITE_A, Arc::new(WriteAlphaOnPartitionOne));
    registry.register(PROC_FAIL_B, Arc::new(WriteTable { fragment: FRAG_FAIL_B }));
    registry.register(PROC_REMOTE_READ_A, Arc::new(ReadAlphaOnPartitionOne));
    registry.register(PROC_SYS_STATUS, Arc::new(StatusSysproc));
    Arc::new(registry)
}

#[derive(Default)]
pub(super) struct CoordinatorLog {
    pub works: Vec<(SiteId, TransactionWorkRequest)>,
    pub prepares: Vec<(TxnId, Vec<PartitionId>)>,
    pub finishes: Vec<(TxnId, Status, bool)>,
    pub prefetch_results: Vec<(TxnId, WorkResult)>,
    pub shutdowns: Vec<HornetError>,
}

/// Coordinator stub: records every call, answers work requests with canned
/// results, and routes prepare/finish messages back into registered work
/// queues.
pub(super) struct TestCoordinator {
    log: Rc<RefCell<CoordinatorLog>>,
    routes: Rc<RefCell<HashMap<PartitionId, WorkSender>>>,
    fail_work: Rc<RefCell<Option<AbortReason>>>,
}

impl Coordinator for TestCoordinator {
    fn transaction_work(
        &mut self,
        request: TransactionWorkRequest,
        target_site: SiteId,
        results: WorkResultSender,
    ) -> HornetResult<()> {
        let failure = self.fail_work.borrow_mut().take();
        for unit in &request.fragments {
            let result = match &failure {
                Some(reason) => WorkResult {
                    partition: unit.partition,
                    status: reason.status(),
                    dep_ids: Vec::new(),
                    dep_data: Vec::new(),
                    error: Some(reason.clone()),
                },
                None => WorkResult {
                    partition: unit.partition,
                    status: Status::Ok,
                    dep_ids: unit.output_dep_ids.clone(),
                    dep_data: unit
                        .output_dep_ids
                        .iter()
                        .map(|_| wire::encode_row_set(&RowSet::single_bigint(1)))
                        .collect(),
                    error: None,
                },
            };
            results.send(result)?;
        }
        self.log.borrow_mut().works.push((target_site, request));
        Ok(())
    }

    fn transaction_prepare(
        &mut self,
        txn_id: TxnId,
        partitions: &hornet_common::ids::PartitionSet,
    ) -> HornetResult<()> {
        self.log
            .borrow_mut()
            .prepares
            .push((txn_id, partitions.iter().collect()));
        let routes = self.routes.borrow();
        for partition in partitions.iter() {
            if let Some(sender) = routes.get(&partition) {
                let _ = sender.send(InternalMessage::Prepare(txn_id));
            }
        }
        Ok(())
    }

    fn transaction_finish(
        &mut self,
        txn_id: TxnId,
        status: Status,
        requeue: bool,
    ) -> HornetResult<()> {
        self.log.borrow_mut().finishes.push((txn_id, status, requeue));
        for sender in self.routes.borrow().values() {
            let _ = sender.send(InternalMessage::Finish { txn: txn_id, status });
        }
        Ok(())
    }

    fn transaction_prefetch_result(
        &mut self,
        txn_id: TxnId,
        result: WorkResult,
    ) -> HornetResult<()> {
        self.log.borrow_mut().prefetch_results.push((txn_id, result));
        Ok(())
    }

    fn shutdown_cluster(&mut self, error: HornetError) {
        self.log.borrow_mut().shutdowns.push(error);
    }
}

pub(super) fn test_config() -> ExecutorConfig {
    ExecutorConfig {
        partition_count: PartitionCount::new(4).expect("literal partition count must be non-zero"),
        partitions_per_site: 1,
        ..ExecutorConfig::default()
    }
}

/// One executor plus handles into its collaborators.
pub(super) struct Harness {
    pub exec: PartitionExecutor<InMemoryEngine, TestCoordinator>,
    pub log: Rc<RefCell<CoordinatorLog>>,
    pub fail_work: Rc<RefCell<Option<AbortReason>>>,
    pub sender: WorkSender,
}

impl Harness {
    pub fn new(partition: PartitionId) -> Self {
        Self::with_config(partition, test_config())
    }

    pub fn with_config(partition: PartitionId, config: ExecutorConfig) -> Self {
        let log = Rc::new(RefCell::new(CoordinatorLog::default()));
        let routes = Rc::new(RefCell::new(HashMap::new()));
        let fail_work = Rc::new(RefCell::new(None));
        let coordinator = TestCoordinator {
            log: Rc::clone(&log),
            routes: Rc::clone(&routes),
            fail_work: Rc::clone(&fail_work),
        };
        let catalog = catalog();
        let peers = PeerExecutorMap::new(config.partitions_per_site);
        let exec = PartitionExecutor::new(
            partition,
            config,
            Arc::clone(&catalog),
            Arc::new(SysprocRegistry::new()),
            procedures(),
            engine(),
            coordinator,
            peers,
            Box::new(TableConflictChecker::new(catalog)),
        )
        .expect("executor must initialize");
        let sender = exec.work_sender();
        let _ = routes.borrow_mut().insert(partition, sender.clone());
        Self {
            exec,
            log,
            fail_work,
            sender,
        }
    }

    pub fn send(&self, message: InternalMessage) {
        self.sender
            .send(message)
            .expect("executor work queue must be alive");
    }

    pub fn drive(&mut self, iterations: usize) {
        for _ in 0..iterations {
            let _ = self.exec.run_once(0);
        }
    }
}

pub(super) fn client_channel() -> (ResponseSender, Receiver<ClientResponse>) {
    ResponseSender::channel()
}

pub(super) fn local_txn(
    id: TxnId,
    base: PartitionId,
    procedure: ProcedureId,
    params: Vec<Value>,
    single: bool,
    touched: &[PartitionId],
    client: &ResponseSender,
) -> Transaction {
    let mut txn = Transaction::new(
        id,
        id,
        base,
        procedure,
        ParameterSet::new(params),
        procedure == PROC_SYS_STATUS,
        touched.iter().copied().collect(),
        single,
    );
    txn.set_response_sender(client.clone());
    txn
}

pub(super) fn remote_dtxn(
    id: TxnId,
    base: PartitionId,
    procedure: ProcedureId,
) -> (RemoteTransaction, Receiver<WorkResult>) {
    let interrupt = Arc::new(AtomicBool::new(false));
    let (sender, receiver) = WorkResultSender::channel(interrupt);
    (
        RemoteTransaction::new(id, base, procedure, false, sender),
        receiver,
    )
}

pub(super) fn bigint_params(value: i64) -> Vec<Value> {
    vec![Value::BigInt(value)]
}

pub(super) fn drain_responses(receiver: &Receiver<ClientResponse>) -> Vec<ClientResponse> {
    let mut responses = Vec::new();
    while let Ok(response) = receiver.try_recv() {
        responses.push(response);
    }
    responses
}
