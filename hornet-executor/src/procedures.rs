//! Stored-procedure seam: control code runs against a batch-oriented runner.

use std::sync::Arc;

use hashbrown::HashMap;

use hornet_common::error::AbortReason;
use hornet_common::ids::{
    DependencyId, FragmentId, PartitionId, PartitionSet, ProcedureId, TableId, TxnId,
};
use hornet_engine::value::{ParameterSet, RowSet};
use hornet_txn::work::WorkFragment;

/// One planned statement batch, already turned into a fragment DAG by the
/// batch planner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Work units across partitions.
    pub fragments: Vec<WorkFragment>,
    /// Parameter sets referenced by the units' param indices.
    pub params: Vec<ParameterSet>,
    /// Dependency id producing each statement's final result, in statement
    /// order.
    pub result_deps: Vec<DependencyId>,
}

impl BatchPlan {
    /// Whether every unit targets the given partition.
    #[must_use]
    pub fn is_single_partition_local(&self, partition: PartitionId) -> bool {
        self.fragments.iter().all(|unit| unit.partition == partition)
    }

    /// Whether every unit in the batch is read-only.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.fragments.iter().all(|unit| unit.read_only)
    }

    /// Whether the units at the given partition are all read-only.
    #[must_use]
    pub fn is_read_only_at(&self, partition: PartitionId) -> bool {
        self.fragments
            .iter()
            .filter(|unit| unit.partition == partition)
            .all(|unit| unit.read_only)
    }

    /// Partitions the batch touches.
    #[must_use]
    pub fn touched_partitions(&self) -> PartitionSet {
        self.fragments.iter().map(|unit| unit.partition).collect()
    }
}

/// Execution surface procedures run against.
///
/// Implemented by the executor's dispatch context; object-safe so procedure
/// implementations stay independent of the executor's type parameters.
pub trait ProcedureRunner {
    /// Id of the running transaction.
    fn txn_id(&self) -> TxnId;

    /// Partition the control code runs on.
    fn partition_id(&self) -> PartitionId;

    /// Invocation parameters.
    fn proc_params(&self) -> &ParameterSet;

    /// Plans are executed as a whole batch; returns one row set per
    /// statement, in `result_deps` order.
    ///
    /// # Errors
    ///
    /// Returns the abort reason when the batch fails; mispredictions and
    /// engine faults surface here as early-exit results.
    fn execute_batch(&mut self, plan: BatchPlan) -> Result<Vec<RowSet>, AbortReason>;

    /// Bulk-loads rows into a table under the transaction's undo token.
    ///
    /// # Errors
    ///
    /// Returns the abort reason when the load fails.
    fn load_table(&mut self, table: TableId, rows: &RowSet) -> Result<(), AbortReason>;

    /// Queues a single-fragment query for idle-time execution.
    fn defer_query(&mut self, fragment: FragmentId, params: ParameterSet);
}

/// Control code of one stored procedure.
pub trait StoredProcedure: Send + Sync {
    /// Runs the procedure to completion, returning the client-visible result
    /// tables.
    ///
    /// # Errors
    ///
    /// Returns the abort reason when the procedure aborts; a voluntary abort
    /// maps to [`AbortReason::User`].
    fn run(&self, runner: &mut dyn ProcedureRunner) -> Result<Vec<RowSet>, AbortReason>;
}

/// Procedure-id → implementation table, built at boot.
#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: HashMap<ProcedureId, Arc<dyn StoredProcedure>>,
}

impl ProcedureRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one procedure implementation, replacing any previous one.
    pub fn register(&mut self, id: ProcedureId, procedure: Arc<dyn StoredProcedure>) {
        let _ = self.procedures.insert(id, procedure);
    }

    /// Looks up a procedure implementation.
    #[must_use]
    pub fn get(&self, id: ProcedureId) -> Option<Arc<dyn StoredProcedure>> {
        self.procedures.get(&id).cloned()
    }
}
