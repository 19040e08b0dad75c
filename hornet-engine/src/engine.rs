//! Execution-engine seam between the partition executor and storage.

use hashbrown::HashMap;
use thiserror::Error;

use hornet_common::error::{AbortReason, HornetResult};
use hornet_common::ids::{DependencyId, FragmentId, TableId, TxnId, UndoToken};

use crate::catalog::CatalogContext;
use crate::value::{ParameterSet, RowSet};

/// Output of one engine work unit: dependency ids with their row sets,
/// position-aligned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    /// Output dependency ids.
    pub dep_ids: Vec<DependencyId>,
    /// Row sets, one per dependency id.
    pub rowsets: Vec<RowSet>,
}

impl DependencySet {
    /// Number of dependencies in this set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dep_ids.len()
    }

    /// Returns whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dep_ids.is_empty()
    }
}

/// One batched plan-fragment execution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentExecRequest {
    /// Fragments to execute, in order.
    pub fragment_ids: Vec<FragmentId>,
    /// Parameters, one set per fragment.
    pub params: Vec<ParameterSet>,
    /// Input dependency per fragment; `None` for leaf fragments.
    pub input_dep_ids: Vec<Option<DependencyId>>,
    /// Output dependency id per fragment.
    pub output_dep_ids: Vec<DependencyId>,
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Last transaction committed at this partition.
    pub last_committed_txn: TxnId,
    /// Undo token the whole batch executes under.
    pub undo_token: UndoToken,
}

/// Selector for [`ExecutionEngine::get_stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsSelector {
    /// Per-table tuple counts and memory estimates.
    Table,
}

/// Transaction-scoped failures raised while executing fragments.
///
/// These abort the transaction, not the process; the executor maps them onto
/// the client-visible abort taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The fragment touched a tuple that was evicted to cold storage.
    #[error("evicted tuple access on table {table}")]
    EvictedTupleAccess {
        /// Table the access landed on.
        table: String,
    },

    /// A uniqueness or integrity constraint failed.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Statement-level SQL failure.
    #[error("sql error: {0}")]
    Sql(String),

    /// Engine-internal failure executing the fragment.
    #[error("engine execution fault: {0}")]
    Fault(String),
}

impl EngineError {
    /// Maps this engine failure onto the client-visible abort taxonomy.
    #[must_use]
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            EngineError::EvictedTupleAccess { table } => AbortReason::EvictedAccess {
                table: table.clone(),
            },
            EngineError::ConstraintViolation(message)
            | EngineError::Sql(message)
            | EngineError::Fault(message) => AbortReason::Unexpected(message.clone()),
        }
    }
}

/// The storage engine owned by one partition executor.
///
/// # Undo-token contract
///
/// Tokens handed to [`execute_plan_fragments`](Self::execute_plan_fragments)
/// are non-decreasing. [`release_undo_token`](Self::release_undo_token) commits
/// the given token *and every outstanding token below it*; successive release
/// calls must use strictly increasing tokens.
/// [`undo_undo_token`](Self::undo_undo_token) rolls back the given token *and
/// every outstanding token above it*; the token must be greater than the last
/// released one. A release at token `t` followed by an undo at `t' > t` is
/// legal and deterministic. Violations are engine faults and crash the
/// cluster.
pub trait ExecutionEngine {
    /// Installs the catalog. Called once before any other operation.
    ///
    /// # Errors
    ///
    /// Returns an error when the catalog cannot be loaded.
    fn load_catalog(&mut self, catalog: &CatalogContext) -> HornetResult<()>;

    /// Periodic maintenance tick carrying the last committed transaction.
    fn tick(&mut self, now_ms: u64, last_committed_txn: TxnId);

    /// Executes one batch of plan fragments and returns their output
    /// dependencies.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when any fragment aborts; partial effects
    /// stay rollback-able under the request's undo token.
    fn execute_plan_fragments(
        &mut self,
        request: &FragmentExecRequest,
    ) -> Result<DependencySet, EngineError>;

    /// Commits all outstanding undo tokens up to and including `token`.
    ///
    /// # Errors
    ///
    /// Returns an error when the token violates the strictly-increasing commit
    /// contract.
    fn release_undo_token(&mut self, token: UndoToken) -> HornetResult<()>;

    /// Rolls back all outstanding undo tokens down to and including `token`.
    ///
    /// # Errors
    ///
    /// Returns an error when the token is at or below the last committed one.
    fn undo_undo_token(&mut self, token: UndoToken) -> HornetResult<()>;

    /// Returns statistics rows for the selected subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error when statistics cannot be collected.
    fn get_stats(
        &mut self,
        selector: StatsSelector,
        table_ids: &[TableId],
        now_ms: u64,
    ) -> HornetResult<RowSet>;

    /// Bulk-loads rows into a table under the given undo token.
    ///
    /// # Errors
    ///
    /// Returns an [`EngineError`] when the load fails.
    #[allow(clippy::too_many_arguments)]
    fn load_table(
        &mut self,
        table: TableId,
        rows: &RowSet,
        txn_id: TxnId,
        last_committed_txn: TxnId,
        undo_token: UndoToken,
        allow_export: bool,
    ) -> Result<(), EngineError>;

    /// Stashes input dependencies for the next
    /// [`execute_plan_fragments`](Self::execute_plan_fragments) call.
    fn stash_work_unit_dependencies(&mut self, deps: HashMap<DependencyId, Vec<RowSet>>);
}
