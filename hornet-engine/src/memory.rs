//! Table-backed in-memory engine with full undo-token layering.
//!
//! This is the engine the executor test harness runs against. It enforces the
//! commit/abort contract documented on [`ExecutionEngine`]: commits must use
//! strictly increasing tokens, aborts must stay above the last committed
//! token. Fragment behavior is table-driven: callers register a handler per
//! fragment id.

use std::collections::BTreeMap;
use std::rc::Rc;

use hashbrown::HashMap;

use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{
    DISABLE_UNDO_TOKEN, DependencyId, FragmentId, TableId, TxnId, UndoToken,
};

use crate::catalog::CatalogContext;
use crate::engine::{DependencySet, EngineError, ExecutionEngine, FragmentExecRequest, StatsSelector};
use crate::value::{ParameterSet, RowSet, Value};

type TableRows = Vec<Vec<Value>>;
type TableStore = HashMap<TableId, TableRows>;

/// Handler invoked for one registered fragment id.
pub type FragmentHandler = Rc<dyn Fn(&mut FragmentCtx<'_>) -> Result<RowSet, EngineError>>;

/// Execution context handed to fragment handlers.
pub struct FragmentCtx<'a> {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Parameters for this fragment.
    pub params: &'a ParameterSet,
    /// Input dependency row sets, if the fragment declared any.
    pub inputs: Vec<RowSet>,
    tables: &'a mut TableStore,
    journal: Option<&'a mut TableStore>,
}

impl FragmentCtx<'_> {
    /// Reads a table's rows.
    #[must_use]
    pub fn read_table(&self, table: TableId) -> &[Vec<Value>] {
        self.tables.get(&table).map_or(&[], Vec::as_slice)
    }

    /// Returns mutable rows for a table, journaling the pre-image so the
    /// active undo token can roll the write back.
    pub fn table_mut(&mut self, table: TableId) -> &mut TableRows {
        if let Some(journal) = self.journal.as_deref_mut()
            && !journal.contains_key(&table)
        {
            let pre_image = self.tables.get(&table).cloned().unwrap_or_default();
            let _ = journal.insert(table, pre_image);
        }
        self.tables.entry(table).or_default()
    }
}

/// In-memory [`ExecutionEngine`] implementation.
#[derive(Default)]
pub struct InMemoryEngine {
    tables: TableStore,
    handlers: HashMap<FragmentId, FragmentHandler>,
    stashed: HashMap<DependencyId, Vec<RowSet>>,
    /// Pre-images per outstanding undo token, ordered by token.
    outstanding: BTreeMap<UndoToken, TableStore>,
    last_released: Option<UndoToken>,
    released_log: Vec<UndoToken>,
    rolled_back_log: Vec<UndoToken>,
    ticks: Vec<(u64, TxnId)>,
    catalog_loaded: bool,
}

impl InMemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler executed for a fragment id.
    pub fn register_fragment<F>(&mut self, fragment: FragmentId, handler: F)
    where
        F: Fn(&mut FragmentCtx<'_>) -> Result<RowSet, EngineError> + 'static,
    {
        let _ = self.handlers.insert(fragment, Rc::new(handler));
    }

    /// Rows currently visible in a table.
    #[must_use]
    pub fn table_rows(&self, table: TableId) -> &[Vec<Value>] {
        self.tables.get(&table).map_or(&[], Vec::as_slice)
    }

    /// Tokens committed so far, in call order.
    #[must_use]
    pub fn released_tokens(&self) -> &[UndoToken] {
        &self.released_log
    }

    /// Tokens rolled back so far, in call order.
    #[must_use]
    pub fn rolled_back_tokens(&self) -> &[UndoToken] {
        &self.rolled_back_log
    }

    /// Ticks observed so far.
    #[must_use]
    pub fn ticks(&self) -> &[(u64, TxnId)] {
        &self.ticks
    }

    /// Undo tokens with uncommitted write layers.
    #[must_use]
    pub fn outstanding_tokens(&self) -> Vec<UndoToken> {
        self.outstanding.keys().copied().collect()
    }

    fn gather_inputs(&self, dep: Option<DependencyId>) -> Vec<RowSet> {
        let Some(dep) = dep else {
            return Vec::new();
        };
        self.stashed.get(&dep).cloned().unwrap_or_default()
    }
}

impl ExecutionEngine for InMemoryEngine {
    fn load_catalog(&mut self, _catalog: &CatalogContext) -> HornetResult<()> {
        self.catalog_loaded = true;
        Ok(())
    }

    fn tick(&mut self, now_ms: u64, last_committed_txn: TxnId) {
        self.ticks.push((now_ms, last_committed_txn));
    }

    fn execute_plan_fragments(
        &mut self,
        request: &FragmentExecRequest,
    ) -> Result<DependencySet, EngineError> {
        if !self.catalog_loaded {
            return Err(EngineError::Fault("catalog not loaded".to_owned()));
        }
        if request.fragment_ids.len() != request.params.len()
            || request.fragment_ids.len() != request.output_dep_ids.len()
        {
            return Err(EngineError::Fault(
                "fragment/parameter/output arity mismatch".to_owned(),
            ));
        }
        if request.undo_token != DISABLE_UNDO_TOKEN
            && self.last_released.is_some_and(|last| request.undo_token <= last)
        {
            return Err(EngineError::Fault(format!(
                "undo token {} is not above last committed token",
                request.undo_token
            )));
        }

        let mut rowsets = Vec::with_capacity(request.fragment_ids.len());
        for (index, fragment) in request.fragment_ids.iter().copied().enumerate() {
            let Some(handler) = self.handlers.get(&fragment).cloned() else {
                return Err(EngineError::Fault(format!(
                    "no handler registered for fragment {fragment}"
                )));
            };
            let inputs = self.gather_inputs(request.input_dep_ids[index]);
            let journal = if request.undo_token == DISABLE_UNDO_TOKEN {
                None
            } else {
                Some(self.outstanding.entry(request.undo_token).or_default())
            };
            let mut ctx = FragmentCtx {
                txn_id: request.txn_id,
                params: &request.params[index],
                inputs,
                tables: &mut self.tables,
                journal,
            };
            rowsets.push(handler(&mut ctx)?);
        }
        self.stashed.clear();

        Ok(DependencySet {
            dep_ids: request.output_dep_ids.clone(),
            rowsets,
        })
    }

    fn release_undo_token(&mut self, token: UndoToken) -> HornetResult<()> {
        if token == DISABLE_UNDO_TOKEN {
            return Err(HornetError::EngineFault(
                "cannot release the disabled-undo sentinel".to_owned(),
            ));
        }
        if self.last_released.is_some_and(|last| token <= last) {
            return Err(HornetError::EngineFault(format!(
                "release token {token} is not strictly above the last committed token"
            )));
        }
        // Committing a token drops its pre-images and those of every lower
        // outstanding token.
        let keep = self.outstanding.split_off(&(token + 1));
        self.outstanding = keep;
        self.last_released = Some(token);
        self.released_log.push(token);
        Ok(())
    }

    fn undo_undo_token(&mut self, token: UndoToken) -> HornetResult<()> {
        if self.last_released.is_some_and(|last| token <= last) {
            return Err(HornetError::EngineFault(format!(
                "undo token {token} is at or below the last committed token"
            )));
        }
        // Aborts are LIFO: restore pre-images from the highest token down so
        // the surviving state is the pre-image of the lowest rolled-back
        // token.
        let rolled = self.outstanding.split_off(&token);
        for (_, pre_images) in rolled.into_iter().rev() {
            for (table, rows) in pre_images {
                let _ = self.tables.insert(table, rows);
            }
        }
        self.rolled_back_log.push(token);
        Ok(())
    }

    fn get_stats(
        &mut self,
        selector: StatsSelector,
        table_ids: &[TableId],
        _now_ms: u64,
    ) -> HornetResult<RowSet> {
        match selector {
            StatsSelector::Table => {
                let rows = table_ids
                    .iter()
                    .map(|table| {
                        let count = self.tables.get(table).map_or(0, Vec::len);
                        vec![Value::BigInt(i64::from(*table)), Value::BigInt(count as i64)]
                    })
                    .collect::<Vec<_>>();
                Ok(RowSet { rows })
            }
        }
    }

    fn load_table(
        &mut self,
        table: TableId,
        rows: &RowSet,
        _txn_id: TxnId,
        _last_committed_txn: TxnId,
        undo_token: UndoToken,
        _allow_export: bool,
    ) -> Result<(), EngineError> {
        if undo_token != DISABLE_UNDO_TOKEN {
            let journal = self.outstanding.entry(undo_token).or_default();
            if !journal.contains_key(&table) {
                let pre_image = self.tables.get(&table).cloned().unwrap_or_default();
                let _ = journal.insert(table, pre_image);
            }
        }
        self.tables
            .entry(table)
            .or_default()
            .extend(rows.rows.iter().cloned());
        Ok(())
    }

    fn stash_work_unit_dependencies(&mut self, deps: HashMap<DependencyId, Vec<RowSet>>) {
        self.stashed = deps;
    }
}
