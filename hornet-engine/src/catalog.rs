//! Catalog context: tables, plan fragments, and stored-procedure metadata.
//!
//! Built once at boot and read-only afterwards; executors share it behind an
//! `Arc`.

use hashbrown::HashMap;

use hornet_common::error::{HornetError, HornetResult};
use hornet_common::ids::{FragmentId, ProcedureId, TableId};

/// One table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    /// Catalog id.
    pub id: TableId,
    /// Table name.
    pub name: String,
}

/// One plan-fragment definition.
///
/// The batch planner emits fragment ids; the executor only needs the read-only
/// flag and the table footprint for conflict tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentDef {
    /// Catalog id.
    pub id: FragmentId,
    /// Whether the fragment never writes.
    pub read_only: bool,
    /// Tables the fragment reads.
    pub read_tables: Vec<TableId>,
    /// Tables the fragment writes.
    pub write_tables: Vec<TableId>,
}

/// One stored-procedure definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureDef {
    /// Catalog id.
    pub id: ProcedureId,
    /// Procedure name.
    pub name: String,
    /// System procedures bypass halt rejection and speculation.
    pub sysproc: bool,
    /// Union of tables any of the procedure's statements may read.
    pub read_tables: Vec<TableId>,
    /// Union of tables any of the procedure's statements may write.
    pub write_tables: Vec<TableId>,
}

impl ProcedureDef {
    /// Returns whether the procedure never writes any table.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.write_tables.is_empty()
    }
}

/// Immutable catalog shared by every executor in the process.
#[derive(Debug, Default)]
pub struct CatalogContext {
    tables: HashMap<TableId, TableDef>,
    fragments: HashMap<FragmentId, FragmentDef>,
    procedures: HashMap<ProcedureId, ProcedureDef>,
}

impl CatalogContext {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table definition.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is already taken.
    pub fn add_table(&mut self, table: TableDef) -> HornetResult<()> {
        if self.tables.insert(table.id, table).is_some() {
            return Err(HornetError::InvalidConfig("duplicate table id in catalog"));
        }
        Ok(())
    }

    /// Registers a plan-fragment definition.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is already taken.
    pub fn add_fragment(&mut self, fragment: FragmentDef) -> HornetResult<()> {
        if self.fragments.insert(fragment.id, fragment).is_some() {
            return Err(HornetError::InvalidConfig(
                "duplicate fragment id in catalog",
            ));
        }
        Ok(())
    }

    /// Registers a stored-procedure definition.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is already taken.
    pub fn add_procedure(&mut self, procedure: ProcedureDef) -> HornetResult<()> {
        if self.procedures.insert(procedure.id, procedure).is_some() {
            return Err(HornetError::InvalidConfig(
                "duplicate procedure id in catalog",
            ));
        }
        Ok(())
    }

    /// Looks up a table.
    #[must_use]
    pub fn table(&self, id: TableId) -> Option<&TableDef> {
        self.tables.get(&id)
    }

    /// Looks up a plan fragment.
    #[must_use]
    pub fn fragment(&self, id: FragmentId) -> Option<&FragmentDef> {
        self.fragments.get(&id)
    }

    /// Looks up a stored procedure.
    #[must_use]
    pub fn procedure(&self, id: ProcedureId) -> Option<&ProcedureDef> {
        self.procedures.get(&id)
    }

    /// Ids of all registered tables, ascending.
    #[must_use]
    pub fn table_ids(&self) -> Vec<TableId> {
        let mut ids = self.tables.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }
}
