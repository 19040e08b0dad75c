//! Conflict checking between a distributed transaction and speculative
//! candidates.

use std::sync::Arc;

use hornet_common::ids::{PartitionId, ProcedureId, TableId};
use hornet_engine::catalog::CatalogContext;

/// Answers "may this candidate run while the dtxn holds the partition?".
pub trait ConflictChecker {
    /// Procedures the speculation machinery should never reason about.
    fn should_ignore_procedure(&self, procedure: ProcedureId) -> bool;

    /// Whether `candidate` can safely execute at `partition` while `dtxn`
    /// holds it mid-execution.
    fn can_execute(
        &self,
        dtxn_procedure: ProcedureId,
        candidate_procedure: ProcedureId,
        partition: PartitionId,
    ) -> bool;
}

/// Table-granularity checker driven by the catalog's per-procedure read and
/// write sets.
pub struct TableConflictChecker {
    catalog: Arc<CatalogContext>,
}

impl TableConflictChecker {
    /// Creates a checker over the given catalog.
    #[must_use]
    pub fn new(catalog: Arc<CatalogContext>) -> Self {
        Self { catalog }
    }
}

fn intersects(left: &[TableId], right: &[TableId]) -> bool {
    left.iter().any(|table| right.contains(table))
}

impl ConflictChecker for TableConflictChecker {
    fn should_ignore_procedure(&self, procedure: ProcedureId) -> bool {
        // Sysprocs and unknown procedures have no usable footprint.
        self.catalog
            .procedure(procedure)
            .is_none_or(|def| def.sysproc)
    }

    fn can_execute(
        &self,
        dtxn_procedure: ProcedureId,
        candidate_procedure: ProcedureId,
        _partition: PartitionId,
    ) -> bool {
        let (Some(dtxn), Some(candidate)) = (
            self.catalog.procedure(dtxn_procedure),
            self.catalog.procedure(candidate_procedure),
        ) else {
            return false;
        };

        // Write-write, write-read, and read-write overlaps at table
        // granularity all order the candidate against the dtxn.
        if intersects(&candidate.write_tables, &dtxn.write_tables)
            || intersects(&candidate.write_tables, &dtxn.read_tables)
            || intersects(&candidate.read_tables, &dtxn.write_tables)
        {
            return false;
        }
        true
    }
}

/// Checker that lets a bounded number of candidates through unchecked.
///
/// Exists for measuring the upper bound of speculative throughput; never safe
/// for production workloads.
pub struct UnsafeConflictChecker {
    limit: Option<usize>,
    approved: std::cell::Cell<usize>,
}

impl UnsafeConflictChecker {
    /// Creates a checker that approves at most `limit` candidates, or every
    /// candidate when `limit` is `None`.
    #[must_use]
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            approved: std::cell::Cell::new(0),
        }
    }
}

impl ConflictChecker for UnsafeConflictChecker {
    fn should_ignore_procedure(&self, _procedure: ProcedureId) -> bool {
        false
    }

    fn can_execute(
        &self,
        _dtxn_procedure: ProcedureId,
        _candidate_procedure: ProcedureId,
        _partition: PartitionId,
    ) -> bool {
        if let Some(limit) = self.limit {
            if self.approved.get() >= limit {
                return false;
            }
            self.approved.set(self.approved.get() + 1);
        }
        true
    }
}
