//! Speculative-execution scheduler: picks the next single-partition
//! transaction that can safely run while a distributed transaction holds the
//! partition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use hornet_common::config::{ExecutorConfig, SchedulerPolicy};
use hornet_common::ids::{PartitionId, TxnId};
use hornet_txn::arena::{TransactionArena, TxnSlot};
use hornet_txn::transaction::SpeculationType;

use crate::conflict::ConflictChecker;
use crate::lock_queue::PartitionLockQueue;

/// Conflict-aware candidate selection over the partition lock queue.
///
/// The scan position is cached between calls and reused while the dtxn, the
/// speculation type, and the queue size stay stable (each sensitivity is
/// configurable). Any new work arrival raises the shared interrupt flag and
/// aborts the scan; the partial result is discarded.
#[derive(Debug)]
pub struct SpecExecScheduler {
    partition_id: PartitionId,
    policy: SchedulerPolicy,
    window: usize,
    ignore_all_local: bool,
    ignore_queue_size_change: bool,
    ignore_speculation_type_change: bool,
    partitions_per_site: u16,
    last_dtxn: Option<TxnId>,
    last_spec_type: Option<SpeculationType>,
    cursor: Option<TxnId>,
    last_size: usize,
    interrupt: Arc<AtomicBool>,
}

impl SpecExecScheduler {
    /// Creates the scheduler for one partition.
    #[must_use]
    pub fn new(partition_id: PartitionId, config: &ExecutorConfig, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            partition_id,
            policy: config.scheduler_policy,
            window: config.scheduler_window.max(1),
            ignore_all_local: config.ignore_all_local,
            ignore_queue_size_change: config.ignore_queue_size_change,
            ignore_speculation_type_change: config.ignore_speculation_type_change,
            partitions_per_site: config.partitions_per_site,
            last_dtxn: None,
            last_spec_type: None,
            cursor: None,
            last_size: 0,
            interrupt,
        }
    }

    /// Drops the cached scan position.
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Finds the next non-conflicting candidate and atomically claims it:
    /// the returned transaction is removed from the lock queue and marked
    /// released. Callers that cannot execute it must requeue it themselves.
    pub fn next(
        &mut self,
        queue: &mut PartitionLockQueue,
        arena: &mut TransactionArena,
        dtxn: Option<TxnId>,
        spec_type: SpeculationType,
        checker: &dyn ConflictChecker,
    ) -> Option<TxnId> {
        self.interrupt.store(false, Ordering::Release);

        // A dtxn that stays inside this site resolves quickly; scanning for
        // speculative work would cost more than the stall it hides.
        if self.ignore_all_local
            && let Some(dtxn_id) = dtxn
            && let Some(TxnSlot::Local(local)) = arena.get(dtxn_id)
            && local.predict_all_local(self.partitions_per_site)
        {
            return None;
        }

        let reuse_cursor = self.policy == SchedulerPolicy::First
            && self.last_dtxn == dtxn
            && self.cursor.is_some()
            && (self.ignore_speculation_type_change || self.last_spec_type == Some(spec_type))
            && (self.ignore_queue_size_change || self.last_size == queue.len());
        if !reuse_cursor {
            self.cursor = None;
        }

        let dtxn_procedure = dtxn
            .and_then(|id| arena.get(id))
            .map(hornet_txn::arena::TxnSlot::procedure);

        let mut chosen: Option<TxnId> = None;
        let mut best_remaining: Option<u64> = None;
        let mut examined = 0_usize;
        let mut interrupted = false;
        let mut exhausted = true;

        for entry in queue.iter_from(self.cursor) {
            if self.interrupt.load(Ordering::Acquire) {
                interrupted = true;
                exhausted = false;
                break;
            }

            // Only locally-based, single-partition candidates can speculate.
            if entry.base_partition != self.partition_id || !entry.predict_single_partition {
                continue;
            }
            let Some(candidate) = arena.local(entry.id) else {
                continue;
            };
            if candidate.is_executed() {
                continue;
            }

            examined += 1;
            let conflicts = spec_type.requires_conflict_check()
                && !dtxn_procedure.is_some_and(|dtxn_proc| {
                    checker.can_execute(dtxn_proc, entry.procedure, self.partition_id)
                });
            if !conflicts {
                match self.policy {
                    SchedulerPolicy::First => {
                        chosen = Some(entry.id);
                        exhausted = false;
                        break;
                    }
                    SchedulerPolicy::Shortest => {
                        if let Some(remaining) = entry.estimated_remaining_us
                            && best_remaining.is_none_or(|best| remaining < best)
                        {
                            best_remaining = Some(remaining);
                            chosen = Some(entry.id);
                        }
                    }
                    SchedulerPolicy::Longest => {
                        if let Some(remaining) = entry.estimated_remaining_us
                            && best_remaining.is_none_or(|best| remaining > best)
                        {
                            best_remaining = Some(remaining);
                            chosen = Some(entry.id);
                        }
                    }
                }
            }
            if examined == self.window {
                exhausted = false;
                break;
            }
        }

        if interrupted {
            debug!(partition = self.partition_id, "speculative scan interrupted by new work");
            self.cursor = None;
            self.last_dtxn = dtxn;
            self.last_spec_type = Some(spec_type);
            return None;
        }

        if let Some(id) = chosen {
            if let Some(local) = arena.local_mut(id) {
                local.work_state_mut(self.partition_id).released = true;
            }
            let _ = queue.remove(id);
            debug!(
                partition = self.partition_id,
                txn = id,
                ?spec_type,
                "claimed speculative candidate"
            );
        }

        if self.policy == SchedulerPolicy::First && chosen.is_some() && !exhausted {
            // Resume the scan after the claimed entry on the next call.
            self.cursor = chosen;
            if !self.ignore_queue_size_change {
                self.last_size = queue.len();
            }
        } else {
            self.cursor = None;
        }
        self.last_dtxn = dtxn;
        self.last_spec_type = Some(spec_type);
        chosen
    }
}
