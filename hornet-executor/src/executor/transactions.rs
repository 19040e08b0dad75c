//! Local transaction execution, response gating, and the finish protocol.

use tracing::{debug, warn};

use hornet_common::error::{AbortReason, HornetError, HornetResult, Status};
use hornet_common::ids::{
    DISABLE_UNDO_TOKEN, NULL_UNDO_TOKEN, PartitionSet, TxnId, UndoToken,
};
use hornet_engine::engine::ExecutionEngine;
use hornet_txn::response::ClientResponse;

use crate::coordinator::Coordinator;
use crate::executor::{ExecutionMode, PartitionExecutor, queued_entry};
use crate::executor::dispatch::ProcedureContext;
use crate::messages::InternalMessage;

impl<E: ExecutionEngine, C: Coordinator> PartitionExecutor<E, C> {
    /// Runs a locally-based transaction's control code and routes its client
    /// response.
    pub(crate) fn execute_transaction(&mut self, id: TxnId) -> HornetResult<()> {
        let Some(txn) = self.arena.local(id) else {
            warn!(partition = self.partition_id, txn = id, "start for unknown transaction");
            return Ok(());
        };
        let before_mode = self.exec_mode;
        let predict_single = txn.predict_single_partition();

        if !predict_single {
            // Distributed transaction: claim the partition or wait in line.
            if let Some(current) = self.current_dtxn
                && current != id
            {
                self.blocked_messages.push_back(InternalMessage::StartTxn(id));
                return Ok(());
            }
            if self.current_dtxn.is_none() {
                self.set_current_dtxn(id)?;
            }
            self.set_execution_mode(ExecutionMode::CommitNone)?;
        } else if self.current_dtxn.is_some() {
            // Single-partition work under a dtxn only runs when the
            // speculative scheduler picked it.
            let speculative = self.arena.get(id).is_some_and(|slot| slot.is_speculative());
            if self.exec_mode == ExecutionMode::Disabled
                || !self.config.specexec_enable
                || !speculative
            {
                self.blocked_messages.push_back(InternalMessage::StartTxn(id));
                return Ok(());
            }
            debug!(
                partition = self.partition_id,
                txn = id,
                dtxn = ?self.current_dtxn,
                "speculatively executing while the dtxn holds the partition"
            );
        }

        let Some(txn) = self.arena.local_mut(id) else {
            return Ok(());
        };
        txn.mark_executed();
        let procedure_id = txn.procedure();
        let client_handle = txn.client_handle();
        let Some(procedure) = self.procedures.get(procedure_id) else {
            let response = ClientResponse {
                txn_id: id,
                client_handle,
                status: Status::AbortUnexpected,
                results: Vec::new(),
                abort: Some(AbortReason::Unexpected("unknown procedure".to_owned())),
                speculative: false,
            };
            self.send_response(id, response);
            self.arena.remove(id);
            return Ok(());
        };

        let outcome = procedure.run(&mut ProcedureContext::new(self, id));
        if self.shutdown {
            return Ok(());
        }

        let speculative = self.arena.get(id).is_some_and(|slot| slot.is_speculative());
        let (status, results, abort) = match outcome {
            Ok(rows) => (Status::Ok, rows, None),
            Err(reason) => (reason.status(), Vec::new(), Some(reason)),
        };
        let response = ClientResponse {
            txn_id: id,
            client_handle,
            status,
            results,
            abort,
            speculative,
        };

        if !predict_single || self.can_process_response_now(id, status, before_mode) {
            self.process_client_response(id, response)
        } else {
            // The response has to wait for the dtxn. An aborted speculative
            // write is rolled back right now so the dtxn never reads its
            // dirty data, and the partition stops speculating.
            let read_only = self
                .arena
                .get(id)
                .is_some_and(|slot| slot.is_exec_read_only(self.partition_id));
            if status.is_abort() && !read_only {
                let first_undo = self
                    .arena
                    .get(id)
                    .map_or(NULL_UNDO_TOKEN, |slot| {
                        slot.first_undo_token(self.partition_id)
                    });
                let needs_finish = self
                    .arena
                    .get(id)
                    .is_some_and(|slot| slot.needs_finish(self.partition_id));
                if needs_finish && first_undo != NULL_UNDO_TOKEN {
                    self.finish_work_ee(id, first_undo, false)?;
                }
                if let Some(slot) = self.arena.get_mut(id) {
                    slot.mark_finished(self.partition_id);
                }
                self.set_execution_mode(ExecutionMode::Disabled)?;
                while let Some(message) = self.work_queue.try_poll() {
                    self.blocked_messages.push_back(message);
                }
            }
            self.block_client_response(id, response);
            Ok(())
        }
    }

    /// Whether a finished single-partition transaction may answer its client
    /// now, or must wait behind the current dtxn.
    pub(crate) fn can_process_response_now(
        &self,
        id: TxnId,
        status: Status,
        before_mode: ExecutionMode,
    ) -> bool {
        let speculative = self.arena.get(id).is_some_and(|slot| slot.is_speculative());
        if self.exec_mode == ExecutionMode::CommitAll {
            return true;
        }
        // A voluntary abort never depends on the dtxn's outcome.
        if status == Status::AbortUser && speculative {
            return true;
        }
        if status == Status::AbortMispredict {
            return true;
        }
        if status == Status::Ok {
            return match before_mode {
                ExecutionMode::CommitAll => true,
                ExecutionMode::CommitReadonly => {
                    !self.spec_modified
                        && self
                            .arena
                            .get(id)
                            .is_some_and(|slot| slot.is_exec_read_only(self.partition_id))
                }
                ExecutionMode::CommitNonconflicting | ExecutionMode::CommitNone => false,
                ExecutionMode::Disabled | ExecutionMode::DisabledReject => false,
            };
        }
        false
    }

    fn block_client_response(&mut self, id: TxnId, response: ClientResponse) {
        let read_only = self
            .arena
            .get(id)
            .is_some_and(|slot| slot.is_exec_read_only(self.partition_id));
        self.spec_modified = self.spec_modified || !read_only;
        debug!(
            partition = self.partition_id,
            txn = id,
            status = ?response.status,
            blocked = self.spec_blocked.len() + 1,
            "blocking speculative client response"
        );
        self.spec_blocked.push((id, response));
    }

    /// Routes a finished transaction's response: requeue internally-restarted
    /// aborts, answer single-partition clients directly, and drive 2PC for
    /// distributed commits.
    pub(crate) fn process_client_response(
        &mut self,
        id: TxnId,
        response: ClientResponse,
    ) -> HornetResult<()> {
        let status = response.status;
        let Some(slot) = self.arena.get(id) else {
            warn!(partition = self.partition_id, txn = id, "response for unknown transaction");
            return Ok(());
        };
        let predict_single = slot.predict_single_partition();

        if status.needs_restart() {
            if predict_single {
                if !self.arena.get(id).is_some_and(|slot| slot.is_finished(self.partition_id)) {
                    self.finish_transaction(id, status)?;
                }
                self.requeue_transaction(id, response)
            } else {
                // The coordinator aborts the transaction everywhere, then the
                // transaction system re-executes it with fresh predictions.
                if let Some(txn) = self.arena.local_mut(id) {
                    txn.mark_aborted();
                }
                self.coordinator.transaction_finish(id, status, true)
            }
        } else if predict_single {
            if !self.arena.get(id).is_some_and(|slot| slot.is_finished(self.partition_id)) {
                self.finish_transaction(id, status)?;
            }
            self.send_response(id, response);
            let _ = self.arena.remove(id);
            Ok(())
        } else if status == Status::Ok {
            // Distributed commit: hold the response, flip the mode, and start
            // phase one everywhere the transaction went.
            let new_mode = if self.config.specexec_enable {
                let read_only = self
                    .arena
                    .get(id)
                    .is_some_and(|slot| slot.is_exec_read_only(self.partition_id));
                if read_only {
                    ExecutionMode::CommitReadonly
                } else {
                    ExecutionMode::CommitNone
                }
            } else {
                ExecutionMode::Disabled
            };
            self.set_execution_mode(new_mode)?;

            let prepare_set = self
                .arena
                .local(id)
                .map(|txn| {
                    txn.predict_touched()
                        .iter()
                        .filter(|partition| !txn.done_partitions().contains(*partition))
                        .collect::<PartitionSet>()
                })
                .unwrap_or_default();
            if let Some(txn) = self.arena.local_mut(id) {
                txn.hold_response(response);
            }
            self.coordinator.transaction_prepare(id, &prepare_set)
        } else {
            // Distributed abort: nothing will ever improve this outcome, so
            // answer the client first, then tear the transaction down.
            self.send_response(id, response);
            self.coordinator.transaction_finish(id, status, false)
        }
    }

    /// Resets an internally-aborted transaction, emits its aborted response,
    /// and puts it back in line with a widened partition prediction.
    pub(crate) fn requeue_transaction(
        &mut self,
        id: TxnId,
        response: ClientResponse,
    ) -> HornetResult<()> {
        let Some(txn) = self.arena.local_mut(id) else {
            return Ok(());
        };
        let mut widened = txn.predict_touched().clone();
        widened.extend_from(txn.touched());

        // Re-arm the response channel for the next attempt before this one
        // reports its abort.
        let sender = txn.take_response_sender();
        if let Some(sender) = &sender {
            txn.set_response_sender(sender.clone());
        }
        txn.restart(widened);
        let entry = queued_entry(txn);
        if let Some(sender) = sender
            && let Err(error) = sender.send(response)
        {
            warn!(partition = self.partition_id, txn = id, %error, "client gone during requeue");
        }
        debug!(
            partition = self.partition_id,
            txn = id,
            restarts = self.arena.local(id).map_or(0, hornet_txn::transaction::Transaction::restarts),
            "requeued transaction as multi-partition"
        );
        self.lock_queue.insert(entry)
    }

    /// Commits or rolls back one transaction's engine work at this partition.
    pub(crate) fn finish_transaction(&mut self, id: TxnId, status: Status) -> HornetResult<()> {
        let Some(slot) = self.arena.get(id) else {
            return Err(HornetError::InvalidState(
                "finishing an unknown transaction",
            ));
        };
        let commit = status == Status::Ok;
        let token = if commit {
            slot.last_undo_token(self.partition_id)
        } else {
            slot.first_undo_token(self.partition_id)
        };

        if slot.needs_finish(self.partition_id) && token != NULL_UNDO_TOKEN {
            self.finish_work_ee(id, token, commit)?;
        }
        if commit {
            self.last_committed_txn = id;
        }
        self.lock_queue.finished(id, status);
        if let Some(slot) = self.arena.get_mut(id) {
            slot.mark_finished(self.partition_id);
        }
        debug!(
            partition = self.partition_id,
            txn = id,
            commit,
            "transaction finished at this partition"
        );
        Ok(())
    }

    /// Pushes one commit/rollback into the engine.
    ///
    /// # Errors
    ///
    /// Returns an error (fatal upstream) when the undo-token contract is
    /// violated, including an abort for work that ran without undo logging.
    pub(crate) fn finish_work_ee(
        &mut self,
        id: TxnId,
        token: UndoToken,
        commit: bool,
    ) -> HornetResult<()> {
        if token == DISABLE_UNDO_TOKEN {
            let read_only = self
                .arena
                .get(id)
                .is_some_and(|slot| slot.is_exec_read_only(self.partition_id));
            if !commit && !read_only {
                return Err(HornetError::EngineFault(format!(
                    "aborting transaction {id} at partition {} without undo logging",
                    self.partition_id
                )));
            }
            return Ok(());
        }
        if token <= self.undo.last_committed() {
            return Err(HornetError::EngineFault(format!(
                "token {token} is not above last committed {} at partition {}",
                self.undo.last_committed(),
                self.partition_id
            )));
        }
        if commit {
            self.engine.release_undo_token(token)?;
            self.undo.note_committed(token)?;
        } else {
            self.engine.undo_undo_token(token)?;
        }
        Ok(())
    }

    /// Terminal commit/abort for a distributed transaction at this partition,
    /// resolving every speculative transaction layered on top of it.
    pub(crate) fn finish_distributed_transaction(
        &mut self,
        id: TxnId,
        status: Status,
    ) -> HornetResult<()> {
        if self.current_dtxn != Some(id) {
            // A dtxn that never held this partition's lock can only be
            // aborting here.
            if status == Status::Ok {
                return Err(HornetError::InvalidState(
                    "commit decision for a dtxn that does not hold the partition",
                ));
            }
            self.lock_queue.finished(id, status);
            let _ = self.arena.remove(id);
            return Ok(());
        }

        debug!(
            partition = self.partition_id,
            txn = id,
            ?status,
            spec_blocked = self.spec_blocked.len(),
            "finishing current dtxn"
        );

        if self.spec_blocked.is_empty() {
            self.finish_transaction(id, status)?;
        } else {
            let wrote_here = !self
                .arena
                .get(id)
                .is_some_and(|slot| slot.is_exec_read_only(self.partition_id));
            if status.is_abort() && wrote_here {
                self.finish_dtxn_abort_with_spec(id, status)?;
            } else {
                self.finish_dtxn_commit_with_spec(id, status)?;
            }
            self.spec_modified = false;
        }

        self.query_cache.purge_transaction(id);
        self.reset_current_dtxn();
        self.set_execution_mode(ExecutionMode::CommitAll)?;

        let released = self.blocked_messages.drain(..).collect::<Vec<_>>();
        if !released.is_empty() {
            debug!(
                partition = self.partition_id,
                count = released.len(),
                "releasing blocked messages"
            );
            self.work_queue.push_back_all(released);
        }

        // A committed local dtxn answers its client only after everything it
        // gated is resolved.
        if status == Status::Ok {
            let held = self
                .arena
                .local_mut(id)
                .filter(|txn| txn.base_partition() == self.partition_id)
                .and_then(hornet_txn::transaction::Transaction::take_held_response);
            if let Some(response) = held {
                self.send_response(id, response);
            }
        }
        let _ = self.arena.remove(id);
        Ok(())
    }

    /// Dtxn commit (or read-only abort): one engine commit at the newest
    /// token covers the dtxn plus every speculative layer, then the blocked
    /// responses are released in the order they were queued.
    fn finish_dtxn_commit_with_spec(&mut self, id: TxnId, status: Status) -> HornetResult<()> {
        let token = self.undo.last_undo_token();
        if token != self.undo.last_committed() {
            self.finish_work_ee(id, token, true)?;
        }
        self.lock_queue.finished(id, status);
        if let Some(slot) = self.arena.get_mut(id) {
            slot.mark_finished(self.partition_id);
        }
        if status == Status::Ok {
            self.last_committed_txn = id;
        }

        let drained = std::mem::take(&mut self.spec_blocked);
        for (spec_id, response) in drained {
            if let Some(slot) = self.arena.get_mut(spec_id) {
                slot.mark_finished(self.partition_id);
            }
            self.process_client_response(spec_id, response)?;
        }
        Ok(())
    }

    /// Dtxn abort after writing here: speculative transactions that only read
    /// the pre-dtxn state commit, the rest restart, and the dtxn's writes
    /// roll back.
    fn finish_dtxn_abort_with_spec(&mut self, id: TxnId, status: Status) -> HornetResult<()> {
        let dtxn_first = self
            .arena
            .get(id)
            .map_or(NULL_UNDO_TOKEN, |slot| slot.first_undo_token(self.partition_id));

        let drained = std::mem::take(&mut self.spec_blocked);
        let mut to_commit = Vec::new();
        let mut to_restart = Vec::new();
        let mut max_commit_token = NULL_UNDO_TOKEN;
        for (spec_id, response) in drained {
            let spec_first = self
                .arena
                .get(spec_id)
                .map_or(NULL_UNDO_TOKEN, |slot| {
                    slot.first_undo_token(self.partition_id)
                });
            if spec_first == DISABLE_UNDO_TOKEN {
                return Err(HornetError::InvalidState(
                    "speculative transaction ran without an undo token",
                ));
            }
            // No token means the transaction never reached the engine; it can
            // always commit. Otherwise its first token tells us which side of
            // the dtxn's writes it read.
            if spec_first == NULL_UNDO_TOKEN || spec_first < dtxn_first {
                if spec_first != NULL_UNDO_TOKEN && spec_first > max_commit_token {
                    max_commit_token = spec_first;
                }
                to_commit.push((spec_id, response));
            } else {
                to_restart.push((spec_id, response));
            }
        }
        debug!(
            partition = self.partition_id,
            dtxn = id,
            commit = to_commit.len(),
            restart = to_restart.len(),
            "partitioned speculative transactions around the aborting dtxn"
        );

        // One engine commit at the largest pre-dtxn token carries every lower
        // outstanding token with it.
        if max_commit_token != NULL_UNDO_TOKEN {
            self.finish_work_ee(id, max_commit_token, true)?;
        }
        for (spec_id, response) in to_commit {
            if let Some(slot) = self.arena.get_mut(spec_id) {
                slot.mark_finished(self.partition_id);
            }
            self.process_client_response(spec_id, response)?;
        }

        // Roll the dtxn back at its first token; every higher outstanding
        // token goes with it.
        self.finish_transaction(id, status)?;

        for (spec_id, mut response) in to_restart {
            if let Some(slot) = self.arena.get_mut(spec_id) {
                slot.mark_finished(self.partition_id);
            }
            let touched = self
                .arena
                .local(spec_id)
                .map(|txn| txn.touched().clone())
                .unwrap_or_default();
            response.status = Status::AbortSpeculative;
            response.abort = Some(AbortReason::Speculative { touched });
            response.results.clear();
            self.requeue_transaction(spec_id, response)?;
        }
        Ok(())
    }
}
