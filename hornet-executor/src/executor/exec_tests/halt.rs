use googletest::prelude::*;
use rstest::rstest;

use hornet_common::error::Status;

use crate::executor::ExecutionMode;
use crate::messages::InternalMessage;

use super::testkit::{
    Harness, PROC_WRITE_A, bigint_params, client_channel, drain_responses, local_txn,
};

#[rstest]
fn halt_rejects_queued_and_new_transactions() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    // Register one transaction in the lock queue, then leave a start for it
    // and a fresh request sitting in the work queue.
    let released = local_txn(101, 0, PROC_WRITE_A, bigint_params(2), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(released)));
    harness.drive(1);
    harness.send(InternalMessage::StartTxn(101));
    let queued = local_txn(100, 0, PROC_WRITE_A, bigint_params(1), true, &[0], &client);
    harness.send(InternalMessage::InitializeRequest(Box::new(queued)));

    harness
        .exec
        .halt_processing()
        .expect("halt must not fail");
    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::DisabledReject));

    let rejected = drain_responses(&responses);
    let outcomes = rejected
        .iter()
        .map(|response| (response.txn_id, response.status))
        .collect::<Vec<_>>();
    assert_that!(
        outcomes,
        eq(&vec![(101, Status::AbortReject), (100, Status::AbortReject)])
    );
    assert_that!(harness.exec.lock_queue().contains(101), eq(false));

    // New non-sysproc work is rejected outright.
    let late = local_txn(102, 0, PROC_WRITE_A, bigint_params(3), true, &[0], &client);
    harness.send(InternalMessage::InitializeRequest(Box::new(late)));
    harness.drive(1);
    let late_responses = drain_responses(&responses);
    assert_that!(late_responses.len(), eq(1_usize));
    assert_that!(late_responses[0].status, eq(Status::AbortReject));
}

#[rstest]
fn halt_keeps_finish_messages() {
    let mut harness = Harness::new(0);

    // A finish for a foreign transaction is queued behind the halt.
    harness.send(InternalMessage::Finish {
        txn: 999,
        status: Status::AbortUser,
    });
    harness
        .exec
        .halt_processing()
        .expect("halt must not fail");

    // The finish survived the drain and still processes.
    harness.drive(1);
    assert_that!(harness.exec.is_shutdown(), eq(false));
    assert_that!(harness.exec.last_executed_txn(), eq(Some(999)));
}
