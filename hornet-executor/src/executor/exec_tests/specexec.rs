use googletest::prelude::*;
use rstest::rstest;

use hornet_common::error::Status;
use hornet_engine::value::ParameterSet;

use crate::executor::ExecutionMode;
use crate::messages::{InternalMessage, TxnRef};

use super::testkit::{
    FRAG_READ_A, FRAG_READ_B, FRAG_WRITE_A, Harness, PROC_FAIL_B, PROC_READ_B, PROC_USER_ABORT,
    PROC_WRITE_A, PROC_WRITE_B, TABLE_A, TABLE_B, bigint_params, client_channel, drain_responses,
    local_txn, remote_dtxn, work_unit,
};

#[rstest]
fn dtxn_commit_releases_speculative_reads_in_dispatch_order() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    // D: read-write distributed transaction based here.
    let dtxn = local_txn(100, 0, PROC_WRITE_A, bigint_params(1), false, &[0, 1], &client);
    harness.send(InternalMessage::InitializeRequest(Box::new(dtxn)));
    harness.drive(2);
    assert_that!(harness.exec.current_dtxn(), eq(Some(100)));

    // Three read-only single-partition transactions line up behind it.
    for id in [101, 102, 103] {
        let txn = local_txn(id, 0, PROC_READ_B, Vec::new(), true, &[0], &client);
        harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    }
    harness.drive(4);

    // Idle slots speculate all three; their responses queue.
    harness.drive(3);
    assert_that!(harness.exec.spec_blocked_len(), eq(3_usize));
    assert_that!(drain_responses(&responses).is_empty(), eq(true));

    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::Ok,
    });
    harness.drive(1);

    let responses = drain_responses(&responses);
    let order = responses.iter().map(|response| response.txn_id).collect::<Vec<_>>();
    assert_that!(order, eq(&vec![101, 102, 103, 100]));
    assert_that!(
        responses.iter().all(|response| response.status == Status::Ok),
        eq(true)
    );
    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::CommitAll));
    assert_that!(harness.exec.current_dtxn(), eq(None));
    assert_that!(harness.exec.spec_blocked_len(), eq(0_usize));
}

#[rstest]
fn read_only_speculation_responds_immediately_once_the_dtxn_is_prepared() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    let (dtxn, _results) = remote_dtxn(100, 1, PROC_WRITE_A);
    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_READ_A, true),
        params: vec![ParameterSet::default()],
    });
    harness.drive(1);
    harness.send(InternalMessage::Prepare(100));
    harness.drive(1);
    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::CommitReadonly));

    let txn = local_txn(101, 0, PROC_READ_B, Vec::new(), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(2);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::Ok));
    assert_that!(responses[0].speculative, eq(true));
    assert_that!(harness.exec.spec_blocked_len(), eq(0_usize));
}

#[rstest]
fn speculative_writes_queue_behind_the_dtxn() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    let (dtxn, _results) = remote_dtxn(100, 1, PROC_READ_B);
    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_READ_B, true),
        params: vec![ParameterSet::default()],
    });
    harness.drive(1);

    let txn = local_txn(101, 0, PROC_WRITE_A, bigint_params(9), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(2);
    assert_that!(harness.exec.spec_blocked_len(), eq(1_usize));
    assert_that!(drain_responses(&responses).is_empty(), eq(true));

    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::Ok,
    });
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].txn_id, eq(101));
    assert_that!(responses[0].status, eq(Status::Ok));
    assert_that!(harness.exec.engine().table_rows(TABLE_A).len(), eq(1_usize));
}

#[rstest]
fn speculative_user_abort_responds_immediately() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    let (dtxn, _results) = remote_dtxn(100, 1, PROC_READ_B);
    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_READ_B, true),
        params: vec![ParameterSet::default()],
    });
    harness.drive(1);

    let txn = local_txn(101, 0, PROC_USER_ABORT, bigint_params(3), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(2);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::AbortUser));
    assert_that!(harness.exec.spec_blocked_len(), eq(0_usize));
    assert_that!(harness.exec.engine().rolled_back_tokens().len(), eq(1_usize));
    // The dtxn is untouched.
    assert_that!(harness.exec.current_dtxn(), eq(Some(100)));
}

#[rstest]
fn aborted_speculative_write_disables_speculation_until_the_dtxn_finishes() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    let (dtxn, _results) = remote_dtxn(100, 1, PROC_WRITE_A);
    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_WRITE_A, false),
        params: vec![ParameterSet::new(bigint_params(1))],
    });
    harness.drive(1);

    // This speculative write hits a constraint violation.
    let txn = local_txn(101, 0, PROC_FAIL_B, bigint_params(2), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(2);

    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::Disabled));
    assert_that!(harness.exec.spec_blocked_len(), eq(1_usize));

    // A later candidate stays put: speculation is off.
    let txn = local_txn(102, 0, PROC_WRITE_B, bigint_params(3), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(3);
    assert_that!(harness.exec.spec_blocked_len(), eq(1_usize));

    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::Ok,
    });
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].txn_id, eq(101));
    assert_that!(responses[0].status, eq(Status::AbortUnexpected));
    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::CommitAll));
    assert_that!(harness.exec.engine().table_rows(TABLE_B).is_empty(), eq(true));
}
