use std::sync::mpsc;

use googletest::prelude::*;
use rstest::rstest;

use hornet_common::error::Status;
use hornet_engine::value::{ParameterSet, Value};
use hornet_txn::response::ClientResponse;

use crate::executor::ExecutionMode;
use crate::messages::{InternalMessage, TxnRef};

use super::testkit::{
    FRAG_READ_A, FRAG_READ_B, FRAG_WRITE_A, Harness, PROC_READ_B, PROC_WRITE_A, PROC_WRITE_B,
    TABLE_A, TABLE_B, bigint_params, client_channel, drain_responses, local_txn, remote_dtxn,
    work_unit,
};

/// Installs a remote dtxn that reads alpha, then writes it, with three
/// speculative beta writers interleaved: s1 before the dtxn's write, s2 and
/// s3 after.
fn mixed_speculation_harness() -> (Harness, mpsc::Receiver<ClientResponse>) {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    let (dtxn, _results) = remote_dtxn(100, 1, PROC_WRITE_A);
    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);

    // Read round first: the dtxn holds the partition but has not written.
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_READ_A, true),
        params: vec![ParameterSet::default()],
    });
    harness.drive(1);

    // s1 speculates against the pre-write state.
    let txn = local_txn(101, 0, PROC_WRITE_B, bigint_params(1), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(2);

    // Now the dtxn writes alpha.
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_WRITE_A, false),
        params: vec![ParameterSet::new(bigint_params(55))],
    });
    harness.drive(1);

    // s2 and s3 speculate on top of the dirty write.
    for id in [102_u64, 103] {
        let txn = local_txn(id, 0, PROC_WRITE_B, bigint_params(id as i64), true, &[0], &client);
        harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    }
    harness.drive(4);
    assert_that!(harness.exec.spec_blocked_len(), eq(3_usize));

    (harness, responses)
}

#[rstest]
fn dtxn_abort_commits_early_speculation_and_restarts_the_rest() {
    let (mut harness, responses) = mixed_speculation_harness();

    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::AbortUser,
    });
    harness.drive(1);

    let responses = drain_responses(&responses);
    let outcomes = responses
        .iter()
        .map(|response| (response.txn_id, response.status))
        .collect::<Vec<_>>();
    assert_that!(
        outcomes,
        eq(&vec![
            (101, Status::Ok),
            (102, Status::AbortSpeculative),
            (103, Status::AbortSpeculative),
        ])
    );

    // One commit below the dtxn's first write token, then one rollback at it.
    assert_that!(harness.exec.engine().released_tokens(), eq(&[1]));
    assert_that!(harness.exec.engine().rolled_back_tokens(), eq(&[2]));

    // s1's write survives; the dtxn's write and the later speculation do not.
    assert_that!(harness.exec.engine().table_rows(TABLE_A).is_empty(), eq(true));
    assert_that!(harness.exec.engine().table_rows(TABLE_B).len(), eq(1_usize));
    assert_that!(
        harness.exec.engine().table_rows(TABLE_B)[0],
        eq(&vec![Value::BigInt(1)])
    );

    // The restarted transactions are back in line as multi-partition.
    assert_that!(harness.exec.lock_queue().contains(102), eq(true));
    assert_that!(harness.exec.lock_queue().contains(103), eq(true));
    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::CommitAll));
    assert_that!(harness.exec.current_dtxn(), eq(None));
}

#[rstest]
fn read_only_dtxn_abort_commits_all_speculation() {
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

    let txn = local_txn(101, 0, PROC_WRITE_A, bigint_params(4), true, &[0], &client);
    harness.send(InternalMessage::InitializeTxn(Box::new(txn)));
    harness.drive(2);
    assert_that!(harness.exec.spec_blocked_len(), eq(1_usize));

    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::AbortUser,
    });
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::Ok));
    assert_that!(harness.exec.engine().rolled_back_tokens().is_empty(), eq(true));
    assert_that!(harness.exec.engine().table_rows(TABLE_A).len(), eq(1_usize));
}

#[rstest]
fn second_dtxn_blocks_until_the_first_finishes() {
    let mut harness = Harness::new(0);

    let (first, _first_results) = remote_dtxn(100, 1, PROC_WRITE_A);
    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(first)));
    harness.drive(1);
    assert_that!(harness.exec.current_dtxn(), eq(Some(100)));

    // Work for a second dtxn arrives while the first holds the partition.
    let (second, second_results) = remote_dtxn(200, 2, PROC_WRITE_A);
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::remote(second),
        fragment: work_unit(0, FRAG_WRITE_A, false),
        params: vec![ParameterSet::new(bigint_params(9))],
    });
    harness.drive(1);
    assert_that!(harness.exec.blocked_messages_len(), eq(1_usize));
    assert_that!(second_results.try_recv().is_err(), eq(true));

    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::Ok,
    });
    harness.drive(2);

    assert_that!(harness.exec.current_dtxn(), eq(Some(200)));
    assert_that!(harness.exec.blocked_messages_len(), eq(0_usize));
    let result = second_results.try_recv().expect("second dtxn work must run");
    assert_that!(result.status, eq(Status::Ok));
}

#[rstest]
fn prepare_acknowledges_each_partition_exactly_once() {
    let mut harness = Harness::new(0);
    let (mut dtxn, _results) = remote_dtxn(100, 1, PROC_WRITE_A);
    let (ack_tx, ack_rx) = mpsc::channel();
    dtxn.set_prepare_ack_sender(ack_tx);

    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: work_unit(0, FRAG_WRITE_A, false),
        params: vec![ParameterSet::new(bigint_params(1))],
    });
    harness.drive(1);

    harness.send(InternalMessage::Prepare(100));
    harness.send(InternalMessage::Prepare(100));
    harness.drive(2);

    assert_that!(ack_rx.try_recv(), eq(Ok(0)));
    assert_that!(ack_rx.try_recv().is_err(), eq(true));
}

#[rstest]
fn commit_for_a_non_current_dtxn_is_fatal() {
    let mut harness = Harness::new(0);
    harness.send(InternalMessage::Finish {
        txn: 999,
        status: Status::Ok,
    });
    harness.drive(1);

    assert_that!(harness.exec.is_shutdown(), eq(true));
    assert_that!(harness.log.borrow().shutdowns.len(), eq(1_usize));
}

#[rstest]
fn abort_for_a_non_current_dtxn_only_notifies_the_lock_queue() {
    let mut harness = Harness::new(0);
    harness.send(InternalMessage::Finish {
        txn: 999,
        status: Status::AbortUser,
    });
    harness.drive(1);

    assert_that!(harness.exec.is_shutdown(), eq(false));
    assert_that!(harness.exec.current_dtxn(), eq(None));
}
