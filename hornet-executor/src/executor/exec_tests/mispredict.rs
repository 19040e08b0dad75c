use googletest::prelude::*;
use rstest::rstest;

use hornet_common::error::{AbortReason, Status};
use hornet_engine::value::{ParameterSet, RowSet};

use crate::messages::{InternalMessage, TxnRef};

use super::testkit::{
    FRAG_READ_A, FRAG_WRITE_A, Harness, PROC_REMOTE_READ_A, PROC_REMOTE_WRITE_A, bigint_params,
    client_channel, drain_responses, local_txn, remote_dtxn, work_unit,
};

#[rstest]
fn single_partition_misprediction_restarts_as_multi_partition() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();

    // Predicted single-partition, but the procedure reaches for partition 1.
    let txn = local_txn(
        100,
        0,
        PROC_REMOTE_WRITE_A,
        bigint_params(7),
        true,
        &[0],
        &client,
    );
    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(1);

    // First attempt aborts without committing anything and goes back in line
    // with a widened prediction.
    let aborted = drain_responses(&responses);
    assert_that!(aborted.len(), eq(1_usize));
    assert_that!(aborted[0].status, eq(Status::AbortMispredict));
    assert_that!(harness.exec.engine().released_tokens().is_empty(), eq(true));
    assert_that!(harness.exec.lock_queue().contains(100), eq(true));

    let restarted = harness.exec.arena().local(100).expect("transaction must stay registered");
    assert_that!(restarted.predict_single_partition(), eq(false));
    assert_that!(restarted.predict_touched().contains(0), eq(true));
    assert_that!(restarted.predict_touched().contains(1), eq(true));
    assert_that!(restarted.restarts(), eq(1));

    // The second attempt runs as a distributed transaction: remote work goes
    // out, 2PC drives it home.
    harness.drive(2);
    assert_that!(harness.log.borrow().works.len(), eq(1_usize));
    assert_that!(harness.log.borrow().prepares.len(), eq(1_usize));

    harness.drive(1);
    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::Ok,
    });
    harness.drive(1);

    let committed = drain_responses(&responses);
    assert_that!(committed.len(), eq(1_usize));
    assert_that!(committed[0].status, eq(Status::Ok));
}

#[rstest]
fn remote_work_failure_aborts_the_distributed_transaction() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();
    *harness.fail_work.borrow_mut() =
        Some(AbortReason::Unexpected("remote partition exploded".to_owned()));

    let txn = local_txn(
        100,
        0,
        PROC_REMOTE_WRITE_A,
        bigint_params(7),
        false,
        &[0, 1],
        &client,
    );
    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(2);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::AbortUnexpected));
    let finishes = harness.log.borrow().finishes.clone();
    assert_that!(finishes, eq(&vec![(100, Status::AbortUnexpected, false)]));
}

#[rstest]
fn prefetched_results_skip_the_remote_send() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();
    let params = ParameterSet::new(bigint_params(7));

    // The prefetch machinery already pulled this query's result over.
    harness.exec.add_prefetch_result(
        100,
        FRAG_READ_A,
        1,
        params.param_hash(),
        RowSet::single_bigint(42),
    );

    let txn = local_txn(
        100,
        0,
        PROC_REMOTE_READ_A,
        bigint_params(7),
        false,
        &[0, 1],
        &client,
    );
    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(2);

    // The answer came from the cache: nothing was shipped anywhere.
    assert_that!(harness.log.borrow().works.is_empty(), eq(true));
    harness.drive(1);
    harness.send(InternalMessage::Finish {
        txn: 100,
        status: Status::Ok,
    });
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::Ok));
    assert_that!(responses[0].results[0], eq(&RowSet::single_bigint(42)));
}

#[rstest]
fn the_last_fragment_triggers_an_early_prepare() {
    let mut harness = Harness::new(0);
    let (dtxn, results) = remote_dtxn(100, 1, PROC_REMOTE_WRITE_A);

    harness.send(InternalMessage::SetDistributedTxn(TxnRef::remote(dtxn)));
    harness.drive(1);

    let mut unit = work_unit(0, FRAG_WRITE_A, false);
    unit.last_fragment = true;
    harness.send(InternalMessage::WorkFragment {
        txn: TxnRef::known(100),
        fragment: unit,
        params: vec![ParameterSet::new(bigint_params(5))],
    });
    harness.drive(2);

    assert_that!(results.try_recv().is_ok(), eq(true));
    let slot = harness.exec.arena().get(100).expect("dtxn must stay registered");
    assert_that!(slot.is_prepared(0), eq(true));
}
