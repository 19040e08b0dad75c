use googletest::prelude::*;
use rstest::rstest;

use hornet_common::error::Status;
use hornet_engine::value::{ParameterSet, RowSet, Value};

use crate::executor::ExecutionMode;
use crate::messages::InternalMessage;

use super::testkit::{
    FRAG_READ_A, FRAG_WRITE_B, Harness, PROC_READ_A, PROC_USER_ABORT, PROC_WRITE_A, TABLE_A,
    TABLE_B, bigint_params, client_channel, drain_responses, local_txn,
};

#[rstest]
fn single_partition_stream_commits_immediately() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();
    let count = 1000_u64;

    for index in 0..count {
        let txn = local_txn(
            100 + index,
            0,
            PROC_WRITE_A,
            bigint_params(index as i64),
            true,
            &[0],
            &client,
        );
        harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    }
    harness.drive(count as usize);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(count as usize));
    assert_that!(
        responses.iter().all(|response| response.status == Status::Ok),
        eq(true)
    );
    assert_that!(harness.exec.exec_mode(), eq(ExecutionMode::CommitAll));
    assert_that!(harness.exec.spec_blocked_len(), eq(0_usize));
    assert_that!(
        harness.exec.undo_manager().last_committed() >= count as i64,
        eq(true)
    );
    assert_that!(harness.exec.engine().table_rows(TABLE_A).len(), eq(count as usize));
}

#[rstest]
fn read_only_transactions_skip_undo_logging() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();
    let txn = local_txn(100, 0, PROC_READ_A, Vec::new(), true, &[0], &client);

    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::Ok));
    assert_that!(harness.exec.engine().released_tokens().is_empty(), eq(true));
    assert_that!(harness.exec.engine().rolled_back_tokens().is_empty(), eq(true));
}

#[rstest]
fn user_abort_rolls_back_and_responds() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();
    let txn = local_txn(100, 0, PROC_USER_ABORT, bigint_params(7), true, &[0], &client);

    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::AbortUser));
    assert_that!(harness.exec.engine().rolled_back_tokens().len(), eq(1_usize));
    assert_that!(harness.exec.engine().table_rows(TABLE_A).is_empty(), eq(true));
}

#[rstest]
fn unknown_procedure_answers_abort_unexpected() {
    let mut harness = Harness::new(0);
    let (client, responses) = client_channel();
    let txn = local_txn(100, 0, 999, Vec::new(), true, &[0], &client);

    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(1);

    let responses = drain_responses(&responses);
    assert_that!(responses.len(), eq(1_usize));
    assert_that!(responses[0].status, eq(Status::AbortUnexpected));
}

#[rstest]
fn tick_forwards_the_last_committed_txn_to_the_engine() {
    let mut harness = Harness::new(0);
    let (client, _responses) = client_channel();
    let txn = local_txn(100, 0, PROC_WRITE_A, bigint_params(1), true, &[0], &client);
    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(1);

    // The first due tick only arms the clock; the second reaches the engine.
    harness.exec.tick(2_000);
    harness.exec.tick(2_500);
    harness.exec.tick(3_500);

    let ticks = harness.exec.engine().ticks();
    assert_that!(ticks.len(), eq(1_usize));
    assert_that!(ticks[0], eq((3_500, 100)));
}

#[rstest]
fn deferred_queries_run_at_idle_without_undo_logging() {
    let mut harness = Harness::new(0);
    harness.send(InternalMessage::DeferredQuery {
        txn: 42,
        fragment: FRAG_WRITE_B,
        params: ParameterSet::new(bigint_params(5)),
    });
    harness.drive(1);

    assert_that!(harness.exec.engine().table_rows(TABLE_B).len(), eq(1_usize));
    assert_that!(harness.exec.engine().outstanding_tokens().is_empty(), eq(true));
}

#[rstest]
fn table_stats_requests_reply_on_their_channel() {
    let mut harness = Harness::new(0);
    let (reply, stats) = std::sync::mpsc::channel::<RowSet>();
    harness.send(InternalMessage::TableStatsRequest {
        table_ids: vec![TABLE_A, TABLE_B],
        reply,
    });
    harness.drive(1);

    let stats = stats.try_recv().expect("stats reply must arrive");
    assert_that!(stats.row_count(), eq(2_usize));
    assert_that!(stats.rows[0][0], eq(&Value::BigInt(i64::from(TABLE_A))));
}

#[rstest]
fn last_executed_txn_tracks_dispatched_work() {
    let mut harness = Harness::new(0);
    let (client, _responses) = client_channel();
    let txn = local_txn(100, 0, FRAG_READ_A, Vec::new(), true, &[0], &client);
    // Procedure id is bogus on purpose; the message still counts as executed.
    harness.send(InternalMessage::InitializeRequest(Box::new(txn)));
    harness.drive(1);

    assert_that!(harness.exec.last_executed_txn(), eq(Some(100)));
}
