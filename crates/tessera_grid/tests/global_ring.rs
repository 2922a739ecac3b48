//! Two-tier deployment: cross-silo deterministic transactions.
//!
//! Test flow:
//! 1) Two silos with their own coordinator rings plus a global ring.
//! 2) Cross-silo transfers register globally, then with one local
//!    coordinator per silo; local rings absorb the global batches in
//!    declared order.
//! 3) Balances reflect every transfer exactly once, and per-actor batch
//!    order holds with local and cross-silo batches interleaved.
//!
//! Also covered: non-deterministic access sets are silo-local, a call out
//! of the silo surfaces as a remote-call failure.

mod common;

use serde_json::json;
use tessera_grid::{Grid, GridConfig};
use tessera_txn::txn::{CcStrategy, TxnError};

fn two_silo_grid() -> std::sync::Arc<Grid> {
    Grid::new(GridConfig {
        silos: 2,
        coords_per_silo: 2,
        global_coords: 2,
        ..GridConfig::default()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_silo_transfers_apply_exactly_once() {
    let grid = two_silo_grid();
    let left = common::account(&grid, 0, 1, CcStrategy::S2pl, 1_000);
    let right = common::account(&grid, 1, 2, CcStrategy::S2pl, 1_000);
    grid.start().await;

    for _ in 0..5 {
        let result = common::within(
            "cross-silo transfer",
            left.start_transaction(
                "transfer",
                json!({ "to": 2u64, "amount": 100 }),
                Some(vec![1, 2]),
            ),
        )
        .await;
        assert!(result.outcome.is_ok(), "transfer failed: {:?}", result.outcome);
    }

    common::settle().await;
    assert_eq!(left.committed_state().balance, 500);
    assert_eq!(right.committed_state().balance, 1_500);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn local_and_global_batches_interleave_in_order() {
    let grid = two_silo_grid();
    let left = common::account(&grid, 0, 1, CcStrategy::S2pl, 0);
    let right = common::account(&grid, 1, 2, CcStrategy::S2pl, 0);
    grid.start().await;

    let mut submissions = Vec::new();
    for round in 0..12usize {
        let (origin, set) = match round % 3 {
            // Purely local work in each silo, then a cross-silo batch.
            0 => (left.clone(), vec![1]),
            1 => (right.clone(), vec![2]),
            _ => (left.clone(), vec![1, 2]),
        };
        submissions.push(tokio::spawn(async move {
            origin
                .start_transaction("mark_all", json!({ "actors": set.clone() }), Some(set))
                .await
        }));
    }
    for submission in submissions {
        let result = common::within("mixed emission", submission)
            .await
            .expect("task");
        assert!(result.outcome.is_ok(), "pact failed: {:?}", result.outcome);
    }

    common::settle().await;
    for actor in [&left, &right] {
        let marks = actor.committed_state().marks;
        assert!(!marks.is_empty());
        for pair in marks.windows(2) {
            assert!(
                pair[0].0 <= pair[1].0,
                "batch order violated on actor: {marks:?}"
            );
        }
    }
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn act_access_sets_are_silo_local() {
    let grid = two_silo_grid();
    let left = common::account(&grid, 0, 1, CcStrategy::S2pl, 1_000);
    let _right = common::account(&grid, 1, 2, CcStrategy::S2pl, 1_000);
    grid.start().await;

    let result = common::within(
        "cross-silo act",
        left.start_transaction("transfer", json!({ "to": 2u64, "amount": 10 }), None),
    )
    .await;
    assert!(
        matches!(result.outcome, Err(TxnError::RemoteCallFailure(_))),
        "cross-silo act must fail: {:?}",
        result.outcome
    );

    common::settle().await;
    // The failed call left no partial effects behind.
    assert_eq!(left.committed_state().balance, 1_000);
    grid.shutdown();
}
