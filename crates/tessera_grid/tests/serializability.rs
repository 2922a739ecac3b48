//! Mixed deterministic and non-deterministic load.
//!
//! Test flow:
//! 1) Three accounts take interleaved deterministic and non-deterministic
//!    transfers from concurrent submitters.
//! 2) Deterministic transactions never abort from conflicts; the
//!    non-deterministic ones retry through optimistic aborts.
//! 3) Money is conserved exactly: every transfer applied once or not at
//!    all, under both concurrency-control strategies.

mod common;

use serde_json::json;
use tessera_grid::{Grid, GridConfig};
use tessera_txn::txn::{ActorId, CcStrategy};

async fn mixed_load_conserves_total(strategy: CcStrategy) {
    let grid = Grid::new(GridConfig::default());
    let accounts: Vec<_> = (0..3)
        .map(|id| common::account(&grid, 0, id, strategy, 1_000))
        .collect();
    grid.start().await;

    let mut submissions = Vec::new();
    for round in 0..24usize {
        let from = (round % 3) as ActorId;
        let to = ((round + 1) % 3) as ActorId;
        let origin = accounts[from as usize].clone();
        let deterministic = round % 2 == 0;
        submissions.push(tokio::spawn(async move {
            let input = json!({ "to": to, "amount": 5 });
            if deterministic {
                let result = origin
                    .start_transaction("transfer", input, Some(vec![from, to]))
                    .await;
                assert!(
                    result.outcome.is_ok(),
                    "deterministic transfer aborted: {:?}",
                    result.outcome
                );
            } else {
                common::run_act_with_retry(&origin, "transfer", input, 100).await;
            }
        }));
    }
    for submission in submissions {
        common::within("mixed load", submission).await.expect("task");
    }

    common::settle().await;
    let total: i64 = accounts
        .iter()
        .map(|account| account.committed_state().balance)
        .sum();
    assert_eq!(total, 3_000, "transfers must be applied exactly once");
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_load_conserves_total_s2pl() {
    mixed_load_conserves_total(CcStrategy::S2pl).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_load_conserves_total_tso() {
    mixed_load_conserves_total(CcStrategy::Tso).await;
}
