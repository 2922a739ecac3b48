//! Bookkeeping is bounded to in-flight work.
//!
//! Test flow:
//! 1) Run a mixed deterministic and non-deterministic load to completion.
//! 2) Let commit notices and token rounds drain.
//! 3) Sweep every coordinator and actor: schedule graphs hold only their
//!    sentinel, no batch records, no admissions, no queued registrations.

mod common;

use serde_json::json;
use tessera_grid::{Grid, GridConfig};
use tessera_txn::txn::{ActorId, CcStrategy};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bookkeeping_drains_after_load() {
    let grid = Grid::new(GridConfig::default());
    let accounts: Vec<_> = (0..4)
        .map(|id| common::account(&grid, 0, id, CcStrategy::S2pl, 1_000))
        .collect();
    grid.start().await;

    let mut submissions = Vec::new();
    for round in 0..16usize {
        let from = (round % 4) as ActorId;
        let to = ((round + 1) % 4) as ActorId;
        let origin = accounts[from as usize].clone();
        let deterministic = round % 2 == 0;
        submissions.push(tokio::spawn(async move {
            let input = json!({ "to": to, "amount": 1 });
            if deterministic {
                origin
                    .start_transaction("transfer", input, Some(vec![from, to]))
                    .await
            } else {
                common::run_act_with_retry(&origin, "transfer", input, 100).await
            }
        }));
    }
    for submission in submissions {
        common::within("load", submission).await.expect("task");
    }

    common::settle().await;
    let issues = grid.check_gc_health().await;
    assert!(issues.is_empty(), "leftover bookkeeping: {issues:#?}");
    grid.shutdown();
}
