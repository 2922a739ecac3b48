//! Workload generator for exercising a tessera grid.
//!
//! This binary builds an in-process grid of bank-account actors, issues a
//! mix of deterministic and non-deterministic transfers from concurrent
//! clients, and reports throughput, abort classes, and a conservation
//! audit of the final balances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tessera_grid::{Grid, GridConfig};
use tessera_txn::txn::{
    ActorId, CcStrategy, TransactionalActor, TxnError, Value,
};
use tokio::time;

/// CLI options for running the workload.
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera-workload")]
struct Args {
    /// Number of account actors.
    #[arg(long, default_value_t = 8)]
    accounts: u64,

    /// Number of concurrent client tasks.
    #[arg(long, default_value_t = 4)]
    clients: usize,

    /// Percent of transactions submitted deterministically with a declared
    /// access set.
    #[arg(long, default_value_t = 50)]
    pact_pct: u8,

    /// Concurrency-control strategy for non-deterministic transactions
    /// (`s2pl` or `tso`).
    #[arg(long, default_value = "s2pl")]
    strategy: String,

    /// Local coordinators in the ring.
    #[arg(long, default_value_t = 2)]
    coords: usize,

    /// Token hold interval per coordinator.
    #[arg(long, default_value = "2ms")]
    token_interval: humantime::Duration,

    /// Total runtime for the workload.
    #[arg(long, default_value = "10s")]
    duration: humantime::Duration,

    /// Random seed shared by all clients.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Starting balance per account.
    #[arg(long, default_value_t = 1_000)]
    balance: i64,
}

/// Account state driven by the workload handlers.
#[derive(Clone, Debug, Default)]
struct Account {
    balance: i64,
}

#[derive(Default)]
struct Stats {
    committed: AtomicU64,
    deadlock_aborts: AtomicU64,
    serializability_aborts: AtomicU64,
    failures: AtomicU64,
}

/// Summary serialized at the end of the run.
#[derive(serde::Serialize, Debug)]
struct Summary {
    committed: u64,
    deadlock_aborts: u64,
    serializability_aborts: u64,
    failures: u64,
    throughput_per_sec: f64,
    balance_total: i64,
    balance_expected: i64,
    conserved: bool,
}

fn build_account(
    grid: &Grid,
    id: ActorId,
    strategy: CcStrategy,
    balance: i64,
) -> anyhow::Result<Arc<TransactionalActor<Account>>> {
    let actor = TransactionalActor::<Account>::builder(grid.actor_config(0, id))
        .strategy(strategy)
        .initial_state(Account { balance })
        .handler("credit", |h, input| async move {
            let amount = input["amount"].as_i64().unwrap_or(0);
            let mut account = h.read_write().await?;
            account.balance += amount;
            h.write(account);
            Ok(Value::Null)
        })
        .handler("transfer", |h, input| async move {
            let to = input["to"]
                .as_u64()
                .ok_or_else(|| TxnError::Application("missing target".to_string()))?;
            let amount = input["amount"].as_i64().unwrap_or(0);
            let mut account = h.read_write().await?;
            account.balance -= amount;
            h.write(account);
            h.call(to, "credit", json!({ "amount": amount })).await?;
            Ok(Value::Null)
        })
        .build(grid.log())?;
    grid.register(actor.clone())?;
    Ok(actor)
}

async fn run_client(
    client: usize,
    args: Args,
    actors: Arc<Vec<Arc<TransactionalActor<Account>>>>,
    stats: Arc<Stats>,
    deadline: Instant,
) {
    let mut rng = SmallRng::seed_from_u64(args.seed.wrapping_add(client as u64));
    while Instant::now() < deadline {
        let from = rng.gen_range(0..args.accounts);
        let mut to = rng.gen_range(0..args.accounts);
        if to == from {
            to = (to + 1) % args.accounts;
        }
        let amount = rng.gen_range(1..=10);
        let deterministic = rng.gen_range(0..100) < args.pact_pct;
        let origin = actors[from as usize].clone();
        let input = json!({ "to": to, "amount": amount });
        let access_set = deterministic.then(|| vec![from, to]);

        let result = origin.start_transaction("transfer", input, access_set).await;
        match result.outcome {
            Ok(_) => {
                stats.committed.fetch_add(1, Ordering::Relaxed);
            }
            Err(TxnError::DeadlockAvoidance(_)) => {
                stats.deadlock_aborts.fetch_add(1, Ordering::Relaxed);
            }
            Err(TxnError::NotSerializable(_)) | Err(TxnError::NotSureSerializable(_)) => {
                stats.serializability_aborts.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::warn!(client, error = %err, "transfer failed");
                stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    anyhow::ensure!(args.accounts >= 2, "need at least two accounts");
    anyhow::ensure!(args.pact_pct <= 100, "pact percentage over 100");
    let strategy = match args.strategy.as_str() {
        "s2pl" => CcStrategy::S2pl,
        "tso" => CcStrategy::Tso,
        other => anyhow::bail!("unknown strategy {other}, expected s2pl or tso"),
    };

    let grid = Grid::new(GridConfig {
        silos: 1,
        coords_per_silo: args.coords,
        global_coords: 0,
        token_interval: args.token_interval.into(),
        deadlock_window: Duration::from_secs(2),
    });
    let mut actors = Vec::new();
    for id in 0..args.accounts {
        actors.push(build_account(&grid, id, strategy, args.balance)?);
    }
    let actors = Arc::new(actors);
    grid.start().await;
    tracing::info!(
        accounts = args.accounts,
        clients = args.clients,
        pact_pct = args.pact_pct,
        strategy = args.strategy,
        "workload starting"
    );

    let stats = Arc::new(Stats::default());
    let started = Instant::now();
    let deadline = started + Into::<Duration>::into(args.duration);
    let mut clients = Vec::new();
    for client in 0..args.clients {
        clients.push(tokio::spawn(run_client(
            client,
            args.clone(),
            actors.clone(),
            stats.clone(),
            deadline,
        )));
    }
    for client in clients {
        client.await?;
    }
    let elapsed = started.elapsed();

    // Let in-flight commit notices drain before auditing balances.
    time::sleep(Duration::from_millis(200)).await;
    let balance_total: i64 = actors
        .iter()
        .map(|actor| actor.committed_state().balance)
        .sum();
    let balance_expected = args.balance * args.accounts as i64;

    let committed = stats.committed.load(Ordering::Relaxed);
    let summary = Summary {
        committed,
        deadlock_aborts: stats.deadlock_aborts.load(Ordering::Relaxed),
        serializability_aborts: stats.serializability_aborts.load(Ordering::Relaxed),
        failures: stats.failures.load(Ordering::Relaxed),
        throughput_per_sec: committed as f64 / elapsed.as_secs_f64(),
        balance_total,
        balance_expected,
        conserved: balance_total == balance_expected,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    grid.shutdown();
    anyhow::ensure!(summary.conserved, "balance conservation violated");
    Ok(())
}
