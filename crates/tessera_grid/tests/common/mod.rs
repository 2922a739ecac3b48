//! Shared helpers for grid scenario tests: a bank-account actor with
//! deterministic and non-deterministic handlers, retry for optimistic
//! aborts, and timeout guards.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tessera_grid::Grid;
use tessera_txn::txn::{
    ActorId, BatchId, CcStrategy, SiloId, TransactionalActor, TxnError, TxnId, TxnResult, Value,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bank account state.
#[derive(Clone, Debug, Default)]
pub struct Account {
    pub balance: i64,
    /// (batch id, txn id) markers appended by deterministic transactions.
    pub marks: Vec<(BatchId, TxnId)>,
}

fn amount_of(input: &Value) -> Result<i64, TxnError> {
    input
        .get("amount")
        .and_then(Value::as_i64)
        .ok_or_else(|| TxnError::Application("missing amount".to_string()))
}

fn target_of(input: &Value) -> Result<ActorId, TxnError> {
    input
        .get("to")
        .and_then(Value::as_u64)
        .ok_or_else(|| TxnError::Application("missing transfer target".to_string()))
}

/// Build and register one account actor with the standard handler set.
pub fn account(
    grid: &Grid,
    silo: SiloId,
    id: ActorId,
    strategy: CcStrategy,
    initial: i64,
) -> Arc<TransactionalActor<Account>> {
    let actor = TransactionalActor::<Account>::builder(grid.actor_config(silo, id))
        .strategy(strategy)
        .initial_state(Account {
            balance: initial,
            marks: Vec::new(),
        })
        .handler("credit", |h, input| async move {
            let amount = amount_of(&input)?;
            let mut account = h.read_write().await?;
            account.balance += amount;
            h.write(account);
            Ok(Value::Null)
        })
        .handler("transfer", |h, input| async move {
            let to = target_of(&input)?;
            let amount = amount_of(&input)?;
            let mut account = h.read_write().await?;
            account.balance -= amount;
            h.write(account);
            h.call(to, "credit", json!({ "amount": amount })).await?;
            Ok(Value::Null)
        })
        .handler("mark", |h, _input| async move {
            let mut account = h.read_write().await?;
            account.marks.push((h.bid(), h.tid()));
            h.write(account);
            Ok(Value::Null)
        })
        .handler("mark_all", |h, input| async move {
            let actors = input
                .get("actors")
                .and_then(Value::as_array)
                .ok_or_else(|| TxnError::Application("missing actor list".to_string()))?
                .clone();
            for actor in actors {
                let actor = actor
                    .as_u64()
                    .ok_or_else(|| TxnError::Application("bad actor id".to_string()))?;
                h.call(actor, "mark", Value::Null).await?;
            }
            Ok(Value::Null)
        })
        .handler("balance", |h, _input| async move {
            let account = h.read().await?;
            Ok(json!(account.balance))
        })
        .build(grid.log())
        .expect("account actor builds");
    grid.register(actor.clone()).expect("account registers");
    actor
}

/// Retry a non-deterministic transaction through optimistic aborts until it
/// commits. Panics when it keeps aborting, which would point at a liveness
/// bug rather than contention.
#[allow(dead_code)]
pub async fn run_act_with_retry(
    actor: &Arc<TransactionalActor<Account>>,
    func: &str,
    input: Value,
    attempts: usize,
) -> TxnResult {
    for _ in 0..attempts {
        let result = actor.start_transaction(func, input.clone(), None).await;
        match &result.outcome {
            Err(TxnError::DeadlockAvoidance(_))
            | Err(TxnError::NotSerializable(_))
            | Err(TxnError::NotSureSerializable(_)) => {
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
            _ => return result,
        }
    }
    panic!("transaction kept aborting after {attempts} attempts");
}

/// Guard any protocol-driven wait with the test timeout.
pub async fn within<T>(step: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(TEST_TIMEOUT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out during {step}"),
    }
}

/// Let in-flight commit notices and token rounds drain.
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
