//! Concurrency-control contract for non-deterministic transactions.
//!
//! Two interchangeable strategies implement the same contract so the commit
//! protocol stays strategy-agnostic: strict two-phase locking with
//! deadlock-avoidance aborts (`S2plEngine`) and timestamp ordering over an
//! in-flight version chain (`TsoEngine`). Deterministic transactions never
//! pass through here; their order is fixed by the schedule graph.

use std::sync::Arc;

use async_trait::async_trait;

use super::s2pl::S2plEngine;
use super::tso::TsoEngine;
use super::types::{ActRole, ActorId, ActorState, TxnError, TxnId};

/// Strategy selector, fixed per actor at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CcStrategy {
    S2pl,
    Tso,
}

/// Admission and lifecycle contract shared by both strategies.
///
/// `read`/`read_write` admit a state access and hand back the value the
/// transaction observes; `stage` stores the mutated working copy;
/// `prepare` computes the participant's vote, releasing read-only holdings;
/// `commit`/`abort` settle writers. Transaction ids double as priorities
/// (lower id wins) and are unique per ring by token construction; both
/// engines assert uniqueness rather than resolving ties silently.
#[async_trait]
pub trait ConcurrencyControl<S: ActorState>: Send + Sync + 'static {
    async fn read(&self, tid: TxnId) -> Result<S, TxnError>;
    async fn read_write(&self, tid: TxnId) -> Result<S, TxnError>;
    fn stage(&self, tid: TxnId, value: S);
    async fn prepare(&self, tid: TxnId) -> bool;
    fn commit(&self, tid: TxnId);
    fn abort(&self, tid: TxnId);
    fn role(&self, tid: TxnId) -> ActRole;
    fn gc_health(&self, actor: ActorId, issues: &mut Vec<String>);
}

/// Committed single-version state shared between the deterministic path and
/// a concurrency-control engine. Deterministic transactions mutate it
/// directly under schedule-graph serialization; engines install staged
/// copies on commit.
#[derive(Debug, Default)]
pub struct StateCell<S> {
    inner: std::sync::Mutex<S>,
}

impl<S: ActorState> StateCell<S> {
    pub fn new(value: S) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
        }
    }

    pub fn snapshot(&self) -> S {
        self.inner.lock().expect("state lock poisoned").clone()
    }

    pub fn install(&self, value: S) {
        *self.inner.lock().expect("state lock poisoned") = value;
    }
}

pub(crate) fn build_engine<S: ActorState>(
    strategy: CcStrategy,
    cell: Arc<StateCell<S>>,
) -> Arc<dyn ConcurrencyControl<S>> {
    match strategy {
        CcStrategy::S2pl => Arc::new(S2plEngine::new(cell)),
        CcStrategy::Tso => Arc::new(TsoEngine::new(cell)),
    }
}
