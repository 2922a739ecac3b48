//! Timestamp ordering over an in-flight version chain.
//!
//! Writers append id-ordered version copies above a committed baseline, each
//! recording the version it chained off (its dependency) and the highest id
//! that read it. A write is refused when a higher id already read or
//! overwrote the prior version; a read is refused when it would observe a
//! different dependency than it already observed. Prepare blocks until the
//! dependency resolves, cascading aborts onto dirty readers and dependent
//! writers. Settled entries are trimmed from the head of the chain into the
//! baseline.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use super::cc::{ConcurrencyControl, StateCell};
use super::types::{ActRole, ActorId, ActorState, TxnError, TxnId, NO_TXN};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VersionStatus {
    Executing,
    Committed,
    Aborted,
}

struct VersionEntry<S> {
    /// Version this writer chained off, `NO_TXN` for the baseline.
    dep: TxnId,
    /// Highest id that read this version.
    read_ts: TxnId,
    status: VersionStatus,
    /// Set once the writer stored its working copy. Dependents may not
    /// observe the version before then, or they would base their own work
    /// on a value the writer is still about to replace.
    staged: bool,
    value: S,
}

struct VersionChain<S> {
    entries: BTreeMap<TxnId, VersionEntry<S>>,
    /// Highest id that read the baseline.
    baseline_read_ts: TxnId,
    /// Dependency each pure reader observed, for repeatable reads.
    reader_deps: HashMap<TxnId, TxnId>,
    /// Readers whose observed dependency aborted.
    poisoned: HashSet<TxnId>,
}

impl<S> VersionChain<S> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            baseline_read_ts: NO_TXN,
            reader_deps: HashMap::new(),
            poisoned: HashSet::new(),
        }
    }

    /// Latest non-aborted version strictly below `tid`.
    fn predecessor(&self, tid: TxnId) -> Option<TxnId> {
        self.entries
            .range(..tid)
            .rev()
            .find(|(_, entry)| entry.status != VersionStatus::Aborted)
            .map(|(&id, _)| id)
    }

    /// Whether `dep` is observable: settled, staged, or the baseline.
    fn observable(&self, dep: TxnId) -> bool {
        if dep == NO_TXN {
            return true;
        }
        match self.entries.get(&dep) {
            None => true,
            Some(entry) => entry.status != VersionStatus::Executing || entry.staged,
        }
    }
}

pub struct TsoEngine<S: ActorState> {
    cell: Arc<StateCell<S>>,
    chain: std::sync::Mutex<VersionChain<S>>,
    /// Bumped on every commit or abort so blocked prepares re-check.
    epoch: watch::Sender<u64>,
}

impl<S: ActorState> TsoEngine<S> {
    pub fn new(cell: Arc<StateCell<S>>) -> Self {
        let (epoch, _rx) = watch::channel(0);
        Self {
            cell,
            chain: std::sync::Mutex::new(VersionChain::new()),
            epoch,
        }
    }

    fn lock_chain(&self) -> std::sync::MutexGuard<'_, VersionChain<S>> {
        self.chain.lock().expect("version chain poisoned")
    }

    fn bump_epoch(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Install the committed contiguous head of the chain into the baseline
    /// and drop settled entries.
    fn trim(&self, chain: &mut VersionChain<S>) {
        while let Some((&id, entry)) = chain.entries.first_key_value() {
            match entry.status {
                VersionStatus::Executing => return,
                VersionStatus::Committed => {
                    let entry = chain.entries.remove(&id).expect("chain head exists");
                    self.cell.install(entry.value);
                    chain.baseline_read_ts = chain.baseline_read_ts.max(entry.read_ts);
                }
                VersionStatus::Aborted => {
                    chain.entries.remove(&id);
                }
            }
        }
    }

    /// Mark `tid` aborted and cascade onto everything that observed it.
    fn cascade_abort(&self, chain: &mut VersionChain<S>, tid: TxnId) {
        let mut worklist = vec![tid];
        while let Some(current) = worklist.pop() {
            let Some(entry) = chain.entries.get_mut(&current) else {
                continue;
            };
            if entry.status != VersionStatus::Executing {
                continue;
            }
            entry.status = VersionStatus::Aborted;
            // Keep the refusal visible even after the entry is trimmed.
            chain.poisoned.insert(current);
            let dependents: Vec<TxnId> = chain
                .entries
                .iter()
                .filter(|(_, e)| e.dep == current && e.status == VersionStatus::Executing)
                .map(|(&id, _)| id)
                .collect();
            worklist.extend(dependents);
            let dirty_readers: Vec<TxnId> = chain
                .reader_deps
                .iter()
                .filter(|(_, &dep)| dep == current)
                .map(|(&reader, _)| reader)
                .collect();
            chain.poisoned.extend(dirty_readers);
        }
    }

    /// Resolve `tid`'s dependency: `Some(vote)` once settled, `None` while
    /// the dependency is still executing.
    fn dependency_vote(&self, chain: &VersionChain<S>, dep: TxnId) -> Option<bool> {
        if dep == NO_TXN {
            return Some(true);
        }
        match chain.entries.get(&dep) {
            // Trimmed entries were committed; aborted dependencies reach us
            // through the cascade, never through a dangling lookup.
            None => Some(true),
            Some(entry) => match entry.status {
                VersionStatus::Committed => Some(true),
                VersionStatus::Aborted => Some(false),
                VersionStatus::Executing => None,
            },
        }
    }
}

#[async_trait]
impl<S: ActorState> ConcurrencyControl<S> for TsoEngine<S> {
    async fn read(&self, tid: TxnId) -> Result<S, TxnError> {
        loop {
            let mut rx = self.epoch.subscribe();
            {
                let mut chain = self.lock_chain();
                if chain.poisoned.contains(&tid) {
                    return Err(TxnError::DeadlockAvoidance(tid));
                }
                if let Some(entry) = chain.entries.get(&tid) {
                    return match entry.status {
                        VersionStatus::Aborted => Err(TxnError::DeadlockAvoidance(tid)),
                        _ => Ok(entry.value.clone()),
                    };
                }

                let dep = chain.predecessor(tid).unwrap_or(NO_TXN);
                if let Some(&seen) = chain.reader_deps.get(&tid) {
                    if seen != dep {
                        // The version it read before was superseded:
                        // repeatable reads no longer hold.
                        return Err(TxnError::DeadlockAvoidance(tid));
                    }
                }
                if chain.observable(dep) {
                    let value = if dep == NO_TXN {
                        chain.baseline_read_ts = chain.baseline_read_ts.max(tid);
                        self.cell.snapshot()
                    } else {
                        let entry =
                            chain.entries.get_mut(&dep).expect("predecessor exists");
                        entry.read_ts = entry.read_ts.max(tid);
                        entry.value.clone()
                    };
                    chain.reader_deps.insert(tid, dep);
                    return Ok(value);
                }
            }
            // The predecessor has not stored its working copy yet.
            let _ = rx.changed().await;
        }
    }

    async fn read_write(&self, tid: TxnId) -> Result<S, TxnError> {
        loop {
            let mut rx = self.epoch.subscribe();
            {
                let mut chain = self.lock_chain();
                if chain.poisoned.contains(&tid) {
                    return Err(TxnError::DeadlockAvoidance(tid));
                }
                if let Some(entry) = chain.entries.get(&tid) {
                    return match entry.status {
                        VersionStatus::Aborted => Err(TxnError::DeadlockAvoidance(tid)),
                        _ => Ok(entry.value.clone()),
                    };
                }

                let dep = chain.predecessor(tid).unwrap_or(NO_TXN);
                let prior_read_ts = if dep == NO_TXN {
                    chain.baseline_read_ts
                } else {
                    chain.entries.get(&dep).expect("predecessor exists").read_ts
                };
                if prior_read_ts > tid {
                    // A higher id already read the version this write would
                    // replace.
                    return Err(TxnError::DeadlockAvoidance(tid));
                }
                let overwritten = chain
                    .entries
                    .range((Bound::Excluded(tid), Bound::Unbounded))
                    .any(|(_, entry)| {
                        entry.status != VersionStatus::Aborted && entry.dep == dep
                    });
                if overwritten {
                    // A higher id already chained a write off the prior
                    // version.
                    return Err(TxnError::DeadlockAvoidance(tid));
                }
                if let Some(&seen) = chain.reader_deps.get(&tid) {
                    if seen != dep {
                        return Err(TxnError::DeadlockAvoidance(tid));
                    }
                }

                if chain.observable(dep) {
                    let value = if dep == NO_TXN {
                        self.cell.snapshot()
                    } else {
                        chain
                            .entries
                            .get(&dep)
                            .expect("predecessor exists")
                            .value
                            .clone()
                    };
                    chain.entries.insert(
                        tid,
                        VersionEntry {
                            dep,
                            read_ts: tid,
                            status: VersionStatus::Executing,
                            staged: false,
                            value: value.clone(),
                        },
                    );
                    return Ok(value);
                }
            }
            let _ = rx.changed().await;
        }
    }

    fn stage(&self, tid: TxnId, value: S) {
        {
            let mut chain = self.lock_chain();
            if let Some(entry) = chain.entries.get_mut(&tid) {
                if entry.status == VersionStatus::Executing {
                    entry.value = value;
                    entry.staged = true;
                }
            }
        }
        // Wake dependents blocked on this version becoming observable.
        self.bump_epoch();
    }

    async fn prepare(&self, tid: TxnId) -> bool {
        loop {
            let mut rx = self.epoch.subscribe();
            {
                let mut chain = self.lock_chain();
                if chain.poisoned.contains(&tid) {
                    chain.reader_deps.remove(&tid);
                    chain.poisoned.remove(&tid);
                    return false;
                }
                let dep = match chain.entries.get(&tid) {
                    Some(entry) => match entry.status {
                        VersionStatus::Aborted => return false,
                        _ => entry.dep,
                    },
                    None => chain.reader_deps.get(&tid).copied().unwrap_or(NO_TXN),
                };
                match self.dependency_vote(&chain, dep) {
                    Some(vote) => {
                        if chain.entries.get(&tid).is_none() {
                            // Pure reader: release immediately.
                            chain.reader_deps.remove(&tid);
                        }
                        return vote;
                    }
                    None => {}
                }
            }
            // The dependency is still executing; wait for a settlement.
            let _ = rx.changed().await;
        }
    }

    fn commit(&self, tid: TxnId) {
        let mut chain = self.lock_chain();
        if let Some(entry) = chain.entries.get(&tid) {
            assert_eq!(
                entry.status,
                VersionStatus::Executing,
                "txn {tid} settled twice"
            );
            let dep = entry.dep;
            assert_eq!(
                self.dependency_vote(&chain, dep),
                Some(true),
                "txn {tid} committed with unresolved dependency"
            );
            chain.entries.get_mut(&tid).expect("entry exists").status =
                VersionStatus::Committed;
        }
        chain.reader_deps.remove(&tid);
        chain.poisoned.remove(&tid);
        self.trim(&mut chain);
        drop(chain);
        self.bump_epoch();
    }

    fn abort(&self, tid: TxnId) {
        let mut chain = self.lock_chain();
        self.cascade_abort(&mut chain, tid);
        chain.reader_deps.remove(&tid);
        chain.poisoned.remove(&tid);
        self.trim(&mut chain);
        drop(chain);
        self.bump_epoch();
    }

    fn role(&self, tid: TxnId) -> ActRole {
        let chain = self.lock_chain();
        if chain.entries.contains_key(&tid) {
            ActRole::Writer
        } else if chain.reader_deps.contains_key(&tid) || chain.poisoned.contains(&tid) {
            ActRole::Reader
        } else {
            ActRole::NoOp
        }
    }

    fn gc_health(&self, actor: ActorId, issues: &mut Vec<String>) {
        let chain = self.lock_chain();
        if !chain.entries.is_empty() {
            issues.push(format!(
                "actor {actor}: {} tso versions still in flight",
                chain.entries.len()
            ));
        }
        if !chain.reader_deps.is_empty() || !chain.poisoned.is_empty() {
            issues.push(format!("actor {actor}: tso reader bookkeeping not drained"));
        }
    }
}
