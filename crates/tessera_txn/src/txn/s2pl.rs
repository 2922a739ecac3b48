//! Strict two-phase locking with deadlock-avoidance aborts.
//!
//! Transaction id doubles as priority, lower id first. A transaction only
//! ever waits on strictly-lower ids, so no wait cycles can form: a request
//! that would wait on a higher-id holder is aborted on the spot, trading
//! spurious aborts for guaranteed liveness. Lock upgrades are disallowed and
//! abort. Readers release at prepare, writers at commit or abort.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::cc::{ConcurrencyControl, StateCell};
use super::types::{ActRole, ActorId, ActorState, TxnError, TxnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockMode {
    Read,
    Write,
}

struct QueuedRequest<S> {
    mode: LockMode,
    reply: oneshot::Sender<Result<S, TxnError>>,
}

struct LockTable<S> {
    readers: HashSet<TxnId>,
    writer: Option<TxnId>,
    /// Waiting requests served lowest id first.
    queue: BTreeMap<TxnId, QueuedRequest<S>>,
    /// Working copies held by admitted writers.
    staged: HashMap<TxnId, S>,
    /// Role each admitted transaction played, kept until settlement.
    roles: HashMap<TxnId, ActRole>,
}

impl<S> LockTable<S> {
    fn new() -> Self {
        Self {
            readers: HashSet::new(),
            writer: None,
            queue: BTreeMap::new(),
            staged: HashMap::new(),
            roles: HashMap::new(),
        }
    }

    /// Highest id among transactions currently holding admission.
    fn max_holder(&self) -> Option<TxnId> {
        self.readers.iter().copied().chain(self.writer).max()
    }
}

pub struct S2plEngine<S: ActorState> {
    cell: Arc<StateCell<S>>,
    table: std::sync::Mutex<LockTable<S>>,
}

impl<S: ActorState> S2plEngine<S> {
    pub fn new(cell: Arc<StateCell<S>>) -> Self {
        Self {
            cell,
            table: std::sync::Mutex::new(LockTable::new()),
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, LockTable<S>> {
        self.table.lock().expect("lock table poisoned")
    }

    /// Serve the wait queue after a release. Grants run lowest id first:
    /// a contiguous run of readers, or one writer once the table is clear.
    fn wake(&self, table: &mut LockTable<S>) {
        loop {
            let Some((&tid, queued)) = table.queue.first_key_value() else {
                return;
            };
            match queued.mode {
                LockMode::Write => {
                    if table.writer.is_none() && table.readers.is_empty() {
                        let queued = table.queue.remove(&tid).expect("queue head exists");
                        table.writer = Some(tid);
                        table.roles.insert(tid, ActRole::Writer);
                        let copy = self.cell.snapshot();
                        table.staged.insert(tid, copy.clone());
                        let _ = queued.reply.send(Ok(copy));
                    }
                    return;
                }
                LockMode::Read => {
                    if table.writer.is_some() {
                        return;
                    }
                    let queued = table.queue.remove(&tid).expect("queue head exists");
                    table.readers.insert(tid);
                    table.roles.entry(tid).or_insert(ActRole::Reader);
                    let _ = queued.reply.send(Ok(self.cell.snapshot()));
                }
            }
        }
    }

    fn enqueue(
        &self,
        table: &mut LockTable<S>,
        tid: TxnId,
        mode: LockMode,
    ) -> oneshot::Receiver<Result<S, TxnError>> {
        let (reply, rx) = oneshot::channel();
        let evicted = table.queue.insert(tid, QueuedRequest { mode, reply });
        assert!(evicted.is_none(), "txn {tid} queued twice");
        rx
    }
}

#[async_trait]
impl<S: ActorState> ConcurrencyControl<S> for S2plEngine<S> {
    async fn read(&self, tid: TxnId) -> Result<S, TxnError> {
        let rx = {
            let mut table = self.lock_table();
            if table.writer == Some(tid) {
                return Ok(table.staged.get(&tid).expect("writer has a copy").clone());
            }
            if table.readers.contains(&tid) {
                return Ok(self.cell.snapshot());
            }
            match table.writer {
                Some(writer) => {
                    assert_ne!(writer, tid, "duplicate txn id {tid}");
                    if writer > tid {
                        // Waiting would be on a higher id.
                        return Err(TxnError::DeadlockAvoidance(tid));
                    }
                    self.enqueue(&mut table, tid, LockMode::Read)
                }
                None => {
                    let lower_writer_waiting = table
                        .queue
                        .range(..tid)
                        .any(|(_, queued)| queued.mode == LockMode::Write);
                    if lower_writer_waiting {
                        self.enqueue(&mut table, tid, LockMode::Read)
                    } else {
                        table.readers.insert(tid);
                        table.roles.entry(tid).or_insert(ActRole::Reader);
                        return Ok(self.cell.snapshot());
                    }
                }
            }
        };
        rx.await
            .unwrap_or_else(|_| Err(TxnError::DeadlockAvoidance(tid)))
    }

    async fn read_write(&self, tid: TxnId) -> Result<S, TxnError> {
        let rx = {
            let mut table = self.lock_table();
            if table.writer == Some(tid) {
                return Ok(table.staged.get(&tid).expect("writer has a copy").clone());
            }
            if table.readers.contains(&tid) {
                // Upgrade is disallowed.
                return Err(TxnError::DeadlockAvoidance(tid));
            }
            if let Some(max) = table.max_holder() {
                assert_ne!(max, tid, "duplicate txn id {tid}");
                if max > tid {
                    return Err(TxnError::DeadlockAvoidance(tid));
                }
            }
            let lower_queued = table.queue.range(..tid).next().is_some();
            if table.writer.is_some() || !table.readers.is_empty() || lower_queued {
                self.enqueue(&mut table, tid, LockMode::Write)
            } else {
                table.writer = Some(tid);
                table.roles.insert(tid, ActRole::Writer);
                let copy = self.cell.snapshot();
                table.staged.insert(tid, copy.clone());
                return Ok(copy);
            }
        };
        rx.await
            .unwrap_or_else(|_| Err(TxnError::DeadlockAvoidance(tid)))
    }

    fn stage(&self, tid: TxnId, value: S) {
        let mut table = self.lock_table();
        if table.writer == Some(tid) {
            table.staged.insert(tid, value);
        }
    }

    async fn prepare(&self, tid: TxnId) -> bool {
        let mut table = self.lock_table();
        if table.readers.remove(&tid) {
            table.roles.remove(&tid);
            self.wake(&mut table);
        }
        true
    }

    fn commit(&self, tid: TxnId) {
        let mut table = self.lock_table();
        table.roles.remove(&tid);
        if table.writer == Some(tid) {
            let staged = table.staged.remove(&tid).expect("writer has a copy");
            self.cell.install(staged);
            table.writer = None;
            self.wake(&mut table);
        }
    }

    fn abort(&self, tid: TxnId) {
        let mut table = self.lock_table();
        table.roles.remove(&tid);
        table.staged.remove(&tid);
        let mut released = table.readers.remove(&tid);
        if table.writer == Some(tid) {
            table.writer = None;
            released = true;
        }
        if let Some(queued) = table.queue.remove(&tid) {
            let _ = queued.reply.send(Err(TxnError::DeadlockAvoidance(tid)));
        }
        if released {
            self.wake(&mut table);
        }
    }

    fn role(&self, tid: TxnId) -> ActRole {
        let table = self.lock_table();
        table.roles.get(&tid).copied().unwrap_or(ActRole::NoOp)
    }

    fn gc_health(&self, actor: ActorId, issues: &mut Vec<String>) {
        let table = self.lock_table();
        if !table.readers.is_empty() || table.writer.is_some() {
            issues.push(format!("actor {actor}: s2pl admissions still held"));
        }
        if !table.queue.is_empty() {
            issues.push(format!(
                "actor {actor}: {} s2pl requests still queued",
                table.queue.len()
            ));
        }
        if !table.staged.is_empty() || !table.roles.is_empty() {
            issues.push(format!("actor {actor}: s2pl bookkeeping not drained"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> S2plEngine<i64> {
        S2plEngine::new(Arc::new(StateCell::new(100)))
    }

    #[tokio::test]
    async fn readers_are_concurrent() {
        let engine = engine();
        assert_eq!(engine.read(1).await, Ok(100));
        assert_eq!(engine.read(2).await, Ok(100));
        assert!(engine.prepare(1).await);
        assert!(engine.prepare(2).await);
        engine.commit(1);
        engine.commit(2);
    }

    #[tokio::test]
    async fn writer_excludes_higher_id_requests() {
        let engine = engine();
        assert_eq!(engine.read_write(1).await, Ok(100));
        // A request that outranks the current holder would wait on a higher
        // id and must abort on the spot instead.
        assert_eq!(engine.read(0).await, Err(TxnError::DeadlockAvoidance(0)));
        assert_eq!(
            engine.read_write(0).await,
            Err(TxnError::DeadlockAvoidance(0))
        );
        engine.commit(1);
    }

    #[tokio::test]
    async fn higher_id_writer_waits_for_lower_holder() {
        let engine = Arc::new(engine());
        assert_eq!(engine.read_write(1).await, Ok(100));
        engine.stage(1, 60);

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.read_write(5).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        engine.commit(1);
        // The queued writer observes the committed value.
        assert_eq!(waiter.await.expect("waiter task"), Ok(60));
        engine.commit(5);
    }

    #[tokio::test]
    async fn upgrade_aborts() {
        let engine = engine();
        assert_eq!(engine.read(3).await, Ok(100));
        assert_eq!(
            engine.read_write(3).await,
            Err(TxnError::DeadlockAvoidance(3))
        );
        engine.abort(3);
    }

    #[tokio::test]
    async fn reader_queues_behind_lower_waiting_writer() {
        let engine = Arc::new(engine());
        assert_eq!(engine.read(1).await, Ok(100));

        // Writer 2 waits on reader 1.
        let writer = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.read_write(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());

        // Reader 5 must queue behind waiting writer 2, not join reader 1.
        let reader = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.read(5).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        assert!(engine.prepare(1).await);
        engine.commit(1);

        assert_eq!(writer.await.expect("writer task"), Ok(100));
        engine.stage(2, 70);
        engine.commit(2);
        assert_eq!(reader.await.expect("reader task"), Ok(70));
        assert!(engine.prepare(5).await);
        engine.commit(5);

        let mut issues = Vec::new();
        engine.gc_health(1, &mut issues);
        assert!(issues.is_empty(), "unexpected leftovers: {issues:?}");
    }

    #[tokio::test]
    async fn abort_releases_and_wakes() {
        let engine = Arc::new(engine());
        assert_eq!(engine.read_write(1).await, Ok(100));
        engine.stage(1, 0);

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.read(4).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        engine.abort(1);
        // Staged mutation is discarded, the reader sees the old value.
        assert_eq!(waiter.await.expect("reader task"), Ok(100));
        assert!(engine.prepare(4).await);
        engine.commit(4);
    }
}
