//! Deterministic executor.
//!
//! Tracks delivered sub-batches and hands each transaction its turn:
//! transactions within a sub-batch run serially in batch order, and the
//! first gates on the schedule graph node preceding the batch. Completion
//! is broadcast per actor by the originating executor; once a sub-batch
//! fully drains the coordinator is acked.

use std::collections::{HashMap, HashSet};

use super::signal::Signal;
use super::token::SubBatch;
use super::types::{BatchId, CoordId, TxnError, TxnId};

struct DetRun {
    coord: CoordId,
    order: Vec<TxnId>,
    /// Per-transaction go signal. The first entry aliases the schedule
    /// graph gate, later entries fire as their predecessors finish.
    turn: HashMap<TxnId, Signal>,
    done: HashSet<TxnId>,
    /// Position of the first transaction not yet finished.
    next_idx: usize,
    current: Option<TxnId>,
}

struct DetState {
    runs: HashMap<BatchId, DetRun>,
    /// Wakes calls that outran their sub-batch delivery.
    arrivals: HashMap<BatchId, Signal>,
}

pub(crate) struct DetExecutor {
    state: std::sync::Mutex<DetState>,
}

impl DetExecutor {
    pub(crate) fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(DetState {
                runs: HashMap::new(),
                arrivals: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetState> {
        self.state.lock().expect("det state poisoned")
    }

    pub(crate) fn accept(&self, sub: &SubBatch, gate: Signal) {
        let mut state = self.lock();
        let mut turn = HashMap::new();
        for (idx, &tid) in sub.tids.iter().enumerate() {
            let signal = if idx == 0 { gate.clone() } else { Signal::new() };
            turn.insert(tid, signal);
        }
        let evicted = state.runs.insert(
            sub.bid,
            DetRun {
                coord: sub.coord,
                order: sub.tids.clone(),
                turn,
                done: HashSet::new(),
                next_idx: 0,
                current: None,
            },
        );
        assert!(evicted.is_none(), "duplicate sub-batch {}", sub.bid);
        if let Some(arrival) = state.arrivals.remove(&sub.bid) {
            arrival.fire();
        }
    }

    /// Block until `tid` may execute on this actor. Repeat accesses by the
    /// transaction currently holding the turn pass straight through.
    pub(crate) async fn wait_turn(&self, bid: BatchId, tid: TxnId) -> Result<(), TxnError> {
        let gate = loop {
            let arrival = {
                let mut state = self.lock();
                if let Some(run) = state.runs.get(&bid) {
                    if run.current == Some(tid) || run.done.contains(&tid) {
                        return Ok(());
                    }
                    match run.turn.get(&tid) {
                        Some(signal) => break signal.clone(),
                        None => {
                            return Err(TxnError::ReadWriteConflict(format!(
                                "txn {tid} is not scheduled in batch {bid} on this actor"
                            )))
                        }
                    }
                }
                state
                    .arrivals
                    .entry(bid)
                    .or_insert_with(Signal::new)
                    .clone()
            };
            arrival.wait().await;
        };
        gate.wait().await;
        let mut state = self.lock();
        if let Some(run) = state.runs.get_mut(&bid) {
            run.current = Some(tid);
        }
        Ok(())
    }

    /// Record `tid` complete on this actor, releasing its successor's turn.
    /// Returns the coordinator to ack when the sub-batch fully drains.
    pub(crate) fn finish(&self, bid: BatchId, tid: TxnId) -> Option<CoordId> {
        let mut state = self.lock();
        let run = state.runs.get_mut(&bid)?;
        if !run.done.insert(tid) {
            return None;
        }
        if run.current == Some(tid) {
            run.current = None;
        }
        let before = run.next_idx;
        while run.next_idx < run.order.len() && run.done.contains(&run.order[run.next_idx]) {
            run.next_idx += 1;
        }
        if run.next_idx > before && run.next_idx < run.order.len() {
            run.turn[&run.order[run.next_idx]].fire();
        }
        if run.done.len() == run.order.len() {
            let coord = run.coord;
            state.runs.remove(&bid);
            return Some(coord);
        }
        None
    }

    pub(crate) fn gc_health(&self, actor: u64, issues: &mut Vec<String>) {
        let state = self.lock();
        if !state.runs.is_empty() {
            issues.push(format!(
                "actor {actor}: {} det sub-batches still running",
                state.runs.len()
            ));
        }
        if !state.arrivals.is_empty() {
            issues.push(format!(
                "actor {actor}: {} det arrivals never satisfied",
                state.arrivals.len()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use std::time::Duration;

    fn sub(bid: BatchId, tids: &[TxnId]) -> SubBatch {
        SubBatch {
            bid,
            prev_bid: -1,
            coord: 9,
            tids: tids.to_vec(),
            highest_committed_bid: -1,
            global_bid: -1,
            bid_map: StdHashMap::new(),
        }
    }

    #[tokio::test]
    async fn turns_run_in_batch_order() {
        let det = std::sync::Arc::new(DetExecutor::new());
        det.accept(&sub(0, &[1, 2]), Signal::fired());

        det.wait_turn(0, 1).await.expect("first turn");
        let second = {
            let det = det.clone();
            tokio::spawn(async move { det.wait_turn(0, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        assert_eq!(det.finish(0, 1), None);
        second.await.expect("turn task").expect("second turn");
        assert_eq!(det.finish(0, 2), Some(9));
    }

    #[tokio::test]
    async fn early_finish_of_later_txn_keeps_order() {
        let det = DetExecutor::new();
        det.accept(&sub(0, &[1, 2, 3]), Signal::fired());

        // Txn 2 completes elsewhere before txn 1 finishes here.
        assert_eq!(det.finish(0, 2), None);
        det.wait_turn(0, 1).await.expect("first turn");
        assert_eq!(det.finish(0, 1), None);
        // Both predecessors done, txn 3 runs at once.
        det.wait_turn(0, 3).await.expect("third turn");
        assert_eq!(det.finish(0, 3), Some(9));
    }

    #[tokio::test]
    async fn call_that_outruns_delivery_waits_for_the_sub_batch() {
        let det = std::sync::Arc::new(DetExecutor::new());
        let waiter = {
            let det = det.clone();
            tokio::spawn(async move { det.wait_turn(4, 7).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        det.accept(&sub(4, &[7]), Signal::fired());
        waiter.await.expect("turn task").expect("turn");
    }

    #[tokio::test]
    async fn undeclared_txn_is_a_conflict() {
        let det = DetExecutor::new();
        det.accept(&sub(0, &[1]), Signal::fired());
        assert!(matches!(
            det.wait_turn(0, 8).await,
            Err(TxnError::ReadWriteConflict(_))
        ));
    }
}
