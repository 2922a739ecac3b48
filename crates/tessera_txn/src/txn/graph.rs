//! Per-actor schedule graph.
//!
//! A doubly linked list of nodes gating execution order on one actor:
//! deterministic batches run in batch-id order, non-deterministic
//! transactions interleave with them only at node boundaries. The list is
//! arena-allocated (keys into a map) with a permanent sentinel head that is
//! already satisfied, so turn-taking stays O(1) amortized.
//!
//! Invariants: batch ids strictly increase along the list, and two
//! non-deterministic nodes are never adjacent (a maximal contiguous run
//! collapses into one shared node).

use std::collections::{HashMap, HashSet};

use super::signal::Signal;
use super::types::{BatchId, TxnId, NO_BATCH};

type NodeKey = u64;

const SENTINEL: NodeKey = 0;

#[derive(Debug)]
enum NodeKind {
    Det { bid: BatchId, placeholder: bool },
    Nondet { members: HashSet<TxnId> },
}

#[derive(Debug)]
struct ScheduleNode {
    prev: NodeKey,
    next: Option<NodeKey>,
    kind: NodeKind,
    /// Fires when successors may proceed.
    signal: Signal,
}

/// Bounds of a non-deterministic transaction within this actor's schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ActBounds {
    pub(crate) before_bid: BatchId,
    pub(crate) after_bid: BatchId,
    pub(crate) after_known: bool,
}

#[derive(Debug)]
pub(crate) struct ScheduleGraph {
    nodes: HashMap<NodeKey, ScheduleNode>,
    det_index: HashMap<BatchId, NodeKey>,
    act_index: HashMap<TxnId, NodeKey>,
    tail: NodeKey,
    next_key: NodeKey,
    /// Highest deterministic bid along the list, placeholders included.
    max_det_bid: BatchId,
    /// Highest deterministic bid garbage-collected off the head, which is by
    /// construction known committed on this actor.
    committed_tail_bid: BatchId,
    highest_committed_bid: BatchId,
}

impl ScheduleGraph {
    pub(crate) fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            SENTINEL,
            ScheduleNode {
                prev: SENTINEL,
                next: None,
                kind: NodeKind::Det {
                    bid: NO_BATCH,
                    placeholder: false,
                },
                signal: Signal::fired(),
            },
        );
        Self {
            nodes,
            det_index: HashMap::new(),
            act_index: HashMap::new(),
            tail: SENTINEL,
            next_key: SENTINEL + 1,
            max_det_bid: NO_BATCH,
            committed_tail_bid: NO_BATCH,
            highest_committed_bid: NO_BATCH,
        }
    }

    pub(crate) fn highest_committed(&self) -> BatchId {
        self.highest_committed_bid
    }

    fn append(&mut self, kind: NodeKind) -> NodeKey {
        let key = self.next_key;
        self.next_key += 1;
        let prev = self.tail;
        self.nodes.insert(
            key,
            ScheduleNode {
                prev,
                next: None,
                kind,
                signal: Signal::new(),
            },
        );
        self.node_mut(prev).next = Some(key);
        self.tail = key;
        key
    }

    fn node(&self, key: NodeKey) -> &ScheduleNode {
        self.nodes.get(&key).expect("schedule node exists")
    }

    fn node_mut(&mut self, key: NodeKey) -> &mut ScheduleNode {
        self.nodes.get_mut(&key).expect("schedule node exists")
    }

    /// Insert the node for a newly delivered sub-batch.
    ///
    /// The declared predecessor is the last previous batch touching this
    /// actor, so the new node always lands at the tail. A placeholder is
    /// synthesized when the predecessor has not arrived yet (reordered
    /// delivery) and is filled in place once it does.
    pub(crate) fn insert_det(&mut self, bid: BatchId, prev_bid: BatchId) {
        if let Some(&key) = self.det_index.get(&bid) {
            match &mut self.node_mut(key).kind {
                NodeKind::Det { placeholder, .. } => {
                    assert!(
                        *placeholder,
                        "duplicate sub-batch delivery for batch {bid}"
                    );
                    *placeholder = false;
                }
                NodeKind::Nondet { .. } => unreachable!("det index points at det node"),
            }
            return;
        }

        assert!(
            bid > self.max_det_bid,
            "batch {bid} arrived behind schedule tail {}",
            self.max_det_bid
        );

        if prev_bid != NO_BATCH
            && prev_bid > self.highest_committed_bid
            && prev_bid > self.committed_tail_bid
            && !self.det_index.contains_key(&prev_bid)
        {
            assert!(
                prev_bid > self.max_det_bid,
                "batch {bid} declares predecessor {prev_bid} behind schedule tail {}",
                self.max_det_bid
            );
            let key = self.append(NodeKind::Det {
                bid: prev_bid,
                placeholder: true,
            });
            self.det_index.insert(prev_bid, key);
            self.max_det_bid = prev_bid;
        }

        let key = self.append(NodeKind::Det {
            bid,
            placeholder: false,
        });
        self.det_index.insert(bid, key);
        self.max_det_bid = bid;
    }

    /// Gate the first transaction of `bid` waits on: the signal of the node
    /// preceding the batch's node.
    pub(crate) fn det_gate(&self, bid: BatchId) -> Signal {
        let key = *self.det_index.get(&bid).expect("batch has a node");
        self.node(self.node(key).prev).signal.clone()
    }

    /// Record a coordinator commit confirmation for `bid`, releasing the
    /// batch node's successors and collecting committed prefix nodes.
    pub(crate) fn mark_det_committed(&mut self, bid: BatchId, highest_committed_bid: BatchId) {
        if let Some(&key) = self.det_index.get(&bid) {
            self.node(key).signal.fire();
        }
        self.observe_committed(highest_committed_bid.max(bid));
    }

    /// Learn a new highest committed batch and collect eligible head nodes.
    pub(crate) fn observe_committed(&mut self, highest_committed_bid: BatchId) {
        if highest_committed_bid > self.highest_committed_bid {
            self.highest_committed_bid = highest_committed_bid;
        }
        self.collect();
    }

    /// Walk from the sentinel removing fully committed deterministic nodes
    /// and drained non-deterministic nodes, stopping at the first
    /// ineligible node. Bounds memory to the in-flight window.
    fn collect(&mut self) {
        loop {
            let Some(head) = self.node(SENTINEL).next else {
                return;
            };
            let node = self.node(head);
            let eligible = match &node.kind {
                NodeKind::Det { bid, placeholder } => {
                    !placeholder && *bid <= self.highest_committed_bid && node.signal.is_fired()
                }
                NodeKind::Nondet { members } => members.is_empty(),
            };
            if !eligible {
                return;
            }
            self.unlink_head(head);
        }
    }

    fn unlink_head(&mut self, key: NodeKey) {
        let node = self.nodes.remove(&key).expect("schedule node exists");
        match node.kind {
            NodeKind::Det { bid, .. } => {
                self.det_index.remove(&bid);
                self.committed_tail_bid = self.committed_tail_bid.max(bid);
            }
            NodeKind::Nondet { .. } => {
                node.signal.fire();
            }
        }
        match node.next {
            Some(next) => {
                self.node_mut(next).prev = SENTINEL;
                self.node_mut(SENTINEL).next = Some(next);
            }
            None => {
                self.node_mut(SENTINEL).next = None;
                self.tail = SENTINEL;
            }
        }
    }

    /// Admit a non-deterministic transaction at the tail, returning the
    /// signal it must await before executing.
    pub(crate) fn join_nondet(&mut self, tid: TxnId) -> Signal {
        assert!(
            !self.act_index.contains_key(&tid),
            "txn {tid} already admitted"
        );
        let tail = self.tail;
        let key = if let NodeKind::Nondet { .. } = &self.node(tail).kind {
            tail
        } else {
            self.append(NodeKind::Nondet {
                members: HashSet::new(),
            })
        };
        match &mut self.node_mut(key).kind {
            NodeKind::Nondet { members } => {
                members.insert(tid);
            }
            NodeKind::Det { .. } => unreachable!("joined node is nondet"),
        }
        self.act_index.insert(tid, key);
        self.node(self.node(key).prev).signal.clone()
    }

    pub(crate) fn act_member(&self, tid: TxnId) -> bool {
        self.act_index.contains_key(&tid)
    }

    /// Gate an already admitted member waits on, for reentrant arrivals.
    pub(crate) fn act_gate(&self, tid: TxnId) -> Signal {
        let key = *self.act_index.get(&tid).expect("txn is admitted");
        self.node(self.node(key).prev).signal.clone()
    }

    /// Drop a member on commit, abort, or admission abandonment. A drained
    /// node releases its successors; a drained tail node is unlinked so the
    /// next arrival starts a fresh group.
    pub(crate) fn leave_nondet(&mut self, tid: TxnId) {
        let Some(key) = self.act_index.remove(&tid) else {
            return;
        };
        let drained = match &mut self.node_mut(key).kind {
            NodeKind::Nondet { members } => {
                members.remove(&tid);
                members.is_empty()
            }
            NodeKind::Det { .. } => unreachable!("act index points at nondet node"),
        };
        if !drained {
            return;
        }
        if self.node(key).next.is_some() {
            self.node(key).signal.fire();
            self.collect();
        } else {
            // Tail node: unlink immediately rather than leaving a stub.
            let prev = self.node(key).prev;
            let node = self.nodes.remove(&key).expect("schedule node exists");
            node.signal.fire();
            self.node_mut(prev).next = None;
            self.tail = prev;
        }
    }

    /// Serialization bounds of an admitted non-deterministic transaction.
    pub(crate) fn act_bounds(&self, tid: TxnId) -> ActBounds {
        let key = *self.act_index.get(&tid).expect("txn is admitted");
        let node = self.node(key);

        let before_bid = match &self.node(node.prev).kind {
            NodeKind::Det { bid, .. } if node.prev != SENTINEL => *bid,
            _ => self.committed_tail_bid,
        };

        let mut cursor = node.next;
        while let Some(next) = cursor {
            match &self.node(next).kind {
                NodeKind::Det { bid, .. } => {
                    return ActBounds {
                        before_bid,
                        after_bid: *bid,
                        after_known: true,
                    }
                }
                NodeKind::Nondet { .. } => cursor = self.node(next).next,
            }
        }
        ActBounds {
            before_bid,
            after_bid: NO_BATCH,
            after_known: false,
        }
    }

    pub(crate) fn gc_health(&self, actor: u64, issues: &mut Vec<String>) {
        if self.nodes.len() > 1 {
            issues.push(format!(
                "actor {actor}: schedule graph holds {} nodes beyond the sentinel",
                self.nodes.len() - 1
            ));
        }
        if !self.act_index.is_empty() {
            issues.push(format!(
                "actor {actor}: {} nondet transactions still admitted",
                self.act_index.len()
            ));
        }
        if !self.det_index.is_empty() {
            issues.push(format!(
                "actor {actor}: {} det batches still scheduled",
                self.det_index.len()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn det_batches_gate_in_order() {
        let mut graph = ScheduleGraph::new();
        graph.insert_det(0, NO_BATCH);
        graph.insert_det(1, 0);

        assert!(graph.det_gate(0).is_fired());
        assert!(!graph.det_gate(1).is_fired());

        graph.mark_det_committed(0, 0);
        assert!(graph.det_gate(1).is_fired());
    }

    #[test]
    fn committed_predecessor_admits_immediately() {
        let mut graph = ScheduleGraph::new();
        graph.insert_det(5, NO_BATCH);
        graph.mark_det_committed(5, 5);
        // Batch 5 is gone from the graph; its successor gates on the
        // sentinel and may run at once.
        graph.insert_det(6, 5);
        assert!(graph.det_gate(6).is_fired());
    }

    #[test]
    fn placeholder_bridges_reordered_delivery() {
        let mut graph = ScheduleGraph::new();
        // Batch 4 declaring predecessor 3 arrives before batch 3 itself.
        graph.insert_det(4, 3);
        assert!(!graph.det_gate(4).is_fired());

        // Batch 3 fills the placeholder; only its completion releases 4.
        graph.insert_det(3, NO_BATCH);
        assert!(graph.det_gate(3).is_fired());
        assert!(!graph.det_gate(4).is_fired());

        graph.mark_det_committed(3, 3);
        assert!(graph.det_gate(4).is_fired());
    }

    #[test]
    fn contiguous_nondet_runs_share_a_node() {
        let mut graph = ScheduleGraph::new();
        let first = graph.join_nondet(7);
        let second = graph.join_nondet(9);
        assert!(first.is_fired());
        assert!(second.is_fired());
        assert_eq!(graph.act_bounds(7), graph.act_bounds(9));

        graph.insert_det(0, NO_BATCH);
        let gate = graph.det_gate(0);
        assert!(!gate.is_fired());

        graph.leave_nondet(7);
        assert!(!gate.is_fired());
        graph.leave_nondet(9);
        assert!(gate.is_fired());
    }

    #[test]
    fn nondet_after_det_waits_for_commit() {
        let mut graph = ScheduleGraph::new();
        graph.insert_det(0, NO_BATCH);
        let gate = graph.join_nondet(3);
        assert!(!gate.is_fired());
        graph.mark_det_committed(0, 0);
        assert!(gate.is_fired());
    }

    #[test]
    fn act_bounds_track_surrounding_batches() {
        let mut graph = ScheduleGraph::new();
        graph.insert_det(10, NO_BATCH);
        graph.mark_det_committed(10, 10);

        let _ = graph.join_nondet(42);
        let bounds = graph.act_bounds(42);
        assert_eq!(bounds.before_bid, 10);
        assert!(!bounds.after_known);

        graph.insert_det(12, 10);
        let bounds = graph.act_bounds(42);
        assert_eq!(bounds.before_bid, 10);
        assert_eq!(bounds.after_bid, 12);
        assert!(bounds.after_known);
    }

    #[test]
    fn collect_bounds_memory_to_in_flight_window() {
        let mut graph = ScheduleGraph::new();
        for bid in 0..4 {
            let prev = bid - 1;
            graph.insert_det(bid, prev);
            graph.mark_det_committed(bid, bid);
        }
        let mut issues = Vec::new();
        graph.gc_health(1, &mut issues);
        assert!(issues.is_empty(), "unexpected leftovers: {issues:?}");
    }

    #[test]
    fn drained_tail_group_unlinks_itself() {
        let mut graph = ScheduleGraph::new();
        let _ = graph.join_nondet(1);
        graph.leave_nondet(1);
        let mut issues = Vec::new();
        graph.gc_health(1, &mut issues);
        assert!(issues.is_empty(), "unexpected leftovers: {issues:?}");
    }

    #[test]
    #[should_panic(expected = "arrived behind schedule tail")]
    fn out_of_order_batch_is_fatal() {
        let mut graph = ScheduleGraph::new();
        graph.insert_det(5, NO_BATCH);
        graph.insert_det(4, NO_BATCH);
    }
}
