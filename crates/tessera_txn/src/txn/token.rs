//! Ordering tokens and batch records.
//!
//! Exactly one token circulates per ring. It is created once at bootstrap
//! and mutated in place forever; its loss halts batch emission for the ring
//! and is not self-healing.

use std::collections::HashMap;

use super::types::{ActorId, BatchId, CoordId, SiloId, TxnId, NO_BATCH, NO_TXN};

/// Token circulating a silo-local coordinator ring.
#[derive(Clone, Debug)]
pub struct Token {
    /// Last batch id emitted on this ring.
    pub last_emit_bid: BatchId,
    /// Last transaction id handed out on this ring, including pre-reserved
    /// ranges that may never be assigned.
    pub last_emit_tid: TxnId,
    /// Coordinator that emitted `last_emit_bid`. Predecessor-commit waits
    /// are routed there.
    pub last_emit_coord: CoordId,
    /// Highest batch id known committed on this ring.
    pub highest_committed_bid: BatchId,
    /// Per-actor id of the last batch touching that actor. Establishes
    /// per-actor causal FIFO order without a shared clock.
    pub last_touch: HashMap<ActorId, BatchId>,
    /// Last global batch absorbed by this ring. Unused on single-tier rings.
    pub last_emitted_global_bid: BatchId,
}

impl Token {
    pub fn new() -> Self {
        Self {
            last_emit_bid: NO_BATCH,
            last_emit_tid: NO_TXN,
            last_emit_coord: 0,
            highest_committed_bid: NO_BATCH,
            last_touch: HashMap::new(),
            last_emitted_global_bid: NO_BATCH,
        }
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

/// Token circulating the global coordinator ring.
#[derive(Clone, Debug)]
pub struct GlobalToken {
    pub last_emit_bid: BatchId,
    pub last_emit_tid: TxnId,
    pub last_emit_coord: CoordId,
    pub highest_committed_bid: BatchId,
    /// Per-silo id of the last global batch touching that silo.
    pub last_touch_silo: HashMap<SiloId, BatchId>,
}

impl GlobalToken {
    pub fn new() -> Self {
        Self {
            last_emit_bid: NO_BATCH,
            last_emit_tid: NO_TXN,
            last_emit_coord: 0,
            highest_committed_bid: NO_BATCH,
            last_touch_silo: HashMap::new(),
        }
    }
}

impl Default for GlobalToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-actor materialization of a batch, immutable once emitted.
#[derive(Clone, Debug)]
pub struct SubBatch {
    pub bid: BatchId,
    /// Last batch touching this actor before `bid`, `NO_BATCH` if none
    /// outstanding.
    pub prev_bid: BatchId,
    /// Originating coordinator; completion acks go there.
    pub coord: CoordId,
    /// Transactions touching this actor, in batch order.
    pub tids: Vec<TxnId>,
    /// Highest committed batch known at emission, piggybacked so actors can
    /// garbage-collect without extra round trips.
    pub highest_committed_bid: BatchId,
    /// Global batch this sub-batch materializes, `NO_BATCH` for purely
    /// local batches.
    pub global_bid: BatchId,
    /// Local-to-global batch id mapping for absorbed cross-silo batches.
    pub bid_map: HashMap<BatchId, BatchId>,
}

/// Per-silo materialization of a global batch, sent to the chosen local
/// coordinator for absorption into its ring.
#[derive(Clone, Debug)]
pub struct GlobalSubBatch {
    pub global_bid: BatchId,
    /// Previous global batch routed to this silo, `NO_BATCH` if none.
    pub prev_global_bid: BatchId,
    pub gcoord: CoordId,
    /// Global transaction ids expected to register in this silo, in batch
    /// order.
    pub global_tids: Vec<TxnId>,
}
