//! Global coordinator: cross-silo batch formation.
//!
//! Global coordinators form their own ring with their own token and id
//! spaces. A cross-silo transaction registers here first, receiving global
//! ids and one chosen local coordinator per silo, then registers with each
//! of those; local rings absorb the global batch into their own order once
//! its per-silo predecessor has been absorbed and every local leg arrived.
//! A global batch commits when all silos acked and its ring predecessor
//! committed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use super::signal::Signal;
use super::token::{GlobalSubBatch, GlobalToken};
use super::types::{
    BatchId, CoordId, GlobalPactContext, SiloId, Transport, TxnId, TxnLog, NO_BATCH,
};

#[derive(Clone, Debug)]
pub struct GlobalCoordinatorConfig {
    pub coord_id: CoordId,
    pub next_coord: CoordId,
    pub token_interval: Duration,
    /// Local coordinators per silo to choose absorption targets from.
    pub local_coords: HashMap<SiloId, Vec<CoordId>>,
}

struct PendingGlobalPact {
    silos: Vec<SiloId>,
    reply: oneshot::Sender<GlobalPactContext>,
}

struct GlobalBatchRecord {
    prev_bid: BatchId,
    prev_coord: CoordId,
    pending_silos: HashSet<SiloId>,
}

struct GlobalState {
    pending: Vec<PendingGlobalPact>,
    /// Round-robin cursor for local coordinator choice.
    rr: usize,
    batches: HashMap<BatchId, GlobalBatchRecord>,
    highest_committed_bid: BatchId,
    commit_waiters: BTreeMap<BatchId, Signal>,
}

pub struct GlobalCoordinator {
    cfg: GlobalCoordinatorConfig,
    transport: OnceLock<Arc<dyn Transport>>,
    log: Arc<dyn TxnLog>,
    state: Mutex<GlobalState>,
}

impl GlobalCoordinator {
    pub fn new(cfg: GlobalCoordinatorConfig, log: Arc<dyn TxnLog>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport: OnceLock::new(),
            log,
            state: Mutex::new(GlobalState {
                pending: Vec::new(),
                rr: 0,
                batches: HashMap::new(),
                highest_committed_bid: NO_BATCH,
                commit_waiters: BTreeMap::new(),
            }),
        })
    }

    pub fn coord_id(&self) -> CoordId {
        self.cfg.coord_id
    }

    pub fn connect(&self, transport: Arc<dyn Transport>) {
        if self.transport.set(transport).is_err() {
            panic!("global coordinator transport wired twice");
        }
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.get().expect("transport wired").clone()
    }

    /// Queue a cross-silo registration; resolves at the next token pass.
    pub async fn register_global_pact(
        &self,
        silos: Vec<SiloId>,
    ) -> anyhow::Result<GlobalPactContext> {
        if silos.len() < 2 {
            anyhow::bail!("cross-silo transaction must span at least two silos");
        }
        for silo in &silos {
            if !self.cfg.local_coords.contains_key(silo) {
                anyhow::bail!("unknown silo {silo}");
            }
        }
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.pending.push(PendingGlobalPact { silos, reply });
        }
        rx.await
            .map_err(|_| anyhow::anyhow!("global coordinator dropped registration"))
    }

    pub async fn receive_token(self: &Arc<Self>, mut token: GlobalToken) {
        struct GlobalEmission {
            bid: BatchId,
            tids: Vec<TxnId>,
            subs: Vec<(CoordId, GlobalSubBatch)>,
            replies: Vec<(oneshot::Sender<GlobalPactContext>, GlobalPactContext)>,
        }

        let emission = {
            let mut state = self.state.lock().await;
            self.merge_committed(&mut state, token.highest_committed_bid);
            token.highest_committed_bid = token
                .highest_committed_bid
                .max(state.highest_committed_bid);

            if state.pending.is_empty() {
                None
            } else {
                let (prev_bid, prev_coord) = (token.last_emit_bid, token.last_emit_coord);
                let bid = token.last_emit_bid + 1;
                token.last_emit_bid = bid;
                token.last_emit_coord = self.cfg.coord_id;

                // One absorption target per silo for the whole batch.
                let batch_silos: HashSet<SiloId> = state
                    .pending
                    .iter()
                    .flat_map(|pact| pact.silos.iter().copied())
                    .collect();
                let mut chosen: HashMap<SiloId, CoordId> = HashMap::new();
                for &silo in &batch_silos {
                    let coords = &self.cfg.local_coords[&silo];
                    chosen.insert(silo, coords[state.rr % coords.len()]);
                }
                state.rr += 1;

                let mut tids = Vec::new();
                let mut per_silo_tids: HashMap<SiloId, Vec<TxnId>> = HashMap::new();
                let mut replies = Vec::new();
                for pact in state.pending.drain(..) {
                    token.last_emit_tid += 1;
                    let gtid = token.last_emit_tid;
                    tids.push(gtid);
                    let mut coord_per_silo = HashMap::new();
                    for &silo in &pact.silos {
                        per_silo_tids.entry(silo).or_default().push(gtid);
                        coord_per_silo.insert(silo, chosen[&silo]);
                    }
                    replies.push((
                        pact.reply,
                        GlobalPactContext {
                            global_bid: bid,
                            global_tid: gtid,
                            gcoord: self.cfg.coord_id,
                            coord_per_silo,
                        },
                    ));
                }

                let mut subs = Vec::new();
                for (silo, global_tids) in per_silo_tids {
                    let prev_global_bid =
                        token.last_touch_silo.get(&silo).copied().unwrap_or(NO_BATCH);
                    token.last_touch_silo.insert(silo, bid);
                    subs.push((
                        chosen[&silo],
                        GlobalSubBatch {
                            global_bid: bid,
                            prev_global_bid,
                            gcoord: self.cfg.coord_id,
                            global_tids,
                        },
                    ));
                }

                state.batches.insert(
                    bid,
                    GlobalBatchRecord {
                        prev_bid,
                        prev_coord,
                        pending_silos: batch_silos,
                    },
                );
                Some(GlobalEmission {
                    bid,
                    tids,
                    subs,
                    replies,
                })
            }
        };

        if let Some(emission) = emission {
            if let Err(err) = self.log.write_batch_prepare(emission.bid, &emission.tids) {
                tracing::warn!(gbid = emission.bid, error = ?err, "global batch prepare write failed");
            }
            tracing::debug!(
                gbid = emission.bid,
                txns = emission.tids.len(),
                "emitting global batch"
            );
            let transport = self.transport();
            for (coord, sub) in emission.subs {
                if let Err(err) = transport.deliver_global_batch(coord, sub).await {
                    tracing::warn!(gbid = emission.bid, coord, error = ?err, "global batch delivery failed");
                }
            }
            for (reply, ctx) in emission.replies {
                let _ = reply.send(ctx);
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.cfg.token_interval).await;
            let transport = this.transport();
            if let Err(err) = transport
                .pass_global_token(this.cfg.next_coord, token)
                .await
            {
                tracing::warn!(error = ?err, "global token forward failed, ring halted");
            }
        });
    }

    fn merge_committed(&self, state: &mut GlobalState, observed: BatchId) {
        if observed <= state.highest_committed_bid {
            return;
        }
        state.highest_committed_bid = observed;
        let still_waiting = state.commit_waiters.split_off(&(observed + 1));
        for (_, signal) in std::mem::replace(&mut state.commit_waiters, still_waiting) {
            signal.fire();
        }
    }

    /// One silo completed and locally committed its leg of `global_bid`.
    pub async fn handle_silo_ack(self: &Arc<Self>, global_bid: BatchId, silo: SiloId) {
        let ready = {
            let mut state = self.state.lock().await;
            let record = state
                .batches
                .get_mut(&global_bid)
                .unwrap_or_else(|| panic!("ack for unknown global batch {global_bid}"));
            record.pending_silos.remove(&silo);
            record.pending_silos.is_empty()
        };
        if ready {
            let this = self.clone();
            tokio::spawn(async move { this.drive_commit(global_bid).await });
        }
    }

    async fn drive_commit(self: Arc<Self>, global_bid: BatchId) {
        let (prev_bid, prev_coord) = {
            let state = self.state.lock().await;
            let record = state
                .batches
                .get(&global_bid)
                .expect("global batch record exists");
            (record.prev_bid, record.prev_coord)
        };

        if prev_bid != NO_BATCH {
            if prev_coord == self.cfg.coord_id {
                self.wait_global_committed(prev_bid).await;
            } else if let Err(err) = self
                .transport()
                .wait_global_committed(prev_coord, prev_bid)
                .await
            {
                tracing::warn!(global_bid, prev_bid, error = ?err, "global predecessor wait failed");
                return;
            }
        }

        {
            let mut state = self.state.lock().await;
            state
                .batches
                .remove(&global_bid)
                .expect("global batch record exists");
            assert!(
                global_bid > state.highest_committed_bid,
                "global batch {global_bid} committing out of ring order behind {}",
                state.highest_committed_bid
            );
            self.merge_committed(&mut state, global_bid);
        }
        if let Err(err) = self.log.write_batch_commit(global_bid) {
            tracing::warn!(global_bid, error = ?err, "global commit write failed");
        }
        tracing::debug!(global_bid, "global batch committed");
    }

    /// Resolve once this coordinator knows `global_bid` committed.
    pub async fn wait_global_committed(&self, global_bid: BatchId) {
        let signal = {
            let mut state = self.state.lock().await;
            if global_bid <= state.highest_committed_bid {
                return;
            }
            state
                .commit_waiters
                .entry(global_bid)
                .or_insert_with(Signal::new)
                .clone()
        };
        signal.wait().await;
    }

    pub async fn gc_health(&self, issues: &mut Vec<String>) {
        let state = self.state.lock().await;
        let id = self.cfg.coord_id;
        if !state.batches.is_empty() {
            issues.push(format!(
                "global coordinator {id}: {} batches awaiting commit",
                state.batches.len()
            ));
        }
        if !state.commit_waiters.is_empty() {
            issues.push(format!(
                "global coordinator {id}: {} commit waiters outstanding",
                state.commit_waiters.len()
            ));
        }
        if !state.pending.is_empty() {
            issues.push(format!(
                "global coordinator {id}: registrations still queued"
            ));
        }
    }
}
