//! Local coordinator: token-passing batch formation and commit tracking.
//!
//! Coordinators queue registrations without servicing them until the ring
//! token arrives; the interval a coordinator holds the token before
//! forwarding it is the sole knob trading batch size against latency. All
//! mutable state lives in one mutex owned by this coordinator's handlers,
//! and no await happens while it is held. Loss of the token halts emission
//! for the whole ring; registrations are never lost but starve until the
//! token circulates again.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};

use super::signal::Signal;
use super::token::{GlobalSubBatch, SubBatch, Token};
use super::types::{
    ActContext, ActorId, BatchId, CoordId, GlobalPactLocalReq, PactContext, SiloId, Transport,
    TxnId, TxnLog, NO_BATCH,
};

/// Smoothing factor for the adaptive id pre-reservation.
const ACT_RESERVE_SMOOTHING: f64 = 0.5;

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub coord_id: CoordId,
    pub silo_id: SiloId,
    /// Ring successor the token is forwarded to.
    pub next_coord: CoordId,
    /// Hold time before forwarding the token.
    pub token_interval: Duration,
}

struct PendingPact {
    actors: Vec<ActorId>,
    reply: oneshot::Sender<PactContext>,
}

#[derive(Default)]
struct PendingGlobal {
    delivered: Option<GlobalSubBatch>,
    regs: HashMap<TxnId, (GlobalPactLocalReq, oneshot::Sender<PactContext>)>,
}

struct BatchRecord {
    /// Ring predecessor and its owner, captured at emission.
    prev_bid: BatchId,
    prev_coord: CoordId,
    actors: Vec<ActorId>,
    pending_acks: usize,
    /// Set when this batch materializes a global batch in this silo.
    global: Option<(BatchId, CoordId)>,
}

struct CoordState {
    pending_pacts: Vec<PendingPact>,
    pending_acts: Vec<oneshot::Sender<ActContext>>,
    /// Pre-reserved id range served between token passes.
    reserved_next: TxnId,
    reserved_end: TxnId,
    /// Ids handed out since the last pass, smoothing input.
    acts_since_pass: u64,
    act_ema: f64,
    batches: HashMap<BatchId, BatchRecord>,
    highest_committed_bid: BatchId,
    commit_waiters: BTreeMap<BatchId, Signal>,
    /// Global batches awaiting absorption, by global bid.
    pending_global: BTreeMap<BatchId, PendingGlobal>,
}

/// One emission prepared under the state lock, sent after it drops.
struct Emission {
    bid: BatchId,
    tids: Vec<TxnId>,
    subs: Vec<(ActorId, SubBatch)>,
    pact_replies: Vec<(oneshot::Sender<PactContext>, PactContext)>,
}

pub struct Coordinator {
    cfg: CoordinatorConfig,
    transport: OnceLock<Arc<dyn Transport>>,
    log: Arc<dyn TxnLog>,
    state: Mutex<CoordState>,
}

impl Coordinator {
    pub fn new(cfg: CoordinatorConfig, log: Arc<dyn TxnLog>) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            transport: OnceLock::new(),
            log,
            state: Mutex::new(CoordState {
                pending_pacts: Vec::new(),
                pending_acts: Vec::new(),
                reserved_next: 0,
                reserved_end: -1,
                acts_since_pass: 0,
                act_ema: 0.0,
                batches: HashMap::new(),
                highest_committed_bid: NO_BATCH,
                commit_waiters: BTreeMap::new(),
                pending_global: BTreeMap::new(),
            }),
        })
    }

    pub fn coord_id(&self) -> CoordId {
        self.cfg.coord_id
    }

    pub fn silo_id(&self) -> SiloId {
        self.cfg.silo_id
    }

    pub fn connect(&self, transport: Arc<dyn Transport>) {
        if self.transport.set(transport).is_err() {
            panic!("coordinator transport wired twice");
        }
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.get().expect("transport wired").clone()
    }

    /// Queue a deterministic registration; resolves at the next token pass.
    pub async fn register_pact(&self, actors: Vec<ActorId>) -> anyhow::Result<PactContext> {
        if actors.is_empty() {
            anyhow::bail!("deterministic transaction with empty access set");
        }
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            state.pending_pacts.push(PendingPact { actors, reply });
        }
        rx.await
            .map_err(|_| anyhow::anyhow!("coordinator dropped registration"))
    }

    /// Assign a non-deterministic id, immediately when the pre-reserved
    /// range has room, otherwise at the next token pass.
    pub async fn register_act(&self, origin: ActorId) -> anyhow::Result<ActContext> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.reserved_next <= state.reserved_end {
                let tid = state.reserved_next;
                state.reserved_next += 1;
                state.acts_since_pass += 1;
                return Ok(ActContext {
                    tid,
                    coord: self.cfg.coord_id,
                    origin,
                    silo: self.cfg.silo_id,
                });
            }
            let (reply, rx) = oneshot::channel();
            state.pending_acts.push(reply);
            rx
        };
        let mut ctx = rx
            .await
            .map_err(|_| anyhow::anyhow!("coordinator dropped registration"))?;
        ctx.origin = origin;
        Ok(ctx)
    }

    /// Record the arrival of a global batch awaiting absorption.
    pub async fn deliver_global_batch(&self, batch: GlobalSubBatch) {
        let mut state = self.state.lock().await;
        let entry = state.pending_global.entry(batch.global_bid).or_default();
        assert!(
            entry.delivered.is_none(),
            "global batch {} delivered twice",
            batch.global_bid
        );
        entry.delivered = Some(batch);
    }

    /// Register one cross-silo transaction's local leg.
    pub async fn register_pact_in_silo(
        &self,
        req: GlobalPactLocalReq,
    ) -> anyhow::Result<PactContext> {
        if req.actors.is_empty() {
            anyhow::bail!("cross-silo transaction with empty local access set");
        }
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().await;
            let entry = state.pending_global.entry(req.global_bid).or_default();
            let evicted = entry.regs.insert(req.global_tid, (req, reply));
            assert!(evicted.is_none(), "cross-silo txn registered twice");
        }
        rx.await
            .map_err(|_| anyhow::anyhow!("coordinator dropped registration"))
    }

    /// Service queued work, then forward the token after the configured
    /// hold interval.
    pub async fn receive_token(self: &Arc<Self>, mut token: Token) {
        let emissions = {
            let mut state = self.state.lock().await;
            self.merge_committed(&mut state, token.highest_committed_bid);
            token.highest_committed_bid = token
                .highest_committed_bid
                .max(state.highest_committed_bid);

            let mut emissions = Vec::new();
            self.absorb_global(&mut state, &mut token, &mut emissions);
            self.emit_local(&mut state, &mut token, &mut emissions);
            self.drain_acts(&mut state, &mut token);
            emissions
        };

        let transport = self.transport();
        for emission in emissions {
            if let Err(err) = self.log.write_batch_prepare(emission.bid, &emission.tids) {
                tracing::warn!(bid = emission.bid, error = ?err, "batch prepare write failed");
            }
            for (actor, sub) in emission.subs {
                if let Err(err) = transport.deliver_sub_batch(actor, sub).await {
                    tracing::warn!(bid = emission.bid, actor, error = ?err, "sub-batch delivery failed");
                }
            }
            for (reply, ctx) in emission.pact_replies {
                let _ = reply.send(ctx);
            }
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.cfg.token_interval).await;
            let transport = this.transport();
            if let Err(err) = transport.pass_token(this.cfg.next_coord, token).await {
                tracing::warn!(error = ?err, "token forward failed, ring halted");
            }
        });
    }

    fn merge_committed(&self, state: &mut CoordState, observed: BatchId) {
        if observed <= state.highest_committed_bid {
            return;
        }
        state.highest_committed_bid = observed;
        let still_waiting = state.commit_waiters.split_off(&(observed + 1));
        for (_, signal) in std::mem::replace(&mut state.commit_waiters, still_waiting) {
            signal.fire();
        }
    }

    /// Absorb arrived global batches in global-bid order. A batch is
    /// eligible only once its declared predecessor has been absorbed by
    /// this ring and every local transaction of it has registered.
    fn absorb_global(
        &self,
        state: &mut CoordState,
        token: &mut Token,
        emissions: &mut Vec<Emission>,
    ) {
        loop {
            let eligible = {
                let Some((&gbid, pending)) = state.pending_global.first_key_value() else {
                    break;
                };
                let Some(sub) = &pending.delivered else { break };
                sub.prev_global_bid == token.last_emitted_global_bid
                    && sub
                        .global_tids
                        .iter()
                        .all(|gtid| pending.regs.contains_key(gtid))
                    && gbid == sub.global_bid
            };
            if !eligible {
                break;
            }
            let (gbid, mut pending) = state
                .pending_global
                .pop_first()
                .expect("eligible global batch exists");
            let delivered = pending.delivered.take().expect("delivered global batch");

            let (prev_bid, prev_coord) = (token.last_emit_bid, token.last_emit_coord);
            let bid = token.last_emit_bid + 1;
            token.last_emit_bid = bid;
            token.last_emit_coord = self.cfg.coord_id;
            token.last_emitted_global_bid = gbid;

            let mut emission = Emission {
                bid,
                tids: Vec::new(),
                subs: Vec::new(),
                pact_replies: Vec::new(),
            };
            let mut per_actor: HashMap<ActorId, Vec<TxnId>> = HashMap::new();
            for gtid in &delivered.global_tids {
                let (req, reply) = pending
                    .regs
                    .remove(gtid)
                    .expect("eligibility checked registration");
                token.last_emit_tid += 1;
                let tid = token.last_emit_tid;
                emission.tids.push(tid);
                for &actor in &req.actors {
                    per_actor.entry(actor).or_default().push(tid);
                }
                let mut per_silo = HashMap::new();
                per_silo.insert(self.cfg.silo_id, (bid, tid));
                emission.pact_replies.push((
                    reply,
                    PactContext {
                        bid,
                        tid,
                        coord: self.cfg.coord_id,
                        global_bid: gbid,
                        global_tid: *gtid,
                        gcoord: delivered.gcoord,
                        actors: req.actors,
                        per_silo,
                    },
                ));
            }
            self.seal_batch(
                state,
                token,
                emission,
                per_actor,
                Some((gbid, delivered.gcoord)),
                (prev_bid, prev_coord),
                emissions,
            );
        }
    }

    /// Form one batch from all queued deterministic registrations.
    fn emit_local(
        &self,
        state: &mut CoordState,
        token: &mut Token,
        emissions: &mut Vec<Emission>,
    ) {
        if state.pending_pacts.is_empty() {
            return;
        }
        let (prev_bid, prev_coord) = (token.last_emit_bid, token.last_emit_coord);
        let bid = token.last_emit_bid + 1;
        token.last_emit_bid = bid;
        token.last_emit_coord = self.cfg.coord_id;

        let mut emission = Emission {
            bid,
            tids: Vec::new(),
            subs: Vec::new(),
            pact_replies: Vec::new(),
        };
        let mut per_actor: HashMap<ActorId, Vec<TxnId>> = HashMap::new();
        for pact in state.pending_pacts.drain(..) {
            token.last_emit_tid += 1;
            let tid = token.last_emit_tid;
            emission.tids.push(tid);
            for &actor in &pact.actors {
                per_actor.entry(actor).or_default().push(tid);
            }
            let mut per_silo = HashMap::new();
            per_silo.insert(self.cfg.silo_id, (bid, tid));
            emission.pact_replies.push((
                pact.reply,
                PactContext {
                    bid,
                    tid,
                    coord: self.cfg.coord_id,
                    global_bid: NO_BATCH,
                    global_tid: -1,
                    gcoord: 0,
                    actors: pact.actors,
                    per_silo,
                },
            ));
        }
        self.seal_batch(
            state,
            token,
            emission,
            per_actor,
            None,
            (prev_bid, prev_coord),
            emissions,
        );
    }

    /// Fan a formed batch into per-actor sub-batches, wiring per-actor
    /// predecessors from the token's touch map, and record it for commit
    /// tracking.
    #[allow(clippy::too_many_arguments)]
    fn seal_batch(
        &self,
        state: &mut CoordState,
        token: &mut Token,
        mut emission: Emission,
        per_actor: HashMap<ActorId, Vec<TxnId>>,
        global: Option<(BatchId, CoordId)>,
        ring_prev: (BatchId, CoordId),
        emissions: &mut Vec<Emission>,
    ) {
        let bid = emission.bid;
        let mut bid_map = HashMap::new();
        if let Some((gbid, _)) = global {
            bid_map.insert(bid, gbid);
        }
        let mut actors: Vec<ActorId> = Vec::with_capacity(per_actor.len());
        for (actor, tids) in per_actor {
            let prev_bid = token.last_touch.get(&actor).copied().unwrap_or(NO_BATCH);
            token.last_touch.insert(actor, bid);
            actors.push(actor);
            emission.subs.push((
                actor,
                SubBatch {
                    bid,
                    prev_bid,
                    coord: self.cfg.coord_id,
                    tids,
                    highest_committed_bid: token.highest_committed_bid,
                    global_bid: global.map(|(gbid, _)| gbid).unwrap_or(NO_BATCH),
                    bid_map: bid_map.clone(),
                },
            ));
        }
        tracing::debug!(
            bid,
            txns = emission.tids.len(),
            actors = actors.len(),
            "emitting batch"
        );
        state.batches.insert(
            bid,
            BatchRecord {
                prev_bid: ring_prev.0,
                prev_coord: ring_prev.1,
                pending_acks: actors.len(),
                actors,
                global,
            },
        );
        emissions.push(emission);
    }

    /// Hand queued non-deterministic registrations their ids and pre-reserve
    /// a range for the next round from a smoothed arrival estimate.
    fn drain_acts(&self, state: &mut CoordState, token: &mut Token) {
        let drained = state.acts_since_pass + state.pending_acts.len() as u64;
        for reply in state.pending_acts.drain(..) {
            token.last_emit_tid += 1;
            let _ = reply.send(ActContext {
                tid: token.last_emit_tid,
                coord: self.cfg.coord_id,
                origin: 0,
                silo: self.cfg.silo_id,
            });
        }
        state.act_ema =
            (1.0 - ACT_RESERVE_SMOOTHING) * state.act_ema + ACT_RESERVE_SMOOTHING * drained as f64;
        state.acts_since_pass = 0;
        let reserve = state.act_ema.ceil() as i64;
        state.reserved_next = token.last_emit_tid + 1;
        state.reserved_end = token.last_emit_tid + reserve;
        token.last_emit_tid += reserve;
    }

    /// One actor finished its sub-batch of `bid`.
    pub async fn handle_ack(self: &Arc<Self>, bid: BatchId) {
        let ready = {
            let mut state = self.state.lock().await;
            let record = state
                .batches
                .get_mut(&bid)
                .unwrap_or_else(|| panic!("ack for unknown batch {bid}"));
            record.pending_acks -= 1;
            record.pending_acks == 0
        };
        if ready {
            let this = self.clone();
            tokio::spawn(async move { this.drive_commit(bid).await });
        }
    }

    /// Wait for the ring predecessor to commit, then declare `bid`
    /// committed, notify its actors, and garbage-collect the record.
    async fn drive_commit(self: Arc<Self>, bid: BatchId) {
        let (prev_bid, prev_coord) = {
            let state = self.state.lock().await;
            let record = state.batches.get(&bid).expect("batch record exists");
            (record.prev_bid, record.prev_coord)
        };

        if prev_bid != NO_BATCH {
            if prev_coord == self.cfg.coord_id {
                self.wait_batch_committed(prev_bid).await;
            } else if let Err(err) = self
                .transport()
                .wait_batch_committed(prev_coord, prev_bid)
                .await
            {
                tracing::warn!(bid, prev_bid, error = ?err, "predecessor commit wait failed");
                return;
            }
        }

        let (actors, global, highest) = {
            let mut state = self.state.lock().await;
            let record = state.batches.remove(&bid).expect("batch record exists");
            // The predecessor wait above established ring order; the local
            // view may lag behind other coordinators' commits, but it can
            // never run ahead of this batch.
            assert!(
                bid > state.highest_committed_bid,
                "batch {bid} committing out of ring order behind {}",
                state.highest_committed_bid
            );
            self.merge_committed(&mut state, bid);
            (record.actors, record.global, state.highest_committed_bid)
        };

        if let Err(err) = self.log.write_batch_commit(bid) {
            tracing::warn!(bid, error = ?err, "batch commit write failed");
        }
        tracing::debug!(bid, "batch committed");

        let transport = self.transport();
        for actor in actors {
            if let Err(err) = transport.notify_batch_committed(actor, bid, highest).await {
                tracing::warn!(bid, actor, error = ?err, "commit notice delivery failed");
            }
        }
        if let Some((gbid, gcoord)) = global {
            if let Err(err) = transport
                .ack_global_batch(gcoord, gbid, self.cfg.silo_id)
                .await
            {
                tracing::warn!(bid, gbid, error = ?err, "global ack delivery failed");
            }
        }
    }

    /// Resolve once this coordinator knows `bid` committed.
    pub async fn wait_batch_committed(&self, bid: BatchId) {
        let signal = {
            let mut state = self.state.lock().await;
            if bid <= state.highest_committed_bid {
                return;
            }
            state
                .commit_waiters
                .entry(bid)
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
                "coordinator {id}: {} batches awaiting commit",
                state.batches.len()
            ));
        }
        if !state.commit_waiters.is_empty() {
            issues.push(format!(
                "coordinator {id}: {} commit waiters outstanding",
                state.commit_waiters.len()
            ));
        }
        if !state.pending_global.is_empty() {
            issues.push(format!(
                "coordinator {id}: {} global batches unabsorbed",
                state.pending_global.len()
            ));
        }
        if !state.pending_pacts.is_empty() || !state.pending_acts.is_empty() {
            issues.push(format!("coordinator {id}: registrations still queued"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use super::super::token::GlobalToken;
    use super::super::types::{CallReply, CallRequest, ExecInfo, GlobalPactContext};

    struct NullLog;

    impl TxnLog for NullLog {
        fn write_before_prepare(&self, _tid: TxnId, _writers: &[ActorId]) -> anyhow::Result<()> {
            Ok(())
        }
        fn write_commit(&self, _tid: TxnId) -> anyhow::Result<()> {
            Ok(())
        }
        fn write_abort(&self, _tid: TxnId) -> anyhow::Result<()> {
            Ok(())
        }
        fn write_batch_prepare(&self, _bid: BatchId, _tids: &[TxnId]) -> anyhow::Result<()> {
            Ok(())
        }
        fn write_batch_commit(&self, _bid: BatchId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Captures forwarded tokens and delivered sub-batches instead of
    /// routing them, so token rounds can be driven by hand.
    #[derive(Default)]
    struct StubTransport {
        tokens: StdMutex<Vec<Token>>,
        subs: StdMutex<Vec<(ActorId, SubBatch)>>,
    }

    #[async_trait::async_trait]
    impl Transport for StubTransport {
        fn silo_of(&self, _actor: ActorId) -> Option<SiloId> {
            Some(0)
        }
        async fn pass_token(&self, _target: CoordId, token: Token) -> anyhow::Result<()> {
            self.tokens.lock().expect("stub poisoned").push(token);
            Ok(())
        }
        async fn pass_global_token(
            &self,
            _target: CoordId,
            _token: GlobalToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn register_pact(
            &self,
            _coord: CoordId,
            _actors: Vec<ActorId>,
        ) -> anyhow::Result<PactContext> {
            unreachable!("coordinator never registers")
        }
        async fn register_act(
            &self,
            _coord: CoordId,
            _origin: ActorId,
        ) -> anyhow::Result<ActContext> {
            unreachable!("coordinator never registers")
        }
        async fn register_global_pact(
            &self,
            _gcoord: CoordId,
            _silos: Vec<SiloId>,
        ) -> anyhow::Result<GlobalPactContext> {
            unreachable!("coordinator never registers")
        }
        async fn register_pact_in_silo(
            &self,
            _coord: CoordId,
            _req: GlobalPactLocalReq,
        ) -> anyhow::Result<PactContext> {
            unreachable!("coordinator never registers")
        }
        async fn deliver_sub_batch(&self, actor: ActorId, sub: SubBatch) -> anyhow::Result<()> {
            self.subs.lock().expect("stub poisoned").push((actor, sub));
            Ok(())
        }
        async fn notify_batch_committed(
            &self,
            _actor: ActorId,
            _bid: BatchId,
            _highest: BatchId,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn ack_batch_complete(&self, _coord: CoordId, _bid: BatchId) -> anyhow::Result<()> {
            unreachable!("actors ack in the other direction")
        }
        async fn wait_batch_committed(&self, _coord: CoordId, _bid: BatchId) -> anyhow::Result<()> {
            Ok(())
        }
        async fn deliver_global_batch(
            &self,
            _coord: CoordId,
            _batch: GlobalSubBatch,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn ack_global_batch(
            &self,
            _gcoord: CoordId,
            _global_bid: BatchId,
            _silo: SiloId,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn wait_global_committed(
            &self,
            _gcoord: CoordId,
            _global_bid: BatchId,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn call_actor(
            &self,
            _actor: ActorId,
            _req: CallRequest,
        ) -> anyhow::Result<CallReply> {
            unreachable!("coordinator never calls actors")
        }
        async fn finish_det(&self, _actor: ActorId, _ctx: PactContext) -> anyhow::Result<()> {
            unreachable!("coordinator never finishes transactions")
        }
        async fn exec_info(&self, _actor: ActorId, _tid: TxnId) -> anyhow::Result<ExecInfo> {
            unreachable!("coordinator never gathers bounds")
        }
        async fn prepare(&self, _actor: ActorId, _tid: TxnId) -> anyhow::Result<bool> {
            unreachable!("coordinator never prepares")
        }
        async fn commit(&self, _actor: ActorId, _tid: TxnId) -> anyhow::Result<()> {
            unreachable!("coordinator never commits actors")
        }
        async fn abort(&self, _actor: ActorId, _tid: TxnId) -> anyhow::Result<()> {
            unreachable!("coordinator never aborts actors")
        }
    }

    fn coordinator(stub: &Arc<StubTransport>) -> Arc<Coordinator> {
        let coordinator = Coordinator::new(
            CoordinatorConfig {
                coord_id: 1,
                silo_id: 0,
                next_coord: 1,
                token_interval: Duration::from_millis(1),
            },
            Arc::new(NullLog),
        );
        coordinator.connect(stub.clone());
        coordinator
    }

    async fn next_token(stub: &Arc<StubTransport>) -> Token {
        for _ in 0..200 {
            if let Some(token) = stub.tokens.lock().expect("stub poisoned").pop() {
                return token;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("token was never forwarded");
    }

    #[tokio::test]
    async fn token_pass_batches_and_links_predecessors() {
        let stub = Arc::new(StubTransport::default());
        let coordinator = coordinator(&stub);

        let registration = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_pact(vec![1, 2]).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.receive_token(Token::new()).await;

        let ctx = registration.await.expect("task").expect("registration");
        assert_eq!((ctx.bid, ctx.tid), (0, 0));
        assert_eq!(ctx.per_silo.get(&0), Some(&(0, 0)));

        let token = next_token(&stub).await;
        assert_eq!(token.last_emit_bid, 0);
        assert_eq!(token.last_emit_coord, 1);
        assert_eq!(token.last_touch.get(&1), Some(&0));
        assert_eq!(token.last_touch.get(&2), Some(&0));

        // The next batch touching actor 2 declares batch 0 as its
        // per-actor predecessor.
        let registration = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_pact(vec![2]).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.receive_token(token).await;
        let ctx = registration.await.expect("task").expect("registration");
        assert_eq!(ctx.bid, 1);

        let subs = stub.subs.lock().expect("stub poisoned");
        let (_, sub) = subs
            .iter()
            .find(|(actor, sub)| *actor == 2 && sub.bid == 1)
            .expect("second sub-batch delivered");
        assert_eq!(sub.prev_bid, 0);
        let (_, first) = subs
            .iter()
            .find(|(actor, sub)| *actor == 2 && sub.bid == 0)
            .expect("first sub-batch delivered");
        assert_eq!(first.prev_bid, NO_BATCH);
    }

    #[tokio::test]
    async fn act_ids_follow_the_pact_range_and_reserve_ahead() {
        let stub = Arc::new(StubTransport::default());
        let coordinator = coordinator(&stub);

        let pact = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_pact(vec![5]).await })
        };
        let act = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_act(5).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        coordinator.receive_token(Token::new()).await;

        let pact_ctx = pact.await.expect("task").expect("registration");
        let act_ctx = act.await.expect("task").expect("registration");
        assert_eq!(pact_ctx.tid, 0);
        // The queued act id follows the deterministic range.
        assert_eq!(act_ctx.tid, 1);
        assert_eq!(act_ctx.origin, 5);

        // One act was drained, so one id is pre-reserved and served
        // without waiting for the token.
        let reserved = coordinator.register_act(6).await.expect("reserved id");
        assert_eq!(reserved.tid, 2);

        // The reservation is spent; the next registration queues again.
        let queued = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.register_act(7).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!queued.is_finished());

        let token = next_token(&stub).await;
        assert_eq!(token.last_emit_tid, 2, "reservation advanced the token");
        coordinator.receive_token(token).await;
        let ctx = queued.await.expect("task").expect("registration");
        assert_eq!(ctx.tid, 3);
    }
}

