//! Transactional actor shell.
//!
//! Owns the committed state cell, the handler registry, the schedule graph,
//! and the per-actor executors, and exposes the business-facing
//! `start_transaction` surface: an access set present means a deterministic
//! transaction, absent means a non-deterministic one. Handlers are explicit
//! named closures validated at build time; dispatch never goes through
//! reflection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;

use super::cc::{build_engine, CcStrategy, ConcurrencyControl, StateCell};
use super::det::DetExecutor;
use super::graph::ScheduleGraph;
use super::nondet::Committer;
use super::token::SubBatch;
use super::types::{
    ActRole, ActorId, ActorShell, ActorState, BatchId, CallReply, CallRequest, CoordId, ExecInfo,
    GlobalPactLocalReq, PactContext, SiloId, Transport, TxnContext, TxnError, TxnId, TxnLog,
    TxnResult, Value, NO_BATCH, NO_TXN,
};

type HandlerFn<S> =
    Arc<dyn Fn(TxnHandle<S>, Value) -> BoxFuture<'static, Result<Value, TxnError>> + Send + Sync>;

type TouchedMap = Arc<std::sync::Mutex<HashMap<ActorId, ActRole>>>;

#[derive(Clone, Debug)]
pub struct ActorConfig {
    pub actor_id: ActorId,
    pub silo_id: SiloId,
    /// Home local coordinator for registrations.
    pub coord: CoordId,
    /// Global coordinator for cross-silo registrations, if deployed.
    pub gcoord: Option<CoordId>,
    /// Bound on waiting for a non-deterministic schedule turn; past it the
    /// admission is abandoned rather than retried.
    pub deadlock_window: Duration,
}

pub struct ActorBuilder<S: ActorState> {
    cfg: ActorConfig,
    initial: S,
    strategy: CcStrategy,
    handlers: Vec<(String, HandlerFn<S>)>,
}

impl<S: ActorState> ActorBuilder<S> {
    pub fn new(cfg: ActorConfig) -> Self {
        Self {
            cfg,
            initial: S::default(),
            strategy: CcStrategy::S2pl,
            handlers: Vec::new(),
        }
    }

    pub fn initial_state(mut self, value: S) -> Self {
        self.initial = value;
        self
    }

    pub fn strategy(mut self, strategy: CcStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn handler<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(TxnHandle<S>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, TxnError>> + Send + 'static,
    {
        self.handlers.push((
            name.to_string(),
            Arc::new(move |handle, input| handler(handle, input).boxed()),
        ));
        self
    }

    pub fn build(self, log: Arc<dyn TxnLog>) -> anyhow::Result<Arc<TransactionalActor<S>>> {
        let mut handlers = HashMap::new();
        for (name, handler) in self.handlers {
            if handlers.insert(name.clone(), handler).is_some() {
                anyhow::bail!("duplicate handler {name}");
            }
        }
        let cell = Arc::new(StateCell::new(self.initial));
        let cc = build_engine(self.strategy, cell.clone());
        Ok(Arc::new_cyclic(|weak| TransactionalActor {
            cfg: self.cfg,
            weak: weak.clone(),
            transport: OnceLock::new(),
            log,
            cell,
            cc,
            handlers,
            graph: std::sync::Mutex::new(ScheduleGraph::new()),
            det: DetExecutor::new(),
        }))
    }
}

pub struct TransactionalActor<S: ActorState> {
    cfg: ActorConfig,
    weak: Weak<Self>,
    transport: OnceLock<Arc<dyn Transport>>,
    log: Arc<dyn TxnLog>,
    cell: Arc<StateCell<S>>,
    cc: Arc<dyn ConcurrencyControl<S>>,
    handlers: HashMap<String, HandlerFn<S>>,
    graph: std::sync::Mutex<ScheduleGraph>,
    det: DetExecutor,
}

impl<S: ActorState> TransactionalActor<S> {
    pub fn builder(cfg: ActorConfig) -> ActorBuilder<S> {
        ActorBuilder::new(cfg)
    }

    pub fn connect(&self, transport: Arc<dyn Transport>) {
        if self.transport.set(transport).is_err() {
            panic!("actor transport wired twice");
        }
    }

    /// Committed state, outside any transaction. Intended for inspection
    /// after the system settles.
    pub fn committed_state(&self) -> S {
        self.cell.snapshot()
    }

    fn transport(&self) -> Arc<dyn Transport> {
        self.transport.get().expect("transport wired").clone()
    }

    fn strong(&self) -> Arc<Self> {
        self.weak.upgrade().expect("actor alive while handling")
    }

    fn lock_graph(&self) -> std::sync::MutexGuard<'_, ScheduleGraph> {
        self.graph.lock().expect("schedule graph poisoned")
    }

    /// Entry point for business logic. An access set present means a
    /// deterministic transaction, absent a non-deterministic one.
    pub async fn start_transaction(
        self: &Arc<Self>,
        func: &str,
        input: Value,
        access_set: Option<Vec<ActorId>>,
    ) -> TxnResult {
        match access_set {
            Some(actors) => self.start_pact(func, input, actors).await,
            None => self.start_act(func, input).await,
        }
    }

    async fn start_pact(self: &Arc<Self>, func: &str, input: Value, actors: Vec<ActorId>) -> TxnResult {
        let mut actors = actors;
        if !actors.contains(&self.cfg.actor_id) {
            actors.push(self.cfg.actor_id);
        }
        actors.sort_unstable();
        actors.dedup();
        let transport = self.transport();

        let mut by_silo: BTreeMap<SiloId, Vec<ActorId>> = BTreeMap::new();
        for &actor in &actors {
            match transport.silo_of(actor) {
                Some(silo) => by_silo.entry(silo).or_default().push(actor),
                None => {
                    return TxnResult {
                        tid: NO_TXN,
                        outcome: Err(TxnError::RemoteCallFailure(format!(
                            "unknown actor {actor}"
                        ))),
                        bounds: None,
                    }
                }
            }
        }

        let registered = if by_silo.len() == 1 {
            transport.register_pact(self.cfg.coord, actors.clone()).await
        } else {
            self.register_cross_silo(&actors, &by_silo).await
        };
        let ctx = match registered {
            Ok(ctx) => ctx,
            Err(err) => {
                return TxnResult {
                    tid: NO_TXN,
                    outcome: Err(TxnError::RemoteCallFailure(err.to_string())),
                    bounds: None,
                }
            }
        };

        let touched: TouchedMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let outcome = self
            .run_in_txn(&TxnContext::Pact(ctx.clone()), func, input, touched)
            .await;

        // Every declared actor learns completion, whether or not the logic
        // reached it; sub-batches drain and the coordinator gets acked.
        for &actor in &ctx.actors {
            if let Err(err) = transport.finish_det(actor, ctx.clone()).await {
                tracing::warn!(tid = ctx.tid, actor, error = ?err, "det completion delivery failed");
            }
        }

        let wait = if ctx.global_bid != NO_BATCH {
            transport
                .wait_global_committed(ctx.gcoord, ctx.global_bid)
                .await
        } else {
            transport.wait_batch_committed(ctx.coord, ctx.bid).await
        };
        let outcome = match wait {
            Ok(()) => outcome,
            Err(err) => Err(TxnError::RemoteCallFailure(err.to_string())),
        };
        TxnResult {
            tid: ctx.tid,
            outcome,
            bounds: None,
        }
    }

    /// Register a cross-silo transaction: global ids first, then one local
    /// leg per silo, concurrently. The merged context carries every silo's
    /// id assignment so callees anywhere can find their schedule slot.
    async fn register_cross_silo(
        &self,
        actors: &[ActorId],
        by_silo: &BTreeMap<SiloId, Vec<ActorId>>,
    ) -> anyhow::Result<PactContext> {
        let transport = self.transport();
        let Some(gcoord) = self.cfg.gcoord else {
            anyhow::bail!("no global coordinator configured for cross-silo access set");
        };
        let silos: Vec<SiloId> = by_silo.keys().copied().collect();
        let gctx = transport.register_global_pact(gcoord, silos).await?;

        let mut regs = FuturesUnordered::new();
        for (&silo, silo_actors) in by_silo {
            let coord = *gctx
                .coord_per_silo
                .get(&silo)
                .context("global registration chose a coordinator per silo")?;
            let transport = transport.clone();
            let req = GlobalPactLocalReq {
                global_bid: gctx.global_bid,
                global_tid: gctx.global_tid,
                actors: silo_actors.clone(),
            };
            regs.push(async move { (silo, transport.register_pact_in_silo(coord, req).await) });
        }
        let mut per_silo = HashMap::new();
        let mut own: Option<PactContext> = None;
        while let Some((silo, result)) = regs.next().await {
            let ctx = result?;
            let ids = ctx.ids_in(silo).context("silo registration carries ids")?;
            per_silo.insert(silo, ids);
            if silo == self.cfg.silo_id {
                own = Some(ctx);
            }
        }
        let own = own.context("origin silo registration resolved")?;

        Ok(PactContext {
            bid: own.bid,
            tid: own.tid,
            coord: own.coord,
            global_bid: gctx.global_bid,
            global_tid: gctx.global_tid,
            gcoord,
            actors: actors.to_vec(),
            per_silo,
        })
    }

    async fn start_act(self: &Arc<Self>, func: &str, input: Value) -> TxnResult {
        let transport = self.transport();
        let ctx = match transport
            .register_act(self.cfg.coord, self.cfg.actor_id)
            .await
        {
            Ok(ctx) => ctx,
            Err(err) => {
                return TxnResult {
                    tid: NO_TXN,
                    outcome: Err(TxnError::RemoteCallFailure(err.to_string())),
                    bounds: None,
                }
            }
        };

        let touched: TouchedMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let outcome = self
            .run_in_txn(&TxnContext::Act(ctx), func, input, touched.clone())
            .await;
        merge_touched(&touched, self.cfg.actor_id, self.cc.role(ctx.tid));
        let participants: Vec<(ActorId, ActRole)> = touched
            .lock()
            .expect("touched map poisoned")
            .iter()
            .map(|(&actor, &role)| (actor, role))
            .collect();

        let committer = Committer {
            transport: transport.clone(),
            log: self.log.clone(),
        };
        match outcome {
            Err(err) => {
                committer
                    .abort_participants(ctx.tid, participants.iter().map(|&(actor, _)| actor))
                    .await;
                TxnResult {
                    tid: ctx.tid,
                    outcome: Err(err),
                    bounds: None,
                }
            }
            Ok(value) => {
                let highest = self.lock_graph().highest_committed();
                match committer.commit_act(&ctx, &participants, highest).await {
                    Ok(bounds) => TxnResult {
                        tid: ctx.tid,
                        outcome: Ok(value),
                        bounds: Some(bounds),
                    },
                    Err(err) => TxnResult {
                        tid: ctx.tid,
                        outcome: Err(err),
                        bounds: None,
                    },
                }
            }
        }
    }

    /// Admit the transaction on this actor, then run the named handler.
    async fn run_in_txn(
        &self,
        ctx: &TxnContext,
        func: &str,
        input: Value,
        touched: TouchedMap,
    ) -> Result<Value, TxnError> {
        let handler = self
            .handlers
            .get(func)
            .cloned()
            .ok_or_else(|| TxnError::Application(format!("no handler named {func}")))?;

        match ctx {
            TxnContext::Pact(pact) => {
                if !pact.actors.contains(&self.cfg.actor_id) {
                    return Err(TxnError::ReadWriteConflict(format!(
                        "actor {} is not in the declared access set",
                        self.cfg.actor_id
                    )));
                }
                let Some((bid, tid)) = pact.ids_in(self.cfg.silo_id) else {
                    return Err(TxnError::ReadWriteConflict(
                        "transaction is not scheduled in this silo".to_string(),
                    ));
                };
                self.det.wait_turn(bid, tid).await?;
            }
            TxnContext::Act(act) => self.ensure_admitted(act.tid).await?,
        }

        let handle = TxnHandle {
            actor: self.strong(),
            ctx: ctx.clone(),
            touched,
        };
        handler(handle, input).await
    }

    /// Join the schedule graph, bounded by the deadlock-detection window.
    /// On timeout the admission is abandoned and cleaned up, not retried.
    async fn ensure_admitted(&self, tid: TxnId) -> Result<(), TxnError> {
        let gate = {
            let mut graph = self.lock_graph();
            if graph.act_member(tid) {
                graph.act_gate(tid)
            } else {
                graph.join_nondet(tid)
            }
        };
        match tokio::time::timeout(self.cfg.deadlock_window, gate.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.lock_graph().leave_nondet(tid);
                Err(TxnError::DeadlockAvoidance(tid))
            }
        }
    }
}

#[async_trait]
impl<S: ActorState> ActorShell for TransactionalActor<S> {
    fn actor_id(&self) -> ActorId {
        self.cfg.actor_id
    }

    fn silo_id(&self) -> SiloId {
        self.cfg.silo_id
    }

    async fn deliver_sub_batch(&self, sub: SubBatch) {
        let gate = {
            let mut graph = self.lock_graph();
            graph.observe_committed(sub.highest_committed_bid);
            graph.insert_det(sub.bid, sub.prev_bid);
            graph.det_gate(sub.bid)
        };
        self.det.accept(&sub, gate);
    }

    async fn on_batch_committed(&self, bid: BatchId, highest_committed_bid: BatchId) {
        self.lock_graph()
            .mark_det_committed(bid, highest_committed_bid);
    }

    async fn execute_call(&self, req: CallRequest) -> CallReply {
        let touched: TouchedMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let result = self
            .run_in_txn(&req.ctx, &req.func, req.input, touched.clone())
            .await;
        if let TxnContext::Act(act) = &req.ctx {
            merge_touched(&touched, self.cfg.actor_id, self.cc.role(act.tid));
        }
        let touched = touched
            .lock()
            .expect("touched map poisoned")
            .iter()
            .map(|(&actor, &role)| (actor, role))
            .collect();
        CallReply { result, touched }
    }

    async fn finish_det(&self, ctx: PactContext) {
        let Some((bid, tid)) = ctx.ids_in(self.cfg.silo_id) else {
            tracing::warn!(tid = ctx.tid, "det completion addressed to foreign silo");
            return;
        };
        if let Some(coord) = self.det.finish(bid, tid) {
            if let Err(err) = self.transport().ack_batch_complete(coord, bid).await {
                tracing::warn!(bid, error = ?err, "batch ack delivery failed");
            }
        }
    }

    async fn exec_info(&self, tid: TxnId) -> ExecInfo {
        let bounds = {
            let graph = self.lock_graph();
            graph.act_bounds(tid)
        };
        ExecInfo {
            before_bid: bounds.before_bid,
            after_bid: bounds.after_bid,
            after_known: bounds.after_known,
            role: self.cc.role(tid),
        }
    }

    async fn prepare(&self, tid: TxnId) -> bool {
        let role = self.cc.role(tid);
        let vote = self.cc.prepare(tid).await;
        if role != ActRole::Writer {
            // Read-only participants release at prepare; only writers stay
            // admitted for the decision round.
            self.lock_graph().leave_nondet(tid);
        }
        vote
    }

    async fn commit_txn(&self, tid: TxnId) {
        self.cc.commit(tid);
        self.lock_graph().leave_nondet(tid);
    }

    async fn abort_txn(&self, tid: TxnId) {
        self.cc.abort(tid);
        self.lock_graph().leave_nondet(tid);
    }

    fn gc_health(&self, issues: &mut Vec<String>) {
        let id = self.cfg.actor_id;
        self.lock_graph().gc_health(id, issues);
        self.det.gc_health(id, issues);
        self.cc.gc_health(id, issues);
    }
}

/// Capability handle passed to business-logic handlers.
pub struct TxnHandle<S: ActorState> {
    actor: Arc<TransactionalActor<S>>,
    ctx: TxnContext,
    touched: TouchedMap,
}

impl<S: ActorState> TxnHandle<S> {
    pub fn tid(&self) -> TxnId {
        self.ctx.tid()
    }

    pub fn actor_id(&self) -> ActorId {
        self.actor.cfg.actor_id
    }

    /// Batch id assigned in this actor's silo, `NO_BATCH` for
    /// non-deterministic transactions.
    pub fn bid(&self) -> BatchId {
        match &self.ctx {
            TxnContext::Pact(pact) => pact
                .ids_in(self.actor.cfg.silo_id)
                .map(|(bid, _)| bid)
                .unwrap_or(NO_BATCH),
            TxnContext::Act(_) => NO_BATCH,
        }
    }

    /// Read this actor's state. Deterministic transactions read the
    /// committed value directly, their order is fixed by the schedule;
    /// non-deterministic ones go through concurrency-control admission.
    pub async fn read(&self) -> Result<S, TxnError> {
        match &self.ctx {
            TxnContext::Pact(_) => Ok(self.actor.cell.snapshot()),
            TxnContext::Act(act) => {
                let value = self.actor.cc.read(act.tid).await?;
                self.record(self.actor.cfg.actor_id, ActRole::Reader);
                Ok(value)
            }
        }
    }

    /// Obtain a writable working copy of this actor's state.
    pub async fn read_write(&self) -> Result<S, TxnError> {
        match &self.ctx {
            TxnContext::Pact(_) => Ok(self.actor.cell.snapshot()),
            TxnContext::Act(act) => {
                let value = self.actor.cc.read_write(act.tid).await?;
                self.record(self.actor.cfg.actor_id, ActRole::Writer);
                Ok(value)
            }
        }
    }

    /// Store the working copy obtained from `read_write`. Deterministic
    /// transactions install directly into committed state.
    pub fn write(&self, value: S) {
        match &self.ctx {
            TxnContext::Pact(_) => self.actor.cell.install(value),
            TxnContext::Act(act) => {
                self.actor.cc.stage(act.tid, value);
                self.record(self.actor.cfg.actor_id, ActRole::Writer);
            }
        }
    }

    /// Call another actor inside this transaction.
    pub async fn call(&self, actor: ActorId, func: &str, input: Value) -> Result<Value, TxnError> {
        if let TxnContext::Pact(pact) = &self.ctx {
            if !pact.actors.contains(&actor) {
                return Err(TxnError::ReadWriteConflict(format!(
                    "actor {actor} is not in the declared access set"
                )));
            }
        }
        let req = CallRequest {
            ctx: self.ctx.clone(),
            func: func.to_string(),
            input,
        };
        let reply = self
            .actor
            .transport()
            .call_actor(actor, req)
            .await
            .map_err(|err| TxnError::RemoteCallFailure(err.to_string()))?;
        if matches!(self.ctx, TxnContext::Act(_)) {
            for &(actor, role) in &reply.touched {
                self.record(actor, role);
            }
        }
        reply.result
    }

    fn record(&self, actor: ActorId, role: ActRole) {
        merge_touched(&self.touched, actor, role);
    }
}

fn merge_touched(touched: &TouchedMap, actor: ActorId, role: ActRole) {
    let mut map = touched.lock().expect("touched map poisoned");
    let entry = map.entry(actor).or_insert(role);
    *entry = (*entry).max(role);
}
