//! Grid assembly and in-memory transport.
//!
//! Builds the coordinator rings (one local ring per silo, optionally a
//! global ring), hands out actor homes, and routes every kernel transport
//! call to the target component by direct async call. Stopping the grid
//! drops the circulating tokens, which halts batch emission exactly the way
//! token loss would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tessera_txn::txn::{
    ActContext, ActorConfig, ActorId, ActorShell, ActorState, BatchId, CallReply, CallRequest,
    CoordId, Coordinator, CoordinatorConfig, ExecInfo, GlobalCoordinator,
    GlobalCoordinatorConfig, GlobalPactContext, GlobalPactLocalReq, GlobalSubBatch, GlobalToken,
    PactContext, SiloId, SubBatch, Token, TransactionalActor, Transport, TxnContext, TxnId,
};

use crate::log::MemoryTxnLog;

#[derive(Clone, Debug)]
pub struct GridConfig {
    pub silos: u32,
    pub coords_per_silo: usize,
    /// Global coordinators; zero deploys a single-tier grid.
    pub global_coords: usize,
    /// Token hold time per coordinator, the batch-size/latency knob.
    pub token_interval: Duration,
    /// Deadlock-detection window for non-deterministic schedule admission.
    pub deadlock_window: Duration,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            silos: 1,
            coords_per_silo: 2,
            global_coords: 0,
            token_interval: Duration::from_millis(2),
            deadlock_window: Duration::from_secs(2),
        }
    }
}

/// Base id for global coordinators, clear of any local ring's ids.
const GLOBAL_COORD_BASE: CoordId = 1_000_000;

pub struct Grid {
    cfg: GridConfig,
    transport: Arc<GridTransport>,
    log: Arc<MemoryTxnLog>,
    /// Per-silo round-robin cursor for actor home assignment.
    next_home: std::sync::Mutex<HashMap<SiloId, usize>>,
}

impl Grid {
    pub fn new(cfg: GridConfig) -> Arc<Self> {
        assert!(cfg.silos >= 1, "grid needs at least one silo");
        assert!(
            cfg.coords_per_silo >= 1,
            "grid needs at least one coordinator per silo"
        );
        let log = MemoryTxnLog::new();

        let mut coords: HashMap<CoordId, Arc<Coordinator>> = HashMap::new();
        let mut silo_coords: HashMap<SiloId, Vec<CoordId>> = HashMap::new();
        let mut next_id: CoordId = 0;
        for silo in 0..cfg.silos {
            let ids: Vec<CoordId> =
                (0..cfg.coords_per_silo).map(|i| next_id + i as CoordId).collect();
            next_id += cfg.coords_per_silo as CoordId;
            for (idx, &coord_id) in ids.iter().enumerate() {
                let next_coord = ids[(idx + 1) % ids.len()];
                let coordinator = Coordinator::new(
                    CoordinatorConfig {
                        coord_id,
                        silo_id: silo,
                        next_coord,
                        token_interval: cfg.token_interval,
                    },
                    log.clone(),
                );
                coords.insert(coord_id, coordinator);
            }
            silo_coords.insert(silo, ids);
        }

        let mut gcoords: HashMap<CoordId, Arc<GlobalCoordinator>> = HashMap::new();
        if cfg.global_coords > 0 {
            let ids: Vec<CoordId> = (0..cfg.global_coords)
                .map(|i| GLOBAL_COORD_BASE + i as CoordId)
                .collect();
            for (idx, &coord_id) in ids.iter().enumerate() {
                let next_coord = ids[(idx + 1) % ids.len()];
                let coordinator = GlobalCoordinator::new(
                    GlobalCoordinatorConfig {
                        coord_id,
                        next_coord,
                        token_interval: cfg.token_interval,
                        local_coords: silo_coords.clone(),
                    },
                    log.clone(),
                );
                gcoords.insert(coord_id, coordinator);
            }
        }

        let transport = Arc::new(GridTransport {
            coords,
            gcoords,
            silo_coords,
            actors: std::sync::RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        });
        for coordinator in transport.coords.values() {
            coordinator.connect(transport.clone());
        }
        for coordinator in transport.gcoords.values() {
            coordinator.connect(transport.clone());
        }

        Arc::new(Self {
            cfg,
            transport,
            log,
            next_home: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn log(&self) -> Arc<MemoryTxnLog> {
        self.log.clone()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Configuration for a new actor in `silo`: a home coordinator chosen
    /// round-robin and the grid's admission window.
    pub fn actor_config(&self, silo: SiloId, actor_id: ActorId) -> ActorConfig {
        let homes = &self.transport.silo_coords[&silo];
        let mut cursor = self.next_home.lock().expect("home cursor poisoned");
        let slot = cursor.entry(silo).or_insert(0);
        let coord = homes[*slot % homes.len()];
        *slot += 1;
        ActorConfig {
            actor_id,
            silo_id: silo,
            coord,
            gcoord: self
                .transport
                .gcoords
                .keys()
                .min()
                .copied(),
            deadlock_window: self.cfg.deadlock_window,
        }
    }

    /// Add a built actor to the routing table and wire its transport.
    pub fn register<S: ActorState>(
        &self,
        actor: Arc<TransactionalActor<S>>,
    ) -> anyhow::Result<()> {
        let shell: Arc<dyn ActorShell> = actor.clone();
        if !self.transport.silo_coords.contains_key(&shell.silo_id()) {
            anyhow::bail!("unknown silo {}", shell.silo_id());
        }
        {
            let mut actors = self.transport.actors.write().expect("actor table poisoned");
            if actors.contains_key(&shell.actor_id()) {
                anyhow::bail!("actor {} registered twice", shell.actor_id());
            }
            actors.insert(shell.actor_id(), shell);
        }
        actor.connect(self.transport.clone());
        Ok(())
    }

    /// Inject one token per ring and start circulation.
    pub async fn start(&self) {
        for ids in self.transport.silo_coords.values() {
            let first = self.transport.coords[&ids[0]].clone();
            first.receive_token(Token::new()).await;
        }
        if let Some(first) = self.transport.gcoords.keys().min().copied() {
            let coordinator = self.transport.gcoords[&first].clone();
            coordinator.receive_token(GlobalToken::new()).await;
        }
    }

    /// Drop the circulating tokens; emission halts at the next forward.
    pub fn shutdown(&self) {
        self.transport.stopped.store(true, Ordering::SeqCst);
    }

    /// Diagnostic sweep asserting bookkeeping is empty outside genuine
    /// in-flight work. Returns descriptions of anything left behind.
    pub async fn check_gc_health(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for coordinator in self.transport.coords.values() {
            coordinator.gc_health(&mut issues).await;
        }
        for coordinator in self.transport.gcoords.values() {
            coordinator.gc_health(&mut issues).await;
        }
        let actors: Vec<Arc<dyn ActorShell>> = {
            let table = self.transport.actors.read().expect("actor table poisoned");
            table.values().cloned().collect()
        };
        for actor in actors {
            actor.gc_health(&mut issues);
        }
        issues
    }
}

struct GridTransport {
    coords: HashMap<CoordId, Arc<Coordinator>>,
    gcoords: HashMap<CoordId, Arc<GlobalCoordinator>>,
    silo_coords: HashMap<SiloId, Vec<CoordId>>,
    actors: std::sync::RwLock<HashMap<ActorId, Arc<dyn ActorShell>>>,
    stopped: AtomicBool,
}

impl GridTransport {
    fn coord(&self, coord: CoordId) -> anyhow::Result<Arc<Coordinator>> {
        self.coords
            .get(&coord)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown coordinator {coord}"))
    }

    fn gcoord(&self, coord: CoordId) -> anyhow::Result<Arc<GlobalCoordinator>> {
        self.gcoords
            .get(&coord)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown global coordinator {coord}"))
    }

    fn actor(&self, actor: ActorId) -> anyhow::Result<Arc<dyn ActorShell>> {
        self.actors
            .read()
            .expect("actor table poisoned")
            .get(&actor)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown actor {actor}"))
    }
}

#[async_trait]
impl Transport for GridTransport {
    fn silo_of(&self, actor: ActorId) -> Option<SiloId> {
        self.actors
            .read()
            .expect("actor table poisoned")
            .get(&actor)
            .map(|shell| shell.silo_id())
    }

    async fn pass_token(&self, target: CoordId, token: Token) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(target, "grid stopped, dropping token");
            return Ok(());
        }
        let coordinator = self.coord(target)?;
        coordinator.receive_token(token).await;
        Ok(())
    }

    async fn pass_global_token(&self, target: CoordId, token: GlobalToken) -> anyhow::Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::debug!(target, "grid stopped, dropping global token");
            return Ok(());
        }
        let coordinator = self.gcoord(target)?;
        coordinator.receive_token(token).await;
        Ok(())
    }

    async fn register_pact(
        &self,
        coord: CoordId,
        actors: Vec<ActorId>,
    ) -> anyhow::Result<PactContext> {
        self.coord(coord)?.register_pact(actors).await
    }

    async fn register_act(&self, coord: CoordId, origin: ActorId) -> anyhow::Result<ActContext> {
        self.coord(coord)?.register_act(origin).await
    }

    async fn register_global_pact(
        &self,
        gcoord: CoordId,
        silos: Vec<SiloId>,
    ) -> anyhow::Result<GlobalPactContext> {
        self.gcoord(gcoord)?.register_global_pact(silos).await
    }

    async fn register_pact_in_silo(
        &self,
        coord: CoordId,
        req: GlobalPactLocalReq,
    ) -> anyhow::Result<PactContext> {
        self.coord(coord)?.register_pact_in_silo(req).await
    }

    async fn deliver_sub_batch(&self, actor: ActorId, sub: SubBatch) -> anyhow::Result<()> {
        self.actor(actor)?.deliver_sub_batch(sub).await;
        Ok(())
    }

    async fn notify_batch_committed(
        &self,
        actor: ActorId,
        bid: BatchId,
        highest_committed_bid: BatchId,
    ) -> anyhow::Result<()> {
        self.actor(actor)?
            .on_batch_committed(bid, highest_committed_bid)
            .await;
        Ok(())
    }

    async fn ack_batch_complete(&self, coord: CoordId, bid: BatchId) -> anyhow::Result<()> {
        self.coord(coord)?.handle_ack(bid).await;
        Ok(())
    }

    async fn wait_batch_committed(&self, coord: CoordId, bid: BatchId) -> anyhow::Result<()> {
        self.coord(coord)?.wait_batch_committed(bid).await;
        Ok(())
    }

    async fn deliver_global_batch(
        &self,
        coord: CoordId,
        batch: GlobalSubBatch,
    ) -> anyhow::Result<()> {
        self.coord(coord)?.deliver_global_batch(batch).await;
        Ok(())
    }

    async fn ack_global_batch(
        &self,
        gcoord: CoordId,
        global_bid: BatchId,
        silo: SiloId,
    ) -> anyhow::Result<()> {
        self.gcoord(gcoord)?.handle_silo_ack(global_bid, silo).await;
        Ok(())
    }

    async fn wait_global_committed(
        &self,
        gcoord: CoordId,
        global_bid: BatchId,
    ) -> anyhow::Result<()> {
        self.gcoord(gcoord)?.wait_global_committed(global_bid).await;
        Ok(())
    }

    async fn call_actor(&self, actor: ActorId, req: CallRequest) -> anyhow::Result<CallReply> {
        let shell = self.actor(actor)?;
        if let TxnContext::Act(act) = &req.ctx {
            // Non-deterministic access sets are silo-local.
            if shell.silo_id() != act.silo {
                anyhow::bail!("actor {actor} is outside the transaction's silo");
            }
        }
        Ok(shell.execute_call(req).await)
    }

    async fn finish_det(&self, actor: ActorId, ctx: PactContext) -> anyhow::Result<()> {
        self.actor(actor)?.finish_det(ctx).await;
        Ok(())
    }

    async fn exec_info(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<ExecInfo> {
        Ok(self.actor(actor)?.exec_info(tid).await)
    }

    async fn prepare(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<bool> {
        Ok(self.actor(actor)?.prepare(tid).await)
    }

    async fn commit(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<()> {
        self.actor(actor)?.commit_txn(tid).await;
        Ok(())
    }

    async fn abort(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<()> {
        self.actor(actor)?.abort_txn(tid).await;
        Ok(())
    }
}
