//! Shared types for the transaction kernel.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the coordinator protocol and the per-actor execution layers.

use std::collections::HashMap;

use async_trait::async_trait;

use super::token::{GlobalSubBatch, GlobalToken, SubBatch, Token};

/// Logical identifier for a transactional actor.
pub type ActorId = u64;
/// Logical identifier for a coordinator (local or global).
pub type CoordId = u64;
/// Logical identifier for a silo (one local coordinator ring per silo).
pub type SiloId = u32;

/// Transaction identifier, assigned solely from a circulating token.
///
/// Ids double as priorities for concurrency control: lower id means higher
/// priority. They are unique per ring by construction.
pub type TxnId = i64;
/// Batch identifier. Batch ids increase by exactly one per emission on a
/// ring, so a batch's ring predecessor is always `bid - 1`.
pub type BatchId = i64;

/// Sentinel for "no batch outstanding".
pub const NO_BATCH: BatchId = -1;
/// Sentinel for "no transaction".
pub const NO_TXN: TxnId = -1;

/// Dynamic handler input/output payload.
pub type Value = serde_json::Value;

/// Classified transaction failure.
///
/// Everything here is surfaced as a structured result at the actor boundary.
/// Protocol invariant violations are not represented: they panic, and are the
/// only condition allowed to crash an actor.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TxnError {
    /// Concurrency control refused admission to avoid a wait cycle. Always
    /// recoverable by abort and retry upstream.
    #[error("deadlock avoidance abort for txn {0}")]
    DeadlockAvoidance(TxnId),
    /// Deterministic execution touched state it never declared.
    #[error("read/write conflict: {0}")]
    ReadWriteConflict(String),
    /// Commit-time serializability check found an order violation.
    #[error("txn {0} is not serializable")]
    NotSerializable(TxnId),
    /// Commit-time serializability check could not decide; aborted rather
    /// than block.
    #[error("txn {0} serializability is undecidable")]
    NotSureSerializable(TxnId),
    /// A cross-actor call never resolved. Not retried by this layer.
    #[error("remote call failed: {0}")]
    RemoteCallFailure(String),
    /// Business-logic failure carried through the result.
    #[error("application error: {0}")]
    Application(String),
}

/// Role an actor played in a non-deterministic transaction, reported at
/// commit time. Writers participate in the full two-phase commit, readers
/// release at prepare, no-ops are skipped entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActRole {
    NoOp,
    Reader,
    Writer,
}

/// Context handed to a deterministic transaction at registration.
#[derive(Clone, Debug)]
pub struct PactContext {
    /// Batch id in the originating silo's ring.
    pub bid: BatchId,
    /// Transaction id in the originating silo's ring.
    pub tid: TxnId,
    /// Local coordinator that assigned the ids.
    pub coord: CoordId,
    /// Global ids, `NO_BATCH`/`NO_TXN` unless the transaction is cross-silo.
    pub global_bid: BatchId,
    pub global_tid: TxnId,
    /// Global coordinator, meaningful only when `global_bid != NO_BATCH`.
    pub gcoord: CoordId,
    /// Declared actor access set.
    pub actors: Vec<ActorId>,
    /// Per-silo (bid, tid) assignment. Single-silo transactions carry one
    /// entry; cross-silo transactions carry one per touched silo.
    pub per_silo: HashMap<SiloId, (BatchId, TxnId)>,
}

impl PactContext {
    /// Ids assigned to this transaction in `silo`'s ring.
    pub fn ids_in(&self, silo: SiloId) -> Option<(BatchId, TxnId)> {
        self.per_silo.get(&silo).copied()
    }
}

/// Context handed to a non-deterministic transaction at registration.
#[derive(Clone, Copy, Debug)]
pub struct ActContext {
    pub tid: TxnId,
    /// Local coordinator that assigned the id.
    pub coord: CoordId,
    /// Actor the transaction originated on.
    pub origin: ActorId,
    /// Silo the transaction is confined to.
    pub silo: SiloId,
}

/// Context attached to every transactional call.
#[derive(Clone, Debug)]
pub enum TxnContext {
    Pact(PactContext),
    Act(ActContext),
}

impl TxnContext {
    pub fn tid(&self) -> TxnId {
        match self {
            TxnContext::Pact(ctx) => ctx.tid,
            TxnContext::Act(ctx) => ctx.tid,
        }
    }
}

/// Serialization bounds computed for a committed non-deterministic
/// transaction: the batch it was proven to follow and, when known, the batch
/// proven to follow it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnBounds {
    pub before_bid: BatchId,
    pub after_bid: Option<BatchId>,
}

/// Outcome of a transaction, classified at the actor boundary.
#[derive(Clone, Debug)]
pub struct TxnResult {
    pub tid: TxnId,
    pub outcome: Result<Value, TxnError>,
    /// Present for committed non-deterministic transactions.
    pub bounds: Option<TxnBounds>,
}

/// Per-actor execution report gathered at non-deterministic commit time.
///
/// `before_bid` is the highest deterministic batch known to strictly precede
/// the transaction in the actor's schedule; `after_bid` the lowest known to
/// strictly follow it, with `after_known` saying whether such a batch has
/// arrived at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecInfo {
    pub before_bid: BatchId,
    pub after_bid: BatchId,
    pub after_known: bool,
    pub role: ActRole,
}

/// Transactional call envelope.
#[derive(Clone, Debug)]
pub struct CallRequest {
    pub ctx: TxnContext,
    pub func: String,
    pub input: Value,
}

/// Reply to a transactional call.
///
/// `touched` accumulates the actors the call transitively accessed together
/// with their roles, so the originating actor learns the full participant
/// set without a discovery round.
#[derive(Clone, Debug)]
pub struct CallReply {
    pub result: Result<Value, TxnError>,
    pub touched: Vec<(ActorId, ActRole)>,
}

/// Context returned by a global coordinator for a cross-silo registration.
#[derive(Clone, Debug)]
pub struct GlobalPactContext {
    pub global_bid: BatchId,
    pub global_tid: TxnId,
    pub gcoord: CoordId,
    /// Local coordinator chosen for each touched silo.
    pub coord_per_silo: HashMap<SiloId, CoordId>,
}

/// Per-silo registration of a cross-silo transaction with its chosen local
/// coordinator.
#[derive(Clone, Debug)]
pub struct GlobalPactLocalReq {
    pub global_bid: BatchId,
    pub global_tid: TxnId,
    /// Actors the transaction touches inside this silo.
    pub actors: Vec<ActorId>,
}

/// Delivery fabric between coordinators and actors.
///
/// The kernel is transport-agnostic; concrete implementations can use
/// in-process calls, RPC, or test harnesses. Delivery is best effort with no
/// automatic retries. A call that never resolves simply never resolves; the
/// kernel surfaces that as `RemoteCallFailure` where it can bound the wait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Silo an actor lives in, if the actor is known.
    fn silo_of(&self, actor: ActorId) -> Option<SiloId>;

    // Ring circulation. Fire and forget.
    async fn pass_token(&self, target: CoordId, token: Token) -> anyhow::Result<()>;
    async fn pass_global_token(&self, target: CoordId, token: GlobalToken) -> anyhow::Result<()>;

    // Registration. Resolves at the target coordinator's next token pass, or
    // immediately from a pre-reserved id range.
    async fn register_pact(
        &self,
        coord: CoordId,
        actors: Vec<ActorId>,
    ) -> anyhow::Result<PactContext>;
    async fn register_act(&self, coord: CoordId, origin: ActorId) -> anyhow::Result<ActContext>;
    async fn register_global_pact(
        &self,
        gcoord: CoordId,
        silos: Vec<SiloId>,
    ) -> anyhow::Result<GlobalPactContext>;
    async fn register_pact_in_silo(
        &self,
        coord: CoordId,
        req: GlobalPactLocalReq,
    ) -> anyhow::Result<PactContext>;

    // Coordinator to actor.
    async fn deliver_sub_batch(&self, actor: ActorId, sub: SubBatch) -> anyhow::Result<()>;
    async fn notify_batch_committed(
        &self,
        actor: ActorId,
        bid: BatchId,
        highest_committed_bid: BatchId,
    ) -> anyhow::Result<()>;

    // Actor to coordinator.
    async fn ack_batch_complete(&self, coord: CoordId, bid: BatchId) -> anyhow::Result<()>;
    /// Resolves once `coord` knows `bid` committed.
    async fn wait_batch_committed(&self, coord: CoordId, bid: BatchId) -> anyhow::Result<()>;

    // Two-tier plumbing.
    async fn deliver_global_batch(
        &self,
        coord: CoordId,
        batch: GlobalSubBatch,
    ) -> anyhow::Result<()>;
    async fn ack_global_batch(
        &self,
        gcoord: CoordId,
        global_bid: BatchId,
        silo: SiloId,
    ) -> anyhow::Result<()>;
    /// Resolves once the global coordinator knows `global_bid` committed.
    async fn wait_global_committed(
        &self,
        gcoord: CoordId,
        global_bid: BatchId,
    ) -> anyhow::Result<()>;

    // Transactional calls and two-phase commit, actor to actor.
    async fn call_actor(&self, actor: ActorId, req: CallRequest) -> anyhow::Result<CallReply>;
    async fn finish_det(&self, actor: ActorId, ctx: PactContext) -> anyhow::Result<()>;
    async fn exec_info(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<ExecInfo>;
    async fn prepare(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<bool>;
    async fn commit(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<()>;
    async fn abort(&self, actor: ActorId, tid: TxnId) -> anyhow::Result<()>;
}

/// Durable transaction log interface.
///
/// Invoked at the exact protocol points of batch emission/commit and
/// non-deterministic two-phase commit. Implementations own the medium; the
/// kernel never inspects what was written. Aborts follow presumed abort, so
/// no participant abort record is required.
pub trait TxnLog: Send + Sync + 'static {
    fn write_before_prepare(&self, tid: TxnId, writers: &[ActorId]) -> anyhow::Result<()>;
    fn write_commit(&self, tid: TxnId) -> anyhow::Result<()>;
    fn write_abort(&self, tid: TxnId) -> anyhow::Result<()>;
    fn write_batch_prepare(&self, bid: BatchId, tids: &[TxnId]) -> anyhow::Result<()>;
    fn write_batch_commit(&self, bid: BatchId) -> anyhow::Result<()>;
}

/// State carried by a transactional actor.
pub trait ActorState: Clone + Default + Send + Sync + 'static {}

impl<T> ActorState for T where T: Clone + Default + Send + Sync + 'static {}

/// Type-erased actor surface used by transports to route protocol traffic.
#[async_trait]
pub trait ActorShell: Send + Sync + 'static {
    fn actor_id(&self) -> ActorId;
    fn silo_id(&self) -> SiloId;
    async fn deliver_sub_batch(&self, sub: SubBatch);
    async fn on_batch_committed(&self, bid: BatchId, highest_committed_bid: BatchId);
    async fn execute_call(&self, req: CallRequest) -> CallReply;
    async fn finish_det(&self, ctx: PactContext);
    async fn exec_info(&self, tid: TxnId) -> ExecInfo;
    async fn prepare(&self, tid: TxnId) -> bool;
    async fn commit_txn(&self, tid: TxnId);
    async fn abort_txn(&self, tid: TxnId);
    /// Push descriptions of any bookkeeping that should be empty but is not.
    fn gc_health(&self, issues: &mut Vec<String>);
}
