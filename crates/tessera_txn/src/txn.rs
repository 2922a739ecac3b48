//! Kernel module wiring.
//!
//! `types` defines the shared id/request/trait contracts (transport, log),
//! `token` and `graph` hold the ordering machinery, `s2pl`/`tso` are the two
//! interchangeable concurrency-control strategies, `det`/`nondet` drive
//! per-actor execution, and `coordinator`/`global` implement the
//! token-passing batching protocol. `actor` ties everything together behind
//! the `TransactionalActor` surface.

mod actor;
mod cc;
mod coordinator;
mod det;
mod global;
mod graph;
mod nondet;
mod s2pl;
mod signal;
mod token;
mod tso;
mod types;

pub use actor::{ActorBuilder, ActorConfig, TransactionalActor, TxnHandle};
pub use cc::{CcStrategy, ConcurrencyControl, StateCell};
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use global::{GlobalCoordinator, GlobalCoordinatorConfig};
pub use s2pl::S2plEngine;
pub use signal::Signal;
pub use token::{GlobalSubBatch, GlobalToken, SubBatch, Token};
pub use tso::TsoEngine;
pub use types::{
    ActContext, ActRole, ActorId, ActorShell, ActorState, BatchId, CallReply, CallRequest,
    CoordId, ExecInfo, GlobalPactContext, GlobalPactLocalReq, PactContext, SiloId, Transport,
    TxnBounds, TxnContext, TxnError, TxnId, TxnLog, TxnResult, Value, NO_BATCH, NO_TXN,
};
