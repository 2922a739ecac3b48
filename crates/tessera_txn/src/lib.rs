//! Tessera transaction kernel.
//!
//! This crate provides the transaction-execution core used by tessera_grid.
//! The API surface is intentionally small: higher layers supply a `Transport`
//! and a `TxnLog`, register handlers on `TransactionalActor`s, and drive
//! transactions through `start_transaction`.

pub mod txn;
