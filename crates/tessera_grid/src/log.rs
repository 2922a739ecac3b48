//! In-memory transaction log.
//!
//! Records every protocol write point in arrival order so tests can assert
//! that prepares precede decisions and batch commits follow batch prepares.

use std::sync::Arc;

use tessera_txn::txn::{ActorId, BatchId, TxnId, TxnLog};

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum LogRecord {
    BeforePrepare { tid: TxnId, writers: Vec<ActorId> },
    Commit { tid: TxnId },
    Abort { tid: TxnId },
    BatchPrepare { bid: BatchId, tids: Vec<TxnId> },
    BatchCommit { bid: BatchId },
}

#[derive(Debug, Default)]
pub struct MemoryTxnLog {
    records: std::sync::Mutex<Vec<LogRecord>>,
}

impl MemoryTxnLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().expect("log poisoned").clone()
    }

    fn push(&self, record: LogRecord) {
        self.records.lock().expect("log poisoned").push(record);
    }
}

impl TxnLog for MemoryTxnLog {
    fn write_before_prepare(&self, tid: TxnId, writers: &[ActorId]) -> anyhow::Result<()> {
        self.push(LogRecord::BeforePrepare {
            tid,
            writers: writers.to_vec(),
        });
        Ok(())
    }

    fn write_commit(&self, tid: TxnId) -> anyhow::Result<()> {
        self.push(LogRecord::Commit { tid });
        Ok(())
    }

    fn write_abort(&self, tid: TxnId) -> anyhow::Result<()> {
        self.push(LogRecord::Abort { tid });
        Ok(())
    }

    fn write_batch_prepare(&self, bid: BatchId, tids: &[TxnId]) -> anyhow::Result<()> {
        self.push(LogRecord::BatchPrepare {
            bid,
            tids: tids.to_vec(),
        });
        Ok(())
    }

    fn write_batch_commit(&self, bid: BatchId) -> anyhow::Result<()> {
        self.push(LogRecord::BatchCommit { bid });
        Ok(())
    }
}
