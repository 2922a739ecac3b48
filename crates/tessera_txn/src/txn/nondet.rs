//! Non-deterministic commit protocol.
//!
//! After a transaction's logic completes on all touched actors, each actor
//! reports its serialization bounds relative to the deterministic batch
//! order. The committer reconciles the reports into a verdict and, when
//! serializable, runs two-phase commit: read-only participants vote and
//! release at prepare, writers receive the decision, no-ops are skipped.
//! Aborts are presumed, no participant abort record is written.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};

use super::types::{
    ActContext, ActRole, ActorId, BatchId, ExecInfo, Transport, TxnBounds, TxnError, TxnId,
    TxnLog, NO_BATCH,
};

/// Outcome of the serializability check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Commit {
        max_before: BatchId,
        min_after: Option<BatchId>,
    },
    NotSerializable,
    NotSure,
}

/// Reconcile per-actor bounds into a verdict.
///
/// The overlap abort is evaluated first so a stale committed prefix can
/// never commit an interleaving that some actor already ordered the other
/// way. After that, a transaction whose entire before-set is committed is
/// certainly serializable; so is one boxed between bid-consecutive batches.
/// Everything else aborts conservatively rather than block.
pub(crate) fn serialization_verdict(
    infos: &[ExecInfo],
    highest_committed_bid: BatchId,
) -> Verdict {
    let max_before = infos.iter().map(|i| i.before_bid).max().unwrap_or(NO_BATCH);
    let min_after = infos
        .iter()
        .filter(|i| i.after_known)
        .map(|i| i.after_bid)
        .min();

    if let Some(after) = min_after {
        if max_before >= after {
            return Verdict::NotSerializable;
        }
    }
    if max_before <= highest_committed_bid {
        return Verdict::Commit {
            max_before,
            min_after,
        };
    }
    let consecutive = infos
        .iter()
        .any(|i| i.before_bid == max_before && i.after_known && i.after_bid == max_before + 1);
    if consecutive {
        return Verdict::Commit {
            max_before,
            min_after,
        };
    }
    Verdict::NotSure
}

/// Drives validation and two-phase commit for one originating actor.
pub(crate) struct Committer {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) log: Arc<dyn TxnLog>,
}

impl Committer {
    /// Validate and commit a completed transaction. Returns the bounds it
    /// was proven to sit between, or the classified abort.
    pub(crate) async fn commit_act(
        &self,
        ctx: &ActContext,
        touched: &[(ActorId, ActRole)],
        highest_committed_bid: BatchId,
    ) -> Result<TxnBounds, TxnError> {
        let tid = ctx.tid;
        let mut participants: BTreeMap<ActorId, ActRole> = BTreeMap::new();
        for &(actor, role) in touched {
            let entry = participants.entry(actor).or_insert(role);
            *entry = (*entry).max(role);
        }

        // Gather fresh bounds and roles from every participant.
        let mut gathers = FuturesUnordered::new();
        for &actor in participants.keys() {
            let transport = self.transport.clone();
            gathers.push(async move { (actor, transport.exec_info(actor, tid).await) });
        }
        let mut infos: Vec<ExecInfo> = Vec::with_capacity(participants.len());
        let mut roles: BTreeMap<ActorId, ActRole> = BTreeMap::new();
        let mut gather_failure = None;
        while let Some((actor, result)) = gathers.next().await {
            match result {
                Ok(info) => {
                    infos.push(info);
                    roles.insert(actor, info.role);
                }
                Err(err) => {
                    gather_failure = Some(format!("exec info from actor {actor}: {err}"));
                    roles.insert(actor, ActRole::Writer);
                }
            }
        }
        drop(gathers);
        if let Some(failure) = gather_failure {
            self.abort_participants(tid, roles.keys().copied()).await;
            return Err(TxnError::RemoteCallFailure(failure));
        }

        match serialization_verdict(&infos, highest_committed_bid) {
            Verdict::NotSerializable => {
                self.abort_participants(tid, roles.keys().copied()).await;
                Err(TxnError::NotSerializable(tid))
            }
            Verdict::NotSure => {
                self.abort_participants(tid, roles.keys().copied()).await;
                Err(TxnError::NotSureSerializable(tid))
            }
            Verdict::Commit {
                max_before,
                min_after,
            } => {
                self.two_phase_commit(tid, &roles).await?;
                // The transaction must observe everything it was proven to
                // follow before the caller learns the outcome.
                if max_before > highest_committed_bid {
                    self.transport
                        .wait_batch_committed(ctx.coord, max_before)
                        .await
                        .map_err(|err| TxnError::RemoteCallFailure(err.to_string()))?;
                }
                Ok(TxnBounds {
                    before_bid: max_before,
                    after_bid: min_after,
                })
            }
        }
    }

    async fn two_phase_commit(
        &self,
        tid: TxnId,
        roles: &BTreeMap<ActorId, ActRole>,
    ) -> Result<(), TxnError> {
        let writers: Vec<ActorId> = roles
            .iter()
            .filter(|(_, &role)| role == ActRole::Writer)
            .map(|(&actor, _)| actor)
            .collect();
        let voters: Vec<ActorId> = roles
            .iter()
            .filter(|(_, &role)| role != ActRole::NoOp)
            .map(|(&actor, _)| actor)
            .collect();
        let noops: Vec<ActorId> = roles
            .iter()
            .filter(|(_, &role)| role == ActRole::NoOp)
            .map(|(&actor, _)| actor)
            .collect();

        if !voters.is_empty() {
            self.log
                .write_before_prepare(tid, &writers)
                .map_err(|err| TxnError::RemoteCallFailure(err.to_string()))?;

            let mut votes = FuturesUnordered::new();
            for &actor in &voters {
                let transport = self.transport.clone();
                votes.push(async move { transport.prepare(actor, tid).await.unwrap_or(false) });
            }
            let mut all_yes = true;
            while let Some(vote) = votes.next().await {
                all_yes &= vote;
            }
            drop(votes);

            if all_yes {
                // Read-only transactions end at the vote: with no writers
                // there is nothing to decide and no commit record needed.
                if !writers.is_empty() {
                    if let Err(err) = self.log.write_commit(tid) {
                        tracing::warn!(tid, error = ?err, "commit record write failed");
                    }
                    self.broadcast(tid, &writers, Decision::Commit).await;
                }
            } else {
                if let Err(err) = self.log.write_abort(tid) {
                    tracing::warn!(tid, error = ?err, "abort record write failed");
                }
                self.broadcast(tid, &writers, Decision::Abort).await;
                self.abort_participants(tid, noops.iter().copied()).await;
                return Err(TxnError::DeadlockAvoidance(tid));
            }
        }
        // No-op participants only need their admissions released.
        self.abort_participants(tid, noops.iter().copied()).await;
        Ok(())
    }

    async fn broadcast(&self, tid: TxnId, actors: &[ActorId], decision: Decision) {
        let mut sends = FuturesUnordered::new();
        for &actor in actors {
            let transport = self.transport.clone();
            sends.push(async move {
                let result = match decision {
                    Decision::Commit => transport.commit(actor, tid).await,
                    Decision::Abort => transport.abort(actor, tid).await,
                };
                (actor, result)
            });
        }
        while let Some((actor, result)) = sends.next().await {
            if let Err(err) = result {
                tracing::warn!(tid, actor, error = ?err, "2pc decision delivery failed");
            }
        }
    }

    /// Release every listed participant via presumed abort.
    pub(crate) async fn abort_participants(
        &self,
        tid: TxnId,
        actors: impl Iterator<Item = ActorId>,
    ) {
        let actors: Vec<ActorId> = actors.collect();
        self.broadcast(tid, &actors, Decision::Abort).await;
    }
}

#[derive(Clone, Copy, Debug)]
enum Decision {
    Commit,
    Abort,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(before: BatchId, after: Option<BatchId>, role: ActRole) -> ExecInfo {
        ExecInfo {
            before_bid: before,
            after_bid: after.unwrap_or(NO_BATCH),
            after_known: after.is_some(),
            role,
        }
    }

    #[test]
    fn committed_prefix_is_serializable() {
        let infos = [info(5, None, ActRole::Writer), info(3, None, ActRole::Reader)];
        assert_eq!(
            serialization_verdict(&infos, 5),
            Verdict::Commit {
                max_before: 5,
                min_after: None
            }
        );
    }

    #[test]
    fn consecutive_bounds_are_serializable() {
        let infos = [info(10, Some(11), ActRole::Writer)];
        assert_eq!(
            serialization_verdict(&infos, 2),
            Verdict::Commit {
                max_before: 10,
                min_after: Some(11)
            }
        );
    }

    #[test]
    fn overlapping_bounds_abort() {
        // One actor ordered the txn after batch 12, another before batch 9.
        let infos = [
            info(12, None, ActRole::Writer),
            info(2, Some(9), ActRole::Writer),
        ];
        assert_eq!(serialization_verdict(&infos, 20), Verdict::NotSerializable);
    }

    #[test]
    fn gap_with_uncommitted_prefix_aborts_conservatively() {
        // Bounds 10/12 with batch 11 touching a disjoint actor set: the gap
        // cannot be validated, so the txn must never commit.
        let infos = [info(10, Some(12), ActRole::Writer)];
        assert_eq!(serialization_verdict(&infos, 9), Verdict::NotSure);
    }

    #[test]
    fn fresh_system_commits_immediately() {
        let infos = [info(NO_BATCH, None, ActRole::Writer)];
        assert_eq!(
            serialization_verdict(&infos, NO_BATCH),
            Verdict::Commit {
                max_before: NO_BATCH,
                min_after: None
            }
        );
    }
}
