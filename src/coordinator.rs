// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The coordinator drives finished transactions through the three phases,
//! and holds nothing worth keeping: every decision it makes is derivable
//! from the union of participant states, which is what lets a freshly
//! started coordinator take over by polling.
//!
//! Per-transaction driver tasks run independently and in parallel; each
//! phase is a parallel fan-out over the endpoints. Prepare and PreCommit are
//! one-shot with a per-attempt timeout -- any failure there flips the
//! transaction to the abort path -- while Commit, Abort and recovery's Query
//! are retried for as long as it takes (there is no path that drops a
//! decision on the floor).

use crate::{
    network::{Endpoint, Req, Res},
    Error, ResponseMsg, ServerId, SyncBoxFuture, Tid, TxnState, Val,
};
use async_std::{
    future,
    sync::{Arc, Condvar, Mutex},
    task,
};
use futures::channel::mpsc::UnboundedSender;
use futures_util::{stream::FuturesUnordered, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

type ReplyFuture<V> = SyncBoxFuture<(ServerId, Result<Res<V>, Error>)>;
type ReplyFutures<V> = FuturesUnordered<ReplyFuture<V>>;

/// What recovery decides to do about one reconstructed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Resume {
    Abort,
    Commit(BTreeSet<ServerId>),
    PreCommit(BTreeSet<ServerId>),
    Prepare,
}

/// The coordinator's only state, and all of it disposable: which tids are
/// currently being driven, which have had their response emitted, and
/// whether recovery has finished. Lost on a crash and rebuilt by the next
/// instance's recovery poll.
#[derive(Default)]
struct Ledger {
    recovered: bool,
    driving: BTreeSet<Tid>,
    emitted: BTreeSet<Tid>,
}

/// A transaction coordinator. Construction spawns the recovery poll;
/// [Coordinator::finish_transaction] drivers wait for it to finish before
/// touching anything. Cheap to clone; clones share state.
pub struct Coordinator<V: Val> {
    ends: Arc<Vec<Endpoint<V>>>,
    resp: UnboundedSender<ResponseMsg<V>>,
    ledger: Arc<(Mutex<Ledger>, Condvar)>,
    dead: Arc<AtomicBool>,
}

impl<V: Val> Clone for Coordinator<V> {
    fn clone(&self) -> Self {
        Coordinator {
            ends: self.ends.clone(),
            resp: self.resp.clone(),
            ledger: self.ledger.clone(),
            dead: self.dead.clone(),
        }
    }
}

impl<V: Val> Coordinator<V> {
    const PREPARE_TIMEOUT: Duration = Duration::from_millis(200);
    const PRECOMMIT_TIMEOUT: Duration = Duration::from_millis(200);
    // Per-attempt bound for the retried-forever deliveries (Commit, Abort,
    // Query); the retry loop, not this timeout, is what guarantees arrival.
    const RPC_TIMEOUT: Duration = Duration::from_millis(200);
    const RETRY_DELAY: Duration = Duration::from_millis(25);

    /// Construct a coordinator over `ends` (one endpoint per participant),
    /// emitting transaction outcomes on `resp`. Recovery starts immediately
    /// in the background.
    pub fn new(ends: Vec<Endpoint<V>>, resp: UnboundedSender<ResponseMsg<V>>) -> Self {
        let co = Coordinator {
            ends: Arc::new(ends),
            resp,
            ledger: Arc::new((Mutex::new(Ledger::default()), Condvar::new())),
            dead: Arc::new(AtomicBool::new(false)),
        };
        let this = co.clone();
        task::spawn(async move {
            let span = debug_span!("recovery");
            this.recover().instrument(span).await;
        });
        co
    }

    /// Stop this instance: retry loops wind down, nothing further is
    /// emitted. Participant state is untouched -- finishing the in-flight
    /// transactions is the next instance's recovery problem.
    pub fn kill(&self) {
        debug!("coordinator killed");
        self.dead.store(true, Ordering::SeqCst);
    }

    fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Begin three-phase commit for `tid`, whose operations the client has
    /// already logged at the participants. Returns immediately; the outcome
    /// arrives on the response channel.
    pub fn finish_transaction(&self, tid: Tid) {
        let this = self.clone();
        task::spawn(async move {
            let span = debug_span!("finish", ?tid);
            async move {
                this.await_recovery().await;
                if this.killed() {
                    return;
                }
                if !this.register(tid).await {
                    trace!("{:?} already in flight or resolved, ignoring", tid);
                    return;
                }
                this.run_from_prepare(tid).await;
                this.deregister(tid).await;
            }
            .instrument(span)
            .await;
        });
    }

    async fn await_recovery(&self) {
        let (lock, cvar) = &*self.ledger;
        let g = lock.lock().await;
        let _g = cvar.wait_until(g, |l| l.recovered).await;
    }

    async fn register(&self, tid: Tid) -> bool {
        let (lock, _) = &*self.ledger;
        let mut g = lock.lock().await;
        if g.driving.contains(&tid) || g.emitted.contains(&tid) {
            false
        } else {
            g.driving.insert(tid);
            true
        }
    }

    async fn deregister(&self, tid: Tid) {
        let (lock, _) = &*self.ledger;
        lock.lock().await.driving.remove(&tid);
    }

    /// Report the outcome, once. A killed instance stays silent; its
    /// successor re-derives the outcome from the participants instead.
    async fn emit(&self, tid: Tid, committed: bool, read_values: BTreeMap<String, V>) {
        if self.killed() {
            return;
        }
        let (lock, _) = &*self.ledger;
        let mut g = lock.lock().await;
        if !g.emitted.insert(tid) {
            return;
        }
        debug!("{:?} resolved, committed={:?}", tid, committed);
        let _ = self.resp.unbounded_send(ResponseMsg {
            tid,
            committed,
            read_values,
        });
    }

    fn all_servers(&self) -> BTreeSet<ServerId> {
        self.ends.iter().map(|ep| ep.server()).collect()
    }

    /// One parallel fan-out of `req` to `targets`, each attempt bounded by
    /// `within`. Yields `(server, reply-or-error)` in completion order.
    fn round(&self, req: Req, within: Duration, targets: &BTreeSet<ServerId>) -> ReplyFutures<V> {
        let futs = ReplyFutures::new();
        for ep in self.ends.iter() {
            if !targets.contains(&ep.server()) {
                continue;
            }
            let ep = ep.clone();
            let sid = ep.server();
            let fut: ReplyFuture<V> = Box::pin(async move {
                match future::timeout(within, ep.call(req)).await {
                    Ok(r) => (sid, r),
                    Err(_) => (sid, Err(Error::Timeout)),
                }
            });
            futs.push(fut);
        }
        futs
    }

    /// Deliver `req` come what may: per-attempt timeout, bounded backoff,
    /// unbounded retries. Returns None only if this instance is killed.
    async fn deliver_until_acked(&self, ep: Endpoint<V>, req: Req) -> Option<Res<V>> {
        loop {
            if self.killed() {
                return None;
            }
            match future::timeout(Self::RPC_TIMEOUT, ep.call(req)).await {
                Ok(Ok(res)) => return Some(res),
                Ok(Err(e)) => trace!("{:?} to {:?} failed ({:?}), will retry", req, ep.server(), e),
                Err(_) => trace!("{:?} to {:?} timed out, will retry", req, ep.server()),
            }
            let never = future::pending::<()>();
            let _ = future::timeout(Self::RETRY_DELAY, never).await;
        }
    }

    /// Phase one. Prepare goes to every participant -- the relevant set
    /// isn't known until they answer -- and any No vote or delivery failure
    /// decides Abort. The round is always drained to completion: a reply
    /// that can no longer change the decision still retires its RPC.
    async fn run_from_prepare(&self, tid: Tid) {
        debug!("prepare round for {:?}", tid);
        let mut futs = self.round(Req::Prepare(tid), Self::PREPARE_TIMEOUT, &self.all_servers());
        let mut relevant = BTreeSet::new();
        let mut abort = false;
        while let Some((sid, res)) = futs.next().await {
            match res {
                Ok(Res::Prepare(r)) if !r.relevant => {
                    trace!("{:?} irrelevant to {:?}", sid, tid);
                }
                Ok(Res::Prepare(r)) if r.vote => {
                    relevant.insert(sid);
                }
                Ok(Res::Prepare(_)) => {
                    debug!("{:?} voted no on {:?}", sid, tid);
                    abort = true;
                }
                Ok(r) => {
                    warn!("unexpected response {:?} in prepare round", r);
                    abort = true;
                }
                Err(e) => {
                    debug!("prepare of {:?} at {:?} failed: {:?}", tid, sid, e);
                    abort = true;
                }
            }
        }
        if abort {
            return self.abort_txn(tid).await;
        }
        if relevant.is_empty() {
            debug!("{:?} touches no participant, committing trivially", tid);
            return self.emit(tid, true, BTreeMap::new()).await;
        }
        self.run_from_pre_commit(tid, relevant).await
    }

    /// Phase two. PreCommit goes only to the relevant set; any delivery
    /// failure still decides Abort -- no participant has applied anything
    /// yet, so turning back remains free.
    async fn run_from_pre_commit(&self, tid: Tid, relevant: BTreeSet<ServerId>) {
        debug!("pre-commit round for {:?} to {:?}", tid, relevant);
        let mut futs = self.round(Req::PreCommit(tid), Self::PRECOMMIT_TIMEOUT, &relevant);
        let mut abort = false;
        while let Some((sid, res)) = futs.next().await {
            match res {
                Ok(Res::PreCommit) => (),
                Ok(r) => {
                    warn!("unexpected response {:?} in pre-commit round", r);
                    abort = true;
                }
                Err(e) => {
                    debug!("pre-commit of {:?} at {:?} failed: {:?}", tid, sid, e);
                    abort = true;
                }
            }
        }
        if abort {
            return self.abort_txn(tid).await;
        }
        self.run_from_commit(tid, relevant).await
    }

    /// Phase three. Past this point the decision is Commit and cannot be
    /// walked back: every delivery is retried until acknowledged, and the
    /// response is not emitted until all of them are. Read values merge
    /// across replies; each key's owner is the one that reports it.
    async fn run_from_commit(&self, tid: Tid, relevant: BTreeSet<ServerId>) {
        debug!("commit round for {:?} to {:?}", tid, relevant);
        let mut futs: FuturesUnordered<SyncBoxFuture<Option<Res<V>>>> = FuturesUnordered::new();
        for sid in &relevant {
            let ep = self.ends[sid.0].clone();
            let this = self.clone();
            futs.push(Box::pin(async move {
                this.deliver_until_acked(ep, Req::Commit(tid)).await
            }));
        }
        let mut read_values = BTreeMap::new();
        while let Some(res) = futs.next().await {
            match res {
                Some(Res::Commit(c)) => read_values.extend(c.read_values),
                Some(r) => warn!("unexpected response {:?} in commit round", r),
                // Killed mid-round; the successor's recovery finishes this.
                None => return,
            }
        }
        self.emit(tid, true, read_values).await
    }

    /// The abort path. Abort goes to every participant, not just the
    /// relevant set (in the prepare round that set was never fixed). After
    /// one full wave every reachable participant has turned around, which
    /// settles the outcome: the response is emitted and any stragglers are
    /// chased down by a background task for as long as it takes.
    async fn abort_txn(&self, tid: Tid) {
        debug!("abort path for {:?}", tid);
        let mut futs = self.round(Req::Abort(tid), Self::RPC_TIMEOUT, &self.all_servers());
        let mut unacked = BTreeSet::new();
        while let Some((sid, res)) = futs.next().await {
            match res {
                Ok(Res::Abort) => (),
                _ => {
                    unacked.insert(sid);
                }
            }
        }
        self.emit(tid, false, BTreeMap::new()).await;
        if unacked.is_empty() || self.killed() {
            return;
        }
        let this = self.clone();
        task::spawn(async move {
            let span = debug_span!("abort_drain", ?tid);
            async move {
                debug!("chasing {:?} unacked aborts", unacked.len());
                let mut futs: FuturesUnordered<SyncBoxFuture<Option<Res<V>>>> =
                    FuturesUnordered::new();
                for sid in &unacked {
                    let ep = this.ends[sid.0].clone();
                    let this = this.clone();
                    futs.push(Box::pin(async move {
                        this.deliver_until_acked(ep, Req::Abort(tid)).await
                    }));
                }
                while futs.next().await.is_some() {}
            }
            .instrument(span)
            .await;
        });
    }

    /// Recovery: poll every participant until every one has answered (a
    /// permanently unreachable participant stalls recovery, by design --
    /// nothing can be decided without its testimony), reconstruct each
    /// observed transaction from the union of reports, and resume it at the
    /// phase it had reached. Resumed tids are registered before the gate
    /// opens so a racing client call for the same tid dedups.
    async fn recover(&self) {
        debug!("polling {:?} participants", self.ends.len());
        let mut futs: FuturesUnordered<SyncBoxFuture<(ServerId, Option<Res<V>>)>> =
            FuturesUnordered::new();
        for ep in self.ends.iter() {
            let ep = ep.clone();
            let this = self.clone();
            futs.push(Box::pin(async move {
                let sid = ep.server();
                (sid, this.deliver_until_acked(ep, Req::Query).await)
            }));
        }
        let mut reports: BTreeMap<Tid, Vec<(ServerId, TxnState)>> = BTreeMap::new();
        let mut complete = true;
        while let Some((sid, res)) = futs.next().await {
            match res {
                Some(Res::Query(q)) => {
                    trace!("{:?} reports {:?} transactions", sid, q.transactions.len());
                    for (tid, rec) in q.transactions {
                        reports.entry(tid).or_default().push((sid, rec.state));
                    }
                }
                Some(r) => warn!("unexpected response {:?} to query", r),
                None => {
                    complete = false;
                    break;
                }
            }
        }

        let (lock, cvar) = &*self.ledger;
        if !complete {
            // Killed mid-poll. Open the gate anyway so waiting drivers can
            // notice they're dead.
            let mut g = lock.lock().await;
            g.recovered = true;
            cvar.notify_all();
            return;
        }

        let mut plans = Vec::new();
        for (tid, rep) in &reports {
            if let Some(plan) = Self::classify(rep) {
                plans.push((*tid, plan));
            }
        }
        {
            let mut g = lock.lock().await;
            for (tid, _) in &plans {
                g.driving.insert(*tid);
            }
            g.recovered = true;
            cvar.notify_all();
        }
        debug!(
            "recovery saw {:?} transactions, resuming {:?}",
            reports.len(),
            plans.len()
        );
        for (tid, plan) in plans {
            let this = self.clone();
            task::spawn(async move {
                let span = debug_span!("resume", ?tid, ?plan);
                async move {
                    this.resume(tid, plan).await;
                    this.deregister(tid).await;
                }
                .instrument(span)
                .await;
            });
        }
    }

    /// Decide what one reconstructed transaction needs, from the multiset
    /// of per-participant states. First match wins; the order is the
    /// protocol's own: abort evidence is conclusive, then commit evidence,
    /// then the furthest phase reached.
    fn classify(reports: &[(ServerId, TxnState)]) -> Option<Resume> {
        let any = |s: TxnState| reports.iter().any(|(_, st)| *st == s);
        if reports.iter().all(|(_, st)| st.is_terminal()) {
            // The previous coordinator only gets everyone terminal by
            // finishing the job, response included. Nothing to drive, and
            // re-reporting would duplicate.
            None
        } else if any(TxnState::Aborted) || any(TxnState::VotedNo) {
            Some(Resume::Abort)
        } else if any(TxnState::Committed) {
            // Commit was already being delivered; finish it. Participants
            // already Committed re-ack with empty read values.
            Some(Resume::Commit(
                reports
                    .iter()
                    .filter(|(_, st)| matches!(st, TxnState::PreCommitted | TxnState::Committed))
                    .map(|(sid, _)| *sid)
                    .collect(),
            ))
        } else if any(TxnState::PreCommitted) {
            // Any PreCommitted implies the prepare round finished all-Yes,
            // so it is safe to go forward rather than back.
            Some(Resume::PreCommit(
                reports
                    .iter()
                    .filter(|(_, st)| matches!(st, TxnState::PreCommitted | TxnState::VotedYes))
                    .map(|(sid, _)| *sid)
                    .collect(),
            ))
        } else if any(TxnState::VotedYes) {
            // Mid-prepare. Re-run it: yes-voters re-vote idempotently, and
            // an abort from here is still a valid outcome.
            Some(Resume::Prepare)
        } else {
            // Only Operations: the client hasn't asked to finish yet.
            None
        }
    }

    async fn resume(&self, tid: Tid, plan: Resume) {
        match plan {
            Resume::Abort => self.abort_txn(tid).await,
            Resume::Commit(targets) => self.run_from_commit(tid, targets).await,
            Resume::PreCommit(targets) => self.run_from_pre_commit(tid, targets).await,
            Resume::Prepare => self.run_from_prepare(tid).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rep(states: &[TxnState]) -> Vec<(ServerId, TxnState)> {
        states
            .iter()
            .enumerate()
            .map(|(i, st)| (ServerId(i), *st))
            .collect()
    }

    fn classify(states: &[TxnState]) -> Option<Resume> {
        Coordinator::<u64>::classify(&rep(states))
    }

    #[test]
    fn terminal_transactions_need_no_driving() {
        use TxnState::*;
        assert_eq!(classify(&[Committed, Committed, Committed]), None);
        assert_eq!(classify(&[Aborted, Aborted]), None);
        assert_eq!(classify(&[Committed]), None);
    }

    #[test]
    fn abort_evidence_is_conclusive() {
        use TxnState::*;
        assert_eq!(classify(&[Aborted, VotedYes, VotedYes]), Some(Resume::Abort));
        assert_eq!(classify(&[VotedNo, VotedYes]), Some(Resume::Abort));
        assert_eq!(classify(&[VotedNo, Operations]), Some(Resume::Abort));
    }

    #[test]
    fn partial_commit_finishes_the_commit_round() {
        use TxnState::*;
        let targets: BTreeSet<ServerId> = [ServerId(0), ServerId(1)].iter().cloned().collect();
        assert_eq!(
            classify(&[Committed, PreCommitted, Operations]),
            Some(Resume::Commit(targets))
        );
    }

    #[test]
    fn any_precommit_goes_forward_not_back() {
        use TxnState::*;
        let targets: BTreeSet<ServerId> = [ServerId(0), ServerId(1)].iter().cloned().collect();
        assert_eq!(
            classify(&[PreCommitted, VotedYes]),
            Some(Resume::PreCommit(targets))
        );
    }

    #[test]
    fn mid_prepare_reruns_prepare() {
        use TxnState::*;
        assert_eq!(
            classify(&[VotedYes, Operations, Operations]),
            Some(Resume::Prepare)
        );
    }

    #[test]
    fn unfinished_transactions_are_left_to_the_client() {
        use TxnState::*;
        assert_eq!(classify(&[Operations, Operations]), None);
    }
}
