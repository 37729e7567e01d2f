// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A participant server: owner of one partition of the key space, and of the
//! per-transaction records that drive the commit protocol.
//!
//! Clients log operations here directly ([Participant::get] and
//! [Participant::set] are plain local calls, not RPCs); the coordinator then
//! drives the record through its states with Prepare / PreCommit / Commit /
//! Abort, and reads the whole table back with Query when recovering. All the
//! interesting decisions are local to Prepare: that is where per-key locks
//! are acquired and where a conflict turns into a No vote.
//!
//! Every handler takes the participant-wide mutex for its state work, but
//! Prepare drops it before waiting on per-key locks; otherwise two Prepares
//! contending for keys would also be contending for the whole server.

use crate::{
    network::{Req, Res},
    store::{KeyLock, LockMode, StoreItem},
    Op, ServerId, SyncBoxFuture, Tid, TxnRecord, TxnState, Val,
};
use async_std::sync::{Arc, Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, debug_span, trace, warn, Instrument};

/// Reply to Prepare. A participant with no logged operations for the
/// transaction is not `relevant` and takes no further part in it; the
/// coordinator only inspects `vote` when `relevant` is set.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrepareReply {
    pub relevant: bool,
    pub vote: bool,
}

/// Reply to Commit: the values observed by this participant's Gets, keyed by
/// key. Empty on a re-delivered Commit (the first delivery consumed them).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Val")]
pub struct CommitReply<V: Val> {
    pub read_values: BTreeMap<String, V>,
}

/// Reply to Query: a snapshot of every transaction record this participant
/// has ever seen, terminal ones included.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Val")]
pub struct QueryReply<V: Val> {
    pub transactions: BTreeMap<Tid, TxnRecord<V>>,
}

struct TxnSlot<V: Val> {
    state: TxnState,
    ops: Vec<Op<V>>,
    /// Exactly the locks Prepare acquired, released exactly once on the
    /// terminal transition. Distinct from the op list: duplicate keys
    /// collapse to one acquisition.
    held: Vec<(String, LockMode)>,
    /// True while a Prepare for this tid is off waiting on key locks with
    /// the participant mutex released.
    preparing: bool,
}

impl<V: Val> TxnSlot<V> {
    fn new() -> Self {
        TxnSlot {
            state: TxnState::Operations,
            ops: Vec::new(),
            held: Vec::new(),
            preparing: false,
        }
    }
}

struct Inner<V: Val> {
    store: BTreeMap<String, StoreItem<V>>,
    // Records are never removed: terminal states must stay visible to Query
    // for as long as some future coordinator might ask.
    txns: BTreeMap<Tid, TxnSlot<V>>,
}

/// One participant server. Cheap to clone; clones share state.
pub struct Participant<V: Val> {
    pub id: ServerId,
    inner: Arc<(Mutex<Inner<V>>, Condvar)>,
}

impl<V: Val> Clone for Participant<V> {
    fn clone(&self) -> Self {
        Participant {
            id: self.id,
            inner: self.inner.clone(),
        }
    }
}

impl<V: Val> Participant<V> {
    /// How long a Prepare will wait on any single key lock before treating
    /// the conflict as fatal and voting No. Long enough for a competing
    /// transaction to finish committing, short enough that the coordinator's
    /// Prepare round doesn't give up on us first.
    const CONFLICT_TIMEOUT: Duration = Duration::from_millis(100);

    /// Construct a participant owning exactly `keys`.
    pub fn new(id: ServerId, keys: Vec<String>) -> Self {
        let store = keys.into_iter().map(|k| (k, StoreItem::new())).collect();
        Participant {
            id,
            inner: Arc::new((
                Mutex::new(Inner {
                    store,
                    txns: BTreeMap::new(),
                }),
                Condvar::new(),
            )),
        }
    }

    /// Log a Get for `tid`. Purely local; acquires nothing.
    pub async fn get(&self, tid: Tid, key: &str) {
        let (lock, _) = &*self.inner;
        let mut g = lock.lock().await;
        trace!("logging get of {:?} for {:?} on {:?}", key, tid, self.id);
        g.txns.entry(tid).or_insert_with(TxnSlot::new).ops.push(Op::Get {
            key: key.to_string(),
        });
    }

    /// Log a Set for `tid`. Purely local; acquires nothing.
    pub async fn set(&self, tid: Tid, key: &str, value: V) {
        let (lock, _) = &*self.inner;
        let mut g = lock.lock().await;
        trace!("logging set of {:?} for {:?} on {:?}", key, tid, self.id);
        g.txns.entry(tid).or_insert_with(TxnSlot::new).ops.push(Op::Set {
            key: key.to_string(),
            value,
        });
    }

    // See crate::SyncBoxFuture for explanation of this wrapper function.
    pub(crate) fn serve(&self, req: Req) -> SyncBoxFuture<Res<V>> {
        let this = self.clone();
        let span = debug_span!("serve", peer = ?self.id, ?req);
        Box::pin(async move { this.serve_(req).instrument(span).await })
    }

    pub(crate) async fn serve_(&self, req: Req) -> Res<V> {
        match req {
            Req::Prepare(tid) => Res::Prepare(self.prepare(tid).await),
            Req::PreCommit(tid) => {
                self.pre_commit(tid).await;
                Res::PreCommit
            }
            Req::Commit(tid) => Res::Commit(self.commit(tid).await),
            Req::Abort(tid) => {
                self.abort(tid).await;
                Res::Abort
            }
            Req::Query => Res::Query(self.query().await),
        }
    }

    /// Prepare: acquire this transaction's locks and vote.
    ///
    /// Locks are planned per distinct key (a key both read and written needs
    /// only the write lock) and acquired in key order -- every transaction
    /// walks keys in the same global order, so concurrent Prepares contend
    /// but cannot deadlock -- each acquisition bounded by
    /// [Self::CONFLICT_TIMEOUT]. Any failure releases whatever was taken and
    /// votes No. Re-delivery in any later state re-votes idempotently
    /// without touching the locks.
    pub async fn prepare(&self, tid: Tid) -> PrepareReply {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().await;

        // A second Prepare for the same tid (duplicate delivery, or a
        // recovering coordinator racing the client's) waits out the one in
        // flight, then re-votes on whatever it decided.
        let mut g = cvar
            .wait_until(guard, |inner| {
                inner.txns.get(&tid).map_or(true, |slot| !slot.preparing)
            })
            .await;

        {
            let slot = match g.txns.get_mut(&tid) {
                None => {
                    return PrepareReply {
                        relevant: false,
                        vote: false,
                    }
                }
                Some(slot) if slot.ops.is_empty() => {
                    return PrepareReply {
                        relevant: false,
                        vote: false,
                    }
                }
                Some(slot) => slot,
            };
            match slot.state {
                TxnState::VotedYes | TxnState::PreCommitted | TxnState::Committed => {
                    trace!("re-voting yes for {:?}", tid);
                    return PrepareReply {
                        relevant: true,
                        vote: true,
                    };
                }
                TxnState::VotedNo | TxnState::Aborted => {
                    trace!("re-voting no for {:?}", tid);
                    return PrepareReply {
                        relevant: true,
                        vote: false,
                    };
                }
                TxnState::Operations => slot.preparing = true,
            }
        }

        // Plan the lock set: one acquisition per distinct key, write mode
        // dominating read.
        let ops = g.txns.get(&tid).expect("slot exists").ops.clone();
        let mut plan: BTreeMap<String, LockMode> = BTreeMap::new();
        for op in &ops {
            let mode = if op.is_get() {
                LockMode::Read
            } else {
                LockMode::Write
            };
            let e = plan.entry(op.key().to_string()).or_insert(mode);
            if mode == LockMode::Write {
                *e = LockMode::Write;
            }
        }
        let mut wanted: Vec<(String, LockMode, Arc<KeyLock>)> = Vec::new();
        let mut unowned = None;
        for (key, mode) in plan {
            match g.store.get(&key) {
                None => {
                    unowned = Some(key);
                    break;
                }
                Some(item) => wanted.push((key, mode, item.lock.clone())),
            }
        }
        if let Some(key) = unowned {
            debug!("{:?} wants unowned key {:?}, voting no", tid, key);
            let slot = g.txns.get_mut(&tid).expect("slot exists");
            slot.preparing = false;
            slot.state = TxnState::VotedNo;
            cvar.notify_all();
            return PrepareReply {
                relevant: true,
                vote: false,
            };
        }
        drop(g);

        debug!("acquiring {:?} key locks for {:?}", wanted.len(), tid);
        let mut acquired: Vec<(String, LockMode, Arc<KeyLock>)> = Vec::new();
        let mut all_locked = true;
        for (key, mode, kl) in wanted {
            if kl.acquire(mode, Self::CONFLICT_TIMEOUT).await {
                acquired.push((key, mode, kl));
            } else {
                debug!("{:?} lost the wait for {:?}, voting no", tid, key);
                all_locked = false;
                break;
            }
        }

        let mut g = lock.lock().await;
        let slot = g
            .txns
            .get_mut(&tid)
            .expect("transaction records are never removed");
        slot.preparing = false;
        let reply = if all_locked && slot.state == TxnState::Operations {
            slot.held = acquired.iter().map(|(k, m, _)| (k.clone(), *m)).collect();
            slot.state = TxnState::VotedYes;
            debug!("{:?} voted yes", tid);
            PrepareReply {
                relevant: true,
                vote: true,
            }
        } else {
            // Either a lock wait timed out, or an Abort landed while we were
            // off waiting; both ways, everything we took goes back.
            for (_, mode, kl) in &acquired {
                kl.release(*mode).await;
            }
            if slot.state == TxnState::Operations {
                slot.state = TxnState::VotedNo;
            }
            let vote = matches!(
                slot.state,
                TxnState::VotedYes | TxnState::PreCommitted | TxnState::Committed
            );
            debug!("{:?} voted {:?} after contention", tid, vote);
            PrepareReply {
                relevant: true,
                vote,
            }
        };
        cvar.notify_all();
        reply
    }

    /// PreCommit: advance a Yes vote to PreCommitted. Anything else is a
    /// no-op; the ack is unconditional either way.
    pub async fn pre_commit(&self, tid: Tid) {
        let (lock, _) = &*self.inner;
        let mut g = lock.lock().await;
        match g.txns.get_mut(&tid) {
            Some(slot) if slot.state == TxnState::VotedYes => {
                debug!("{:?} pre-committed", tid);
                slot.state = TxnState::PreCommitted;
            }
            _ => trace!("ignoring pre-commit for {:?}", tid),
        }
    }

    /// Commit: apply the logged operations in arrival order, collect the
    /// values the Gets observe, release every lock Prepare took, and pin the
    /// record at Committed. Re-delivery returns an empty value map; any
    /// state other than PreCommitted or Committed means a confused
    /// coordinator and does nothing.
    pub async fn commit(&self, tid: Tid) -> CommitReply<V> {
        let (lock, _) = &*self.inner;
        let mut g = lock.lock().await;
        let mut read_values = BTreeMap::new();
        let Inner { store, txns } = &mut *g;
        let slot = match txns.get_mut(&tid) {
            Some(slot) if slot.state == TxnState::PreCommitted => slot,
            Some(slot) if slot.state == TxnState::Committed => {
                trace!("{:?} already committed", tid);
                return CommitReply { read_values };
            }
            _ => {
                warn!("commit for {:?} in a state that cannot commit", tid);
                return CommitReply { read_values };
            }
        };
        for op in &slot.ops {
            match op {
                Op::Get { key } => {
                    if let Some(v) = store.get(key).and_then(|item| item.value.clone()) {
                        read_values.insert(key.clone(), v);
                    }
                }
                Op::Set { key, value } => {
                    if let Some(item) = store.get_mut(key) {
                        item.value = Some(value.clone());
                    }
                }
            }
        }
        for (key, mode) in slot.held.drain(..) {
            if let Some(item) = store.get(&key) {
                item.lock.release(mode).await;
            }
        }
        slot.state = TxnState::Committed;
        debug!("{:?} committed, {:?} values read", tid, read_values.len());
        CommitReply { read_values }
    }

    /// Abort: release whatever Prepare acquired and pin the record at
    /// Aborted. Unknown tids are tolerated silently; a Committed record
    /// refuses (the coordinator that sends this has lost its mind, and the
    /// refusal keeps the store consistent with what we already told it).
    pub async fn abort(&self, tid: Tid) {
        let (lock, _) = &*self.inner;
        let mut g = lock.lock().await;
        let Inner { store, txns } = &mut *g;
        let slot = match txns.get_mut(&tid) {
            None => {
                trace!("ignoring abort for unknown {:?}", tid);
                return;
            }
            Some(slot) => slot,
        };
        match slot.state {
            TxnState::Committed => {
                warn!("refusing to abort committed {:?}", tid);
                return;
            }
            TxnState::Aborted => {
                trace!("{:?} already aborted", tid);
                return;
            }
            _ => (),
        }
        for (key, mode) in slot.held.drain(..) {
            if let Some(item) = store.get(&key) {
                item.lock.release(mode).await;
            }
        }
        slot.state = TxnState::Aborted;
        debug!("{:?} aborted", tid);
    }

    /// Query: snapshot every record we hold, terminal ones included -- a
    /// recovering coordinator needs to see Committed and Aborted entries to
    /// know not to re-drive them.
    pub async fn query(&self) -> QueryReply<V> {
        let (lock, _) = &*self.inner;
        let g = lock.lock().await;
        let transactions = g
            .txns
            .iter()
            .map(|(tid, slot)| {
                (
                    *tid,
                    TxnRecord {
                        state: slot.state,
                        ops: slot.ops.clone(),
                    },
                )
            })
            .collect();
        QueryReply { transactions }
    }
}
