// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! A transaction is identified by a [Tid] chosen by the client, and exists in
//! the system only as a set of per-participant records: an ordered log of
//! [Op]s plus a [TxnState]. There is no transaction object anywhere else --
//! in particular the coordinator's in-memory bookkeeping is disposable, and
//! the union of participant records is always enough to finish the job.

use crate::Val;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A client-assigned transaction identifier, unique for the lifetime of the
/// system.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tid(pub u64);

impl std::fmt::Debug for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("t{}", self.0))
    }
}

/// The per-participant state of a transaction. Declared in protocol order:
/// states only ever advance along `Operations → VotedYes → PreCommitted →
/// Committed`, or branch off to `Aborted` (possibly via `VotedNo`) at any
/// point before `Committed`. `Aborted` and `Committed` are sticky: a record
/// that reaches either keeps it forever, so that [crate::Participant::query]
/// stays truthful for an arbitrarily late coordinator restart.
#[derive(
    Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum TxnState {
    Operations,
    VotedNo,
    VotedYes,
    PreCommitted,
    Aborted,
    Committed,
}

impl TxnState {
    /// True for the two states a record can never leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Aborted | TxnState::Committed)
    }
}

/// One logged operation. Operations are ordered by arrival at the
/// participant and executed in that order at commit time; a Get reads the
/// value as of the commit instant (so a Get after a Set of the same key
/// within one transaction observes the new value).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Val")]
pub enum Op<V: Val> {
    Get { key: String },
    Set { key: String, value: V },
}

impl<V: Val> Op<V> {
    pub fn key(&self) -> &str {
        match self {
            Op::Get { key } => key,
            Op::Set { key, .. } => key,
        }
    }

    pub fn is_get(&self) -> bool {
        matches!(self, Op::Get { .. })
    }
}

/// What a participant knows about one transaction, as reported by Query:
/// its state and its operation log. This is the raw material of coordinator
/// recovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Val")]
pub struct TxnRecord<V: Val> {
    pub state: TxnState,
    pub ops: Vec<Op<V>>,
}

/// The one message a client ever hears back: the transaction's outcome, and
/// for a committed transaction the values its Gets observed. Exactly one of
/// these is emitted per finished transaction in the life of a coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Val")]
pub struct ResponseMsg<V: Val> {
    pub tid: Tid,
    pub committed: bool,
    pub read_values: BTreeMap<String, V>,
}
