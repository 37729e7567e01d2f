// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! # Overview
//!
//! This is a small implementation of atomic multi-key transactions across a
//! partitioned key-value store, using the Three-Phase Commit (3PC) protocol.
//! It strives to be as small and simple as possible while still providing
//! the features that make the problem interesting:
//!
//!   - Atomicity across partitions
//!
//!   - Isolation via per-key readers-writer locks
//!
//!   - A completely stateless coordinator, recoverable by polling
//!
//! ## Summary
//!
//! The short version of the protocol is:
//!
//!   - Each of N participant servers owns a disjoint subset of the keys.
//!
//!   - A transaction is an ordered batch of Get and Set operations, logged
//!     at the participants owning the touched keys. Logging an operation
//!     acquires nothing and decides nothing.
//!
//!   - On a finishing signal the coordinator drives the participants through
//!     Prepare → PreCommit → Commit. Prepare is where each participant
//!     acquires its per-key locks and votes; a participant that holds no
//!     operations for the transaction reports itself irrelevant and drops
//!     out of the remaining rounds.
//!
//!   - A No vote or a timeout in Prepare or PreCommit turns the transaction
//!     around into an Abort broadcast. Once every relevant participant has
//!     pre-committed, the decision is Commit, and Commit (like Abort) is
//!     retried for as long as it takes.
//!
//!   - The coordinator keeps no durable state at all. A fresh coordinator
//!     polls every participant with Query, reconstructs the set of in-flight
//!     transactions from their per-transaction states, and resumes each one
//!     at the phase it had reached.
//!
//! ## Caveats
//!
//! Nothing's perfect, and this crate is anything but:
//!
//!  - Participants are in-memory only. "Failure" of a participant here means
//!    a network partition from which it returns with its state intact, which
//!    is exactly what the included simulated network does. If you want
//!    participant crash-recovery you want a different crate.
//!
//!  - There is one coordinator at a time. The surrounding system is expected
//!    to crash it and start another, not to run two at once; there is no
//!    election here.
//!
//!  - 3PC is famously not partition-tolerant in general. It is non-blocking
//!    under the failure model above (coordinator crashes, participants
//!    merely partitioned), which is the model this crate simulates and
//!    tests.
//!
//! ## Reference
//!
//! Dale Skeen. Nonblocking Commit Protocols. SIGMOD 1981.
//!
//! DOI: <https://doi.org/10.1145/582318.582339>
//!
//! ## Name
//!
//! Wikipedia:
//!
//! > A triptych is a work of art that is divided into three sections, or
//! > three carved panels that are hinged together and can be folded shut or
//! > displayed open.
//!
//! Three panels, hinged together, standing or folding as one.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::{fmt::Debug, future::Future, pin::Pin};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Error {
    #[error("Target is disconnected")]
    Disconnected,
    #[error("Message was dropped by the network")]
    Dropped,
    #[error("RPC timed out")]
    Timeout,
    #[error("Unexpected response type")]
    UnexpectedResponse,
}

mod coordinator;
pub mod harness;
mod network;
mod participant;
mod store;
mod txn;

// We define a BoxFuture-like wrapper type here and wrap most of our nontrivial
// async fn calls in it, for compilation and code footprint reasons: it costs an
// extra heap allocation per async call, but means the library compiles faster,
// can handle recursive futures, and doesn't require compiler pragmas to
// override the maximum allowed type size.
//
// We don't use the standard BoxFuture type because we want our boxed futures to
// also implement Sync, which the standard one doesn't.
type SyncBoxFuture<T> = Pin<Box<dyn Future<Output = T> + 'static + Send + Sync>>;

pub use coordinator::Coordinator;
pub use network::{Endpoint, Network, Req, Res, ServerId};
pub use participant::{CommitReply, Participant, PrepareReply, QueryReply};
pub use txn::{Op, ResponseMsg, Tid, TxnRecord, TxnState};

/// Values stored under keys are opaque to the protocol: anything cloneable,
/// comparable and wire-shaped will do. Blanket-implemented; never implement
/// this by hand.
pub trait Val:
    Clone + Debug + PartialEq + Eq + Send + Sync + Serialize + serde::de::DeserializeOwned + 'static
{
}

impl<T> Val for T where
    T: Clone
        + Debug
        + PartialEq
        + Eq
        + Send
        + Sync
        + Serialize
        + serde::de::DeserializeOwned
        + 'static
{
}
