// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! An in-process simulated network, standing in for whatever RPC fabric a
//! deployment would really use. It delivers [Req]s to [crate::Participant]s
//! and carries [Res]ponses back, with the failure modes the protocol has to
//! survive: a server can be disconnected (messages to and from it vanish; its
//! state survives), a coordinator's whole endpoint set can be killed at once
//! (so a dead coordinator's in-flight RPCs can't land), and an unreliable
//! mode adds random delay and loss.
//!
//! A delivery hook lets the test harness act "just as" a particular RPC is
//! about to be delivered -- disconnect a server, crash the coordinator --
//! which is how the nastier protocol corners get exercised deterministically.

use crate::{participant::Participant, Error, Tid, Val};
use async_std::task;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::trace;

/// A simple participant-server identifier: the server's index in the
/// cluster's configuration order, which is also the endpoint order handed to
/// the coordinator.
#[derive(Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub usize);

impl std::fmt::Debug for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("#{}", self.0))
    }
}

/// The coordinator-to-participant RPC surface. Every request carries at most
/// a [Tid]; the operations themselves were already logged at the
/// participants by the client.
#[derive(Clone, Copy, Debug, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Req {
    Prepare(Tid),
    PreCommit(Tid),
    Commit(Tid),
    Abort(Tid),
    Query,
}

impl Req {
    pub fn method(&self) -> &'static str {
        match self {
            Req::Prepare(_) => "Prepare",
            Req::PreCommit(_) => "PreCommit",
            Req::Commit(_) => "Commit",
            Req::Abort(_) => "Abort",
            Req::Query => "Query",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "V: Val")]
pub enum Res<V: Val> {
    Prepare(crate::PrepareReply),
    PreCommit,
    Commit(crate::CommitReply<V>),
    Abort,
    Query(crate::QueryReply<V>),
}

/// Called with the RPC method name on every delivery attempt, before the
/// connectivity check, so the hook's own disconnections suppress the very
/// delivery it was called for.
pub type DeliveryHook = Box<dyn FnMut(&'static str) + Send>;

struct NetState<V: Val> {
    servers: Vec<Participant<V>>,
    connected: Vec<bool>,
    unreliable: bool,
    rpc_count: usize,
}

struct NetShared<V: Val> {
    state: Mutex<NetState<V>>,
    // Kept apart from `state` so a hook may call back into the network
    // (connect, disconnect, endpoint creation) without deadlocking.
    hook: Mutex<Option<DeliveryHook>>,
}

pub struct Network<V: Val> {
    shared: Arc<NetShared<V>>,
}

impl<V: Val> Clone for Network<V> {
    fn clone(&self) -> Self {
        Network {
            shared: self.shared.clone(),
        }
    }
}

impl<V: Val> Network<V> {
    // How long a delivery to an unreachable target takes to come back as a
    // failure. Nonzero so retry loops against a dead server don't spin.
    const DEAD_LETTER_DELAY: Duration = Duration::from_millis(2);

    const UNRELIABLE_MAX_DELAY_MS: u64 = 13;
    const UNRELIABLE_DROP_1_IN: u32 = 10;

    pub fn new(unreliable: bool) -> Self {
        Network {
            shared: Arc::new(NetShared {
                state: Mutex::new(NetState {
                    servers: Vec::new(),
                    connected: Vec::new(),
                    unreliable,
                    rpc_count: 0,
                }),
                hook: Mutex::new(None),
            }),
        }
    }

    /// Register a participant server, returning its id (registration
    /// order). Servers start disconnected; see [Network::connect].
    pub fn add_server(&self, server: Participant<V>) -> ServerId {
        let mut g = self.shared.state.lock().unwrap();
        g.servers.push(server);
        g.connected.push(false);
        ServerId(g.servers.len() - 1)
    }

    /// Attach or detach server `id` from the network. A detached server's
    /// in-memory state is untouched; only its reachability changes.
    pub fn connect(&self, id: ServerId, on: bool) {
        let mut g = self.shared.state.lock().unwrap();
        g.connected[id.0] = on;
    }

    pub fn set_unreliable(&self, unreliable: bool) {
        self.shared.state.lock().unwrap().unreliable = unreliable;
    }

    pub fn set_hook(&self, hook: Option<DeliveryHook>) {
        *self.shared.hook.lock().unwrap() = hook;
    }

    /// Total requests attempted, delivered or not.
    pub fn rpc_count(&self) -> usize {
        self.shared.state.lock().unwrap().rpc_count
    }

    /// Mint one endpoint per server, all sharing `alive`: storing `false`
    /// there kills the whole set, which is how a coordinator instance is
    /// fenced off when it crashes.
    pub fn make_endpoints(&self, alive: &Arc<AtomicBool>) -> Vec<Endpoint<V>> {
        let n = self.shared.state.lock().unwrap().servers.len();
        (0..n)
            .map(|i| Endpoint {
                net: self.clone(),
                server: ServerId(i),
                alive: alive.clone(),
            })
            .collect()
    }

    fn run_hook(&self, method: &'static str) {
        // Take the hook out while running it: hooks routinely re-enter the
        // network (and even install a replacement hook).
        let taken = self.shared.hook.lock().unwrap().take();
        if let Some(mut f) = taken {
            f(method);
            let mut slot = self.shared.hook.lock().unwrap();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    fn reachable(&self, ep: &Endpoint<V>) -> bool {
        ep.alive.load(Ordering::SeqCst) && self.shared.state.lock().unwrap().connected[ep.server.0]
    }

    async fn deliver(&self, ep: &Endpoint<V>, req: Req) -> Result<Res<V>, Error> {
        self.run_hook(req.method());

        let (target, unreliable) = {
            let mut g = self.shared.state.lock().unwrap();
            g.rpc_count += 1;
            if !ep.alive.load(Ordering::SeqCst) || !g.connected[ep.server.0] {
                (None, g.unreliable)
            } else {
                (Some(g.servers[ep.server.0].clone()), g.unreliable)
            }
        };
        let target = match target {
            None => {
                trace!("dead letter: {:?} to {:?}", req, ep.server);
                task::sleep(Self::DEAD_LETTER_DELAY).await;
                return Err(Error::Disconnected);
            }
            Some(t) => t,
        };

        if unreliable {
            let (delay_ms, drop_req) = {
                let mut rng = rand::thread_rng();
                (
                    rng.gen_range(0..=Self::UNRELIABLE_MAX_DELAY_MS),
                    rng.gen_ratio(1, Self::UNRELIABLE_DROP_1_IN),
                )
            };
            task::sleep(Duration::from_millis(delay_ms)).await;
            if drop_req {
                trace!("network dropped request {:?} to {:?}", req, ep.server);
                return Err(Error::Dropped);
            }
        }

        // One handler task per delivered request, as a real server would.
        let res = task::spawn(target.serve(req)).await;

        // The request was handled; its effects stand. But if connectivity
        // went away while it was in flight, the reply is lost.
        if !self.reachable(ep) {
            trace!("reply to {:?} lost: {:?} unreachable", req, ep.server);
            return Err(Error::Dropped);
        }
        if unreliable && rand::thread_rng().gen_ratio(1, Self::UNRELIABLE_DROP_1_IN) {
            trace!("network dropped reply to {:?} from {:?}", req, ep.server);
            return Err(Error::Dropped);
        }
        Ok(res)
    }
}

/// A single coordinator-held handle for sending RPCs to one server.
pub struct Endpoint<V: Val> {
    net: Network<V>,
    server: ServerId,
    alive: Arc<AtomicBool>,
}

impl<V: Val> Clone for Endpoint<V> {
    fn clone(&self) -> Self {
        Endpoint {
            net: self.net.clone(),
            server: self.server.clone(),
            alive: self.alive.clone(),
        }
    }
}

impl<V: Val> Endpoint<V> {
    pub fn server(&self) -> ServerId {
        self.server
    }

    /// Best-effort delivery: the reply, or an error for anything the
    /// network ate. Callers wanting a time bound wrap this in a timeout.
    pub async fn call(&self, req: Req) -> Result<Res<V>, Error> {
        self.net.deliver(self, req).await
    }
}
